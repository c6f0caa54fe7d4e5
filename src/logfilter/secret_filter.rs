//! Secret redaction over a byte stream
//!
//! Every occurrence of a known secret value is replaced by a fixed token
//! before the bytes leave the filter. A rolling tail of `max(secret len) - 1`
//! bytes straddles chunk boundaries so a secret split across two writes is
//! still caught; the tail is flushed, after a final redaction pass, on close.

pub const REDACTION_TOKEN: &str = "[REDACTED]";

#[derive(Debug)]
pub struct SecretFilter {
    secrets: Vec<Vec<u8>>,
    tail_capacity: usize,
    tail: Vec<u8>,
}

impl SecretFilter {
    pub fn new(secrets: &[String]) -> Self {
        let secrets: Vec<Vec<u8>> = secrets
            .iter()
            .filter(|secret| !secret.is_empty())
            .map(|secret| secret.as_bytes().to_vec())
            .collect();
        let tail_capacity = secrets
            .iter()
            .map(|secret| secret.len())
            .max()
            .map(|longest| longest.saturating_sub(1))
            .unwrap_or(0);
        Self {
            secrets,
            tail_capacity,
            tail: Vec::new(),
        }
    }

    /// Redact a chunk and return the bytes that are safe to emit. The last
    /// `tail_capacity` bytes are withheld until the next call or `flush`,
    /// since a secret may continue into the following chunk.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.secrets.is_empty() {
            return chunk.to_vec();
        }

        let mut combined = std::mem::take(&mut self.tail);
        combined.extend_from_slice(chunk);
        let redacted = self.redact(&combined);

        let keep = redacted.len().saturating_sub(self.tail_capacity);
        self.tail = redacted[keep..].to_vec();
        redacted[..keep].to_vec()
    }

    /// Emit the withheld tail after a final redaction pass.
    pub fn flush(&mut self) -> Vec<u8> {
        let tail = std::mem::take(&mut self.tail);
        self.redact(&tail)
    }

    fn redact(&self, data: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(data.len());
        let mut pos = 0;
        'outer: while pos < data.len() {
            for secret in &self.secrets {
                if data[pos..].starts_with(secret) {
                    result.extend_from_slice(REDACTION_TOKEN.as_bytes());
                    pos += secret.len();
                    continue 'outer;
                }
            }
            result.push(data[pos]);
            pos += 1;
        }
        result
    }
}
