//! Streaming log pipeline for step subprocess output
//!
//! Both stdio streams of a step converge on a single [`LogSink`]: the error
//! finder observes the raw bytes, the secret filter redacts them, and the
//! classifier assigns log levels to whatever has left the redaction tail.
//! The sink is strictly single-writer per subprocess (the two reader tasks
//! serialize on a mutex around it) but may be inspected mid-run.

pub mod classifier;
pub mod error_finder;
pub mod secret_filter;

pub use classifier::{ClassifiedMessage, LogClassifier, LogLevel, MAX_BUFFER};
pub use error_finder::ErrorFinder;
pub use secret_filter::{SecretFilter, REDACTION_TOKEN};

use std::io::Write;

/// Redaction, classification and error capture over one subprocess's output.
pub struct LogSink<W: Write> {
    secrets: Vec<String>,
    filter: SecretFilter,
    classifier: LogClassifier,
    error_finder: ErrorFinder,
    messages: Vec<ClassifiedMessage>,
    writer: W,
}

impl<W: Write> LogSink<W> {
    pub fn new(secrets: &[String], writer: W) -> Self {
        Self {
            secrets: secrets.to_vec(),
            filter: SecretFilter::new(secrets),
            classifier: LogClassifier::new(),
            error_finder: ErrorFinder::new(),
            messages: Vec::new(),
            writer,
        }
    }

    /// Feed one raw chunk from the subprocess.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.error_finder.observe(chunk);
        let redacted = self.filter.process(chunk);
        self.dispatch(&redacted)
    }

    /// Flush the redaction tail and any buffered classification state.
    /// Called exactly once, after the subprocess has exited and both
    /// readers have drained.
    pub fn close(&mut self) -> std::io::Result<()> {
        let tail = self.filter.flush();
        self.dispatch(&tail)?;

        let mut flushed = Vec::new();
        self.classifier.flush(&mut flushed);
        for message in flushed {
            self.writer.write_all(&message.message)?;
            self.messages.push(message);
        }
        self.writer.flush()
    }

    fn dispatch(&mut self, redacted: &[u8]) -> std::io::Result<()> {
        if redacted.is_empty() {
            return Ok(());
        }
        let mut classified = Vec::new();
        self.classifier.process(redacted, &mut classified);
        for message in classified {
            self.writer.write_all(&message.message)?;
            if message.level != LogLevel::Normal {
                self.writer.write_all(b"\n")?;
            }
            self.messages.push(message);
        }
        Ok(())
    }

    /// Classified messages seen so far.
    pub fn messages(&self) -> &[ClassifiedMessage] {
        &self.messages
    }

    /// Failure diagnostics from the unredacted stream, with secrets redacted
    /// before they leave the sink.
    pub fn detected_error_messages(&mut self) -> Vec<String> {
        let secrets = self.secrets.clone();
        self.error_finder
            .error_messages()
            .into_iter()
            .map(|line| {
                let mut redactor = SecretFilter::new(&secrets);
                let mut redacted = redactor.process(line.as_bytes());
                redacted.extend(redactor.flush());
                String::from_utf8_lossy(&redacted).to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_before_classifying() {
        let mut output = Vec::new();
        {
            let mut sink = LogSink::new(&["hunter2".to_string()], &mut output);
            let chunk = format!("{}token=hunter2{}", classifier::RED, classifier::RESET);
            sink.write_chunk(chunk.as_bytes()).unwrap();
            sink.close().unwrap();

            assert_eq!(sink.messages().len(), 1);
            assert_eq!(sink.messages()[0].level, LogLevel::Error);
            assert_eq!(sink.messages()[0].message, b"token=[REDACTED]");
        }
        let printed = String::from_utf8(output).unwrap();
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("token=[REDACTED]"));
    }

    #[test]
    fn plain_output_passes_through_redacted() {
        let mut output = Vec::new();
        {
            let mut sink = LogSink::new(&["secret".to_string()], &mut output);
            sink.write_chunk(b"the secret is out\n").unwrap();
            sink.close().unwrap();
        }
        assert_eq!(String::from_utf8(output).unwrap(), "the [REDACTED] is out\n");
    }

    #[test]
    fn error_messages_are_redacted_too() {
        let mut output = Vec::new();
        let mut sink = LogSink::new(&["hunter2".to_string()], &mut output);
        sink.write_chunk(b"error: bad credential hunter2\n").unwrap();
        sink.close().unwrap();

        let detected = sink.detected_error_messages();
        assert!(detected[0].contains("[REDACTED]"));
        assert!(!detected[0].contains("hunter2"));
    }
}
