//! Log-level classification of colored output
//!
//! The engine wraps its own log lines in ANSI color escapes; the classifier
//! recognizes them and assigns a level per chunk. A chunk is classified only
//! when it starts with a known color code and terminates with a reset code
//! (optionally preceded by a newline). Unterminated colored chunks are
//! buffered up to a 32 KiB cap; exceeding the cap flushes the buffer as
//! NORMAL. A chunk beginning with a reset code closes the buffered message,
//! and any trailing content is reprocessed as a new chunk.

pub const RED: &str = "\x1b[31;1m";
pub const GREEN: &str = "\x1b[32;1m";
pub const YELLOW: &str = "\x1b[33;1m";
pub const BLUE: &str = "\x1b[34;1m";
pub const MAGENTA: &str = "\x1b[35;1m";
pub const RESET: &str = "\x1b[0m";

/// Buffer cap for unterminated colored chunks.
pub const MAX_BUFFER: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Done,
    Debug,
    Normal,
}

impl LogLevel {
    fn from_color(code: &str) -> Option<Self> {
        match code {
            RED => Some(LogLevel::Error),
            YELLOW => Some(LogLevel::Warn),
            BLUE => Some(LogLevel::Info),
            GREEN => Some(LogLevel::Done),
            MAGENTA => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

/// One classified message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedMessage {
    pub level: LogLevel,
    pub message: Vec<u8>,
}

#[derive(Debug)]
pub struct LogClassifier {
    buffer: Vec<u8>,
    buffered_level: Option<LogLevel>,
}

impl Default for LogClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LogClassifier {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            buffered_level: None,
        }
    }

    /// Feed one chunk, collecting any completed messages.
    pub fn process(&mut self, chunk: &[u8], out: &mut Vec<ClassifiedMessage>) {
        if chunk.is_empty() {
            return;
        }

        if self.buffered_level.is_some() {
            if let Some(rest) = chunk.strip_prefix(RESET.as_bytes()) {
                let rest = rest.to_vec();
                self.emit_buffered(out);
                self.process(&rest, out);
                return;
            }
            self.buffer.extend_from_slice(chunk);
            if let Some(message) = strip_terminated(&self.buffer) {
                let level = self.buffered_level.take().expect("buffering");
                out.push(ClassifiedMessage {
                    level,
                    message: message.to_vec(),
                });
                self.buffer.clear();
            } else if self.buffer.len() > MAX_BUFFER {
                self.flush_as_normal(out);
            }
            return;
        }

        let Some((level, body)) = starting_color(chunk) else {
            out.push(ClassifiedMessage {
                level: LogLevel::Normal,
                message: chunk.to_vec(),
            });
            return;
        };

        if let Some(message) = strip_terminated(body) {
            out.push(ClassifiedMessage {
                level,
                message: message.to_vec(),
            });
            return;
        }

        self.buffered_level = Some(level);
        self.buffer = body.to_vec();
        if self.buffer.len() > MAX_BUFFER {
            self.flush_as_normal(out);
        }
    }

    /// Emit whatever is still buffered. Called when the stream closes.
    pub fn flush(&mut self, out: &mut Vec<ClassifiedMessage>) {
        if self.buffered_level.is_some() {
            self.emit_buffered(out);
        }
    }

    fn emit_buffered(&mut self, out: &mut Vec<ClassifiedMessage>) {
        let level = self.buffered_level.take().expect("buffering");
        let message = strip_terminated(&self.buffer)
            .map(|m| m.to_vec())
            .unwrap_or_else(|| self.buffer.clone());
        out.push(ClassifiedMessage { level, message });
        self.buffer.clear();
    }

    fn flush_as_normal(&mut self, out: &mut Vec<ClassifiedMessage>) {
        let level = self.buffered_level.take();
        let mut message = Vec::new();
        if let Some(level) = level {
            if let Some(color) = color_of(level) {
                message.extend_from_slice(color.as_bytes());
            }
        }
        message.append(&mut self.buffer);
        out.push(ClassifiedMessage {
            level: LogLevel::Normal,
            message,
        });
    }
}

fn color_of(level: LogLevel) -> Option<&'static str> {
    match level {
        LogLevel::Error => Some(RED),
        LogLevel::Warn => Some(YELLOW),
        LogLevel::Info => Some(BLUE),
        LogLevel::Done => Some(GREEN),
        LogLevel::Debug => Some(MAGENTA),
        LogLevel::Normal => None,
    }
}

fn starting_color(chunk: &[u8]) -> Option<(LogLevel, &[u8])> {
    for color in [RED, YELLOW, BLUE, GREEN, MAGENTA] {
        if let Some(body) = chunk.strip_prefix(color.as_bytes()) {
            return Some((LogLevel::from_color(color).expect("known color"), body));
        }
    }
    None
}

/// If `data` ends with a reset code (optionally followed, or preceded, by a
/// single newline), return the message content before it.
fn strip_terminated(data: &[u8]) -> Option<&[u8]> {
    let without_trailing_newline = data.strip_suffix(b"\n").unwrap_or(data);
    let message = without_trailing_newline.strip_suffix(RESET.as_bytes())?;
    Some(message.strip_suffix(b"\n").unwrap_or(message))
}
