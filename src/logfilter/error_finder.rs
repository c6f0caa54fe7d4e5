//! Error capture over the unredacted step output
//!
//! Observes the raw stream line by line, retaining a bounded tail plus any
//! lines matching a small set of error heuristics. Surfaced in the step
//! result when the step exits non-zero.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;

const TAIL_LINES: usize = 10;
const MAX_MATCHED_LINES: usize = 20;

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\berror\b",
        r"(?i)\bfailed\b",
        r"(?i)\bfailure\b",
        r"(?i)\bfatal\b",
        r"(?i)\bpanic\b",
        r"(?i)\bexception\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid error pattern"))
    .collect()
});

#[derive(Debug, Default)]
pub struct ErrorFinder {
    tail: VecDeque<String>,
    matched: Vec<String>,
    partial: String,
}

impl ErrorFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one raw chunk. Line splitting is handled internally; partial
    /// lines carry over to the next call.
    pub fn observe(&mut self, chunk: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            self.record(line.trim_end_matches('\n'));
        }
    }

    fn record(&mut self, line: &str) {
        let stripped = strip_ansi(line);
        if stripped.trim().is_empty() {
            return;
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(stripped.clone());

        if self.matched.len() < MAX_MATCHED_LINES
            && ERROR_PATTERNS.iter().any(|pattern| pattern.is_match(&stripped))
            && !self.matched.contains(&stripped)
        {
            self.matched.push(stripped);
        }
    }

    /// Lines worth surfacing in a failure footer: heuristic matches first,
    /// then the tail, without duplicates.
    pub fn error_messages(&mut self) -> Vec<String> {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.record(&line);
        }

        let mut messages = self.matched.clone();
        for line in &self.tail {
            if !messages.contains(line) {
                messages.push(line.clone());
            }
        }
        messages
    }
}

fn strip_ansi(line: &str) -> String {
    static ANSI: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi pattern"));
    ANSI.replace_all(line, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_lines() {
        let mut finder = ErrorFinder::new();
        for i in 0..15 {
            finder.observe(format!("line {i}\n").as_bytes());
        }
        let messages = finder.error_messages();
        assert_eq!(messages.len(), TAIL_LINES);
        assert_eq!(messages[0], "line 5");
        assert_eq!(messages[9], "line 14");
    }

    #[test]
    fn heuristic_matches_survive_tail_eviction() {
        let mut finder = ErrorFinder::new();
        finder.observe(b"Error: everything is on fire\n");
        for i in 0..20 {
            finder.observe(format!("filler {i}\n").as_bytes());
        }
        let messages = finder.error_messages();
        assert_eq!(messages[0], "Error: everything is on fire");
    }

    #[test]
    fn handles_lines_split_across_chunks() {
        let mut finder = ErrorFinder::new();
        finder.observe(b"fatal: some");
        finder.observe(b"thing broke\n");
        let messages = finder.error_messages();
        assert_eq!(messages[0], "fatal: something broke");
    }

    #[test]
    fn trailing_partial_line_is_recorded_on_collect() {
        let mut finder = ErrorFinder::new();
        finder.observe(b"panic: no newline at end");
        let messages = finder.error_messages();
        assert_eq!(messages[0], "panic: no newline at end");
    }

    #[test]
    fn ansi_escapes_are_stripped() {
        let mut finder = ErrorFinder::new();
        finder.observe(b"\x1b[31;1merror: colored\x1b[0m\n");
        let messages = finder.error_messages();
        assert_eq!(messages[0], "error: colored");
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut finder = ErrorFinder::new();
        finder.observe(b"\n\n\nreal content\n\n");
        let messages = finder.error_messages();
        assert_eq!(messages, vec!["real content".to_string()]);
    }
}
