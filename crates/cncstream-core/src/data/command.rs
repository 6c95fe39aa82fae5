//! Command types and lifecycle tracking

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Response recorded for commands dropped by the streamer without being sent.
pub const SKIPPED_RESPONSE: &str = "<skipped by application>";

/// Command lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    /// Created, not yet sent
    Pending,
    /// Written to the transport, awaiting acknowledgment
    Sent,
    /// Acknowledged successfully
    Ok,
    /// Acknowledged with an error
    Error,
    /// Dropped without being sent (empty after comment stripping)
    Skipped,
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Sent => write!(f, "Sent"),
            Self::Ok => write!(f, "Ok"),
            Self::Error => write!(f, "Error"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// A single line of firmware input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Sequence number, assigned when the command is sent or skipped
    pub command_number: Option<u32>,
    /// Text exactly as queued
    pub raw: String,
    /// Comment-stripped, trimmed text that goes on the wire
    pub text: String,
    /// Inline comment, if any
    pub comment: Option<String>,
    /// Lifecycle state
    pub state: CommandState,
    /// Response line from the firmware
    pub response: Option<String>,
    /// Synthesized by the engine to adjust modal state temporarily
    pub temporary_modal_change: bool,
    /// Must be the only command in flight (persistent memory writes)
    pub exclusive: bool,
    /// When the command was written to the transport
    pub sent_at: Option<DateTime<Utc>>,
    /// When the command was acknowledged or skipped
    pub completed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// Create a command from a raw line, extracting any inline comment.
    pub fn new(line: impl Into<String>) -> Self {
        let raw = line.into();
        let (text, comment) = split_comment(&raw);
        Self {
            command_number: None,
            raw,
            text,
            comment,
            state: CommandState::Pending,
            response: None,
            temporary_modal_change: false,
            exclusive: false,
            sent_at: None,
            completed_at: None,
        }
    }

    /// Create a command that only exists to change modal state for a moment.
    pub fn temporary(line: impl Into<String>) -> Self {
        let mut cmd = Self::new(line);
        cmd.temporary_modal_change = true;
        cmd
    }

    /// Length of the text on the wire, including the trailing newline.
    pub fn wire_len(&self) -> usize {
        self.text.len() + 1
    }

    /// True when there is nothing to transmit.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn has_comment(&self) -> bool {
        self.comment.is_some()
    }

    /// Mark this command as sent
    pub fn mark_sent(&mut self, number: u32) -> &mut Self {
        debug_assert!(
            self.state == CommandState::Pending,
            "mark_sent called on command in {:?} state (expected Pending)",
            self.state
        );
        self.command_number = Some(number);
        self.state = CommandState::Sent;
        self.sent_at = Some(Utc::now());
        self
    }

    /// Mark this command as skipped
    pub fn mark_skipped(&mut self, number: u32) -> &mut Self {
        self.command_number = Some(number);
        self.state = CommandState::Skipped;
        self.response = Some(SKIPPED_RESPONSE.to_string());
        self.completed_at = Some(Utc::now());
        self
    }

    /// Record the acknowledgment for this command
    pub fn complete(&mut self, response: impl Into<String>, is_error: bool) -> &mut Self {
        self.response = Some(response.into());
        self.state = if is_error {
            CommandState::Error
        } else {
            CommandState::Ok
        };
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    pub fn is_skipped(&self) -> bool {
        self.state == CommandState::Skipped
    }

    pub fn is_error(&self) -> bool {
        self.state == CommandState::Error
    }

    /// Acknowledged, with or without error, or skipped
    pub fn is_done(&self) -> bool {
        matches!(
            self.state,
            CommandState::Ok | CommandState::Error | CommandState::Skipped
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.command_number {
            Some(n) => write!(f, "[{}] {}: {}", n, self.state, self.text),
            None => write!(f, "{}: {}", self.state, self.text),
        }
    }
}

/// Split a G-code line into its transmittable text and its comment.
///
/// Parenthesized comments are removed wherever they appear; a `;` ends the
/// line. Multiple comments are joined with a space.
pub fn split_comment(line: &str) -> (String, Option<String>) {
    static PAREN_COMMENT: OnceLock<Regex> = OnceLock::new();
    let paren =
        PAREN_COMMENT.get_or_init(|| Regex::new(r"\(([^)]*)\)?").expect("invalid regex pattern"));

    let line = line.trim_end_matches(['\r', '\n']);
    let (code, semicolon) = match line.find(';') {
        // A ';' inside a parenthesized comment does not start a line comment.
        Some(idx) if !inside_parens(line, idx) => (&line[..idx], Some(line[idx + 1..].trim())),
        _ => (line, None),
    };

    let mut comments: Vec<String> = paren
        .captures_iter(code)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|c| !c.is_empty())
        .collect();
    if let Some(c) = semicolon.filter(|c| !c.is_empty()) {
        comments.push(c.to_string());
    }

    let text = paren.replace_all(code, "").trim().to_string();
    let comment = if comments.is_empty() {
        None
    } else {
        Some(comments.join(" "))
    };
    (text, comment)
}

fn inside_parens(line: &str, idx: usize) -> bool {
    let before = &line[..idx];
    before.matches('(').count() > before.matches(')').count()
}

/// Sequential command numbers for one session
#[derive(Clone, Debug)]
pub struct CommandNumberGenerator {
    counter: Arc<AtomicU32>,
}

impl CommandNumberGenerator {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Get the next command number
    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Get current command count without incrementing
    pub fn current(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Reset the counter, used when a connection closes
    pub fn reset(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }
}

impl Default for CommandNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_command() {
        let cmd = Command::new("G0 X1 Y2\n");
        assert_eq!(cmd.text, "G0 X1 Y2");
        assert_eq!(cmd.comment, None);
        assert_eq!(cmd.wire_len(), 9);
        assert_eq!(cmd.state, CommandState::Pending);
    }

    #[test]
    fn test_paren_comment_is_removed() {
        let cmd = Command::new("G1 X1 (move right) Y2");
        assert_eq!(cmd.text, "G1 X1  Y2");
        assert_eq!(cmd.comment.as_deref(), Some("move right"));
    }

    #[test]
    fn test_semicolon_comment() {
        let cmd = Command::new("M3 S1000 ; spindle on");
        assert_eq!(cmd.text, "M3 S1000");
        assert_eq!(cmd.comment.as_deref(), Some("spindle on"));
    }

    #[test]
    fn test_semicolon_inside_parens() {
        let (text, comment) = split_comment("G0 X0 (a;b)");
        assert_eq!(text, "G0 X0");
        assert_eq!(comment.as_deref(), Some("a;b"));
    }

    #[test]
    fn test_comment_only_line_is_empty() {
        let cmd = Command::new("(header)");
        assert!(cmd.is_empty());
        assert!(cmd.has_comment());
        assert!(Command::new("   ").is_empty());
    }

    #[test]
    fn test_lifecycle() {
        let mut cmd = Command::new("G0 X1");
        cmd.mark_sent(4);
        assert!(cmd.is_sent());
        assert_eq!(cmd.command_number, Some(4));
        cmd.complete("error:20", true);
        assert!(cmd.is_error());
        assert!(cmd.is_done());

        let mut skipped = Command::new("");
        skipped.mark_skipped(5);
        assert!(skipped.is_skipped());
        assert_eq!(skipped.response.as_deref(), Some(SKIPPED_RESPONSE));
    }

    #[test]
    fn test_number_generator() {
        let gen = CommandNumberGenerator::new();
        assert_eq!(gen.next(), 0);
        assert_eq!(gen.next(), 1);
        gen.reset();
        assert_eq!(gen.current(), 0);
    }
}
