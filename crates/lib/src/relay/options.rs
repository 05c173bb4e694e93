//! Resolution policy parameters: separators, watch marker, and how many replies settle a message.

use std::num::NonZeroU32;

use crate::relay::error::RelayError;
use crate::split::TrailingFragment;

pub const DEFAULT_WATCH_MARKER: &str = "👀";
pub const DEFAULT_FIELD_SEPARATOR: &str = ":";
pub const DEFAULT_LINE_SEPARATOR: &str = "\n";

/// Flag value meaning "collect replies indefinitely".
pub const UNBOUNDED_FLAG: i64 = -1;

/// How many responses resolve a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTarget {
    Count(NonZeroU32),
    /// Never auto-resolve; records are only cleared by shutdown cleanup.
    Unbounded,
}

impl Default for ReplyTarget {
    fn default() -> Self {
        ReplyTarget::Count(NonZeroU32::MIN)
    }
}

impl ReplyTarget {
    /// Parse the CLI value: positive = count, -1 = unbounded. Zero and other negatives are rejected.
    pub fn from_flag(n: i64) -> Result<Self, RelayError> {
        match n {
            UNBOUNDED_FLAG => Ok(ReplyTarget::Unbounded),
            0 => Err(RelayError::Config(
                "reply count must not be 0 (use -1 to collect replies indefinitely)".to_string(),
            )),
            n if n < 0 => Err(RelayError::Config(format!(
                "reply count must be positive or -1, got {}",
                n
            ))),
            n => u32::try_from(n)
                .ok()
                .and_then(NonZeroU32::new)
                .map(ReplyTarget::Count)
                .ok_or_else(|| RelayError::Config(format!("reply count too large: {}", n))),
        }
    }

    /// True once `collected` responses are enough to resolve a message.
    pub fn is_satisfied(self, collected: u32) -> bool {
        match self {
            ReplyTarget::Count(target) => collected >= target.get(),
            ReplyTarget::Unbounded => false,
        }
    }
}

/// Process-wide relay settings, read-only once the run starts.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Between the original content and the response in an emitted line.
    pub field_separator: String,
    /// Between input chunks.
    pub message_separator: String,
    /// Terminates every emitted line.
    pub output_separator: String,
    pub watch_marker: String,
    pub reply_target: ReplyTarget,
    /// Send every line and exit without watching for replies.
    pub skip_replies: bool,
    pub trailing: TrailingFragment,
    /// Never treat a chunk as a file path to upload.
    pub as_text: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            field_separator: DEFAULT_FIELD_SEPARATOR.to_string(),
            message_separator: DEFAULT_LINE_SEPARATOR.to_string(),
            output_separator: DEFAULT_LINE_SEPARATOR.to_string(),
            watch_marker: DEFAULT_WATCH_MARKER.to_string(),
            reply_target: ReplyTarget::default(),
            skip_replies: false,
            trailing: TrailingFragment::default(),
            as_text: false,
        }
    }
}

impl RelayOptions {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.message_separator.is_empty() {
            return Err(RelayError::Config(
                "message separator must not be empty".to_string(),
            ));
        }
        if self.watch_marker.trim().is_empty() {
            return Err(RelayError::Config("watch marker must not be empty".to_string()));
        }
        Ok(())
    }

    /// `<original><field separator><response><output separator>`
    pub fn format_pair(&self, original: &str, response: &str) -> String {
        let mut line = String::with_capacity(
            original.len()
                + self.field_separator.len()
                + response.len()
                + self.output_separator.len(),
        );
        line.push_str(original);
        line.push_str(&self.field_separator);
        line.push_str(response);
        line.push_str(&self.output_separator);
        line
    }
}

/// Expand `\n`, `\r`, `\t`, `\0` and `\\` so separators can be typed literally on a shell.
/// Unknown escapes are kept as written.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
