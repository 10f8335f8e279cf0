//! Output messages produced by the bridged process.
//!
//! Every line read from the child is tagged with the stream it came from.
//! The tag is fixed when the message is built; the wire format is derived
//! from it:
//!
//! ```text
//! stdout "ready"      → Message::Info  → "INFO: ready"
//! stderr "bad input"  → Message::Error → "ERROR: bad input"
//! Message::Raw(text)  → text
//! ```

use std::borrow::Cow;
use std::fmt;

/// Prefix for lines read from stdout.
pub const INFO_PREFIX: &str = "INFO: ";
/// Prefix for lines read from stderr.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Which output stream of the child a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// Tag a line read from this stream.
    pub fn tag(self, line: Vec<u8>) -> Message {
        match self {
            Self::Stdout => Message::Info(line),
            Self::Stderr => Message::Error(line),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of output delivered to connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A line from stdout, without its line terminator.
    Info(Vec<u8>),
    /// A line from stderr, without its line terminator.
    Error(Vec<u8>),
    /// A pass-through notice, sent to the client unchanged.
    Raw(String),
}

impl Message {
    /// The payload as text. Invalid UTF-8 is replaced, never rejected.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Self::Info(line) | Self::Error(line) => String::from_utf8_lossy(line),
            Self::Raw(text) => Cow::Borrowed(text),
        }
    }

    /// Render the text frame sent to a client.
    pub fn to_frame(&self) -> String {
        match self {
            Self::Info(_) => format!("{INFO_PREFIX}{}", self.text()),
            Self::Error(_) => format!("{ERROR_PREFIX}{}", self.text()),
            Self::Raw(text) => text.clone(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_frame())
    }
}

/// Strip a trailing `\n` (and a `\r` before it) from a line read off a pipe.
pub fn trim_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}
