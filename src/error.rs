//! Error kinds and the graded severity policy used for protocol checks.
//!
//! Configuration and transport problems are always returned as `Err`.  Protocol verification
//! problems (a bad IR capture, scanned-out bits that differ from expectation, a write that did
//! not land) are reported through a caller-selected [`Severity`], because during bring-up many
//! of those failures are expected and the operator picks how loud they should be.
use alloc::string::String;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A bit index or range fell outside `[0, len)` of a bit vector.
    #[error("index {index} outside allowed range 0..{len} in bit vector '{name}'")]
    IndexOutOfRange { name: String, index: usize, len: usize },

    /// A bit in the unknown state was read where a definite value is required.
    #[error("bit {index} of bit vector '{name}' is in the invalid state: {state}")]
    InvalidBit { name: String, index: usize, state: String },

    #[error("bad character '{0}' in bit string, only 0, 1 and X are allowed")]
    BadBitChar(char),

    #[error("length mismatch in {what}: expected {expected}, got {actual}")]
    LengthMismatch { what: String, expected: usize, actual: usize },

    /// Chain description or tester setup is inconsistent.  Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("can't find '{0}'; paths start with a chip name and levels are separated with '.'")]
    NotFound(String),

    /// Two or more siblings share the name of a path segment.
    #[error("path '{path}' is ambiguous: {count} nodes named '{segment}'")]
    Ambiguous { path: String, segment: String, count: usize },

    #[error("node '{path}' is a {actual}, but a {expected} was required")]
    WrongKind { path: String, expected: &'static str, actual: &'static str },

    /// The device or cable reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A reply could not be parsed as the number the command promised.
    #[error("malformed response to '{command}': '{reply}'")]
    MalformedResponse { command: String, reply: String },

    /// A protocol check failed at [`Severity::Fatal`].
    #[error("{0}")]
    Verification(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Response level to a detected anomaly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Say nothing and continue.
    NoMessage,
    /// Print a warning and continue.
    Warning,
    /// Print the error with its context and continue.
    NonFatal,
    /// Print the error and abort the operation.
    Fatal,
}

impl Severity {
    /// Report `msg` at this severity.  Only [`Severity::Fatal`] produces an `Err`.
    pub fn report(self, msg: &str) -> Result<()> {
        match self {
            Severity::NoMessage => Ok(()),
            Severity::Warning => {
                log::warn!("{}", msg);
                Ok(())
            }
            Severity::NonFatal => {
                log::error!("nonfatal: {}", msg);
                Ok(())
            }
            Severity::Fatal => {
                log::error!("fatal: {}", msg);
                Err(Error::Verification(String::from(msg)))
            }
        }
    }

    /// Whether a report at this severity prints anything.
    pub fn is_audible(self) -> bool {
        self != Severity::NoMessage
    }
}

/// The three severities a chain shift is checked with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Severities {
    /// Bits scanned out of the instruction register are wrong.
    pub ir_bad: Severity,
    /// No consistency check was possible.
    pub no_test: Severity,
    /// Scanned-out bits differ from expectation, or a write did not land.
    pub err_test: Severity,
}

impl Default for Severities {
    fn default() -> Self {
        Self {
            ir_bad: Severity::Fatal,
            no_test: Severity::Warning,
            err_test: Severity::Fatal,
        }
    }
}

impl Severities {
    /// All three checks silenced.
    pub const QUIET: Severities = Severities {
        ir_bad: Severity::NoMessage,
        no_test: Severity::NoMessage,
        err_test: Severity::NoMessage,
    };
}
