use std::io;
use std::path::PathBuf;

use failure;

/// Structural error taxonomy (see `SPEC_FULL.md` §7, §10.2). Per-event
/// invalidity (`Hit.valid = false`, a dropped malformed frame) is data, not
/// an `Error`; only failures that should abort a run are variants here.
pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "could not open raw data file prefix '{}': {}", prefix, inner)]
    RawFileOpen { prefix: String, inner: io::Error },

    #[fail(display = "short read from '{}': expected {} bytes, got {}", path, expected, got)]
    ShortRead {
        path: String,
        expected: usize,
        got: usize,
    },

    #[fail(display = "required calibration table '{:?}' was not supplied", path)]
    MissingCalibrationTable { path: PathBuf },

    #[fail(display = "could not read calibration table '{:?}': {}", path, inner)]
    CalibrationTableRead { path: PathBuf, inner: io::Error },

    #[fail(
        display = "invalid trigger map entry at line {}: '{}' ({})",
        line_no, line, reason
    )]
    InvalidTriggerMapEntry {
        line_no: usize,
        line: String,
        reason: &'static str,
    },

    #[fail(display = "thread pool ordering invariant violated: {}", detail)]
    OrderingInvariant { detail: String },

    #[fail(display = "unexpected error: {}", inner)]
    Misc { inner: failure::Error },
}

impl From<failure::Error> for Error {
    fn from(inner: failure::Error) -> Self {
        Error::Misc { inner }
    }
}
