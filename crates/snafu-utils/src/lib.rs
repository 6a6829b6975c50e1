//! Error plumbing shared by the `mempool` crates.
//!
//! - [`Location`]: call-site capture for `#[snafu(implicit)]` fields.
//! - [`GenericError`]: a whatever-style error for binaries and tests.
//! - [`Report`]: renders an error together with its chain of sources.

use std::{error::Error, fmt, panic};

use snafu::{GenerateImplicitData, Snafu};

/// Source location where an error was constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

impl GenericError {
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }
}

/// Human-readable rendering of an error and its causes.
///
/// ```text
/// Error: failed to open shared arena
///
/// Caused by:
///    0: failed to create shared segment, key=0x61020034, size=2088
///    1: Permission denied (os error 13)
/// ```
pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }

    pub fn into_inner(self) -> E {
        self.error
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::io;

    use snafu::{ResultExt as _, whatever};

    use super::*;

    fn failing_io() -> Result<(), GenericError> {
        let res: Result<(), io::Error> = Err(io::Error::other("disk on fire"));
        res.whatever_context("failed to read blob")
    }

    #[test]
    fn test_report_without_source() {
        fn fail() -> Result<(), GenericError> {
            whatever!("pool exhausted");
        }
        let report = Report::new(fail().unwrap_err());
        assert_eq!(report.to_string(), "Error: pool exhausted\n");
    }

    #[test]
    fn test_report_with_source_chain() {
        let report = Report::new(failing_io().unwrap_err());
        let text = report.to_string();
        assert!(text.starts_with("Error: failed to read blob\n"));
        assert!(text.contains("Caused by:\n"));
        assert!(text.contains("   0: disk on fire\n"));
    }

    #[test]
    fn test_location_points_at_caller() {
        let err = failing_io().unwrap_err();
        assert!(err.location().file().ends_with("lib.rs"));
        assert!(err.location().line() > 0);
    }
}
