// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Mapping of library errors to process exit codes.

use sizelib::{archive, sizefile, ErrorKind};

/// Errors surfaced by the `supersize` commands.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to create size info")]
    Archive(#[from] archive::Error),

    #[error("unable to process size file")]
    SizeFile(#[from] sizefile::Error),

    #[error("unable to write report")]
    Report(#[source] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Archive(e) => e.kind(),
            Error::SizeFile(e) => e.kind(),
            Error::Report(_) => ErrorKind::Io,
        }
    }
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    UserError = 1,
    InvariantViolation = 2,
    ToolchainMissing = 3,
}

impl From<ErrorKind> for ExitStatus {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::MalformedInput | ErrorKind::Io => ExitStatus::UserError,
            ErrorKind::InvariantViolation => ExitStatus::InvariantViolation,
            ErrorKind::ToolchainMissing => ExitStatus::ToolchainMissing,
        }
    }
}

impl From<&Error> for ExitStatus {
    fn from(e: &Error) -> Self {
        e.kind().into()
    }
}

impl<T> From<&Result<T, Error>> for ExitStatus {
    fn from(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => ExitStatus::Success,
            Err(e) => e.into(),
        }
    }
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        let ok: Result<(), Error> = Ok(());
        assert_eq!(ExitStatus::from(&ok).code(), 0);

        let missing: Result<(), Error> = Err(archive::Error::NoInputs.into());
        assert_eq!(ExitStatus::from(&missing).code(), 1);

        let corrupt: Result<(), Error> = Err(sizefile::Error::ChecksumMismatch.into());
        assert_eq!(ExitStatus::from(&corrupt), ExitStatus::UserError);

        assert_eq!(ExitStatus::from(ErrorKind::InvariantViolation).code(), 2);
        assert_eq!(ExitStatus::from(ErrorKind::ToolchainMissing).code(), 3);
    }

    #[test]
    fn corrupt_size_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.size");
        std::fs::write(&path, b"not a size file").unwrap();

        let err: Error = sizefile::read_path(&path).unwrap_err().into();
        assert_eq!(ExitStatus::from(&err), ExitStatus::UserError);
    }
}
