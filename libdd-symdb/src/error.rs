// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::collections::TryReserveError;
use std::io;

/// Errors caused by malformed or corrupted binary data. These are never
/// retried: the same bytes will fail the same way.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FormatError {
    /// A length or size field is out of bounds, or the data is shorter than
    /// its header claims.
    #[error("invalid size")]
    InvalidSize,
    /// The checksum stored alongside the data does not match its contents.
    #[error("invalid CRC")]
    InvalidCrc,
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unknown version: {0}")]
    UnknownVersion(u32),
    /// The data passed its checksum and size checks but could not be
    /// interpreted, e.g. an unknown encoding tag.
    #[error("malformed data: {0}")]
    Malformed(&'static str),
}

/// Errors returned by the symbol database.
#[derive(Debug, thiserror::Error)]
pub enum SymdbError {
    /// The storage backend failed.
    #[error("bucket: {0}")]
    Bucket(#[source] anyhow::Error),
    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A parameter was incorrect, e.g. a reference to an unknown symbol.
    #[error("invalid input: {0}")]
    InvalidInput(Cow<'static, str>),
    /// A stack trace id does not belong to any chunk of the partition.
    #[error("invalid range: stack traces can't be resolved")]
    InvalidStacktraceRange,
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Failed to allocate memory needed for the operation.
    #[error("out of memory")]
    OutOfMemory,
    #[error("partition not found")]
    PartitionNotFound,
    /// The block uses a feature this crate can read the index of, but not
    /// the data, e.g. Parquet-backed symbol tables.
    #[error("unsupported: {0}")]
    Unsupported(Cow<'static, str>),
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl SymdbError {
    pub fn other(error: impl Into<Cow<'static, str>>) -> Self {
        Self::Other(error.into())
    }

    pub fn invalid_input(error: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidInput(error.into())
    }

    /// Create a formatted error string.
    ///
    /// # Example
    ///
    /// ```
    /// use libdd_symdb::SymdbError;
    /// let id = 42u32;
    /// let _err = SymdbError::fmt(format_args!("unknown function id: {id}"));
    /// ```
    #[cold]
    pub fn fmt(format_args: std::fmt::Arguments) -> Self {
        Self::Other(Cow::Owned(std::fmt::format(format_args)))
    }

    /// Returns true if the error is caused by corrupted or malformed data.
    pub fn is_format_error(&self) -> bool {
        matches!(self, SymdbError::Format(_))
    }
}

impl From<TryReserveError> for SymdbError {
    #[cold]
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<hashbrown::TryReserveError> for SymdbError {
    #[cold]
    fn from(_: hashbrown::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<tokio::task::JoinError> for SymdbError {
    #[cold]
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::other(format!("task failed: {err}"))
        }
    }
}

impl From<FormatError> for io::Error {
    #[cold]
    fn from(err: FormatError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

pub type Result<T, E = SymdbError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_are_recognized() {
        let err = SymdbError::from(FormatError::InvalidCrc);
        assert!(err.is_format_error());
        assert_eq!(err.to_string(), "invalid CRC");
        assert!(!SymdbError::PartitionNotFound.is_format_error());
    }

    #[test]
    fn io_error_keeps_format_error() {
        let err = io::Error::from(FormatError::InvalidMagic);
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<FormatError>())
            .copied();
        assert_eq!(inner, Some(FormatError::InvalidMagic));
    }

    #[test]
    fn caller_error_messages() {
        assert_eq!(
            SymdbError::PartitionNotFound.to_string(),
            "partition not found"
        );
        assert_eq!(
            SymdbError::InvalidStacktraceRange.to_string(),
            "invalid range: stack traces can't be resolved"
        );
    }
}
