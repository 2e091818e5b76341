//! Custom error types for SAM/BAM codec operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, SamBamError>;

/// Error type for SAM/BAM codec and index operations.
///
/// Header and dictionary errors are fatal to the stream they occur on;
/// [`SamBamError::MalformedRecord`] applies to a single record and carries
/// enough context for the caller to skip it and continue.
#[derive(Error, Debug)]
pub enum SamBamError {
    /// The file is neither text SAM, gzip-compressed SAM, nor BAM.
    #[error("unrecognized alignment file format: '{}'", path.display())]
    FormatUnrecognized {
        /// Path of the offending file.
        path: PathBuf,
    },

    /// The input file could not be opened for reading.
    #[error("unable to open '{}' for reading: {source}", path.display())]
    Open {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The output file could not be created or truncated.
    #[error("unable to create '{}': {source}", path.display())]
    Create {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A declared header or record length could not be satisfied by any
    /// amount of refilling from the input stream.
    #[error("truncated input: {reason}")]
    TruncatedHeader {
        /// What was being read when the stream ran dry.
        reason: String,
    },

    /// A single record could not be decoded or encoded.
    #[error("malformed record #{ordinal}: {reason}")]
    MalformedRecord {
        /// 0-based ordinal of the record within the stream.
        ordinal: u64,
        /// Explanation of the problem.
        reason: String,
    },

    /// An alignment references a sequence id or name that is not in the
    /// reference dictionary.
    #[error("unknown reference sequence '{name}'")]
    UnknownReference {
        /// Name or formatted id of the dangling reference.
        name: String,
    },

    /// An alignment ends at or beyond the maximum offset representable by
    /// the requested index format.
    #[error("alignment ending at {end} exceeds the {limit}bp index limit")]
    IndexRangeExceeded {
        /// Exclusive end position of the alignment.
        end: u64,
        /// Maximum reference length supported by the index format.
        limit: u64,
    },

    /// A staging buffer could not be grown.
    #[error("unable to allocate {requested} bytes of buffer space")]
    OutOfMemory {
        /// Number of bytes the failed growth asked for.
        requested: usize,
    },

    /// Invalid parameter value provided.
    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The parameter name.
        parameter: String,
        /// Explanation of why it's invalid.
        reason: String,
    },

    /// Underlying I/O error, surfaced unchanged.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_unrecognized_display() {
        let error = SamBamError::FormatUnrecognized { path: PathBuf::from("reads.xyz") };
        let msg = format!("{error}");
        assert!(msg.contains("unrecognized alignment file format"));
        assert!(msg.contains("reads.xyz"));
    }

    #[test]
    fn test_malformed_record_display() {
        let error = SamBamError::MalformedRecord {
            ordinal: 42,
            reason: "CIGAR op count disagrees with record size".to_string(),
        };
        let msg = format!("{error}");
        assert!(msg.contains("#42"));
        assert!(msg.contains("CIGAR op count"));
    }

    #[test]
    fn test_unknown_reference_display() {
        let error = SamBamError::UnknownReference { name: "chrZ".to_string() };
        assert!(format!("{error}").contains("'chrZ'"));
    }

    #[test]
    fn test_index_range_exceeded_display() {
        let error = SamBamError::IndexRangeExceeded { end: 0x2000_0001, limit: 0x2000_0000 };
        let msg = format!("{error}");
        assert!(msg.contains("536870913"));
        assert!(msg.contains("536870912"));
    }
}
