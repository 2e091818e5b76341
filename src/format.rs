//! Alignment file format classification.
//!
//! The format is decided once, at open time, and carried as a closed
//! variant; all downstream behavior dispatches on it rather than re-probing
//! the stream.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::errors::{Result, SamBamError};

/// Magic bytes at the start of a decompressed BAM stream.
pub const BAM_MAGIC: [u8; 4] = *b"BAM\x01";

/// Prefix every text SAM header is expected to start with.
const SAM_HEADER_PREFIX: &[u8] = b"@HD\tVN:";

/// Number of leading bytes inspected by the content probe.
const PROBE_LEN: usize = 100;

/// The three on-disk shapes an alignment file can take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamFormat {
    /// Tab-delimited text SAM.
    Sam,
    /// Text SAM compressed with plain gzip.
    SamGz,
    /// Block-compressed binary BAM.
    Bam,
}

impl SamFormat {
    /// Whether the format is binary BAM.
    #[inline]
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Bam)
    }
}

/// Classifies a file as text SAM, gzip-compressed SAM, or BAM.
///
/// A `.gz` suffix means gzip SAM and a `.bam` suffix means BAM, both
/// case-insensitively. Any other name falls back to a content probe of the
/// first ~100 bytes: a block-compressed stream whose decompressed bytes
/// start with `BAM\x01` is BAM, a stream starting with the `@HD\tVN:`
/// header prefix is text SAM.
///
/// # Errors
///
/// [`SamBamError::Open`] if the file cannot be read at all, otherwise
/// [`SamBamError::FormatUnrecognized`] when neither probe matches.
pub fn detect_format(path: &Path) -> Result<SamFormat> {
    if has_extension(path, "gz") {
        return Ok(SamFormat::SamGz);
    }
    if has_extension(path, "bam") {
        return Ok(SamFormat::Bam);
    }

    // Probe for BAM first: read the leading bytes through the block
    // decompressor and check for the magic marker. A non-BGZF stream fails
    // to decompress, which simply falls through to the text probe.
    let file = open(path)?;
    let mut bgzf = noodles_bgzf::Reader::new(file);
    let mut magic = [0u8; BAM_MAGIC.len()];
    if bgzf.read_exact(&mut magic).is_ok() && magic == BAM_MAGIC {
        return Ok(SamFormat::Bam);
    }

    let mut head = Vec::with_capacity(PROBE_LEN);
    open(path)?.take(PROBE_LEN as u64).read_to_end(&mut head)?;
    if head.starts_with(SAM_HEADER_PREFIX) {
        return Ok(SamFormat::Sam);
    }

    Err(SamBamError::FormatUnrecognized { path: path.to_path_buf() })
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| SamBamError::Open { path: path.to_path_buf(), source })
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_suffix_classification() {
        assert_eq!(detect_format(Path::new("missing/reads.GZ")).unwrap(), SamFormat::SamGz);
        assert_eq!(detect_format(Path::new("missing/reads.sam.gz")).unwrap(), SamFormat::SamGz);
        assert_eq!(detect_format(Path::new("missing/reads.Bam")).unwrap(), SamFormat::Bam);
    }

    #[test]
    fn test_content_probe_text_sam() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads");
        std::fs::write(&path, b"@HD\tVN:1.4\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n").unwrap();
        assert_eq!(detect_format(&path).unwrap(), SamFormat::Sam);
    }

    #[test]
    fn test_content_probe_bam() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads");
        let file = File::create(&path).unwrap();
        let mut writer = noodles_bgzf::Writer::new(file);
        writer.write_all(&BAM_MAGIC).unwrap();
        writer.write_all(&[0u8; 4]).unwrap();
        writer.finish().unwrap();
        assert_eq!(detect_format(&path).unwrap(), SamFormat::Bam);
    }

    #[test]
    fn test_content_probe_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads");
        std::fs::write(&path, b"definitely not an alignment file\n").unwrap();
        assert!(matches!(
            detect_format(&path),
            Err(SamBamError::FormatUnrecognized { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_open_error() {
        assert!(matches!(
            detect_format(Path::new("/no/such/file")),
            Err(SamBamError::Open { .. })
        ));
    }
}
