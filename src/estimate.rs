//! Best-effort sampling of record-length statistics.
//!
//! Callers use these estimates to size buffers and pre-allocations before
//! a full pass; nothing here is authoritative. The sampler reads a bounded
//! prefix of the file and treats any decode error as the end of the
//! sample rather than a failure.

use std::path::Path;

use log::debug;

use crate::errors::Result;
use crate::format::SamFormat;
use crate::reader::SamReader;

/// Upper bound on the number of records sampled.
pub const MAX_SAMPLED_RECORDS: u64 = 100_000;

/// Sampled name- and sequence-length statistics for an alignment file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeEstimates {
    /// On-disk file size in bytes.
    pub file_size: u64,
    /// Estimated total number of records; exact when the whole file fit
    /// inside the sample, extrapolated otherwise.
    pub est_total_records: u64,
    /// Number of records actually sampled.
    pub sampled_records: u64,
    /// Shortest sampled read name.
    pub min_name_len: u32,
    /// Longest sampled read name.
    pub max_name_len: u32,
    /// Mean sampled read-name length, rounded up.
    pub mean_name_len: u32,
    /// Shortest sampled sequence.
    pub min_seq_len: u32,
    /// Longest sampled sequence.
    pub max_seq_len: u32,
    /// Mean sampled sequence length, rounded up.
    pub mean_seq_len: u32,
}

/// Samples up to [`MAX_SAMPLED_RECORDS`] records from the start of the
/// file and derives length statistics and a total-record estimate.
///
/// # Errors
///
/// Only open and format classification errors propagate; a decode error
/// mid-sample truncates the sample instead.
pub fn estimate_sizes(path: &Path) -> Result<SizeEstimates> {
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut reader = SamReader::open(path)?;

    // Scale the on-disk size by a guesstimated compression ratio before
    // extrapolating record counts from it.
    let scaled_size = match reader.format() {
        SamFormat::Sam => file_size,
        SamFormat::SamGz => file_size * 3,
        SamFormat::Bam => file_size * 4,
    };

    let mut stats = SizeEstimates { file_size, ..SizeEstimates::default() };
    let mut sum_name_len: u64 = 0;
    let mut sum_seq_len: u64 = 0;

    while stats.sampled_records < MAX_SAMPLED_RECORDS {
        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                debug!("size sampling of '{}' cut short: {e}", path.display());
                break;
            }
        };

        let name_len = record.name.len() as u32;
        let seq_len = record.seq.len() as u32;
        if stats.sampled_records == 0 {
            stats.min_name_len = name_len;
            stats.min_seq_len = seq_len;
        }
        stats.min_name_len = stats.min_name_len.min(name_len);
        stats.max_name_len = stats.max_name_len.max(name_len);
        stats.min_seq_len = stats.min_seq_len.min(seq_len);
        stats.max_seq_len = stats.max_seq_len.max(seq_len);
        sum_name_len += u64::from(name_len);
        sum_seq_len += u64::from(seq_len);
        stats.sampled_records += 1;
    }

    if stats.sampled_records == 0 {
        return Ok(stats);
    }

    let n = stats.sampled_records;
    stats.mean_name_len = ((sum_name_len + n - 1) / n) as u32;
    stats.mean_seq_len = ((sum_seq_len + n - 1) / n) as u32;

    // When the sample hit its cap, extrapolate from the scaled size:
    // assume the header is ~2% of the file and name + sequence make up
    // about two thirds of a record's bytes.
    stats.est_total_records = if n < MAX_SAMPLED_RECORDS {
        n
    } else {
        let per_record = u64::from(stats.mean_name_len + stats.mean_seq_len) * 3 / 2;
        (scaled_size * 98 / 100) / per_record.max(1)
    };

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cigar::{CigarOp, CigarOpKind};
    use crate::record::AlignmentRecord;
    use crate::sequence::PackedSequence;
    use crate::writer::{SamWriter, WriterOptions};

    fn write_sample(path: &Path, count: usize) {
        let mut writer = SamWriter::create(path, WriterOptions::default()).unwrap();
        writer.add_reference("chr1", 100_000).unwrap();
        for i in 0..count {
            let len = 10 + (i % 3) as u32 * 5;
            let record = AlignmentRecord {
                name: format!("read{i}").into(),
                ref_id: 0,
                pos: (i * 20) as i32,
                mapq: 60,
                cigar: [CigarOp::new(len, CigarOpKind::Match)].into_iter().collect(),
                mate_ref_id: -1,
                mate_pos: -1,
                seq: PackedSequence::from_ascii(&vec![b'C'; len as usize]),
                ..AlignmentRecord::default()
            };
            writer.write_record(&record).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_estimates_from_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.sam");
        write_sample(&path, 30);

        let stats = estimate_sizes(&path).unwrap();
        assert_eq!(stats.sampled_records, 30);
        // Sample under the cap: the estimate is exact.
        assert_eq!(stats.est_total_records, 30);
        assert_eq!(stats.min_seq_len, 10);
        assert_eq!(stats.max_seq_len, 20);
        assert!(stats.mean_seq_len >= 10 && stats.mean_seq_len <= 20);
        assert_eq!(stats.min_name_len, 5); // "read0"
        assert_eq!(stats.max_name_len, 6); // "read29"
        assert!(stats.file_size > 0);
    }

    #[test]
    fn test_decode_error_truncates_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.sam");
        let mut content = String::from("@HD\tVN:1.4\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n");
        content.push_str("r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGT\t*\n");
        content.push_str("r2\t0\tchr1\tnot-a-position\n");
        content.push_str("r3\t0\tchr1\t151\t60\t4M\t*\t0\t0\tACGT\t*\n");
        std::fs::write(&path, content).unwrap();

        let stats = estimate_sizes(&path).unwrap();
        assert_eq!(stats.sampled_records, 1);
        assert_eq!(stats.est_total_records, 1);
    }

    #[test]
    fn test_empty_file_yields_zero_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.sam");
        std::fs::write(&path, "@HD\tVN:1.4\tSO:coordinate\n").unwrap();

        let stats = estimate_sizes(&path).unwrap();
        assert_eq!(stats.sampled_records, 0);
        assert_eq!(stats.est_total_records, 0);
    }
}
