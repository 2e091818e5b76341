//! Alignment-file codec and random-access index builder for the SAM/BAM
//! family.
//!
//! The crate reads and writes alignments as tab-delimited text SAM
//! (optionally gzip-compressed) or block-compressed binary BAM, and can
//! emit either of two on-disk index formats while writing: the fixed-bin
//! BAI and the variable-depth CSI. Everything is streaming and
//! single-pass; input larger than memory is handled through a growable
//! staging buffer refilled in bulk.
//!
//! # Reading
//!
//! ```no_run
//! use sambam::SamReader;
//!
//! # fn main() -> sambam::Result<()> {
//! let mut reader = SamReader::open("aligned.bam".as_ref())?;
//! while let Some(record) = reader.read_record()? {
//!     println!("{}: {}..{:?}", record.name, record.pos, record.alignment_end());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Writing with an index
//!
//! ```no_run
//! use sambam::{IndexKind, SamFormat, SamWriter, WriterOptions};
//!
//! # fn main() -> sambam::Result<()> {
//! let options = WriterOptions {
//!     format: SamFormat::Bam,
//!     index: Some(IndexKind::Bai),
//!     ..WriterOptions::default()
//! };
//! let mut writer = SamWriter::create("out.bam".as_ref(), options)?;
//! writer.add_reference("chr1", 248_956_422)?;
//! // feed records in reference order...
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```
//!
//! Records must arrive with non-decreasing reference ids for index
//! generation; this is a requirement of both index formats.
//!
//! A codec instance is single-threaded and owns all of its buffers;
//! multi-threaded callers use one instance per thread over disjoint files.

pub mod cigar;
pub mod codec;
pub mod dict;
pub mod errors;
pub mod estimate;
pub mod format;
pub mod index;
pub mod reader;
pub mod record;
pub mod sequence;
pub mod writer;

pub use cigar::{Cigar, CigarOp, CigarOpKind};
pub use dict::{ReferenceDictionary, ReferenceSeq};
pub use errors::{Result, SamBamError};
pub use estimate::{estimate_sizes, SizeEstimates};
pub use format::{detect_format, SamFormat};
pub use index::{exceeds_fixed_bin_range, IndexBuilder, IndexKind};
pub use reader::SamReader;
pub use record::{flags, AlignmentRecord, AuxArray, AuxTag, AuxValue};
pub use sequence::PackedSequence;
pub use writer::{ProgramInfo, SamWriter, WriterOptions};
