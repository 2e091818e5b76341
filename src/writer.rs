//! Streaming alignment output with optional index generation.
//!
//! A writer is created for one of the three output shapes, fed the
//! reference dictionary, then fed records. For binary output the header
//! and dictionary are serialized once, immediately before the first
//! alignment; when an index was requested, every mapped record's
//! virtual-address range is handed to the [`IndexBuilder`] as it is
//! written, and the block compressor is flushed at each reference boundary
//! so the index references clean block starts.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

use crate::codec::{binary, text};
use crate::dict::ReferenceDictionary;
use crate::errors::{Result, SamBamError};
use crate::format::{SamFormat, BAM_MAGIC};
use crate::index::{exceeds_fixed_bin_range, IndexBuilder, IndexKind, MAX_CSI_REF_LEN};
use crate::record::AlignmentRecord;

/// Default gzip/BGZF compression level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// `@PG` identity recorded in generated headers.
#[derive(Clone, Debug)]
pub struct ProgramInfo {
    /// Program id (`ID` field).
    pub id: String,
    /// Program version (`VN` field).
    pub version: String,
}

/// Configuration for a [`SamWriter`].
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Output shape.
    pub format: SamFormat,
    /// Index to build alongside the data file; binary output only.
    pub index: Option<IndexKind>,
    /// gzip/BGZF compression level, `0..=9`.
    pub compression_level: u32,
    /// Optional `@PG` line for the generated header.
    pub program: Option<ProgramInfo>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            format: SamFormat::Sam,
            index: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            program: None,
        }
    }
}

enum OutputSink {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
    Bgzf(noodles_bgzf::Writer<File>),
}

impl OutputSink {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.write_all(buf),
            Self::Gz(w) => w.write_all(buf),
            Self::Bgzf(w) => w.write_all(buf),
        }
    }

    /// Current virtual address; meaningful for block-compressed output
    /// only.
    fn virtual_position(&self) -> u64 {
        match self {
            Self::Bgzf(w) => u64::from(w.virtual_position()),
            _ => 0,
        }
    }

    /// Forces a block boundary on block-compressed output.
    fn flush_block(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gz(w) => w.flush(),
            Self::Bgzf(w) => w.flush(),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Gz(w) => w.finish().map(|_| ()),
            Self::Bgzf(mut w) => w.finish().map(|_| ()),
        }
    }
}

/// Streaming writer for SAM, gzip-SAM or BAM output.
///
/// Dropping a writer forces a final flush (including the remaining index
/// sections), but only [`SamWriter::finish`] reports the outcome; call it.
pub struct SamWriter {
    path: PathBuf,
    options: WriterOptions,
    sink: Option<OutputSink>,
    dict: ReferenceDictionary,
    index: Option<IndexBuilder>,
    started: bool,
    cur_ref: i32,
    records_written: u64,
    scratch: Vec<u8>,
}

impl SamWriter {
    /// Creates the output file.
    ///
    /// # Errors
    ///
    /// [`SamBamError::Create`] when the file cannot be created;
    /// [`SamBamError::InvalidParameter`] for an out-of-range compression
    /// level or an index request on text output.
    pub fn create(path: &Path, options: WriterOptions) -> Result<Self> {
        if options.compression_level > 9 {
            return Err(SamBamError::InvalidParameter {
                parameter: "compression_level".to_string(),
                reason: format!("{} is not in 0..=9", options.compression_level),
            });
        }
        if options.index.is_some() && options.format != SamFormat::Bam {
            return Err(SamBamError::InvalidParameter {
                parameter: "index".to_string(),
                reason: "an index can only accompany binary output".to_string(),
            });
        }

        let file = File::create(path)
            .map_err(|source| SamBamError::Create { path: path.to_path_buf(), source })?;
        let sink = match options.format {
            SamFormat::Sam => OutputSink::Plain(BufWriter::new(file)),
            SamFormat::SamGz => OutputSink::Gz(GzEncoder::new(
                BufWriter::new(file),
                Compression::new(options.compression_level),
            )),
            SamFormat::Bam => {
                let mut builder = noodles_bgzf::writer::Builder::default();
                if let Some(level) = noodles_bgzf::writer::CompressionLevel::new(
                    options.compression_level as u8,
                ) {
                    builder = builder.set_compression_level(level);
                }
                OutputSink::Bgzf(builder.build_from_writer(file))
            }
        };

        debug!("created {} as {:?}", path.display(), options.format);
        Ok(Self {
            path: path.to_path_buf(),
            options,
            sink: Some(sink),
            dict: ReferenceDictionary::new(),
            index: None,
            started: false,
            cur_ref: -1,
            records_written: 0,
            scratch: Vec::new(),
        })
    }

    /// Appends a reference sequence to the dictionary, returning its
    /// 1-based id. References must all be added before the first record.
    pub fn add_reference(&mut self, name: &str, length: u32) -> Result<u32> {
        if self.started {
            return Err(SamBamError::InvalidParameter {
                parameter: "reference".to_string(),
                reason: "the dictionary is closed once alignments begin".to_string(),
            });
        }
        if self.options.index.is_some() && u64::from(length) > MAX_CSI_REF_LEN {
            return Err(SamBamError::IndexRangeExceeded {
                end: u64::from(length),
                limit: MAX_CSI_REF_LEN,
            });
        }
        Ok(self.dict.add(name, length))
    }

    /// The dictionary accumulated so far.
    #[must_use]
    pub fn dictionary(&self) -> &ReferenceDictionary {
        &self.dict
    }

    /// The index format actually being built, once alignments have begun
    /// (a fixed-bin request is switched to the variable-depth format when
    /// a reference outruns its range).
    #[must_use]
    pub fn index_kind(&self) -> Option<IndexKind> {
        self.index.as_ref().map(IndexBuilder::kind).or(self.options.index)
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Closes the dictionary and emits the header (and, for binary
    /// output, the serialized dictionary). Called implicitly by the first
    /// [`SamWriter::write_record`].
    pub fn start_alignments(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let header_text = self.compose_header_text();
        let format = self.options.format;
        let sink = self.sink.as_mut().ok_or_else(|| SamBamError::InvalidParameter {
            parameter: "writer".to_string(),
            reason: "the writer is already finished".to_string(),
        })?;
        match format {
            SamFormat::Sam | SamFormat::SamGz => sink.write_all(header_text.as_bytes())?,
            SamFormat::Bam => {
                sink.write_all(&BAM_MAGIC)?;
                sink.write_all(&(header_text.len() as u32).to_le_bytes())?;
                sink.write_all(header_text.as_bytes())?;
                sink.write_all(&(self.dict.len() as u32).to_le_bytes())?;
                for seq in self.dict.iter() {
                    sink.write_all(&(seq.name.len() as u32 + 1).to_le_bytes())?;
                    sink.write_all(seq.name.as_bytes())?;
                    sink.write_all(&[0])?;
                    sink.write_all(&seq.length.to_le_bytes())?;
                }
            }
        }

        if let Some(requested) = self.options.index {
            let max_len = u64::from(self.dict.max_reference_length());
            let kind = if requested == IndexKind::Bai && exceeds_fixed_bin_range(max_len) {
                warn!(
                    "longest reference ({max_len}bp) outruns the fixed-bin index range; \
                     generating a variable-depth index instead"
                );
                IndexKind::Csi
            } else {
                requested
            };
            let index_path = sibling_path(&self.path, kind.extension());
            self.index = Some(IndexBuilder::create(
                &index_path,
                kind,
                self.dict.len() as u32,
                max_len,
                self.options.compression_level,
            )?);
        }

        Ok(())
    }

    /// Encodes and writes one record, feeding the index builder for
    /// mapped records when an index is being generated.
    pub fn write_record(&mut self, record: &AlignmentRecord) -> Result<()> {
        self.start_alignments()?;
        let ordinal = self.records_written;

        match self.options.format {
            SamFormat::Sam | SamFormat::SamGz => {
                self.scratch.clear();
                text::encode_line(record, &self.dict, &mut self.scratch)?;
                self.scratch.push(b'\n');
                let scratch = std::mem::take(&mut self.scratch);
                self.sink_mut()?.write_all(&scratch)?;
                self.scratch = scratch;
            }
            SamFormat::Bam => self.write_binary_record(record, ordinal)?,
        }

        self.records_written += 1;
        Ok(())
    }

    fn write_binary_record(&mut self, record: &AlignmentRecord, ordinal: u64) -> Result<()> {
        for id in [record.ref_id, record.mate_ref_id] {
            if id != -1 && self.dict.by_bam_id(id).is_none() {
                return Err(SamBamError::UnknownReference { name: format!("id {id}") });
            }
        }

        // Index bookkeeping happens before any bytes go out, so a record
        // past the index range leaves both files untouched.
        let mut span = None;
        if let Some(index) = &self.index {
            if record.is_mapped() {
                let start = record.pos as u64;
                let end = record.alignment_end().unwrap_or(start + 1);
                let limit = index.kind().max_reference_length();
                if end > limit {
                    return Err(SamBamError::IndexRangeExceeded { end, limit });
                }
                if record.ref_id < self.cur_ref {
                    return Err(SamBamError::MalformedRecord {
                        ordinal,
                        reason: "reference ids must be non-decreasing when indexing".to_string(),
                    });
                }
                if record.ref_id != self.cur_ref {
                    // Start the new reference on a clean block boundary.
                    self.sink_mut()?.flush_block()?;
                    self.cur_ref = record.ref_id;
                }
                span = Some((start, end));
            }
        }

        self.scratch.clear();
        let mut scratch = std::mem::take(&mut self.scratch);
        let encoded = binary::encode_record(record, &mut scratch, ordinal);
        let sink = self.sink_mut()?;
        encoded?;

        let start_va = sink.virtual_position();
        sink.write_all(&scratch)?;
        let end_va = sink.virtual_position();
        self.scratch = scratch;

        if let (Some((start, end)), Some(index)) = (span, &mut self.index) {
            index.add_alignment(record.ref_id as u32, start, end, start_va, end_va)?;
        }

        Ok(())
    }

    /// Flushes the data stream, serializes the remaining index sections
    /// and closes both files. A writer that never saw a record still emits
    /// a well-formed header.
    pub fn finish(&mut self) -> Result<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        self.start_alignments()?;

        let sink = self.sink.take().expect("checked above");
        sink.finish()?;
        if let Some(index) = self.index.take() {
            index.finish()?;
        }
        Ok(())
    }

    fn sink_mut(&mut self) -> Result<&mut OutputSink> {
        self.sink.as_mut().ok_or_else(|| SamBamError::InvalidParameter {
            parameter: "writer".to_string(),
            reason: "the writer is already finished".to_string(),
        })
    }

    fn compose_header_text(&self) -> String {
        use std::fmt::Write as _;

        let mut text = String::from("@HD\tVN:1.4\tSO:coordinate\n");
        for seq in self.dict.iter() {
            let _ = writeln!(text, "@SQ\tSN:{}\tLN:{}", seq.name, seq.length);
        }
        if let Some(program) = &self.options.program {
            let _ = writeln!(text, "@PG\tID:{}\tVN:{}", program.id, program.version);
        }
        text
    }
}

impl Drop for SamWriter {
    fn drop(&mut self) {
        if self.sink.is_some() {
            if let Err(e) = self.finish() {
                warn!("error finishing '{}' on drop: {e}", self.path.display());
            }
        }
    }
}

/// `out.bam` -> `out.bam.bai` / `out.bam.csi`.
fn sibling_path(path: &Path, extension: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(".");
    os.push(extension);
    PathBuf::from(os)
}
