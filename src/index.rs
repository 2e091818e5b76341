//! Streaming construction of BAM index files.
//!
//! Two on-disk formats are produced: the fixed-bin BAI (5 levels of 14-bit
//! granularity, a 37450-slot bin table and a 16 kb linear index) and the
//! variable-depth CSI (parameterized `(min_shift, depth)` binning with a
//! per-bin minimum virtual address instead of a linear index). Both bucket
//! alignments into R-tree bins and coalesce adjacent alignments into
//! chunks of virtual-address space.
//!
//! The builder is a per-reference state machine: alignments must arrive
//! with non-decreasing reference ids, and each reference's bins are
//! serialized and cleared when the next reference begins. Chunks live in a
//! flat arena addressed by [`ChunkId`] handles; bins hold handles, never
//! raw indices from another bin's chain.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::errors::{Result, SamBamError};

/// Magic bytes of a BAI index file.
pub const BAI_MAGIC: [u8; 4] = *b"BAI\x01";

/// Magic bytes of a CSI index file.
pub const CSI_MAGIC: [u8; 4] = *b"CSI\x01";

/// BAI bins and linear offsets cannot address loci at or past 512 Mbp.
pub const MAX_BAI_REF_LEN: u64 = 0x2000_0000;

/// CSI has no inherent limit; a 2 Gbp cap keeps bin-table allocations
/// bounded.
pub const MAX_CSI_REF_LEN: u64 = 0x7fff_ffff;

/// Number of bin slots in the fixed-bin table.
pub const BAI_BIN_COUNT: usize = 37450;

/// Bits of granularity of the finest bin level and of the linear index
/// windows (16 kb).
pub const DEFAULT_MIN_SHIFT: u32 = 14;

/// Depth of the fixed-bin scheme, and the floor applied to derived CSI
/// depths.
pub const MIN_DEPTH: u32 = 5;

/// The two index file formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    /// Fixed-bin index with a linear index (`.bai`).
    Bai,
    /// Variable-depth index with per-bin minimum virtual addresses
    /// (`.csi`, itself block-compressed).
    Csi,
}

impl IndexKind {
    /// Longest reference length the format accepts.
    #[must_use]
    pub fn max_reference_length(self) -> u64 {
        match self {
            Self::Bai => MAX_BAI_REF_LEN,
            Self::Csi => MAX_CSI_REF_LEN,
        }
    }

    /// Conventional file name extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bai => "bai",
            Self::Csi => "csi",
        }
    }
}

/// Whether a reference of `length` bases is too long for the fixed-bin
/// format, letting callers pick the variable-depth format before any index
/// bytes are written.
#[inline]
#[must_use]
pub fn exceeds_fixed_bin_range(length: u64) -> bool {
    length >= MAX_BAI_REF_LEN
}

/// Computes the fixed-bin number for an alignment covering the 0-based
/// half-open interval `[beg, end)`.
#[must_use]
pub fn reg2bin(beg: u64, end: u64) -> u32 {
    let end = end.max(beg + 1) - 1;
    if beg >> 14 == end >> 14 {
        return (((1 << 15) - 1) / 7 + (beg >> 14)) as u32;
    }
    if beg >> 17 == end >> 17 {
        return (((1 << 12) - 1) / 7 + (beg >> 17)) as u32;
    }
    if beg >> 20 == end >> 20 {
        return (((1 << 9) - 1) / 7 + (beg >> 20)) as u32;
    }
    if beg >> 23 == end >> 23 {
        return (((1 << 6) - 1) / 7 + (beg >> 23)) as u32;
    }
    if beg >> 26 == end >> 26 {
        return (((1 << 3) - 1) / 7 + (beg >> 26)) as u32;
    }
    0
}

/// Computes the variable-depth bin number for `[beg, end)` under the given
/// `(min_shift, depth)` scheme. `reg2bin(beg, end)` is the
/// `(14, 5)` instance of this function.
#[must_use]
pub fn csi_reg2bin(beg: u64, end: u64, min_shift: u32, depth: u32) -> u32 {
    let end = end.max(beg + 1) - 1;
    let mut s = min_shift;
    let mut t = ((1u64 << (3 * depth)) - 1) / 7;
    let mut level = depth;
    while level > 0 {
        if beg >> s == end >> s {
            return (t + (beg >> s)) as u32;
        }
        level -= 1;
        s += 3;
        t -= 1 << (3 * level);
    }
    0
}

/// Derives the R-tree depth needed for the deepest bin to still resolve
/// single-base granularity over a reference of `max_len` bases.
#[must_use]
pub fn csi_depth(max_len: u64, min_shift: u32) -> u32 {
    let mut depth = 0;
    let mut span = 1u64 << min_shift;
    while max_len > span {
        depth += 1;
        span <<= 3;
    }
    depth
}

/// Number of bin slots a `(min_shift, depth)` scheme can address, plus one
/// slot of headroom as the fixed table carries.
fn bin_table_len(depth: u32) -> usize {
    (((1u64 << (3 * (depth + 1))) - 1) / 7) as usize + 1
}

/// Typed handle into the chunk arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChunkId(u32);

/// A contiguous span of alignments in virtual-address space within one
/// bin. Loci are 0-based half-open.
#[derive(Debug)]
struct Chunk {
    start: u64,
    end: u64,
    start_va: u64,
    end_va: u64,
    next: Option<ChunkId>,
}

/// Per-bin accumulation state for the current reference.
#[derive(Clone, Copy, Default)]
struct BinState {
    chunk_count: u32,
    first: Option<ChunkId>,
    last: Option<ChunkId>,
    /// Minimum virtual address of any alignment assigned to the bin;
    /// serialized for CSI only.
    min_va: u64,
}

enum IndexSink {
    Plain(BufWriter<File>),
    Bgzf(noodles_bgzf::Writer<File>),
}

impl IndexSink {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.write_all(buf),
            Self::Bgzf(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Bgzf(mut w) => w.finish().map(|_| ()),
        }
    }
}

/// Streaming builder for a BAI or CSI index file.
///
/// Feed every mapped alignment, in file order, with its loci span and the
/// virtual addresses the data writer produced around it; call
/// [`IndexBuilder::finish`] when the data stream closes. References the
/// stream never touches still receive empty index sections so the file
/// carries exactly `n_ref` of them.
pub struct IndexBuilder {
    kind: IndexKind,
    sink: IndexSink,
    n_ref: u32,
    refs_flushed: u32,
    cur_ref: Option<u32>,
    min_shift: u32,
    depth: u32,
    bins: Vec<BinState>,
    bins_with_chunks: u32,
    chunks: Vec<Chunk>,
    /// Linear index of the current reference (fixed-bin format only):
    /// first-alignment virtual address per 16 kb window.
    linear: Vec<u64>,
    /// Windows `0..next_window` have been recorded.
    next_window: usize,
}

impl IndexBuilder {
    /// Creates the index file and writes its header.
    ///
    /// `n_ref` fixes the number of reference sections the file will carry;
    /// `max_ref_len` parameterizes the variable-depth binning (ignored by
    /// the fixed-bin format) and `compression_level` the block compression
    /// of the CSI output.
    pub fn create(
        path: &Path,
        kind: IndexKind,
        n_ref: u32,
        max_ref_len: u64,
        compression_level: u32,
    ) -> Result<Self> {
        let file = File::create(path)
            .map_err(|source| SamBamError::Create { path: path.to_path_buf(), source })?;

        let (mut sink, depth, bins) = match kind {
            IndexKind::Bai => {
                let sink = IndexSink::Plain(BufWriter::new(file));
                (sink, MIN_DEPTH, vec![BinState::default(); BAI_BIN_COUNT])
            }
            IndexKind::Csi => {
                let depth = csi_depth(max_ref_len, DEFAULT_MIN_SHIFT).max(MIN_DEPTH);
                let mut builder = noodles_bgzf::writer::Builder::default();
                if let Some(level) =
                    noodles_bgzf::writer::CompressionLevel::new(compression_level as u8)
                {
                    builder = builder.set_compression_level(level);
                }
                let sink = IndexSink::Bgzf(builder.build_from_writer(file));
                (sink, depth, vec![BinState::default(); bin_table_len(depth)])
            }
        };

        match kind {
            IndexKind::Bai => {
                sink.write_all(&BAI_MAGIC)?;
                sink.write_all(&n_ref.to_le_bytes())?;
            }
            IndexKind::Csi => {
                sink.write_all(&CSI_MAGIC)?;
                sink.write_all(&DEFAULT_MIN_SHIFT.to_le_bytes())?;
                sink.write_all(&depth.to_le_bytes())?;
                sink.write_all(&0u32.to_le_bytes())?; // l_aux, reserved
                sink.write_all(&n_ref.to_le_bytes())?;
            }
        }

        let linear = match kind {
            IndexKind::Bai => vec![0u64; (MAX_BAI_REF_LEN >> DEFAULT_MIN_SHIFT) as usize],
            IndexKind::Csi => Vec::new(),
        };

        Ok(Self {
            kind,
            sink,
            n_ref,
            refs_flushed: 0,
            cur_ref: None,
            min_shift: DEFAULT_MIN_SHIFT,
            depth,
            bins,
            bins_with_chunks: 0,
            chunks: Vec::new(),
            linear,
            next_window: 0,
        })
    }

    /// The format being built.
    #[must_use]
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Buckets one mapped alignment.
    ///
    /// `ref_id` is the 0-based reference id (non-decreasing across calls),
    /// `[start, end)` the alignment's reference span and
    /// `start_va..end_va` the virtual-address range its encoded bytes
    /// occupy in the data file.
    ///
    /// # Errors
    ///
    /// [`SamBamError::IndexRangeExceeded`] when `end` is past the format's
    /// limit (nothing is recorded for the alignment);
    /// [`SamBamError::InvalidParameter`] when `ref_id` goes backwards or
    /// past `n_ref`.
    pub fn add_alignment(
        &mut self,
        ref_id: u32,
        start: u64,
        end: u64,
        start_va: u64,
        end_va: u64,
    ) -> Result<()> {
        let limit = self.kind.max_reference_length();
        if end > limit {
            return Err(SamBamError::IndexRangeExceeded { end, limit });
        }
        self.set_reference(ref_id)?;

        if self.kind == IndexKind::Bai {
            self.record_linear(start, start_va);
        }

        let bin_no = match self.kind {
            IndexKind::Bai => reg2bin(start, end),
            IndexKind::Csi => csi_reg2bin(start, end, self.min_shift, self.depth),
        } as usize;

        let mut bin = self.bins[bin_no];
        match bin.last {
            None => {
                let id = self.push_chunk(start, end, start_va, end_va);
                bin = BinState { chunk_count: 1, first: Some(id), last: Some(id), min_va: start_va };
                self.bins_with_chunks += 1;
            }
            Some(last_id) => {
                bin.min_va = bin.min_va.min(start_va);
                let last = &mut self.chunks[last_id.0 as usize];
                if start > last.end + 1 {
                    // More than one base past the open chunk: start a new one.
                    let id = self.push_chunk(start, end, start_va, end_va);
                    self.chunks[last_id.0 as usize].next = Some(id);
                    bin.last = Some(id);
                    bin.chunk_count += 1;
                } else {
                    if start < last.start {
                        last.start = start;
                        last.start_va = start_va;
                    }
                    last.end = last.end.max(end);
                    last.end_va = end_va;
                }
            }
        }
        self.bins[bin_no] = bin;

        Ok(())
    }

    /// Serializes the remaining reference sections and closes the file.
    pub fn finish(mut self) -> Result<()> {
        while self.refs_flushed < self.n_ref {
            self.flush_reference()?;
        }
        self.sink.finish()?;
        Ok(())
    }

    fn set_reference(&mut self, ref_id: u32) -> Result<()> {
        if ref_id >= self.n_ref {
            return Err(SamBamError::InvalidParameter {
                parameter: "ref_id".to_string(),
                reason: format!("{ref_id} is outside the {} declared references", self.n_ref),
            });
        }
        if let Some(cur) = self.cur_ref {
            if ref_id < cur {
                return Err(SamBamError::InvalidParameter {
                    parameter: "ref_id".to_string(),
                    reason: "reference ids must be non-decreasing".to_string(),
                });
            }
        }
        // Flush every reference before the new one; those between the last
        // seen and this one get empty sections.
        while self.refs_flushed < ref_id {
            self.flush_reference()?;
        }
        self.cur_ref = Some(ref_id);
        Ok(())
    }

    fn push_chunk(&mut self, start: u64, end: u64, start_va: u64, end_va: u64) -> ChunkId {
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(Chunk { start, end, start_va, end_va, next: None });
        id
    }

    fn record_linear(&mut self, start: u64, start_va: u64) {
        let window = (start >> self.min_shift) as usize;
        if window < self.next_window {
            return;
        }
        for slot in &mut self.linear[self.next_window..=window] {
            *slot = start_va;
        }
        self.next_window = window + 1;
    }

    /// Writes one reference section from the accumulated state, then
    /// clears the state for the next reference.
    fn flush_reference(&mut self) -> Result<()> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&self.bins_with_chunks.to_le_bytes());
        if self.bins_with_chunks > 0 {
            for (bin_no, bin) in self.bins.iter().enumerate() {
                if bin.chunk_count == 0 {
                    continue;
                }
                buf.extend_from_slice(&(bin_no as u32).to_le_bytes());
                if self.kind == IndexKind::Csi {
                    buf.extend_from_slice(&bin.min_va.to_le_bytes());
                }
                buf.extend_from_slice(&bin.chunk_count.to_le_bytes());
                let mut id = bin.first;
                while let Some(chunk_id) = id {
                    let chunk = &self.chunks[chunk_id.0 as usize];
                    buf.extend_from_slice(&chunk.start_va.to_le_bytes());
                    buf.extend_from_slice(&chunk.end_va.to_le_bytes());
                    id = chunk.next;
                }
            }
        }

        if self.kind == IndexKind::Bai {
            buf.extend_from_slice(&(self.next_window as u32).to_le_bytes());
            for slot in &self.linear[..self.next_window] {
                buf.extend_from_slice(&slot.to_le_bytes());
            }
        }

        self.sink.write_all(&buf)?;
        self.refs_flushed += 1;

        if self.bins_with_chunks > 0 {
            self.bins.fill(BinState::default());
            self.bins_with_chunks = 0;
            self.chunks.clear();
        }
        if self.next_window > 0 {
            self.linear[..self.next_window].fill(0);
            self.next_window = 0;
        }

        Ok(())
    }
}
