//! Streaming alignment input across the three on-disk formats.
//!
//! The reader owns a growable staging buffer refilled in large chunks from
//! the underlying source (plain file, gzip, or the block-compressed
//! service) and hands out whole text lines or whole binary records. Header
//! bytes are consumed once, at open; the reference dictionary they declare
//! is available for the rest of the pass.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use log::debug;

use crate::codec::{binary, text};
use crate::dict::ReferenceDictionary;
use crate::errors::{Result, SamBamError};
use crate::format::{detect_format, SamFormat, BAM_MAGIC};
use crate::record::AlignmentRecord;

/// Bytes requested from the source per refill.
const REFILL_CHUNK: usize = 64 * 1024;

enum InputSource {
    Plain(File),
    Gz(MultiGzDecoder<File>),
    Bgzf(noodles_bgzf::Reader<File>),
}

impl Read for InputSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gz(r) => r.read(buf),
            Self::Bgzf(r) => r.read(buf),
        }
    }
}

/// Growable staging buffer with bulk refills.
///
/// Unconsumed bytes are compacted to the front before each refill, so the
/// buffer only grows when a single line or record outruns its current
/// capacity.
struct StagingBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
}

impl StagingBuffer {
    fn new() -> Self {
        Self { data: Vec::new(), start: 0, end: 0, eof: false }
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.start += n;
    }

    /// Reads one chunk from `src`, returning the number of bytes added
    /// (0 at end of stream).
    fn refill(&mut self, src: &mut InputSource) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }

        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        let target = self.end + REFILL_CHUNK;
        if self.data.len() < target {
            let additional = target - self.data.len();
            self.data
                .try_reserve(additional)
                .map_err(|_| SamBamError::OutOfMemory { requested: additional })?;
            self.data.resize(target, 0);
        }

        let n = src.read(&mut self.data[self.end..target])?;
        if n == 0 {
            self.eof = true;
        } else {
            self.end += n;
        }
        Ok(n)
    }

    /// Refills until at least `n` bytes are available; `false` when the
    /// stream ends first.
    fn fill_to(&mut self, src: &mut InputSource, n: usize) -> Result<bool> {
        while self.available() < n && !self.eof {
            self.refill(src)?;
        }
        Ok(self.available() >= n)
    }
}

/// Streaming reader over a SAM, gzip-SAM or BAM file.
pub struct SamReader {
    format: SamFormat,
    src: InputSource,
    buf: StagingBuffer,
    dict: ReferenceDictionary,
    header_text: String,
    ordinal: u64,
}

impl SamReader {
    /// Opens a file, classifying its format by suffix and content.
    pub fn open(path: &Path) -> Result<Self> {
        let format = detect_format(path)?;
        Self::open_with_format(path, format)
    }

    /// Opens a file whose format the caller already knows.
    pub fn open_with_format(path: &Path, format: SamFormat) -> Result<Self> {
        let file = File::open(path)
            .map_err(|source| SamBamError::Open { path: path.to_path_buf(), source })?;
        let src = match format {
            SamFormat::Sam => InputSource::Plain(file),
            SamFormat::SamGz => InputSource::Gz(MultiGzDecoder::new(file)),
            SamFormat::Bam => InputSource::Bgzf(noodles_bgzf::Reader::new(file)),
        };

        let mut reader = Self {
            format,
            src,
            buf: StagingBuffer::new(),
            dict: ReferenceDictionary::new(),
            header_text: String::new(),
            ordinal: 0,
        };

        debug!("opened {} as {:?}", path.display(), format);
        match format {
            SamFormat::Bam => reader.read_binary_header(path)?,
            SamFormat::Sam | SamFormat::SamGz => reader.read_text_header()?,
        }

        Ok(reader)
    }

    /// The format decided at open time.
    #[must_use]
    pub fn format(&self) -> SamFormat {
        self.format
    }

    /// The reference dictionary declared by the header.
    #[must_use]
    pub fn dictionary(&self) -> &ReferenceDictionary {
        &self.dict
    }

    /// The header text (`@`-lines for text input, the embedded header
    /// block for binary input).
    #[must_use]
    pub fn header_text(&self) -> &str {
        &self.header_text
    }

    /// Number of records handed out (or skipped as malformed) so far.
    #[must_use]
    pub fn records_read(&self) -> u64 {
        self.ordinal
    }

    /// Decodes the next alignment record, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// A [`SamBamError::MalformedRecord`] applies to this record only: the
    /// stream has already advanced past it (for binary input, past its
    /// declared length), so the caller may keep reading.
    /// [`SamBamError::UnknownReference`] and
    /// [`SamBamError::TruncatedHeader`] are fatal to the pass.
    pub fn read_record(&mut self) -> Result<Option<AlignmentRecord>> {
        match self.format {
            SamFormat::Sam | SamFormat::SamGz => self.read_text_record(),
            SamFormat::Bam => self.read_binary_record(),
        }
    }

    fn read_text_record(&mut self) -> Result<Option<AlignmentRecord>> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            // Header lines past the header block are sloughed, not decoded.
            if line.first() == Some(&b'@') {
                continue;
            }
            let ordinal = self.ordinal;
            self.ordinal += 1;
            let record = text::decode_line(&line, &mut self.dict, ordinal)?;
            return Ok(Some(record));
        }
    }

    fn read_binary_record(&mut self) -> Result<Option<AlignmentRecord>> {
        if !self.buf.fill_to(&mut self.src, 4)? {
            if self.buf.available() == 0 {
                return Ok(None);
            }
            return Err(SamBamError::TruncatedHeader {
                reason: "record length prefix cut short".to_string(),
            });
        }

        let head = self.buf.as_slice();
        let block_size = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let ordinal = self.ordinal;
        self.ordinal += 1;

        if block_size == 0 {
            self.buf.consume(4);
            return Err(SamBamError::MalformedRecord {
                ordinal,
                reason: "record with a declared length of zero".to_string(),
            });
        }
        if !self.buf.fill_to(&mut self.src, 4 + block_size)? {
            return Err(SamBamError::TruncatedHeader {
                reason: format!(
                    "record declares {block_size} bytes but the stream ends after {}",
                    self.buf.available().saturating_sub(4)
                ),
            });
        }

        let decoded = binary::decode_record(&self.buf.as_slice()[4..4 + block_size], ordinal);
        // Skip past the declared length whether or not the payload parsed,
        // so a malformed record costs the caller only that record.
        self.buf.consume(4 + block_size);
        let record = decoded?;

        for id in [record.ref_id, record.mate_ref_id] {
            if id != -1 && self.dict.by_bam_id(id).is_none() {
                return Err(SamBamError::UnknownReference { name: format!("id {id}") });
            }
        }

        Ok(Some(record))
    }

    /// Returns the next non-empty line, without its terminator.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.as_slice().iter().position(|&b| b == b'\n') {
                let mut line = self.buf.as_slice()[..pos].to_vec();
                self.buf.consume(pos + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }

            if self.buf.eof {
                // Final line without a terminator.
                let mut line = self.buf.as_slice().to_vec();
                self.buf.consume(line.len());
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(if line.is_empty() { None } else { Some(line) });
            }

            self.buf.refill(&mut self.src)?;
        }
    }

    fn read_text_header(&mut self) -> Result<()> {
        loop {
            if !self.buf.fill_to(&mut self.src, 1)? {
                return Ok(());
            }
            let first = self.buf.as_slice()[0];
            if first == b'\n' || first == b'\r' {
                self.buf.consume(1);
                continue;
            }
            if first != b'@' {
                return Ok(());
            }
            let Some(line) = self.next_line()? else {
                return Ok(());
            };
            self.ingest_header_line(&line);
        }
    }

    fn ingest_header_line(&mut self, line: &[u8]) {
        self.header_text.push_str(&String::from_utf8_lossy(line));
        self.header_text.push('\n');

        if !line.starts_with(b"@SQ") {
            return;
        }
        let mut name = None;
        let mut length = None;
        for field in line.split(|&b| b == b'\t').skip(1) {
            if let Some(value) = field.strip_prefix(b"SN:") {
                name = Some(String::from_utf8_lossy(value).into_owned());
            } else if let Some(value) = field.strip_prefix(b"LN:") {
                length = std::str::from_utf8(value).ok().and_then(|s| s.parse().ok());
            }
        }
        if let (Some(name), Some(length)) = (name, length) {
            self.dict.add(&name, length);
        }
    }

    fn read_binary_header(&mut self, path: &Path) -> Result<()> {
        let truncated = |what: &str| SamBamError::TruncatedHeader {
            reason: format!("{what} cut short in '{}'", path.display()),
        };

        if !self.buf.fill_to(&mut self.src, 8)? {
            return Err(truncated("header magic"));
        }
        if self.buf.as_slice()[..4] != BAM_MAGIC {
            return Err(SamBamError::FormatUnrecognized { path: path.to_path_buf() });
        }
        let l_text =
            u32::from_le_bytes(self.buf.as_slice()[4..8].try_into().expect("4 bytes")) as usize;
        self.buf.consume(8);

        if !self.buf.fill_to(&mut self.src, l_text)? {
            return Err(truncated("header text"));
        }
        self.header_text = String::from_utf8_lossy(&self.buf.as_slice()[..l_text])
            .trim_end_matches('\0')
            .to_string();
        self.buf.consume(l_text);

        if !self.buf.fill_to(&mut self.src, 4)? {
            return Err(truncated("reference count"));
        }
        let n_ref =
            u32::from_le_bytes(self.buf.as_slice()[..4].try_into().expect("4 bytes"));
        self.buf.consume(4);

        for _ in 0..n_ref {
            if !self.buf.fill_to(&mut self.src, 4)? {
                return Err(truncated("reference entry"));
            }
            let l_name =
                u32::from_le_bytes(self.buf.as_slice()[..4].try_into().expect("4 bytes")) as usize;
            self.buf.consume(4);

            if l_name == 0 || !self.buf.fill_to(&mut self.src, l_name + 4)? {
                return Err(truncated("reference entry"));
            }
            let slice = self.buf.as_slice();
            let name = String::from_utf8_lossy(&slice[..l_name - 1]).into_owned();
            let length = u32::from_le_bytes(slice[l_name..l_name + 4].try_into().expect("4 bytes"));
            self.buf.consume(l_name + 4);
            self.dict.add(&name, length);
        }

        debug!("binary header: {} references", n_ref);
        Ok(())
    }
}
