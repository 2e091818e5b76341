//! The ordered reference-sequence dictionary.
//!
//! Ids are 1-based and assigned sequentially in append order; the BAM
//! on-disk `refID` is the 1-based id minus one. Name lookup goes through a
//! small recency cache before falling back to a linear scan, since the same
//! handful of reference names dominate any coordinate-sorted input.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Depth of the recently-located-name cache.
const LOOKUP_CACHE_DEPTH: usize = 25;

/// One reference sequence: a name and its length in bases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceSeq {
    /// Sequence name as it appears in the header.
    pub name: String,
    /// Sequence length in bases.
    pub length: u32,
}

/// Ordered, append-only collection of reference sequences.
///
/// Duplicate names are accepted and each receives a distinct id; lookups
/// resolve to the first entry with a matching name. Name comparison is
/// ASCII case-insensitive.
pub struct ReferenceDictionary {
    seqs: Vec<ReferenceSeq>,
    cache: LruCache<String, u32>,
    max_length: u32,
}

impl ReferenceDictionary {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seqs: Vec::new(),
            cache: LruCache::new(NonZeroUsize::new(LOOKUP_CACHE_DEPTH).unwrap()),
            max_length: 0,
        }
    }

    /// Appends a reference sequence, returning its 1-based id.
    pub fn add(&mut self, name: &str, length: u32) -> u32 {
        self.seqs.push(ReferenceSeq { name: name.to_string(), length });
        self.max_length = self.max_length.max(length);
        self.seqs.len() as u32
    }

    /// Locates a reference by name, returning its 1-based id.
    ///
    /// A cache hit is promoted to most-recent; a scan hit is inserted into
    /// the cache.
    pub fn lookup(&mut self, name: &str) -> Option<u32> {
        let key = name.to_ascii_lowercase();
        if let Some(&id) = self.cache.get(&key) {
            return Some(id);
        }

        let id = self
            .seqs
            .iter()
            .position(|seq| seq.name.eq_ignore_ascii_case(name))
            .map(|idx| idx as u32 + 1)?;
        self.cache.put(key, id);
        Some(id)
    }

    /// The reference with the given 1-based id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&ReferenceSeq> {
        if id == 0 {
            return None;
        }
        self.seqs.get(id as usize - 1)
    }

    /// The reference with the given 0-based BAM `refID`; `None` for -1 or
    /// an id outside `[0, count)`.
    #[must_use]
    pub fn by_bam_id(&self, ref_id: i32) -> Option<&ReferenceSeq> {
        usize::try_from(ref_id).ok().and_then(|idx| self.seqs.get(idx))
    }

    /// Number of reference sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    /// Whether the dictionary is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Length of the longest reference sequence, 0 when empty.
    #[must_use]
    pub fn max_reference_length(&self) -> u32 {
        self.max_length
    }

    /// References in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ReferenceSeq> {
        self.seqs.iter()
    }
}

impl Default for ReferenceDictionary {
    fn default() -> Self {
        Self::new()
    }
}
