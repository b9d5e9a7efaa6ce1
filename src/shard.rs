//! C4: Shard, one slice of the global trie, holding every n-gram whose
//! first two words hash to this shard (see `Index::shard_of`). A shard is
//! a flattened, breadth-first-numbered trie: `ids` holds every node's word
//! id in trie order past the unigram prefix, `positions` marks child-group
//! boundaries, and `offsets[o]` is the first trie position of order `o+1`.
//!
//! `positions` is a unary code over the parent slots below the top order:
//! each parent contributes one zero bit per child followed by a single
//! terminating one bit, in trie-position order, whether or not it has any
//! children (spec §4.7). The `k`-th one bit therefore always marks the
//! end of parent `k`'s group, so `select(k, true)` plus a zero-rank over
//! the bits up to it recovers that group's bounds without needing a
//! one-to-one correspondence between parents and non-empty groups.
//!
//! The position-arithmetic methods below (`children_first`/`children_last`/
//! `parent`) are a direct translation of `NGramIndex::Shard`'s pointer
//! arithmetic, just written as ordinary branches instead of branchless
//! bit tricks (the original leans on `size_type(-1)` wraparound to avoid
//! branches, which Rust's overflow checks would reject outright).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::packed::PackedIntArray;
use crate::succinct::SuccinctBitVector;
use crate::vocab::Vocabulary;
use crate::word::{NodePos, WordId};

/// Below this child-group length, `lower_bound` does a linear scan instead
/// of a binary search; measured heuristic in the original, kept as a named
/// constant so it's trivially tunable.
pub const LINEAR_SCAN_THRESHOLD: usize = 128;

const OFFSETS_MAGIC: u32 = 0x4F46_4631; // "OFF1"

const CACHE_SLOTS: usize = 1 << 16;
const CACHE_EMPTY: u64 = u64::MAX;
const CHILD_NONE: u64 = u64::MAX;

/// 64-bit murmur-style mix, used both for the shard's positive cache and
/// (via `Index::shard_of`) for routing an n-gram's first two words to a
/// shard. Native reimplementation of the original's `hashmurmur` combinator
/// rather than a link against the C++ utility.
pub fn hashmurmur(x: u64, seed: u64) -> u64 {
    let mut h = seed ^ x.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// One slot of the shard's positive find-cache. Fields are independent
/// atomics rather than one locked struct: `find` is a pure function of
/// `(parent_pos, id)` over an immutable shard, so any two writers that
/// race to fill the same key always agree on `child_pos`. A reader that
/// matches `parent_pos` and `id` can therefore trust `child_pos` even if
/// the three loads straddle a concurrent write: the worst a race can do
/// is land on a *different* key, which the match check rejects as a miss.
struct CacheSlot {
    parent_pos: AtomicU64,
    id: AtomicU32,
    child_pos: AtomicU64,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            parent_pos: AtomicU64::new(CACHE_EMPTY),
            id: AtomicU32::new(u32::MAX),
            child_pos: AtomicU64::new(CHILD_NONE),
        }
    }

    fn load(&self, pos: usize, id: WordId) -> Option<Option<NodePos>> {
        let cached_pos = self.parent_pos.load(Ordering::Acquire);
        if cached_pos != pos as u64 {
            return None;
        }
        let cached_id = self.id.load(Ordering::Acquire);
        if cached_id != id.as_u32() {
            return None;
        }
        let child = self.child_pos.load(Ordering::Acquire);
        Some(if child == CHILD_NONE {
            None
        } else {
            Some(NodePos(child as usize))
        })
    }

    fn store(&self, pos: usize, id: WordId, child: Option<NodePos>) {
        self.child_pos.store(
            child.map(|p| p.as_usize() as u64).unwrap_or(CHILD_NONE),
            Ordering::Release,
        );
        self.id.store(id.as_u32(), Ordering::Release);
        self.parent_pos.store(pos as u64, Ordering::Release);
    }
}

/// Positive find-cache for one shard. A single `AtomicBool` gates writers
/// (skip caching under contention, never block); readers never touch the
/// gate at all.
struct FindCache {
    slots: Vec<CacheSlot>,
    writer_busy: AtomicBool,
}

impl FindCache {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        slots.resize_with(CACHE_SLOTS, CacheSlot::empty);
        Self {
            slots,
            writer_busy: AtomicBool::new(false),
        }
    }

    fn slot_index(pos: usize, id: WordId) -> usize {
        (hashmurmur(id.as_u32() as u64, pos as u64) as usize) & (CACHE_SLOTS - 1)
    }

    fn get(&self, pos: usize, id: WordId) -> Option<Option<NodePos>> {
        let idx = Self::slot_index(pos, id);
        self.slots[idx].load(pos, id)
    }

    fn try_put(&self, pos: usize, id: WordId, child: Option<NodePos>) {
        if self
            .writer_busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let idx = Self::slot_index(pos, id);
            self.slots[idx].store(pos, id, child);
            self.writer_busy.store(false, Ordering::Release);
        }
    }
}

fn read_offsets(path: &Path) -> Result<Vec<usize>> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    if bytes.len() < 8 {
        return Err(Error::corrupted(path, "file too small for offsets header"));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != OFFSETS_MAGIC {
        return Err(Error::corrupted(path, format!("bad offsets magic {magic:#010x}")));
    }
    let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let expected_len = 8 + count * 8;
    if bytes.len() < expected_len {
        return Err(Error::corrupted(path, "offsets file truncated"));
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        let off = 8 + i * 8;
        offsets.push(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()) as usize);
    }
    Ok(offsets)
}

pub fn write_offsets(path: &Path, offsets: &[usize]) -> Result<()> {
    let mut f = File::create(path).map_err(|e| Error::io(path, e))?;
    f.write_all(&OFFSETS_MAGIC.to_le_bytes()).map_err(|e| Error::io(path, e))?;
    f.write_all(&(offsets.len() as u32).to_le_bytes())
        .map_err(|e| Error::io(path, e))?;
    for &o in offsets {
        f.write_all(&(o as u64).to_le_bytes()).map_err(|e| Error::io(path, e))?;
    }
    Ok(())
}

pub struct Shard {
    ids: PackedIntArray,
    positions: SuccinctBitVector,
    offsets: Vec<usize>,
    cache: FindCache,
    dir: PathBuf,
}

impl Shard {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let ids = PackedIntArray::open(dir.join("ids.bin"))?;
        let positions = SuccinctBitVector::open(dir.join("positions.bin"))?;
        let offsets = read_offsets(&dir.join("offsets.bin"))?;

        if offsets.len() < 2 {
            return Err(Error::corrupted(dir, "offsets must have at least [0, order1] entries"));
        }
        Ok(Self {
            ids,
            positions,
            offsets,
            cache: FindCache::new(),
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn order(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Total number of trie positions below the top order (used as the
    /// child-boundary bitvector's length).
    pub fn position_size(&self) -> usize {
        self.offsets[self.offsets.len() - 2]
    }

    /// Total number of trie positions across all orders.
    pub fn size(&self) -> usize {
        *self.offsets.last().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The word id stored at trie position `pos`. Positions below
    /// `offsets[1]` are unigrams and equal their own word id.
    pub fn at(&self, pos: usize) -> WordId {
        if pos < self.offsets[1] {
            WordId(pos as u32)
        } else {
            WordId(self.ids.get(pos - self.offsets[1]) as u32)
        }
    }

    /// Cumulative number of children across parent slots `0..=parent_pos`,
    /// in `ids`-relative terms. `parent_pos` must be a valid parent slot
    /// (`< position_size()`): every such slot has a terminating one bit in
    /// `positions`, located by `select(parent_pos, true)`, and the zeros at
    /// or before it are exactly that slot's and every earlier slot's
    /// children.
    fn cumulative_children_through(&self, parent_pos: usize) -> usize {
        let term = self
            .positions
            .select(parent_pos as u64, true)
            .unwrap_or_else(|| Error::abort("positions bitvector missing a parent's terminator bit"));
        self.positions.rank(term + 1, false) as usize
    }

    pub fn parent(&self, pos: usize) -> Option<NodePos> {
        if pos < self.offsets[1] {
            return None;
        }
        let rel = (pos - self.offsets[1]) as u64;
        let child_bit = self
            .positions
            .select(rel, false)
            .unwrap_or_else(|| Error::abort("positions bitvector missing expected child bit"));
        Some(NodePos(self.positions.rank(child_bit, true) as usize))
    }

    pub fn children_first(&self, pos: Option<NodePos>) -> usize {
        match pos {
            None => 0,
            Some(NodePos(0)) => self.offsets[1],
            Some(NodePos(p)) => self.children_last(Some(NodePos(p - 1))),
        }
    }

    pub fn children_last(&self, pos: Option<NodePos>) -> usize {
        match pos {
            None => self.offsets[1],
            Some(NodePos(p)) if p >= self.position_size() => self.size(),
            Some(NodePos(p)) => self.offsets[1] + self.cumulative_children_through(p),
        }
    }

    fn lower_bound(&self, first: usize, last: usize, id: WordId) -> usize {
        if last <= self.offsets[1] {
            return id.as_usize().min(last);
        }
        let offset = self.offsets[1];
        let length = last - first;
        if length <= LINEAR_SCAN_THRESHOLD {
            let mut pos = first;
            while pos != last && self.ids.get(pos - offset) < id.as_u32() as u64 {
                pos += 1;
            }
            pos
        } else {
            let mut first = first;
            let mut length = length;
            while length > 0 {
                let half = length >> 1;
                let middle = first + half;
                if self.ids.get(middle - offset) < id.as_u32() as u64 {
                    first = middle + 1;
                    length -= half + 1;
                } else {
                    length = half;
                }
            }
            first
        }
    }

    fn find_uncached(&self, pos: usize, id: WordId) -> Option<NodePos> {
        let pos_first = self.children_first(Some(NodePos(pos)));
        let pos_last = self.children_last(Some(NodePos(pos)));
        let child = self.lower_bound(pos_first, pos_last, id);
        if child != pos_last && self.at(child) == id {
            Some(NodePos(child))
        } else {
            None
        }
    }

    /// Finds the child of `pos` labeled `id`. `pos = None` means "the
    /// root": a unigram lookup, answered directly without touching the
    /// cache (there is nothing to cache; it's an O(1) id check).
    pub fn find(&self, pos: Option<NodePos>, id: WordId) -> Option<NodePos> {
        match pos {
            None => {
                if id.as_usize() < self.offsets[1] {
                    Some(NodePos(id.as_usize()))
                } else {
                    None
                }
            }
            Some(NodePos(p)) => {
                if let Some(hit) = self.cache.get(p, id) {
                    return hit;
                }
                let result = self.find_uncached(p, id);
                self.cache.try_put(p, id, result);
                result
            }
        }
    }

    /// Walks a sequence of raw word ids down the trie from the root,
    /// stopping at the first id with no matching child. Returns the
    /// number of ids consumed and the deepest node reached (`None` if not
    /// even the first id matched).
    pub fn traverse_ids(&self, ids: &[WordId]) -> (usize, Option<NodePos>) {
        let mut pos = None;
        for (i, &id) in ids.iter().enumerate() {
            match self.find(pos, id) {
                Some(next) => pos = Some(next),
                None => return (i, pos),
            }
        }
        (ids.len(), pos)
    }

    /// Same traversal, but over raw byte-string words resolved through a
    /// vocabulary first. Kept as a separate entry point (rather than one
    /// generic-over-word-type method) so callers never need a dynamic
    /// dispatch between "already have ids" and "have strings".
    pub fn traverse_strings(&self, vocab: &Vocabulary, words: &[&[u8]]) -> (usize, Option<NodePos>) {
        let mut pos = None;
        for (i, &w) in words.iter().enumerate() {
            let id = vocab.lookup_id(w);
            match self.find(pos, id) {
                Some(next) => pos = Some(next),
                None => return (i, pos),
            }
        }
        (words.len(), pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::{bits_for_max_value, PackedIntArraySink};
    use crate::succinct::SuccinctBitVectorSink;
    use std::fs::File;

    /// Builds a tiny two-order shard by hand:
    /// unigrams {0,1,2} (offsets[1] = 3), then bigram children
    /// 0 -> {1, 2}, 1 -> {0}, 2 -> {} (no children).
    fn build_fixture(dir: &Path) {
        let unigram_count = 3usize;
        // ids array stores only the bigram level (positions >= offsets[1]).
        let bigram_ids: Vec<u64> = vec![1, 2, 0];
        let bits = bits_for_max_value(2);
        {
            let f = File::create(dir.join("ids.bin")).unwrap();
            let mut sink = PackedIntArraySink::create(f, bits).unwrap();
            sink.extend(bigram_ids.iter().copied()).unwrap();
            sink.finish().unwrap();
        }
        // positions bitvector: a zero bit per child followed by one
        // terminating one bit, per parent slot, in trie-position order.
        //   parent0 -> [1,2] (2 children): 0,0,1
        //   parent1 -> [0]   (1 child):    0,1
        //   parent2 -> []    (0 children): 1
        let position_bits = [false, false, true, false, true, true];
        {
            let f = File::create(dir.join("positions.bin")).unwrap();
            let mut sink = SuccinctBitVectorSink::create(f, 64).unwrap();
            sink.extend(position_bits.iter().copied()).unwrap();
            sink.finish().unwrap();
        }
        // offsets: [0, unigram_count, unigram_count + bigram_count]
        write_offsets(&dir.join("offsets.bin"), &[0, unigram_count, unigram_count + bigram_ids.len()]).unwrap();
    }

    #[test]
    fn traverse_and_find() {
        let dir = tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        let shard = Shard::open(dir.path()).unwrap();

        assert_eq!(shard.order(), 2);
        assert_eq!(shard.position_size(), 3);
        assert_eq!(shard.size(), 6);

        // unigram lookups.
        assert_eq!(shard.find(None, WordId(0)), Some(NodePos(0)));
        assert_eq!(shard.find(None, WordId(2)), Some(NodePos(2)));
        assert_eq!(shard.find(None, WordId(3)), None);

        // bigram "0 1" exists (child id 1 of parent 0).
        let (consumed, node) = shard.traverse_ids(&[WordId(0), WordId(1)]);
        assert_eq!(consumed, 2);
        assert!(node.is_some());
        assert_eq!(shard.at(node.unwrap().as_usize()), WordId(1));

        // bigram "0 5" doesn't exist; traversal stops after the unigram.
        let (consumed, node) = shard.traverse_ids(&[WordId(0), WordId(5)]);
        assert_eq!(consumed, 1);
        assert_eq!(node, Some(NodePos(0)));

        // bigram "2 anything" doesn't exist (parent 2 has no children).
        let (consumed, node) = shard.traverse_ids(&[WordId(2), WordId(0)]);
        assert_eq!(consumed, 1);
        assert_eq!(node, Some(NodePos(2)));

        // repeated lookups exercise the find-cache path.
        for _ in 0..5 {
            let (consumed, _) = shard.traverse_ids(&[WordId(0), WordId(1)]);
            assert_eq!(consumed, 2);
        }
    }

    #[test]
    fn parent_is_inverse_of_children() {
        let dir = tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        let shard = Shard::open(dir.path()).unwrap();

        let child = shard.find(None, WordId(0)).and_then(|p| shard.find(Some(p), WordId(1))).unwrap();
        assert_eq!(shard.parent(child.as_usize()), Some(NodePos(0)));
    }
}
