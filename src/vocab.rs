//! C1: Vocabulary, a bijection between byte strings and dense `u32` ids.
//!
//! Forward lookup (string -> id) is an `fst::Map` over the sorted byte
//! strings, which is why ids are *not* assigned in sorted order: the FST
//! value slot holds whatever id the builder chose for that string, so
//! insertion order (and thus `<unk>`/`<s>`/`</s>` reserved ids) survives
//! the forced-sorted-key constraint `fst::MapBuilder` imposes. Reverse
//! lookup (id -> string) is a flat, memory-mapped string blob addressed
//! by an offset table, so both directions are O(1)-ish and mmap-backed.
//!
//! Built once, flushed, then reopened read-only; safe for concurrent
//! readers. A small per-thread lookup cache accelerates repeated forward
//! lookups, packing `(hash, id)` into one atomic `u64` slot so readers
//! never observe a torn read; on a cache hit the full string is still
//! compared against the FST before trusting the id, so a hash collision
//! degrades to a cache miss rather than a wrong answer.

use std::collections::BTreeMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fst::{Map, MapBuilder};
use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::word::WordId;

pub const UNK: &str = "<unk>";
pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";

const STRINGS_MAGIC: u32 = 0x564F_4231; // "VOB1"
// magic(4) + count(8)
const STRINGS_HEADER_LEN: usize = 12;

const LOOKUP_CACHE_SLOTS: usize = 1 << 12; // per Vocabulary instance
const EMPTY_SLOT: u64 = u64::MAX;

/// Builder used during indexing: inserts are unordered, ids are
/// caller-assigned (typically sequential, starting after the reserved
/// `<unk>`/`<s>`/`</s>` ids).
pub struct VocabBuilder {
    // sorted by key for fst::MapBuilder; value is the word id.
    entries: BTreeMap<Vec<u8>, u64>,
    next_id: u32,
}

impl VocabBuilder {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(UNK.as_bytes().to_vec(), WordId::UNK.as_u32() as u64);
        Self { entries, next_id: 1 }
    }

    /// Inserts `word`, returning its id. Re-inserting an existing word
    /// returns its original id unchanged.
    pub fn insert(&mut self, word: &[u8]) -> WordId {
        if let Some(&id) = self.entries.get(word) {
            return WordId(id as u32);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(word.to_vec(), id as u64);
        WordId(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the vocabulary's two on-disk components:
    /// `fst_path` (forward string->id map) and `strings_path` (reverse
    /// id->string blob, offset-indexed).
    pub fn write(&self, fst_path: impl AsRef<Path>, strings_path: impl AsRef<Path>) -> Result<()> {
        let fst_path = fst_path.as_ref();
        let strings_path = strings_path.as_ref();

        let mut id_to_word: Vec<&[u8]> = vec![&[]; self.entries.len()];
        for (word, &id) in &self.entries {
            id_to_word[id as usize] = word.as_slice();
        }

        let fst_file = File::create(fst_path).map_err(|e| Error::io(fst_path, e))?;
        let mut builder =
            MapBuilder::new(std::io::BufWriter::new(fst_file)).map_err(|e| Error::corrupted(fst_path, e.to_string()))?;
        for (word, &id) in &self.entries {
            builder
                .insert(word, id)
                .map_err(|e| Error::corrupted(fst_path, e.to_string()))?;
        }
        builder
            .finish()
            .map_err(|e| Error::corrupted(fst_path, e.to_string()))?;

        let strings_file = File::create(strings_path).map_err(|e| Error::io(strings_path, e))?;
        let mut writer = std::io::BufWriter::new(strings_file);
        writer
            .write_all(&STRINGS_MAGIC.to_le_bytes())
            .map_err(|e| Error::io(strings_path, e))?;
        writer
            .write_all(&(id_to_word.len() as u64).to_le_bytes())
            .map_err(|e| Error::io(strings_path, e))?;
        // offset table: (count + 1) u64 byte offsets into the blob that follows.
        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(id_to_word.len() + 1);
        offsets.push(offset);
        for word in &id_to_word {
            offset += word.len() as u64;
            offsets.push(offset);
        }
        for off in &offsets {
            writer.write_all(&off.to_le_bytes()).map_err(|e| Error::io(strings_path, e))?;
        }
        for word in &id_to_word {
            writer.write_all(word).map_err(|e| Error::io(strings_path, e))?;
        }
        writer.flush().map_err(|e| Error::io(strings_path, e))?;
        Ok(())
    }
}

impl Default for VocabBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct LookupCache {
    slots: Vec<AtomicU64>,
}

impl LookupCache {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(LOOKUP_CACHE_SLOTS);
        slots.resize_with(LOOKUP_CACHE_SLOTS, || AtomicU64::new(EMPTY_SLOT));
        Self { slots }
    }

    fn hash_of(word: &[u8]) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        word.hash(&mut h);
        h.finish()
    }

    /// Packs `(truncated_hash:32, id:32)` into one atomic word so a
    /// concurrent reader either sees the whole slot or the whole previous
    /// slot, never a mix of an old hash with a new id.
    fn get(&self, word: &[u8]) -> Option<WordId> {
        let hash = Self::hash_of(word);
        let slot_idx = (hash as usize) & (LOOKUP_CACHE_SLOTS - 1);
        let packed = self.slots[slot_idx].load(Ordering::Acquire);
        if packed == EMPTY_SLOT {
            return None;
        }
        let stored_hash = (packed >> 32) as u32;
        if stored_hash != (hash as u32) {
            return None;
        }
        Some(WordId(packed as u32))
    }

    fn put(&self, word: &[u8], id: WordId) {
        let hash = Self::hash_of(word);
        let slot_idx = (hash as usize) & (LOOKUP_CACHE_SLOTS - 1);
        let packed = ((hash as u32 as u64) << 32) | id.as_u32() as u64;
        self.slots[slot_idx].store(packed, Ordering::Release);
    }
}

/// Read-only, memory-mapped vocabulary.
pub struct Vocabulary {
    fst_map: Map<Mmap>,
    strings_mmap: Mmap,
    offsets_start: usize,
    blob_start: usize,
    len: usize,
    cache: LookupCache,
    fst_path: PathBuf,
}

impl Vocabulary {
    pub fn open(fst_path: impl AsRef<Path>, strings_path: impl AsRef<Path>) -> Result<Self> {
        let fst_path = fst_path.as_ref();
        let strings_path = strings_path.as_ref();

        let fst_file = File::open(fst_path).map_err(|e| Error::io(fst_path, e))?;
        let fst_mmap = unsafe { Mmap::map(&fst_file) }.map_err(|e| Error::io(fst_path, e))?;
        let fst_map = Map::new(fst_mmap).map_err(|e| Error::corrupted(fst_path, e.to_string()))?;

        let strings_file = File::open(strings_path).map_err(|e| Error::io(strings_path, e))?;
        let strings_mmap = unsafe { Mmap::map(&strings_file) }.map_err(|e| Error::io(strings_path, e))?;

        if strings_mmap.len() < STRINGS_HEADER_LEN {
            return Err(Error::corrupted(strings_path, "file too small for vocabulary header"));
        }
        let magic = u32::from_le_bytes(strings_mmap[0..4].try_into().unwrap());
        if magic != STRINGS_MAGIC {
            return Err(Error::corrupted(strings_path, format!("bad vocabulary magic {magic:#010x}")));
        }
        let len = u64::from_le_bytes(strings_mmap[4..12].try_into().unwrap()) as usize;

        let offsets_start = STRINGS_HEADER_LEN;
        let offsets_bytes = (len + 1) * 8;
        let blob_start = offsets_start + offsets_bytes;
        if strings_mmap.len() < blob_start {
            return Err(Error::corrupted(strings_path, "file truncated before string blob"));
        }

        Ok(Self {
            fst_map,
            strings_mmap,
            offsets_start,
            blob_start,
            len,
            cache: LookupCache::new(),
            fst_path: fst_path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset_at(&self, i: usize) -> u64 {
        let off = self.offsets_start + i * 8;
        u64::from_le_bytes(self.strings_mmap[off..off + 8].try_into().unwrap())
    }

    /// Reverse lookup: id -> string. Unchecked beyond bounds; out-of-range
    /// ids are a caller bug (the caller always gets ids from `lookup_id`
    /// or from a shard's trie traversal, both of which only ever yield
    /// valid ids).
    pub fn lookup_string(&self, id: WordId) -> &[u8] {
        let i = id.as_usize();
        assert!(i < self.len, "word id {i} out of vocabulary range {}", self.len);
        let start = self.blob_start + self.offset_at(i) as usize;
        let end = self.blob_start + self.offset_at(i + 1) as usize;
        &self.strings_mmap[start..end]
    }

    /// Forward lookup: string -> id. Unknown words map to `WordId::UNK`,
    /// never to a freshly minted id: the vocabulary is read-only.
    pub fn lookup_id(&self, word: &[u8]) -> WordId {
        if let Some(id) = self.cache.get(word) {
            // revalidate: a stale/collided cache entry must never be trusted
            // blindly, so confirm against the FST before returning.
            if self.lookup_string(id) == word {
                return id;
            }
        }
        let id = match self.fst_map.get(word) {
            Some(v) => WordId(v as u32),
            None => WordId::UNK,
        };
        self.cache.put(word, id);
        id
    }

    pub fn contains(&self, word: &[u8]) -> bool {
        self.fst_map.get(word).is_some()
    }

    pub fn fst_path(&self) -> &Path {
        &self.fst_path
    }
}
