//! C6: QueryEngine, `logprob(state, word_id) -> (state', logprob)` with
//! backoff, over either a raw (`f32` per node) or quantized (8-bit
//! codebook index per node) probability model.
//!
//! The backoff loop walks the trie directly rather than trusting the
//! incoming state's precomputed per-truncation backoff values, simpler
//! and still correct, at the cost of not exploiting the full
//! state-caching optimization the original's per-position backoff array
//! was designed for. See DESIGN.md for the tradeoff.

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::packed::PackedIntArray;
use crate::repository::{self, ModelKind};
use crate::state::{self, StateView, StateViewMut};
use crate::word::WordId;

/// Below this, a node's `logbound` is considered small enough that
/// keeping it in a decoder state can't change any future query: the
/// state can be trimmed from the left at that point.
pub const LOGBOUND_THRESHOLD: f32 = 0.0;

const FLOAT_ARRAY_MAGIC: u32 = 0x464C_4131; // "FLA1"
const FLOAT_ARRAY_HEADER_LEN: usize = 12; // magic(4) + len(8)

/// Streaming writer for a flat `f32` array (unquantized logprob/backoff/
/// logbound). One entry per shard trie position, same indexing domain as
/// `Shard::at`.
pub struct FloatArraySink<W: Write + Seek> {
    writer: W,
    count: u64,
}

impl<W: Write + Seek> FloatArraySink<W> {
    pub fn create(mut writer: W) -> io::Result<Self> {
        writer.write_all(&[0u8; FLOAT_ARRAY_HEADER_LEN])?;
        Ok(Self { writer, count: 0 })
    }

    pub fn push(&mut self, value: f32) -> io::Result<()> {
        self.writer.write_all(&value.to_le_bytes())?;
        self.count += 1;
        Ok(())
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = f32>) -> io::Result<()> {
        for v in values {
            self.push(v)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&FLOAT_ARRAY_MAGIC.to_le_bytes())?;
        self.writer.write_all(&self.count.to_le_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

pub struct FloatArray {
    mmap: Mmap,
    len: u64,
}

impl FloatArray {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        if mmap.len() < FLOAT_ARRAY_HEADER_LEN {
            return Err(Error::corrupted(path, "file too small for float-array header"));
        }
        let magic = u32::from_le_bytes(mmap[0..4].try_into().unwrap());
        if magic != FLOAT_ARRAY_MAGIC {
            return Err(Error::corrupted(path, format!("bad float-array magic {magic:#010x}")));
        }
        let len = u64::from_le_bytes(mmap[4..12].try_into().unwrap());
        let required = FLOAT_ARRAY_HEADER_LEN as u64 + len * 4;
        if (mmap.len() as u64) < required {
            return Err(Error::corrupted(path, "float-array file truncated"));
        }
        Ok(Self { mmap, len })
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> f32 {
        assert!(i < self.len(), "float-array index {i} out of bounds");
        let off = FLOAT_ARRAY_HEADER_LEN + i * 4;
        f32::from_le_bytes(self.mmap[off..off + 4].try_into().unwrap())
    }
}

pub fn write_float_array_file(path: impl AsRef<Path>, values: impl IntoIterator<Item = f32>) -> io::Result<()> {
    let file = File::create(path.as_ref())?;
    let mut sink = FloatArraySink::create(file)?;
    sink.extend(values)?;
    sink.finish()
}

/// One order's 256-entry quantization codebook.
pub type Codebook = [f32; 256];

/// Per-node probability/backoff/logbound lookup, abstracting over the raw
/// and quantized on-disk shapes so `QueryEngine` doesn't care which one
/// it's reading.
pub trait ProbabilityModel: Send + Sync {
    fn logprob(&self, shard: usize, pos: usize, order: usize) -> f32;
    fn backoff(&self, shard: usize, pos: usize, order: usize) -> f32;
    fn logbound(&self, shard: usize, pos: usize, order: usize) -> f32;
}

struct ShardFloatArrays {
    logprob: FloatArray,
    backoff: FloatArray,
    logbound: FloatArray,
}

pub struct RawProbabilityModel {
    shards: Vec<ShardFloatArrays>,
}

impl RawProbabilityModel {
    pub fn open(repo_root: &Path, shard_count: usize) -> Result<Self> {
        let mut shards = Vec::with_capacity(shard_count);
        for s in 0..shard_count {
            shards.push(ShardFloatArrays {
                logprob: FloatArray::open(repo_root.join("logprob").join(s.to_string()).join("logprob.bin"))?,
                backoff: FloatArray::open(repo_root.join("backoff").join(s.to_string()).join("backoff.bin"))?,
                logbound: FloatArray::open(repo_root.join("logbound").join(s.to_string()).join("logbound.bin"))?,
            });
        }
        Ok(Self { shards })
    }
}

impl ProbabilityModel for RawProbabilityModel {
    fn logprob(&self, shard: usize, pos: usize, _order: usize) -> f32 {
        self.shards[shard].logprob.get(pos)
    }

    fn backoff(&self, shard: usize, pos: usize, _order: usize) -> f32 {
        self.shards[shard].backoff.get(pos)
    }

    fn logbound(&self, shard: usize, pos: usize, _order: usize) -> f32 {
        self.shards[shard].logbound.get(pos)
    }
}

struct ShardQuantArrays {
    logprob: PackedIntArray,
    backoff: PackedIntArray,
    logbound: PackedIntArray,
}

pub struct QuantizedProbabilityModel {
    shards: Vec<ShardQuantArrays>,
    logprob_codebooks: Vec<Codebook>,
    backoff_codebooks: Vec<Codebook>,
    logbound_codebooks: Vec<Codebook>,
}

impl QuantizedProbabilityModel {
    pub fn open(repo_root: &Path, shard_count: usize, order: usize) -> Result<Self> {
        let mut shards = Vec::with_capacity(shard_count);
        for s in 0..shard_count {
            shards.push(ShardQuantArrays {
                logprob: PackedIntArray::open(repo_root.join("logprob").join(s.to_string()).join("logprob.qbin"))?,
                backoff: PackedIntArray::open(repo_root.join("backoff").join(s.to_string()).join("backoff.qbin"))?,
                logbound: PackedIntArray::open(repo_root.join("logbound").join(s.to_string()).join("logbound.qbin"))?,
            });
        }
        let logprob_codebooks = read_codebooks(&repo_root.join("logprob").join("codebook.bin"), order)?;
        let backoff_codebooks = read_codebooks(&repo_root.join("backoff").join("codebook.bin"), order)?;
        let logbound_codebooks = read_codebooks(&repo_root.join("logbound").join("codebook.bin"), order)?;
        Ok(Self {
            shards,
            logprob_codebooks,
            backoff_codebooks,
            logbound_codebooks,
        })
    }
}

pub fn read_codebooks(path: &Path, order: usize) -> Result<Vec<Codebook>> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let expected = order * 256 * 4;
    if bytes.len() < expected {
        return Err(Error::corrupted(path, "codebook file truncated"));
    }
    let mut books = Vec::with_capacity(order);
    for o in 0..order {
        let mut book = [0f32; 256];
        for (i, slot) in book.iter_mut().enumerate() {
            let off = (o * 256 + i) * 4;
            *slot = f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        }
        books.push(book);
    }
    Ok(books)
}

pub fn write_codebooks(path: &Path, books: &[Codebook]) -> Result<()> {
    let mut out = Vec::with_capacity(books.len() * 256 * 4);
    for book in books {
        for v in book {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    std::fs::write(path, out).map_err(|e| Error::io(path, e))
}

impl ProbabilityModel for QuantizedProbabilityModel {
    fn logprob(&self, shard: usize, pos: usize, order: usize) -> f32 {
        let idx = self.shards[shard].logprob.get(pos) as usize;
        self.logprob_codebooks[order.saturating_sub(1)][idx]
    }

    fn backoff(&self, shard: usize, pos: usize, order: usize) -> f32 {
        let idx = self.shards[shard].backoff.get(pos) as usize;
        self.backoff_codebooks[order.saturating_sub(1)][idx]
    }

    fn logbound(&self, shard: usize, pos: usize, order: usize) -> f32 {
        let idx = self.shards[shard].logbound.get(pos) as usize;
        self.logbound_codebooks[order.saturating_sub(1)][idx]
    }
}

pub fn open_probability_model(index: &Index) -> Result<Box<dyn ProbabilityModel>> {
    match index.model_kind() {
        ModelKind::Probabilities => {
            Ok(Box::new(RawProbabilityModel::open(index.path(), index.shard_count())?))
        }
        ModelKind::ProbabilitiesQuantized => Ok(Box::new(QuantizedProbabilityModel::open(
            index.path(),
            index.shard_count(),
            index.order(),
        )?)),
        ModelKind::Counts => Err(Error::InvalidArgument(format!(
            "repository at {} holds a counts model; logprob queries require a probability model",
            index.path().display()
        ))),
    }
}

struct CacheEntry {
    key_hash: u64,
    out_state: Vec<u8>,
    logprob: f32,
}

/// Advisory query cache. Each slot is independently locked; a miss or a
/// key mismatch just means "recompute," never a wrong answer. Validity is
/// tracked by `Option` (a real `None`), not by comparing a float to
/// itself: the original's NaN-self-comparison trick couldn't tell an
/// uninitialized slot from a legitimately cached NaN logprob.
struct QueryCache {
    slots: Vec<Mutex<Option<CacheEntry>>>,
}

impl QueryCache {
    fn new(capacity_pow2: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity_pow2);
        slots.resize_with(capacity_pow2, || Mutex::new(None));
        Self { slots }
    }

    fn key(state: &[u8], id: WordId) -> u64 {
        let mut h = DefaultHasher::new();
        state.hash(&mut h);
        id.as_u32().hash(&mut h);
        h.finish()
    }

    fn get(&self, state: &[u8], id: WordId) -> Option<(Vec<u8>, f32)> {
        let key = Self::key(state, id);
        let idx = (key as usize) & (self.slots.len() - 1);
        let guard = self.slots[idx].lock().unwrap();
        match guard.as_ref() {
            Some(entry) if entry.key_hash == key => Some((entry.out_state.clone(), entry.logprob)),
            _ => None,
        }
    }

    fn put(&self, state: &[u8], id: WordId, out_state: Vec<u8>, logprob: f32) {
        let key = Self::key(state, id);
        let idx = (key as usize) & (self.slots.len() - 1);
        let mut guard = self.slots[idx].lock().unwrap();
        *guard = Some(CacheEntry {
            key_hash: key,
            out_state,
            logprob,
        });
    }
}

pub const DEFAULT_CACHE_SLOTS: usize = 1 << 16;

pub struct QueryEngine {
    index: Index,
    model: Box<dyn ProbabilityModel>,
    cache: QueryCache,
}

impl QueryEngine {
    pub fn open(repo_root: impl AsRef<Path>) -> Result<Self> {
        let index = Index::open(repo_root)?;
        let model = open_probability_model(&index)?;
        Ok(Self {
            index,
            model,
            cache: QueryCache::new(DEFAULT_CACHE_SLOTS),
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn order(&self) -> usize {
        self.index.order()
    }

    /// Size of the opaque state buffer this engine requires.
    pub fn state_buffer_size(&self) -> usize {
        state::buffer_size(self.order())
    }

    fn resolve(&self, word_id: WordId) -> WordId {
        if word_id.as_usize() >= self.index.vocab().len() {
            WordId::UNK
        } else {
            word_id
        }
    }

    /// Looks up `word_id` given the decoder `state`, writing the new
    /// state into `out_state` (same size as `state`) and returning the
    /// logprob.
    pub fn logprob(&self, state: &[u8], word_id: WordId, out_state: &mut [u8]) -> Result<f32> {
        let order = self.order();
        let word_id = self.resolve(word_id);

        if let Some((cached_state, cached_lp)) = self.cache.get(state, word_id) {
            out_state.copy_from_slice(&cached_state);
            return Ok(cached_lp);
        }

        let view = StateView::new(state, order)?;
        let ctx = view.context();

        let mut start = 0usize;
        let mut backoff_acc = 0f32;
        let (new_ctx, logprob) = loop {
            let context_slice = &ctx[start..];
            let mut full = context_slice.to_vec();
            full.push(word_id);

            let (shard, consumed, node) = self.index.traverse_ids(&full);
            if consumed == full.len() {
                let node = node.expect("full traversal implies a matched node");
                let found_order = self.index.order_of(shard, node);
                let lp = self.model.logprob(shard, node.as_usize(), found_order) + backoff_acc;
                break (full, lp);
            }

            if context_slice.is_empty() {
                // word_id itself has no unigram entry; every vocabulary id
                // is supposed to have one (even <unk>), so this only fires
                // on a corrupted repository.
                return Err(Error::InternalInvariant(format!(
                    "word id {word_id:?} has no unigram entry"
                )));
            }

            let (c_shard, c_consumed, c_node) = self.index.traverse_ids(context_slice);
            if c_consumed == context_slice.len() {
                if let Some(n) = c_node {
                    let o = self.index.order_of(c_shard, n);
                    backoff_acc += self.model.backoff(c_shard, n.as_usize(), o);
                }
            }
            start += 1;
        };

        let minimized = self.minimize_context(new_ctx);
        let backoffs = self.precompute_backoffs(&minimized);

        let mut out_view = StateViewMut::new(out_state, order)?;
        out_view.fill(&minimized, &backoffs);

        self.cache.put(state, word_id, out_state.to_vec(), logprob);
        Ok(logprob)
    }

    /// Trims `ctx` (oldest-first) from the left while `logbound` at the
    /// node for the remaining suffix is below threshold, and caps it to
    /// `order - 1` words.
    fn minimize_context(&self, mut ctx: Vec<WordId>) -> Vec<WordId> {
        let max_len = self.order().saturating_sub(1);
        if ctx.len() > max_len {
            ctx = ctx[ctx.len() - max_len..].to_vec();
        }
        while ctx.len() > 1 {
            let suffix = &ctx[1..];
            let (shard, consumed, node) = self.index.traverse_ids(suffix);
            let can_trim = consumed == suffix.len()
                && node
                    .map(|n| {
                        let o = self.index.order_of(shard, n);
                        self.model.logbound(shard, n.as_usize(), o) <= LOGBOUND_THRESHOLD
                    })
                    .unwrap_or(false);
            if can_trim {
                ctx.remove(0);
            } else {
                break;
            }
        }
        ctx
    }

    fn precompute_backoffs(&self, ctx: &[WordId]) -> Vec<f32> {
        (0..ctx.len())
            .map(|i| {
                let suffix = &ctx[i..];
                let (shard, consumed, node) = self.index.traverse_ids(suffix);
                if consumed == suffix.len() {
                    if let Some(n) = node {
                        let o = self.index.order_of(shard, n);
                        return self.model.backoff(shard, n.as_usize(), o);
                    }
                }
                0.0
            })
            .collect()
    }
}

pub fn logprob_dir(repo_root: &Path, shard: usize) -> PathBuf {
    repository::data_dir(repo_root, ModelKind::Probabilities).join("logprob").join(shard.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{write_prepare, write_shards_parallel, ShardContent};
    use crate::packed::bits_for_max_value;
    use crate::vocab::VocabBuilder;

    /// Builds the exact repository described in spec scenario 1: vocab
    /// `{<unk>=0, <s>=1, </s>=2, a=3, b=4, c=5}`, single shard, bigram
    /// `a b` (p=-0.5, bo=-0.2), unigrams `b` (p=-1.0) and `c` (p=-1.3).
    /// Unigram `a`'s own backoff (not spelled out in prose, only implied
    /// by the worked arithmetic) is fixed at -0.2 here; see DESIGN.md.
    fn build_scenario_one(dir: &Path) -> (WordId, WordId, WordId, WordId) {
        let mut vb = VocabBuilder::new();
        let bos = vb.insert(b"<s>");
        let eos = vb.insert(b"</s>");
        let a = vb.insert(b"a");
        let b = vb.insert(b"b");
        let c = vb.insert(b"c");
        assert_eq!(bos.as_u32(), 1);
        assert_eq!(eos.as_u32(), 2);
        assert_eq!(a.as_u32(), 3);
        assert_eq!(b.as_u32(), 4);
        assert_eq!(c.as_u32(), 5);

        write_prepare(dir, &vb, 2, 1, ModelKind::Probabilities).unwrap();

        // unigram count = 6 (<unk>,<s>,</s>,a,b,c) -> offsets[1] = 6
        // single bigram child: a -> b; every other unigram has none.
        // positions: one parent slot per unigram in order, each a run of
        // zero bits (one per child) followed by a terminating one bit.
        let bigram_ids = vec![b.as_u32() as u64];
        let bits = bits_for_max_value(b.as_u32() as u64);
        let content = ShardContent {
            shard: 0,
            ids_bits: bits,
            ids: bigram_ids,
            position_bits: vec![true, true, true, false, true, true, true],
            offsets: vec![0, 6, 7],
        };
        write_shards_parallel(dir, &[content]).unwrap();

        // node positions: unigrams 0..6 are their own ids; bigram "a b" is
        // position 6 (offsets[1] + 0).
        let unigram_count = 6usize;
        let logprob_values = {
            let mut v = vec![0f32; unigram_count + 1];
            v[b.as_usize()] = -1.0;
            v[c.as_usize()] = -1.3;
            v[unigram_count] = -0.5; // bigram "a b"
            v
        };
        let backoff_values = {
            let mut v = vec![0f32; unigram_count + 1];
            v[a.as_usize()] = -0.2; // unigram "a"'s own backoff
            v[unigram_count] = 0.0; // bigram "a b"'s backoff (unused here)
            v
        };
        let logbound_values = vec![0f32; unigram_count + 1];

        for (sub, values) in [
            ("logprob", &logprob_values),
            ("backoff", &backoff_values),
            ("logbound", &logbound_values),
        ] {
            let shard_dir = dir.join(sub).join("0");
            std::fs::create_dir_all(&shard_dir).unwrap();
            write_float_array_file(shard_dir.join(format!("{sub}.bin")), values.iter().copied()).unwrap();
        }

        (bos, eos, a, c)
    }

    #[test]
    fn scenario_one_backs_off_to_unigram() {
        let dir = tempfile::tempdir().unwrap();
        let (_bos, _eos, a, c) = build_scenario_one(dir.path());

        let engine = QueryEngine::open(dir.path()).unwrap();
        let order = engine.order();
        assert_eq!(order, 2);

        let mut state = vec![0u8; engine.state_buffer_size()];
        {
            let mut view = StateViewMut::new(&mut state, order).unwrap();
            view.fill(&[a], &[0.0]);
        }

        let mut out_state = vec![0u8; engine.state_buffer_size()];
        let lp = engine.logprob(&state, c, &mut out_state).unwrap();
        assert!((lp - (-1.3 + -0.2)).abs() < 1e-6, "got {lp}");
    }

    #[test]
    fn scenario_two_unigram_from_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let (_bos, _eos, a, _c) = build_scenario_one(dir.path());

        let engine = QueryEngine::open(dir.path()).unwrap();
        let order = engine.order();

        let mut state = vec![0u8; engine.state_buffer_size()];
        {
            let mut view = StateViewMut::new(&mut state, order).unwrap();
            view.fill_empty();
        }

        let mut out_state = vec![0u8; engine.state_buffer_size()];
        let lp = engine.logprob(&state, a, &mut out_state).unwrap();
        // "a" has no explicit unigram logprob set in the fixture (defaults
        // to 0.0), but the important assertion is that it resolves via the
        // unigram path with no backoff contribution at all.
        assert_eq!(lp, 0.0);
    }

    #[test]
    fn repeated_query_hits_cache_with_same_result() {
        let dir = tempfile::tempdir().unwrap();
        let (_bos, _eos, a, c) = build_scenario_one(dir.path());
        let engine = QueryEngine::open(dir.path()).unwrap();
        let order = engine.order();

        let mut state = vec![0u8; engine.state_buffer_size()];
        {
            let mut view = StateViewMut::new(&mut state, order).unwrap();
            view.fill(&[a], &[0.0]);
        }

        let mut out1 = vec![0u8; engine.state_buffer_size()];
        let mut out2 = vec![0u8; engine.state_buffer_size()];
        let lp1 = engine.logprob(&state, c, &mut out1).unwrap();
        let lp2 = engine.logprob(&state, c, &mut out2).unwrap();
        assert_eq!(lp1, lp2);
        assert_eq!(out1, out2);
    }
}
