//! C5: Index, the top-level handle over a repository. Holds every shard
//! plus the vocabulary, and is the only thing that knows how to route an
//! n-gram's first two words to the shard that owns it.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::counts::CountsModel;
use crate::error::{Error, Result};
use crate::query::write_float_array_file;
use crate::repository::{self, vocab_fst_path, vocab_strings_path, Manifest, ModelKind};
use crate::shard::{hashmurmur, write_offsets, Shard};
use crate::vocab::Vocabulary;
use crate::word::{NodePos, WordId};

/// Fixed discount applied at every backoff step by
/// `Index::from_counts_stupid_backoff`. Matches the constant the
/// `StupidBackoff`-style scorer in the pack's reference material uses.
const STUPID_BACKOFF_ALPHA: f32 = 0.4;

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub shard_count: usize,
    pub vocab_size: usize,
    pub ids_bytes: u64,
    pub positions_bytes: u64,
}

pub struct Index {
    shards: Vec<Shard>,
    vocab: Vocabulary,
    manifest: Manifest,
    path: PathBuf,
}

impl Index {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest = repository::open_repository(dir)?;

        let vocab = Vocabulary::open(vocab_fst_path(dir), vocab_strings_path(dir))?;

        let mut shards = Vec::with_capacity(manifest.shard_size);
        for s in 0..manifest.shard_size {
            shards.push(Shard::open(repository::shard_dir(dir, s))?);
        }

        Ok(Self {
            shards,
            vocab,
            manifest,
            path: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn order(&self) -> usize {
        self.manifest.order
    }

    pub fn model_kind(&self) -> ModelKind {
        self.manifest.model_kind
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, i: usize) -> &Shard {
        &self.shards[i]
    }

    /// Routes an n-gram's first two words to a shard. Unigrams and empty
    /// contexts always route to shard 0.
    pub fn shard_of(&self, ids: &[WordId]) -> usize {
        if ids.len() < 2 {
            return 0;
        }
        let h = hashmurmur(ids[0].as_u32() as u64, hashmurmur(ids[1].as_u32() as u64, 0));
        (h % self.shards.len() as u64) as usize
    }

    pub fn traverse_ids(&self, ids: &[WordId]) -> (usize, usize, Option<NodePos>) {
        let s = self.shard_of(ids);
        let (consumed, node) = self.shards[s].traverse_ids(ids);
        (s, consumed, node)
    }

    pub fn traverse_strings(&self, words: &[&[u8]]) -> (usize, usize, Option<NodePos>) {
        let ids: Vec<WordId> = words.iter().map(|w| self.vocab.lookup_id(w)).collect();
        self.traverse_ids(&ids)
    }

    /// The n-gram order (1-indexed) that node `pos` of `shard` belongs to,
    /// found by binary search over that shard's `offsets`.
    pub fn order_of(&self, shard: usize, pos: NodePos) -> usize {
        let offsets = self.shards[shard].offsets();
        match offsets.binary_search(&pos.as_usize()) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            shard_count: self.shards.len(),
            vocab_size: self.vocab.len(),
            ids_bytes: 0,
            positions_bytes: 0,
        };
        for shard in &self.shards {
            stats.ids_bytes += shard_ids_bytes(shard);
            stats.positions_bytes += shard_positions_bytes(shard);
        }
        stats
    }
}

fn shard_ids_bytes(shard: &Shard) -> u64 {
    // best-effort accounting for the --verbose/--debug CLI surface; reads
    // the file back rather than threading a size through Shard, since this
    // is purely diagnostic and off the query hot path.
    std::fs::metadata(shard.dir().join("ids.bin")).map(|m| m.len()).unwrap_or(0)
}

fn shard_positions_bytes(shard: &Shard) -> u64 {
    std::fs::metadata(shard.dir().join("positions.bin")).map(|m| m.len()).unwrap_or(0)
}

/// Content for one shard, ready to be persisted by `write_shard`. The
/// indexer assembles these per order before calling in.
pub struct ShardContent {
    pub shard: usize,
    pub ids_bits: u32,
    pub ids: Vec<u64>,
    pub position_bits: Vec<bool>,
    pub offsets: Vec<usize>,
}

/// Writes the vocabulary and repository manifest. Runs once, on the
/// orchestrating side of a build, before any shard content is written.
pub fn write_prepare(
    repo_root: &Path,
    vocab_builder: &crate::vocab::VocabBuilder,
    order: usize,
    shard_count: usize,
    model_kind: ModelKind,
) -> Result<()> {
    repository::prepare_layout(repo_root, shard_count, model_kind)?;
    vocab_builder.write(vocab_fst_path(repo_root), vocab_strings_path(repo_root))?;
    let manifest = Manifest {
        order,
        shard_size: shard_count,
        model_kind,
    };
    manifest.write(repo_root)
}

/// Writes one shard's `ids.bin`/`positions.bin`/`offsets.bin`.
pub fn write_shard(repo_root: &Path, content: &ShardContent) -> Result<()> {
    let dir = repository::shard_dir(repo_root, content.shard);
    crate::packed::write_packed_int_file(dir.join("ids.bin"), content.ids_bits, content.ids.iter().copied())
        .map_err(|e| Error::io(dir.join("ids.bin"), e))?;

    let positions_file = std::fs::File::create(dir.join("positions.bin")).map_err(|e| Error::io(dir.join("positions.bin"), e))?;
    let mut sink = crate::succinct::SuccinctBitVectorSink::create(positions_file, crate::succinct::DEFAULT_SAMPLE_RATE)
        .map_err(|e| Error::io(dir.join("positions.bin"), e))?;
    sink.extend(content.position_bits.iter().copied())
        .map_err(|e| Error::io(dir.join("positions.bin"), e))?;
    sink.finish().map_err(|e| Error::io(dir.join("positions.bin"), e))?;

    write_offsets(&dir.join("offsets.bin"), &content.offsets)
}

/// Copies `index`'s trie (vocabulary + every shard's `ids`/`positions`/
/// `offsets`) verbatim into a fresh repository directory. Used by anything
/// that derives a sibling repository sharing the same trie but different
/// per-node data: `quantize::quantize` and `from_counts_stupid_backoff`.
pub fn copy_trie_and_vocab(index: &Index, out_dir: &Path) -> Result<()> {
    std::fs::copy(vocab_fst_path(index.path()), vocab_fst_path(out_dir)).map_err(|e| Error::io(out_dir, e))?;
    std::fs::copy(vocab_strings_path(index.path()), vocab_strings_path(out_dir)).map_err(|e| Error::io(out_dir, e))?;
    for s in 0..index.shard_count() {
        let shard = index.shard(s);
        let dest = repository::shard_dir(out_dir, s);
        std::fs::copy(shard.dir().join("ids.bin"), dest.join("ids.bin")).map_err(|e| Error::io(out_dir, e))?;
        std::fs::copy(shard.dir().join("positions.bin"), dest.join("positions.bin")).map_err(|e| Error::io(out_dir, e))?;
        write_offsets(&dest.join("offsets.bin"), shard.offsets())?;
    }
    Ok(())
}

/// Derives a placeholder, non-smoothed probability repository from a
/// `Counts` index, using a fixed-discount stupid-backoff score:
/// `logprob(w | ctx) = ln(count(ctx, w) / count(ctx))`, `backoff = ln(alpha)`
/// everywhere. This is for testing/demo purposes only: a real language
/// model requires smoothing (out of scope for the indexer), so the
/// resulting probabilities don't sum to 1 and shouldn't be trusted for
/// anything beyond exercising `QueryEngine` end to end.
pub fn from_counts_stupid_backoff(counts_index: &Index, out_dir: &Path) -> Result<()> {
    if counts_index.model_kind() != ModelKind::Counts {
        return Err(Error::InvalidArgument(format!(
            "repository at {} holds a {} model; stupid-backoff construction requires `counts`",
            counts_index.path().display(),
            counts_index.model_kind()
        )));
    }

    let shard_count = counts_index.shard_count();
    let counts = CountsModel::open(counts_index.path(), shard_count)?;
    let log_alpha = STUPID_BACKOFF_ALPHA.ln();

    repository::prepare_layout(out_dir, shard_count, ModelKind::Probabilities)?;
    copy_trie_and_vocab(counts_index, out_dir)?;

    let vocab_len = counts_index.shard(0).offsets()[1];
    let mut total_unigrams: u64 = 0;
    for pos in 0..vocab_len {
        total_unigrams += counts.count(0, pos);
    }
    let total_unigrams = total_unigrams.max(1);

    for s in 0..shard_count {
        let shard = counts_index.shard(s);
        let size = shard.size();
        let mut logprob = vec![0f32; size];
        let mut backoff = vec![log_alpha; size];
        let mut logbound = vec![0f32; size];

        for pos in 0..size {
            let count = counts.count(s, pos).max(1);
            let parent_count = if pos < vocab_len {
                total_unigrams
            } else {
                match shard.parent(pos) {
                    Some(parent_pos) => counts.count(s, parent_pos.as_usize()).max(1),
                    None => total_unigrams,
                }
            };
            let lp = ((count as f64) / (parent_count as f64)).ln() as f32;
            logprob[pos] = lp;
            logbound[pos] = lp;
        }

        for (sub, values) in [("logprob", &logprob), ("backoff", &backoff), ("logbound", &logbound)] {
            let dir = out_dir.join(sub).join(s.to_string());
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            write_float_array_file(dir.join(format!("{sub}.bin")), values.iter().copied()).map_err(|e| Error::io(&dir, e))?;
        }
    }

    let manifest = Manifest {
        order: counts_index.order(),
        shard_size: shard_count,
        model_kind: ModelKind::Probabilities,
    };
    manifest.write(out_dir)?;
    repository::write_done(out_dir)
}

/// Writes every shard's content in parallel, then the completion sentinel.
/// The sentinel is written only after every shard succeeds: a panic or
/// error partway through leaves `done` absent, so a subsequent `open`
/// reports `IncompleteIndex` instead of reading a half-built repository.
pub fn write_shards_parallel(repo_root: &Path, contents: &[ShardContent]) -> Result<()> {
    contents
        .par_iter()
        .try_for_each(|content| write_shard(repo_root, content))?;
    repository::write_done(repo_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::bits_for_max_value;
    use crate::vocab::VocabBuilder;

    #[test]
    fn open_write_roundtrip_single_shard() {
        let dir = tempfile::tempdir().unwrap();

        let mut vocab_builder = VocabBuilder::new();
        let a = vocab_builder.insert(b"a");
        let b = vocab_builder.insert(b"b");
        let c = vocab_builder.insert(b"c");

        write_prepare(dir.path(), &vocab_builder, 2, 1, ModelKind::Counts).unwrap();

        // unigrams {<unk>, a, b, c} -> offsets[1] = 4
        // bigram children: a -> [b, c]; <unk>, b, c have none.
        // positions: one parent slot per unigram (in order), each a run of
        // zero bits (one per child) followed by a terminating one bit.
        let ids = vec![b.as_u32() as u64, c.as_u32() as u64];
        let bits = bits_for_max_value(c.as_u32() as u64);
        let content = ShardContent {
            shard: 0,
            ids_bits: bits,
            ids,
            position_bits: vec![true, false, false, true, true, true],
            offsets: vec![0, 4, 6],
        };
        write_shards_parallel(dir.path(), &[content]).unwrap();

        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.shard_count(), 1);
        assert_eq!(index.order(), 2);

        let (shard, consumed, node) = index.traverse_ids(&[a, b]);
        assert_eq!(shard, 0);
        assert_eq!(consumed, 2);
        assert!(node.is_some());
        assert_eq!(index.order_of(shard, node.unwrap()), 2);

        let (_, consumed, node) = index.traverse_ids(&[a]);
        assert_eq!(consumed, 1);
        assert_eq!(index.order_of(0, node.unwrap()), 1);
    }

    #[test]
    fn stupid_backoff_scores_child_over_parent_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut vocab_builder = VocabBuilder::new();
        let a = vocab_builder.insert(b"a");
        let b = vocab_builder.insert(b"b");
        let c = vocab_builder.insert(b"c");

        write_prepare(dir.path(), &vocab_builder, 2, 1, ModelKind::Counts).unwrap();
        let ids = vec![b.as_u32() as u64, c.as_u32() as u64];
        let bits = bits_for_max_value(c.as_u32() as u64);
        let content = ShardContent {
            shard: 0,
            ids_bits: bits,
            ids,
            position_bits: vec![true, false, false, true, true, true],
            offsets: vec![0, 4, 6],
        };
        write_shards_parallel(dir.path(), &[content]).unwrap();

        // unigram counts: <unk>=0, a=10, b=4, c=1; bigram "a b" = 3.
        let unigram_counts = vec![0u64, 10, 4, 1];
        crate::counts::write_shard_counts(dir.path(), 0, &[unigram_counts, vec![3, 1]].concat()).unwrap();

        let counts_index = Index::open(dir.path()).unwrap();
        let prob_dir = tempfile::tempdir().unwrap();
        from_counts_stupid_backoff(&counts_index, prob_dir.path()).unwrap();

        let prob_index = Index::open(prob_dir.path()).unwrap();
        assert_eq!(prob_index.model_kind(), ModelKind::Probabilities);

        let engine = crate::query::QueryEngine::open(prob_dir.path()).unwrap();
        let mut state = vec![0u8; engine.state_buffer_size()];
        {
            let mut view = crate::state::StateViewMut::new(&mut state, engine.order()).unwrap();
            view.fill(&[a], &[0.0]);
        }
        let mut out_state = vec![0u8; engine.state_buffer_size()];
        let lp = engine.logprob(&state, b, &mut out_state).unwrap();
        let expected = ((3.0_f64 / 10.0).ln()) as f32;
        assert!((lp - expected).abs() < 1e-5, "got {lp}, expected {expected}");
    }
}
