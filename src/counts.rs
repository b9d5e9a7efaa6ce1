//! C8 counts-model data: `count[p]`/`count_modified[p]` packed-int arrays,
//! parallel to the trie exactly like the probability model's
//! logprob/backoff/logbound (see `query.rs`), but holding raw occurrence
//! counts instead of floats. This is what `indexer::run` produces
//! directly; a probability repository is derived from it by smoothing,
//! which is out of scope. `Index::from_counts_stupid_backoff` derives a
//! placeholder, non-smoothed probability repository from a counts
//! repository for testing.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::packed::PackedIntArray;

struct ShardCountArrays {
    count: PackedIntArray,
    count_modified: PackedIntArray,
}

/// Read-only view over a repository's `count`/`count_modified` arrays.
pub struct CountsModel {
    shards: Vec<ShardCountArrays>,
}

fn count_path(repo_root: &Path, shard: usize) -> PathBuf {
    repo_root.join("count").join(shard.to_string()).join("count.bin")
}

fn count_modified_path(repo_root: &Path, shard: usize) -> PathBuf {
    repo_root.join("count").join(shard.to_string()).join("count_modified.bin")
}

impl CountsModel {
    pub fn open(repo_root: &Path, shard_count: usize) -> Result<Self> {
        let mut shards = Vec::with_capacity(shard_count);
        for s in 0..shard_count {
            shards.push(ShardCountArrays {
                count: PackedIntArray::open(count_path(repo_root, s))?,
                count_modified: PackedIntArray::open(count_modified_path(repo_root, s))?,
            });
        }
        Ok(Self { shards })
    }

    pub fn count(&self, shard: usize, pos: usize) -> u64 {
        self.shards[shard].count.get(pos)
    }

    pub fn count_modified(&self, shard: usize, pos: usize) -> u64 {
        self.shards[shard].count_modified.get(pos)
    }
}

/// Writes one shard's count arrays, over the full trie position range
/// (unigrams included, unlike `ShardContent::ids`). `count_modified` is stored as a copy
/// of `count`: the real modified count (distinct left-extensions, used by
/// Kneser-Ney-style smoothing) requires context statistics this indexer
/// does not compute, since training is out of scope. Kept as a
/// shape-correct placeholder rather than left absent, so the data model
/// stays complete.
pub fn write_shard_counts(repo_root: &Path, shard: usize, counts: &[u64]) -> Result<()> {
    let dir = repo_root.join("count").join(shard.to_string());
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    let max = counts.iter().copied().max().unwrap_or(0);
    let bits = crate::packed::bits_for_max_value(max);
    crate::packed::write_packed_int_file(dir.join("count.bin"), bits, counts.iter().copied())
        .map_err(|e| Error::io(dir.join("count.bin"), e))?;
    crate::packed::write_packed_int_file(dir.join("count_modified.bin"), bits, counts.iter().copied())
        .map_err(|e| Error::io(dir.join("count_modified.bin"), e))
}
