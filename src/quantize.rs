//! Post-build quantization: turns a `Probabilities` repository into a
//! sibling `ProbabilitiesQuantized` one, replacing each order's `f32`
//! logprob/backoff/logbound arrays with an 8-bit codebook index plus one
//! shared 256-entry codebook per order. The trie itself (vocab + every
//! shard's `ids`/`positions`/`offsets`) is untouched, just copied over via
//! `index::copy_trie_and_vocab`.
//!
//! Codebooks are built by quantile bucketing: sort an order's values,
//! split into (up to) 256 equal-count buckets, and use each bucket's mean
//! as its codebook entry. No iterative refinement (k-means); a single
//! sorted pass is enough to keep quantization error low for the smoothly
//! distributed logprob/backoff/logbound ranges this store holds, and it
//! runs in one pass with no convergence risk.
//!
//! Input is any `Probabilities` repository, typically one produced by
//! `Index::from_counts_stupid_backoff`.

use std::path::Path;

use crate::error::{Error, Result};
use crate::index::{self, Index};
use crate::query::{write_codebooks, Codebook, ProbabilityModel, RawProbabilityModel};
use crate::repository::{self, Manifest, ModelKind};

const QUANTIZED_BITS: u32 = 8;
const QUANTIZED_LEVELS: usize = 256;

type Getter = fn(&dyn ProbabilityModel, usize, usize, usize) -> f32;

struct Sub {
    name: &'static str,
    file_stem: &'static str,
    get: Getter,
}

const SUBS: [Sub; 3] = [
    Sub {
        name: "logprob",
        file_stem: "logprob",
        get: |m, s, p, o| m.logprob(s, p, o),
    },
    Sub {
        name: "backoff",
        file_stem: "backoff",
        get: |m, s, p, o| m.backoff(s, p, o),
    },
    Sub {
        name: "logbound",
        file_stem: "logbound",
        get: |m, s, p, o| m.logbound(s, p, o),
    },
];

/// Builds one order's codebook from its flat value list, plus each
/// value's bucket assignment aligned to the input order.
fn quantize_order_values(values: &[f32]) -> (Codebook, Vec<u8>) {
    let n = values.len();
    let mut codebook = [0f32; QUANTIZED_LEVELS];
    let mut assignment = vec![0u8; n];
    if n == 0 {
        return (codebook, assignment);
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());

    let buckets = QUANTIZED_LEVELS.min(n);
    let mut start = 0usize;
    for b in 0..buckets {
        let remaining_buckets = buckets - b;
        let remaining_items = n - start;
        let take = remaining_items.div_ceil(remaining_buckets);
        let end = start + take;
        let slice = &order[start..end];
        let sum: f64 = slice.iter().map(|&i| values[i] as f64).sum();
        codebook[b] = (sum / slice.len() as f64) as f32;
        for &i in slice {
            assignment[i] = b as u8;
        }
        start = end;
    }
    (codebook, assignment)
}

/// Quantizes `index` (must hold a `Probabilities` model) into a fresh
/// `ProbabilitiesQuantized` repository at `out_dir`.
pub fn quantize(index: &Index, out_dir: &Path) -> Result<()> {
    if index.model_kind() != ModelKind::Probabilities {
        return Err(Error::InvalidArgument(format!(
            "repository at {} holds a {} model; quantization requires `probabilities`",
            index.path().display(),
            index.model_kind()
        )));
    }

    let order = index.order();
    let shard_count = index.shard_count();
    let model = RawProbabilityModel::open(index.path(), shard_count)?;

    repository::prepare_layout(out_dir, shard_count, ModelKind::ProbabilitiesQuantized)?;
    index::copy_trie_and_vocab(index, out_dir)?;

    for sub in &SUBS {
        let mut codebooks: Vec<Codebook> = Vec::with_capacity(order);
        let mut shard_outputs: Vec<Vec<u64>> = (0..shard_count).map(|s| vec![0u64; index.shard(s).size()]).collect();

        for o in 1..=order {
            let mut flat_values = Vec::new();
            let mut locations = Vec::new();
            for s in 0..shard_count {
                let shard = index.shard(s);
                let offsets = shard.offsets();
                let (start, end) = (offsets[o - 1], offsets[o]);
                for pos in start..end {
                    flat_values.push((sub.get)(&model, s, pos, o));
                    locations.push((s, pos));
                }
            }

            let (codebook, assignment) = quantize_order_values(&flat_values);
            for (&(s, pos), &idx) in locations.iter().zip(assignment.iter()) {
                shard_outputs[s][pos] = idx as u64;
            }
            codebooks.push(codebook);
        }

        write_codebooks(&out_dir.join(sub.name).join("codebook.bin"), &codebooks)?;

        for s in 0..shard_count {
            let dir = out_dir.join(sub.name).join(s.to_string());
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            crate::packed::write_packed_int_file(
                dir.join(format!("{}.qbin", sub.file_stem)),
                QUANTIZED_BITS,
                shard_outputs[s].iter().copied(),
            )
            .map_err(|e| Error::io(&dir, e))?;
        }
    }

    let manifest = Manifest {
        order,
        shard_size: shard_count,
        model_kind: ModelKind::ProbabilitiesQuantized,
    };
    manifest.write(out_dir)?;
    repository::write_done(out_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_order_values_preserves_extremes_within_bucket_mean() {
        let values: Vec<f32> = (0..1000).map(|i| i as f32 * 0.01).collect();
        let (codebook, assignment) = quantize_order_values(&values);
        assert_eq!(assignment.len(), values.len());
        // first and last values land in the first/last buckets.
        assert_eq!(assignment[0], 0);
        assert_eq!(assignment[999], 255);
        // codebook entries are non-decreasing since inputs are sorted.
        for w in codebook.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn quantize_order_values_handles_fewer_values_than_levels() {
        let values = vec![1.0, 2.0, 3.0];
        let (_codebook, assignment) = quantize_order_values(&values);
        assert_eq!(assignment, vec![0, 1, 2]);
    }

    #[test]
    fn quantize_order_values_empty_is_a_noop() {
        let (codebook, assignment) = quantize_order_values(&[]);
        assert!(assignment.is_empty());
        assert_eq!(codebook[0], 0.0);
    }
}
