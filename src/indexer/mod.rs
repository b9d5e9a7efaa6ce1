//! C8: Indexer, the distributed build pipeline's driver. Phase 1 bootstraps
//! the vocabulary and unigram counts from `1gms/vocab_cs.gz` on a single
//! rank; Phase 2 walks orders `2..=order`, round-robining each order's
//! `kgms/` count files across mapper ranks and routing their merged output
//! to one reducer per shard, stopping the moment an order's file listing
//! comes back empty (spec §4.7's phase-2 termination signal).
//!
//! Every "rank" here is an OS thread and every mapper-to-reducer edge a
//! bounded `crossbeam-channel` (see `channel.rs`) rather than a real
//! process/MPI layer (explicitly out of scope, spec §1).

pub mod channel;
pub mod google;
pub mod mapper;
pub mod reducer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;

use crate::error::{Error, Result};
use crate::index;
use crate::packed::bits_for_max_value;
use crate::repository::{self, Manifest, ModelKind};
use crate::vocab::{Vocabulary, VocabBuilder};
use channel::Msg;

/// Configuration for one end-to-end build.
pub struct BuildConfig {
    /// Root of the Google Web-1T-layout corpus (`1gms/`, `2gms/`, ...).
    pub corpus_root: PathBuf,
    /// Destination repository directory (must not already exist as a
    /// finished repository).
    pub output_dir: PathBuf,
    /// Highest n-gram order to build, if the corpus has that many `kgms/`
    /// directories. Phase 2 stops early if the corpus runs out first.
    pub order: usize,
    /// Number of shards to route bigram-and-up contexts across.
    pub shard_count: usize,
    /// Number of simulated mapper ranks per order.
    pub mapper_count: usize,
}

/// Accumulates one shard's trie content across orders as Phase 2 proceeds.
struct ShardAccum {
    ids: Vec<u64>,
    position_bits: Vec<bool>,
    counts: Vec<u64>,
    offsets: Vec<usize>,
}

/// Runs a full build per `config`, producing a `counts` repository at
/// `config.output_dir`.
pub fn run(config: &BuildConfig) -> Result<()> {
    log::info!(
        "starting build: corpus={}, output={}, order={}, shards={}",
        config.corpus_root.display(),
        config.output_dir.display(),
        config.order,
        config.shard_count
    );

    // Phase 1: unigram bootstrap.
    let vocab_path = config.corpus_root.join("1gms").join("vocab_cs.gz");
    let unigram_records = google::read_unigram_counts(&vocab_path)?;
    log::info!("phase 1: read {} unigram records", unigram_records.len());

    let mut vocab_builder = VocabBuilder::new();
    let mut unigram_counts: Vec<u64> = vec![0];
    for record in &unigram_records {
        let id = vocab_builder.insert(record.word.as_bytes());
        let idx = id.as_u32() as usize;
        if idx >= unigram_counts.len() {
            unigram_counts.resize(idx + 1, 0);
        }
        unigram_counts[idx] = record.count;
    }
    let vocab_len = vocab_builder.len();
    unigram_counts.resize(vocab_len, 0);

    repository::prepare_layout(&config.output_dir, config.shard_count, ModelKind::Counts)?;
    vocab_builder.write(
        repository::vocab_fst_path(&config.output_dir),
        repository::vocab_strings_path(&config.output_dir),
    )?;
    let vocab = Vocabulary::open(
        repository::vocab_fst_path(&config.output_dir),
        repository::vocab_strings_path(&config.output_dir),
    )?;

    let mut shards: Vec<ShardAccum> = (0..config.shard_count)
        .map(|_| ShardAccum {
            ids: Vec::new(),
            position_bits: Vec::new(),
            counts: unigram_counts.clone(),
            offsets: vec![0, vocab_len],
        })
        .collect();

    // contexts[shard] holds, in trie-position order, the full word-id
    // context of every node at the order currently being used as a parent.
    // Order 1's nodes are unigrams, whose context is just their own id.
    let mut contexts: Vec<Vec<Vec<u32>>> = (0..config.shard_count)
        .map(|_| (0..vocab_len as u32).map(|id| vec![id]).collect())
        .collect();

    let mut achieved_order = 1usize;

    // Phase 2: per-order mapper/reducer passes.
    for k in 2..=config.order {
        let files = google::enumerate_order_files(&config.corpus_root, k)?;
        if files.is_empty() {
            log::info!("phase 2: no files for order {k}, stopping");
            break;
        }
        log::info!("phase 2: order {k}, {} files", files.len());

        let mapper_count = config.mapper_count.max(1);
        let mut rank_files: Vec<Vec<PathBuf>> = vec![Vec::new(); mapper_count];
        for (i, file) in files.into_iter().enumerate() {
            rank_files[i % mapper_count].push(file);
        }

        let mut master_senders: Vec<Sender<Msg>> = Vec::with_capacity(config.shard_count);
        let mut receivers = Vec::with_capacity(config.shard_count);
        for _ in 0..config.shard_count {
            let (tx, rx) = channel::reducer_edge();
            master_senders.push(tx);
            receivers.push(rx);
        }

        let reducer_outputs: Vec<reducer::ReducerOutput> = std::thread::scope(|scope| -> Result<Vec<reducer::ReducerOutput>> {
            let mut reducer_handles = Vec::with_capacity(config.shard_count);
            for rx in receivers {
                let vocab_ref = &vocab;
                reducer_handles.push(scope.spawn(move || reducer::run_reducer(mapper_count, rx, vocab_ref, k)));
            }

            let mut mapper_handles = Vec::with_capacity(mapper_count);
            for (rank, files) in rank_files.into_iter().enumerate() {
                let vocab_ref = &vocab;
                let senders: Vec<Sender<Msg>> = master_senders.iter().cloned().collect();
                mapper_handles.push(scope.spawn(move || mapper::run_mapper(rank, files, vocab_ref, &senders)));
            }
            drop(master_senders);

            for handle in mapper_handles {
                handle
                    .join()
                    .map_err(|_| Error::InternalInvariant("mapper thread panicked".to_string()))??;
            }

            let mut outputs = Vec::with_capacity(config.shard_count);
            for handle in reducer_handles {
                let out = handle
                    .join()
                    .map_err(|_| Error::InternalInvariant("reducer thread panicked".to_string()))??;
                outputs.push(out);
            }
            Ok(outputs)
        })?;

        for (s, output) in reducer_outputs.into_iter().enumerate() {
            let mut groups_by_context: HashMap<Vec<u32>, reducer::GroupEntry> =
                output.entries.into_iter().map(|g| (g.parent_context.clone(), g)).collect();

            let prev_contexts = std::mem::take(&mut contexts[s]);
            let mut new_contexts = Vec::with_capacity(prev_contexts.len());
            let mut next_pos = *shards[s].offsets.last().unwrap();

            // Every node of the previous order is a parent slot at this
            // order, whether or not it actually has children here. Each
            // slot pushes one zero bit per child followed by a single
            // terminating one bit (spec §4.7), so `positions` carries
            // exactly one terminator per parent and group boundaries stay
            // recoverable by `select` even across childless parents.
            for ctx in &prev_contexts {
                if let Some(group) = groups_by_context.remove(ctx) {
                    for (child_id, count) in group.children {
                        shards[s].ids.push(child_id.as_u32() as u64);
                        shards[s].position_bits.push(false);
                        shards[s].counts.push(count);

                        let mut child_ctx = ctx.clone();
                        child_ctx.push(child_id.as_u32());
                        new_contexts.push(child_ctx);
                        next_pos += 1;
                    }
                }
                shards[s].position_bits.push(true);
            }

            if !groups_by_context.is_empty() {
                Error::abort(format!("shard {s} order {k}: reduced group has no matching parent context"));
            }

            shards[s].offsets.push(next_pos);
            contexts[s] = new_contexts;
        }

        achieved_order = k;
    }

    for (s, accum) in shards.iter().enumerate() {
        let max_id = accum.ids.iter().copied().max().unwrap_or(0);
        let content = index::ShardContent {
            shard: s,
            ids_bits: bits_for_max_value(max_id),
            ids: accum.ids.clone(),
            position_bits: accum.position_bits.clone(),
            offsets: accum.offsets.clone(),
        };
        index::write_shard(&config.output_dir, &content)?;
        crate::counts::write_shard_counts(&config.output_dir, s, &accum.counts)?;
    }

    let manifest = Manifest {
        order: achieved_order,
        shard_size: config.shard_count,
        model_kind: ModelKind::Counts,
    };
    manifest.write(&config.output_dir)?;
    repository::write_done(&config.output_dir)?;

    log::info!("build finished: order={achieved_order}, shards={}", config.shard_count);
    Ok(())
}
