//! Mapper side of Phase 2 (spec §4.7): opens a k-way merge over its
//! assigned sorted count files, routes each merged record to the shard
//! that owns it, and forwards batched `w₁ … wₖ c\n` text to that shard's
//! reducer.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use crossbeam_channel::Sender;

use crate::error::Result;
use crate::indexer::channel::{frame_count_lines, Msg};
use crate::indexer::google::CountFileReader;
use crate::shard::hashmurmur;
use crate::vocab::Vocabulary;

/// Lines are batched before compressing and sending; bounds how much
/// per-shard buffering a mapper does before flushing to the channel.
const BATCH_LINES: usize = 512;

struct HeapEntry {
    words: Vec<String>,
    count: u64,
    file_idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.words.cmp(&other.words)
    }
}

/// Merges several individually-sorted count files into one globally sorted
/// stream, pulling the next record from whichever file currently holds the
/// lexicographically smallest context. A direct translation of the classic
/// k-way merge priority-queue pattern (spec §9: "explicit priority queues
/// over input streams; no hidden coroutine state").
struct KWayMerge {
    readers: Vec<CountFileReader>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl KWayMerge {
    fn new(paths: Vec<PathBuf>) -> Result<Self> {
        let mut readers = Vec::with_capacity(paths.len());
        for path in paths {
            readers.push(CountFileReader::open(path)?);
        }
        let mut heap = BinaryHeap::new();
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some((words, count)) = reader.next_record()? {
                heap.push(Reverse(HeapEntry {
                    words,
                    count,
                    file_idx: idx,
                }));
            }
        }
        Ok(Self { readers, heap })
    }

    fn next(&mut self) -> Result<Option<(Vec<String>, u64)>> {
        let Reverse(top) = match self.heap.pop() {
            Some(e) => e,
            None => return Ok(None),
        };
        if let Some((words, count)) = self.readers[top.file_idx].next_record()? {
            self.heap.push(Reverse(HeapEntry {
                words,
                count,
                file_idx: top.file_idx,
            }));
        }
        Ok(Some((top.words, top.count)))
    }
}

/// Routes an n-gram's first two words to a shard, matching
/// `Index::shard_of`'s hash exactly so mappers and the finished index agree
/// on ownership.
fn route(words: &[String], vocab: &Vocabulary, shard_count: usize) -> usize {
    if words.len() < 2 || shard_count <= 1 {
        return 0;
    }
    let w0 = vocab.lookup_id(words[0].as_bytes()).as_u32() as u64;
    let w1 = vocab.lookup_id(words[1].as_bytes()).as_u32() as u64;
    let h = hashmurmur(w0, hashmurmur(w1, 0));
    (h % shard_count as u64) as usize
}

/// Runs one mapper rank: merges `files`, routes each record to its
/// reducer's sender, flushing batched frames along the way. `senders` must
/// have one entry per shard, indexed by shard id.
pub fn run_mapper(rank: usize, files: Vec<PathBuf>, vocab: &Vocabulary, senders: &[Sender<Msg>]) -> Result<()> {
    let shard_count = senders.len();
    let mut merge = KWayMerge::new(files)?;

    let mut batches: Vec<Vec<String>> = vec![Vec::new(); shard_count];
    // caches the routing decision for runs of adjacent contexts sharing the
    // first two words (spec §4.7: "Mappers cache the shard routing decision
    // for adjacent contexts that share the first two words").
    let mut route_cache: Option<((String, String), usize)> = None;

    while let Some((words, count)) = merge.next()? {
        let shard = if words.len() >= 2 {
            let key = (words[0].clone(), words[1].clone());
            match &route_cache {
                Some((cached_key, cached_shard)) if *cached_key == key => *cached_shard,
                _ => {
                    let s = route(&words, vocab, shard_count);
                    route_cache = Some((key, s));
                    s
                }
            }
        } else {
            route(&words, vocab, shard_count)
        };

        let mut line = words.join(" ");
        line.push(' ');
        line.push_str(&count.to_string());
        batches[shard].push(line);

        if batches[shard].len() >= BATCH_LINES {
            let payload = frame_count_lines(&batches[shard])?;
            senders[shard]
                .send(Msg::Count { rank, payload })
                .map_err(|_| crate::error::Error::InternalInvariant(format!("reducer for shard {shard} hung up")))?;
            batches[shard].clear();
        }
    }

    for (shard, batch) in batches.into_iter().enumerate() {
        if !batch.is_empty() {
            let payload = frame_count_lines(&batch)?;
            senders[shard]
                .send(Msg::Count { rank, payload })
                .map_err(|_| crate::error::Error::InternalInvariant(format!("reducer for shard {shard} hung up")))?;
        }
    }
    for sender in senders {
        let _ = sender.send(Msg::End { rank });
    }
    Ok(())
}
