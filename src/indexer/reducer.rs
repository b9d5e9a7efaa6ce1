//! Reducer side of Phase 2 (spec §4.7): runs a k-way merge over its inbound
//! mapper streams, accumulates runs sharing a `(k-1)`-prefix into a
//! children group, and emits each group (sorted by child id) into the
//! shard's packed ids/counts/position-bit sinks.

use std::collections::VecDeque;

use crossbeam_channel::Receiver;

use crate::error::Result;
use crate::indexer::channel::{unframe_count_lines, Msg};
use crate::vocab::Vocabulary;
use crate::word::WordId;

/// One parent's finished children group: the (order-1)-length context that
/// owns it, plus its children sorted by word id (spec §4.7: "sort `words`
/// by id").
pub struct GroupEntry {
    pub parent_context: Vec<u32>,
    pub children: Vec<(WordId, u64)>,
}

/// One reducer's output for a single order: every children group it built,
/// one per parent context that had at least one child in this order's
/// input. The indexer driver looks these up by context while walking
/// every parent slot of the previous order, so no particular entry order
/// is required here.
pub struct ReducerOutput {
    pub entries: Vec<GroupEntry>,
}

/// Demultiplexes a single shared channel into per-mapper-rank line queues
/// and performs the k-way merge across them. Each rank's own frames arrive
/// already sorted (the mapper forwards its merged stream verbatim), so the
/// reducer only needs to pick the lexicographically smallest head among
/// ranks that still have data or haven't signaled `End`.
struct ChannelMerge {
    inbound: Receiver<Msg>,
    buffers: Vec<VecDeque<(Vec<String>, u64)>>,
    finished: Vec<bool>,
}

impl ChannelMerge {
    fn new(inbound: Receiver<Msg>, mapper_count: usize) -> Self {
        Self {
            inbound,
            buffers: (0..mapper_count).map(|_| VecDeque::new()).collect(),
            finished: vec![false; mapper_count],
        }
    }

    fn drain_one_message(&mut self) -> Result<bool> {
        match self.inbound.recv() {
            Ok(Msg::Count { rank, payload }) => {
                let lines = unframe_count_lines(&payload)?;
                for line in lines {
                    if let Some((words, count)) = crate::indexer::google::parse_count_line(&line) {
                        self.buffers[rank].push_back((words, count));
                    }
                }
                Ok(true)
            }
            Ok(Msg::End { rank }) => {
                self.finished[rank] = true;
                Ok(true)
            }
            Err(_) => Ok(false), // every sender dropped: no more ranks to hear from.
        }
    }

    /// Returns the next record in global sorted order, blocking on the
    /// channel as needed to determine whether a currently-empty rank is
    /// truly exhausted or just hasn't spoken yet.
    fn next(&mut self) -> Result<Option<(Vec<String>, u64)>> {
        loop {
            let all_ready = (0..self.buffers.len()).all(|r| self.finished[r] || !self.buffers[r].is_empty());
            if !all_ready {
                if !self.drain_one_message()? {
                    // channel closed with some rank still "pending"; treat
                    // remaining pending ranks as finished; nothing more will
                    // ever arrive for them.
                    for f in self.finished.iter_mut() {
                        *f = true;
                    }
                }
                continue;
            }

            let mut best: Option<usize> = None;
            for (r, buf) in self.buffers.iter().enumerate() {
                if let Some((words, _)) = buf.front() {
                    let better = match best {
                        None => true,
                        Some(b) => words < &self.buffers[b].front().unwrap().0,
                    };
                    if better {
                        best = Some(r);
                    }
                }
            }
            return match best {
                Some(r) => Ok(self.buffers[r].pop_front()),
                None => Ok(None),
            };
        }
    }
}

/// Runs one reducer: merges `mapper_count` inbound streams for order `k`,
/// grouping by `(k-1)`-prefix, and returns every finished group in context
/// order.
pub fn run_reducer(mapper_count: usize, inbound: Receiver<Msg>, vocab: &Vocabulary, order: usize) -> Result<ReducerOutput> {
    let mut merge = ChannelMerge::new(inbound, mapper_count);
    let mut entries = Vec::new();

    let mut current_parent: Option<Vec<u32>> = None;
    let mut current_children: Vec<(WordId, u64)> = Vec::new();

    let flush = |parent: &mut Option<Vec<u32>>, children: &mut Vec<(WordId, u64)>, out: &mut Vec<GroupEntry>| {
        if let Some(p) = parent.take() {
            children.sort_by_key(|(id, _)| id.as_u32());
            out.push(GroupEntry {
                parent_context: p,
                children: std::mem::take(children),
            });
        }
    };

    while let Some((words, count)) = merge.next()? {
        if words.len() != order {
            continue; // malformed or misrouted line; skip rather than abort the world.
        }
        let ids: Vec<u32> = words.iter().map(|w| vocab.lookup_id(w.as_bytes()).as_u32()).collect();
        let parent_context = ids[..order - 1].to_vec();
        let child_id = WordId(ids[order - 1]);

        let same_parent = current_parent.as_deref() == Some(parent_context.as_slice());
        if !same_parent {
            flush(&mut current_parent, &mut current_children, &mut entries);
            current_parent = Some(parent_context);
            current_children.push((child_id, count));
        } else if let Some((last_id, last_count)) = current_children.last_mut() {
            if *last_id == child_id {
                *last_count += count; // duplicate context across input files.
            } else {
                current_children.push((child_id, count));
            }
        } else {
            current_children.push((child_id, count));
        }
    }
    flush(&mut current_parent, &mut current_children, &mut entries);

    Ok(ReducerOutput { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::channel::frame_count_lines;
    use crate::vocab::VocabBuilder;
    use crossbeam_channel::unbounded;

    fn build_vocab(words: &[&str]) -> Vocabulary {
        let mut vb = VocabBuilder::new();
        for w in words {
            vb.insert(w.as_bytes());
        }
        let dir = tempfile::tempdir().unwrap();
        let fst_path = dir.path().join("v.fst");
        let strings_path = dir.path().join("v.strings");
        vb.write(&fst_path, &strings_path).unwrap();
        // leak the tempdir so the mmap stays valid for the test's duration.
        std::mem::forget(dir);
        Vocabulary::open(&fst_path, &strings_path).unwrap()
    }

    #[test]
    fn groups_by_shared_prefix_and_sorts_children_by_id() {
        let vocab = build_vocab(&["a", "b", "c", "d"]);
        let (tx, rx) = unbounded();

        let lines = vec!["a b 5".to_string(), "a c 3".to_string(), "a d 1".to_string()];
        let payload = frame_count_lines(&lines).unwrap();
        tx.send(Msg::Count { rank: 0, payload }).unwrap();
        tx.send(Msg::End { rank: 0 }).unwrap();
        drop(tx);

        let output = run_reducer(1, rx, &vocab, 2).unwrap();
        assert_eq!(output.entries.len(), 1);
        let group = &output.entries[0];
        assert_eq!(group.children.len(), 3);
        for w in group.children.windows(2) {
            assert!(w[0].0.as_u32() < w[1].0.as_u32());
        }
    }

    #[test]
    fn merges_two_mapper_ranks_in_sorted_order() {
        let vocab = build_vocab(&["a", "b", "c"]);
        let (tx, rx) = unbounded();

        let rank0 = vec!["a b 1".to_string()];
        let rank1 = vec!["a c 2".to_string()];
        tx.send(Msg::Count {
            rank: 0,
            payload: frame_count_lines(&rank0).unwrap(),
        })
        .unwrap();
        tx.send(Msg::Count {
            rank: 1,
            payload: frame_count_lines(&rank1).unwrap(),
        })
        .unwrap();
        tx.send(Msg::End { rank: 0 }).unwrap();
        tx.send(Msg::End { rank: 1 }).unwrap();
        drop(tx);

        let output = run_reducer(2, rx, &vocab, 2).unwrap();
        assert_eq!(output.entries.len(), 1);
        assert_eq!(output.entries[0].children.len(), 2);
    }
}
