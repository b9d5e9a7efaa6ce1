//! Quantified trie invariants that must hold for any shard built by the
//! indexer: children of a node are strictly increasing in id, every
//! non-unigram node has a parent strictly below it and falls inside that
//! parent's child range, and a context routed to a shard can always be
//! re-traversed back to the node that represents it.

use expgram::index::{write_prepare, write_shards_parallel, Index};
use expgram::packed::{bits_for_max_value, PackedIntArraySink};
use expgram::repository::ModelKind;
use expgram::succinct::SuccinctBitVectorSink;
use expgram::vocab::VocabBuilder;
use expgram::word::WordId;
use std::fs::File;
use std::path::Path;

/// Three-order fixture: unigrams `{<unk>, a, b, c, d}`, bigrams
/// `a->{b,c}`, `b->{a}`, trigrams `a b -> {c, d}`.
fn build_three_order_fixture(dir: &Path) -> (WordId, WordId, WordId, WordId, WordId) {
    let mut vb = VocabBuilder::new();
    let a = vb.insert(b"a");
    let b = vb.insert(b"b");
    let c = vb.insert(b"c");
    let d = vb.insert(b"d");
    let unk = WordId(0);

    write_prepare(dir, &vb, 3, 1, ModelKind::Counts).unwrap();

    // unigram_count = 5 (<unk>,a,b,c,d) -> offsets[1] = 5
    // positions: one parent slot per node of the previous order, in order,
    // each a run of zero bits (one per child) followed by a terminating
    // one bit, even for parents with no children here.
    let bigram_ids = vec![b.as_u32() as u64, c.as_u32() as u64, a.as_u32() as u64];
    // parents <unk>,a,b,c,d: <unk>->{} a->{b,c} b->{a} c->{} d->{}
    let bigram_bits = [true, false, false, true, false, true, true, true];
    // bigram positions: 5 (a->b), 6 (a->c), 7 (b->a)
    let trigram_ids = vec![c.as_u32() as u64, d.as_u32() as u64];
    // parents "a b","a c","b a": "a b"->{c,d}, "a c"->{}, "b a"->{}
    let trigram_bits = [false, false, true, true, true];
    // trigram positions: 8 ("a b" -> c), 9 ("a b" -> d)

    let shard_dir = expgram::repository::shard_dir(dir, 0);
    let ids_bits = bits_for_max_value(trigram_ids.iter().chain(bigram_ids.iter()).copied().max().unwrap());
    {
        let f = File::create(shard_dir.join("ids.bin")).unwrap();
        let mut sink = PackedIntArraySink::create(f, ids_bits).unwrap();
        sink.extend(bigram_ids.iter().copied()).unwrap();
        sink.extend(trigram_ids.iter().copied()).unwrap();
        sink.finish().unwrap();
    }
    {
        let f = File::create(shard_dir.join("positions.bin")).unwrap();
        let mut sink = SuccinctBitVectorSink::create(f, 64).unwrap();
        sink.extend(bigram_bits.iter().copied()).unwrap();
        sink.extend(trigram_bits.iter().copied()).unwrap();
        sink.finish().unwrap();
    }
    expgram::shard::write_offsets(&shard_dir.join("offsets.bin"), &[0, 5, 8, 10]).unwrap();

    write_shards_parallel(dir, &[]).unwrap();

    (unk, a, b, c, d)
}

#[test]
fn children_are_strictly_increasing_and_parent_is_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let (_unk, a, b, c, d) = build_three_order_fixture(dir.path());

    let index = Index::open(dir.path()).unwrap();
    let shard = index.shard(0);

    for order in 1..shard.order() {
        let parent_start = shard.offsets()[order - 1];
        let parent_end = shard.offsets()[order];
        for parent_pos in parent_start..parent_end {
            let first = shard.children_first(Some(expgram::word::NodePos(parent_pos)));
            let last = shard.children_last(Some(expgram::word::NodePos(parent_pos)));
            let mut prev: Option<u32> = None;
            for pos in first..last {
                let id = shard.at(pos).as_u32();
                if let Some(p) = prev {
                    assert!(id > p, "children of node {parent_pos} are not strictly increasing");
                }
                prev = Some(id);

                let parent = shard.parent(pos).expect("non-unigram node must have a parent");
                assert_eq!(parent.as_usize(), parent_pos);
                assert!(parent.as_usize() < pos);
                assert!(pos >= first && pos < last, "child {pos} outside parent's own child range");
            }
        }
    }

    let (_, consumed, node) = index.traverse_ids(&[a, b, c]);
    assert_eq!(consumed, 3);
    assert_eq!(index.order_of(0, node.unwrap()), 3);

    let (_, consumed, node) = index.traverse_ids(&[a, b, d]);
    assert_eq!(consumed, 3);
    assert_eq!(index.order_of(0, node.unwrap()), 3);

    let (_, consumed, _) = index.traverse_ids(&[b, a]);
    assert_eq!(consumed, 2);
}

#[test]
fn context_routed_to_a_shard_reconstructs_its_own_path() {
    let dir = tempfile::tempdir().unwrap();
    let (_unk, a, b, c, _d) = build_three_order_fixture(dir.path());
    let index = Index::open(dir.path()).unwrap();

    for ctx in [vec![a, b], vec![a, c], vec![b, a]] {
        let shard_for_ctx = index.shard_of(&ctx);
        let (shard, consumed, node) = index.traverse_ids(&ctx);
        assert_eq!(shard, shard_for_ctx);
        assert_eq!(consumed, ctx.len());
        let node = node.expect("fixture context should resolve to a node");
        assert_eq!(index.shard(shard).at(node.as_usize()), *ctx.last().unwrap());
    }
}
