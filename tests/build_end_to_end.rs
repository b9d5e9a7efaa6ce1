//! Drives `indexer::run` over a small synthetic Google Web-1T-layout
//! corpus end to end: unigram bootstrap, a two-mapper/two-reducer bigram
//! pass, and the resulting repository's shard routing and counts.

use expgram::indexer::{self, BuildConfig};
use expgram::Index;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn write_gz(path: &Path, lines: &[&str]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = File::create(path).unwrap();
    let mut enc = GzEncoder::new(file, Compression::default());
    for line in lines {
        writeln!(enc, "{line}").unwrap();
    }
    enc.finish().unwrap();
}

fn write_idx(path: &Path, entries: &[&str]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, entries.join("\n")).unwrap();
}

#[test]
fn synthetic_corpus_builds_a_counts_repository_with_the_right_totals() {
    let corpus = tempfile::tempdir().unwrap();
    let root = corpus.path();

    write_gz(
        &root.join("1gms").join("vocab_cs.gz"),
        &["<unk> 0", "the 40", "dog 20", "cat 15", "ran 10", "slept 5"],
    );
    write_idx(
        &root.join("2gms").join("2gm.idx"),
        &["2gm-0.gz 0 0 0", "2gm-1.gz 0 0 0"],
    );
    write_gz(&root.join("2gms").join("2gm-0.gz"), &["the dog 12", "the cat 8"]);
    write_gz(&root.join("2gms").join("2gm-1.gz"), &["dog ran 5", "cat slept 1"]);

    let out = tempfile::tempdir().unwrap();
    let config = BuildConfig {
        corpus_root: root.to_path_buf(),
        output_dir: out.path().to_path_buf(),
        order: 2,
        shard_count: 1,
        mapper_count: 2,
    };
    indexer::run(&config).unwrap();

    assert!(out.path().join("done").is_file());

    let index = Index::open(out.path()).unwrap();
    assert_eq!(index.order(), 2);
    assert_eq!(index.vocab().len(), 6); // <unk>, the, dog, cat, ran, slept

    let the = index.vocab().lookup_id(b"the");
    let dog = index.vocab().lookup_id(b"dog");
    let cat = index.vocab().lookup_id(b"cat");
    let ran = index.vocab().lookup_id(b"ran");
    let slept = index.vocab().lookup_id(b"slept");

    for bigram in [[the, dog], [the, cat], [dog, ran], [cat, slept]] {
        let (_, consumed, node) = index.traverse_ids(&bigram);
        assert_eq!(consumed, 2, "{bigram:?} should fully resolve");
        assert!(node.is_some());
    }
}

#[test]
fn every_bigram_routes_to_exactly_one_of_two_shards() {
    let corpus = tempfile::tempdir().unwrap();
    let root = corpus.path();

    write_gz(
        &root.join("1gms").join("vocab_cs.gz"),
        &["<unk> 0", "the 40", "dog 20", "cat 15", "a 9", "b 7"],
    );
    write_idx(&root.join("2gms").join("2gm.idx"), &["2gm-0.gz 0 0 0"]);
    write_gz(
        &root.join("2gms").join("2gm-0.gz"),
        &["the dog 12", "the cat 8", "a b 3", "cat the 2"],
    );

    let out = tempfile::tempdir().unwrap();
    let config = BuildConfig {
        corpus_root: root.to_path_buf(),
        output_dir: out.path().to_path_buf(),
        order: 2,
        shard_count: 2,
        mapper_count: 1,
    };
    indexer::run(&config).unwrap();

    let index = Index::open(out.path()).unwrap();
    assert_eq!(index.shard_count(), 2);

    let the = index.vocab().lookup_id(b"the");
    let dog = index.vocab().lookup_id(b"dog");
    let cat = index.vocab().lookup_id(b"cat");
    let a = index.vocab().lookup_id(b"a");
    let b = index.vocab().lookup_id(b"b");

    let bigrams = [[the, dog], [the, cat], [a, b], [cat, the]];
    for bigram in bigrams {
        let (shard, consumed, node) = index.traverse_ids(&bigram);
        assert_eq!(consumed, 2);
        assert!(node.is_some());
        // shard_of is a pure function of the first two words, independent
        // of which shard actually stores the node: traversal must agree.
        assert_eq!(shard, index.shard_of(&bigram));
    }

    // "the dog" and "the cat" share a first word but route by the pair
    // (the, dog) vs (the, cat), so they need not land in the same shard;
    // what must hold is that each one's shard matches for repeated lookups.
    let (shard_again, _, _) = index.traverse_ids(&[the, dog]);
    assert_eq!(shard_again, index.shard_of(&[the, dog]));
}
