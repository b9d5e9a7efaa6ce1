//! Google Web-1T-like input framing: `1gms/vocab_cs.gz` (sorted unigram
//! counts) and `kgms/` directories of gzipped count files indexed by a
//! `kgm.idx` listing. Only the framing the indexer needs is implemented;
//! general ARPA/Google-format reading beyond that is out of scope (spec
//! §1).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

/// One line of `1gms/vocab_cs.gz`: a word and its corpus-wide count.
pub struct UnigramRecord {
    pub word: String,
    pub count: u64,
}

/// Maps the Google-format reserved tokens onto this crate's canonical
/// spellings; every other token passes through unchanged.
pub fn canonicalize_token(token: &str) -> &str {
    match token {
        "<S>" => crate::vocab::BOS,
        "</S>" => crate::vocab::EOS,
        "<UNK>" => crate::vocab::UNK,
        other => other,
    }
}

fn open_gz_lines(path: &Path) -> Result<BufReader<GzDecoder<File>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(BufReader::new(GzDecoder::new(file)))
}

/// Reads `1gms/vocab_cs.gz`, preserving file order (callers insert into the
/// vocabulary in this exact order, per spec §4.7 Phase 1).
pub fn read_unigram_counts(path: &Path) -> Result<Vec<UnigramRecord>> {
    let reader = open_gz_lines(path)?;
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| Error::io(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let word = parts.next().ok_or_else(|| Error::corrupted(path, "empty vocab line"))?;
        let count: u64 = parts
            .next()
            .ok_or_else(|| Error::corrupted(path, "vocab line missing count"))?
            .parse()
            .map_err(|_| Error::corrupted(path, "vocab count is not an integer"))?;
        out.push(UnigramRecord {
            word: canonicalize_token(word).to_string(),
            count,
        });
    }
    Ok(out)
}

/// One entry of `kgms/kgm.idx`: a data file's name plus summary stats.
#[derive(Debug, Clone)]
pub struct KgmIndexEntry {
    pub filename: String,
    pub total: u64,
    pub contexts: u64,
    pub types: u64,
}

fn kgms_dir(corpus_root: &Path, order: usize) -> PathBuf {
    corpus_root.join(format!("{order}gms"))
}

fn kgm_idx_path(corpus_root: &Path, order: usize) -> PathBuf {
    kgms_dir(corpus_root, order).join(format!("{order}gm.idx"))
}

/// Reads `kgms/kgm.idx`, returning the resolved paths of the data files it
/// lists (in listing order). Returns an empty vec if the order-`k`
/// directory doesn't exist at all; the indexer's Phase 2 termination
/// signal is exactly an empty file list for some order.
pub fn enumerate_order_files(corpus_root: &Path, order: usize) -> Result<Vec<PathBuf>> {
    let idx_path = kgm_idx_path(corpus_root, order);
    if !idx_path.is_file() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&idx_path).map_err(|e| Error::io(&idx_path, e))?;
    let dir = kgms_dir(corpus_root, order);
    let mut files = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let filename = parts
            .next()
            .ok_or_else(|| Error::corrupted(&idx_path, "empty kgm.idx line"))?;
        files.push(dir.join(filename));
    }
    Ok(files)
}

/// Parses `kgm.idx` into its structured entries (filename + summary
/// stats), for callers that want more than just the file list (e.g. a
/// `--debug` report of expected record counts).
pub fn read_kgm_index(corpus_root: &Path, order: usize) -> Result<Vec<KgmIndexEntry>> {
    let idx_path = kgm_idx_path(corpus_root, order);
    if !idx_path.is_file() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&idx_path).map_err(|e| Error::io(&idx_path, e))?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let filename = parts
            .next()
            .ok_or_else(|| Error::corrupted(&idx_path, "empty kgm.idx line"))?
            .to_string();
        let total = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let contexts = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let types = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        entries.push(KgmIndexEntry {
            filename,
            total,
            contexts,
            types,
        });
    }
    Ok(entries)
}

/// One parsed `w1 … wk count` line from a count file.
pub fn parse_count_line(line: &str) -> Option<(Vec<String>, u64)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut tokens: Vec<&str> = line.split_whitespace().collect();
    let count_tok = tokens.pop()?;
    let count: u64 = count_tok.parse().ok()?;
    if tokens.is_empty() {
        return None;
    }
    let words = tokens.into_iter().map(|t| canonicalize_token(t).to_string()).collect();
    Some((words, count))
}

/// A sorted count file's lines, decoded one record at a time. Each file is
/// assumed individually sorted lexicographically by context (spec §5
/// Ordering guarantees); the mapper's k-way merge relies on this.
pub struct CountFileReader {
    lines: std::io::Lines<BufReader<GzDecoder<File>>>,
    path: PathBuf,
}

impl CountFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = open_gz_lines(&path)?;
        Ok(Self {
            lines: reader.lines(),
            path,
        })
    }

    /// Returns the next well-formed `(words, count)` record, skipping blank
    /// or malformed lines.
    pub fn next_record(&mut self) -> Result<Option<(Vec<String>, u64)>> {
        loop {
            match self.lines.next() {
                None => return Ok(None),
                Some(line) => {
                    let line = line.map_err(|e| Error::io(&self.path, e))?;
                    if let Some(rec) = parse_count_line(&line) {
                        return Ok(Some(rec));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_reserved_tokens() {
        assert_eq!(canonicalize_token("<S>"), "<s>");
        assert_eq!(canonicalize_token("</S>"), "</s>");
        assert_eq!(canonicalize_token("<UNK>"), "<unk>");
        assert_eq!(canonicalize_token("dog"), "dog");
    }

    #[test]
    fn parses_count_lines() {
        let (words, count) = parse_count_line("the quick fox 42").unwrap();
        assert_eq!(words, vec!["the", "quick", "fox"]);
        assert_eq!(count, 42);

        assert!(parse_count_line("").is_none());
        assert!(parse_count_line("just-a-word").is_none());
    }

    #[test]
    fn enumerate_missing_order_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = enumerate_order_files(dir.path(), 7).unwrap();
        assert!(files.is_empty());
    }
}
