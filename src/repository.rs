//! On-disk repository layout: a directory holding `prop.list` (a small
//! key/value text manifest), `index/<shard>/{ids,positions,offsets}.bin`,
//! `index/vocab/{vocab.fst,vocab.strings}`, one data directory among
//! `count/`, or `logprob/`+`backoff/`+`logbound/`, and a zero-length `done`
//! sentinel written last. The sentinel's absence is exactly what turns an
//! interrupted build into `IncompleteIndex` on open rather than a silent
//! read of partial data.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Counts,
    Probabilities,
    ProbabilitiesQuantized,
}

impl ModelKind {
    fn as_str(self) -> &'static str {
        match self {
            ModelKind::Counts => "counts",
            ModelKind::Probabilities => "probabilities",
            ModelKind::ProbabilitiesQuantized => "probabilities-quantized",
        }
    }

    fn parse(s: &str, prop_path: &Path) -> Result<Self> {
        match s {
            "counts" => Ok(ModelKind::Counts),
            "probabilities" => Ok(ModelKind::Probabilities),
            "probabilities-quantized" => Ok(ModelKind::ProbabilitiesQuantized),
            other => Err(Error::VersionMismatch {
                path: prop_path.to_path_buf(),
                found: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub order: usize,
    pub shard_size: usize,
    pub model_kind: ModelKind,
}

impl Manifest {
    fn prop_list_path(dir: &Path) -> PathBuf {
        dir.join("prop.list")
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = Self::prop_list_path(dir);
        let text = format!(
            "order\t{}\nshard-size\t{}\nmodel-kind\t{}\n",
            self.order, self.shard_size, self.model_kind
        );
        fs::write(&path, text).map_err(|e| Error::io(&path, e))
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::prop_list_path(dir);
        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let mut kv = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, '\t');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            kv.insert(key.to_string(), value.to_string());
        }

        let order = kv
            .get("order")
            .ok_or_else(|| Error::corrupted(&path, "missing `order` key"))?
            .parse::<usize>()
            .map_err(|_| Error::corrupted(&path, "`order` is not an integer"))?;
        let shard_size = kv
            .get("shard-size")
            .ok_or_else(|| Error::corrupted(&path, "missing `shard-size` key"))?
            .parse::<usize>()
            .map_err(|_| Error::corrupted(&path, "`shard-size` is not an integer"))?;
        let model_kind = ModelKind::parse(
            kv.get("model-kind")
                .ok_or_else(|| Error::corrupted(&path, "missing `model-kind` key"))?,
            &path,
        )?;

        Ok(Manifest {
            order,
            shard_size,
            model_kind,
        })
    }
}

pub fn index_dir(repo_root: &Path) -> PathBuf {
    repo_root.join("index")
}

pub fn shard_dir(repo_root: &Path, shard: usize) -> PathBuf {
    index_dir(repo_root).join(shard.to_string())
}

pub fn vocab_dir(repo_root: &Path) -> PathBuf {
    index_dir(repo_root).join("vocab")
}

pub fn vocab_fst_path(repo_root: &Path) -> PathBuf {
    vocab_dir(repo_root).join("vocab.fst")
}

pub fn vocab_strings_path(repo_root: &Path) -> PathBuf {
    vocab_dir(repo_root).join("vocab.strings")
}

pub fn data_dir(repo_root: &Path, model_kind: ModelKind) -> PathBuf {
    match model_kind {
        ModelKind::Counts => repo_root.join("count"),
        ModelKind::Probabilities | ModelKind::ProbabilitiesQuantized => repo_root.to_path_buf(),
    }
}

fn done_path(repo_root: &Path) -> PathBuf {
    repo_root.join("done")
}

pub fn is_done(repo_root: &Path) -> bool {
    done_path(repo_root).is_file()
}

/// Writes the zero-length completion sentinel. Must be the very last
/// write of a build: its presence is the only thing that distinguishes a
/// finished repository from a partially written one.
pub fn write_done(repo_root: &Path) -> Result<()> {
    let path = done_path(repo_root);
    fs::write(&path, []).map_err(|e| Error::io(&path, e))
}

/// Ensures every directory a build will write into exists.
pub fn prepare_layout(repo_root: &Path, shard_count: usize, model_kind: ModelKind) -> Result<()> {
    fs::create_dir_all(repo_root).map_err(|e| Error::io(repo_root, e))?;
    fs::create_dir_all(vocab_dir(repo_root)).map_err(|e| Error::io(repo_root, e))?;
    for s in 0..shard_count {
        let dir = shard_dir(repo_root, s);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    }
    match model_kind {
        ModelKind::Counts => {
            let dir = repo_root.join("count");
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        ModelKind::Probabilities | ModelKind::ProbabilitiesQuantized => {
            for sub in ["logprob", "backoff", "logbound"] {
                let dir = repo_root.join(sub);
                fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            }
        }
    }
    Ok(())
}

/// Opens `repo_root` for reading, verifying the completion sentinel and
/// manifest exist and are well-formed. Does not yet map any shard data.
pub fn open_repository(repo_root: &Path) -> Result<Manifest> {
    if !is_done(repo_root) {
        return Err(Error::IncompleteIndex {
            path: repo_root.to_path_buf(),
        });
    }
    Manifest::read(repo_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            order: 3,
            shard_size: 4,
            model_kind: ModelKind::Probabilities,
        };
        manifest.write(dir.path()).unwrap();
        let read_back = Manifest::read(dir.path()).unwrap();
        assert_eq!(read_back.order, 3);
        assert_eq!(read_back.shard_size, 4);
        assert_eq!(read_back.model_kind, ModelKind::Probabilities);
    }

    #[test]
    fn missing_sentinel_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            order: 2,
            shard_size: 1,
            model_kind: ModelKind::Counts,
        };
        manifest.write(dir.path()).unwrap();
        let err = open_repository(dir.path()).unwrap_err();
        assert!(matches!(err, Error::IncompleteIndex { .. }));

        write_done(dir.path()).unwrap();
        assert!(open_repository(dir.path()).is_ok());
    }

    #[test]
    fn bad_model_kind_is_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prop.list"), "order\t2\nshard-size\t1\nmodel-kind\tbogus\n").unwrap();
        write_done(dir.path()).unwrap();
        let err = open_repository(dir.path()).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }
}
