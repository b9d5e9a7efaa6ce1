//! Word ids: a dense `u32` handle into the vocabulary.
//!
//! Id 0 is reserved for `<unk>`; `<s>`/`</s>` are ordinary inserted words
//! whose ids the vocabulary exposes once known. `WordId::NONE` is the
//! all-ones sentinel used at API boundaries (serialized layouts, the
//! shard's `find`/`parent` results) to mean "not present"; in-memory Rust
//! code should prefer `Option<WordId>` and only touch `NONE` right at a
//! serialization or FFI-shaped boundary.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WordId(pub u32);

impl WordId {
    /// All-ones sentinel meaning "not present" at API boundaries.
    pub const NONE: WordId = WordId(u32::MAX);

    /// The reserved id for `<unk>`.
    pub const UNK: WordId = WordId(0);

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "WordId(NONE)")
        } else {
            write!(f, "WordId({})", self.0)
        }
    }
}

impl From<u32> for WordId {
    fn from(v: u32) -> Self {
        WordId(v)
    }
}

impl From<WordId> for u32 {
    fn from(v: WordId) -> Self {
        v.0
    }
}

/// A node position in the global trie numbering for a single shard. Unlike
/// `WordId`, this is shard-local: `NodePos(p)` for `p < shard.offsets[1]`
/// denotes the unigram node whose word id is `p`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePos(pub usize);

impl NodePos {
    pub const ROOT: Option<NodePos> = None;

    #[inline]
    pub const fn new(p: usize) -> Self {
        NodePos(p)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for NodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePos({})", self.0)
    }
}
