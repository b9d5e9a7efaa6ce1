//! C7: StateManager, the decoder's opaque backoff state, laid out over a
//! caller-owned `&mut [u8]` buffer so the query engine never allocates on
//! the hot path. Mirrors `NGramState.hpp`'s `buffer_size`/`context`/
//! `backoff`/`fill`/`copy` 1:1.
//!
//! Layout: `[length: u32][ids: u32 × (order-1)][backoffs: f32 × (order-1)]`

use crate::word::WordId;

const LENGTH_SIZE: usize = std::mem::size_of::<u32>();
const ID_SIZE: usize = std::mem::size_of::<u32>();
const BACKOFF_SIZE: usize = std::mem::size_of::<f32>();

/// Bytes required to hold a state for n-grams of the given `order`.
pub fn buffer_size(order: usize) -> usize {
    let capacity = order.saturating_sub(1);
    LENGTH_SIZE + capacity * (ID_SIZE + BACKOFF_SIZE)
}

fn ids_offset() -> usize {
    LENGTH_SIZE
}

fn backoffs_offset(order: usize) -> usize {
    LENGTH_SIZE + (order - 1) * ID_SIZE
}

/// Read/write view over a state buffer of a fixed `order`. The buffer must
/// be exactly `buffer_size(order)` bytes; a mismatch is a caller bug
/// (`InvalidArgument`, checked once at construction, not on every access).
pub struct StateView<'a> {
    buf: &'a [u8],
    order: usize,
}

impl<'a> StateView<'a> {
    pub fn new(buf: &'a [u8], order: usize) -> crate::error::Result<Self> {
        if buf.len() != buffer_size(order) {
            return Err(crate::error::Error::InvalidArgument(format!(
                "state buffer is {} bytes, expected {} for order {order}",
                buf.len(),
                buffer_size(order)
            )));
        }
        Ok(Self { buf, order })
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes(self.buf[0..4].try_into().unwrap()) as usize
    }

    /// Context word ids, oldest first, most recent last. Always has
    /// `length()` entries (the unused tail is zero-filled but not read).
    pub fn context(&self) -> Vec<WordId> {
        let len = self.length();
        let off = ids_offset();
        (0..len)
            .map(|i| {
                let start = off + i * ID_SIZE;
                WordId(u32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap()))
            })
            .collect()
    }

    /// Backoff weights accumulated for each context length, aligned with
    /// `context()` (index i = backoff applied when the context was
    /// shortened to length i).
    pub fn backoff(&self) -> Vec<f32> {
        let len = self.length();
        let off = backoffs_offset(self.order);
        (0..len)
            .map(|i| {
                let start = off + i * BACKOFF_SIZE;
                f32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap())
            })
            .collect()
    }
}

/// Mutable view used to build a new state after a query.
pub struct StateViewMut<'a> {
    buf: &'a mut [u8],
    order: usize,
}

impl<'a> StateViewMut<'a> {
    pub fn new(buf: &'a mut [u8], order: usize) -> crate::error::Result<Self> {
        if buf.len() != buffer_size(order) {
            return Err(crate::error::Error::InvalidArgument(format!(
                "state buffer is {} bytes, expected {} for order {order}",
                buf.len(),
                buffer_size(order)
            )));
        }
        Ok(Self { buf, order })
    }

    /// Zeroes the entire buffer, then writes `length = 0`. Used to build
    /// the initial (empty-context) state.
    pub fn fill_empty(&mut self) {
        self.buf.fill(0);
    }

    /// Writes `ids`/`backoffs` (both of length `len <= order - 1`) and
    /// zeroes the unused tail, matching `NGramState::fill`'s
    /// zero-the-remainder behavior.
    pub fn fill(&mut self, ids: &[WordId], backoffs: &[f32]) {
        let max_len = self.order.saturating_sub(1);
        let len = ids.len().min(max_len);
        assert_eq!(ids.len(), backoffs.len(), "ids and backoffs must be the same length");

        self.buf[0..4].copy_from_slice(&(len as u32).to_le_bytes());

        let ids_off = ids_offset();
        let backoffs_off = backoffs_offset(self.order);
        for i in 0..max_len {
            let id_start = ids_off + i * ID_SIZE;
            let bo_start = backoffs_off + i * BACKOFF_SIZE;
            if i < len {
                self.buf[id_start..id_start + 4].copy_from_slice(&ids[i].as_u32().to_le_bytes());
                self.buf[bo_start..bo_start + 4].copy_from_slice(&backoffs[i].to_le_bytes());
            } else {
                self.buf[id_start..id_start + 4].copy_from_slice(&0u32.to_le_bytes());
                self.buf[bo_start..bo_start + 4].copy_from_slice(&0f32.to_le_bytes());
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf
    }
}

/// Raw byte copy of the whole buffer, matching `NGramState::copy`'s
/// `memcpy` exactly (including whatever garbage sits past `length` in the
/// unused tail).
pub fn copy(src: &[u8], dst: &mut [u8]) {
    dst.copy_from_slice(src);
}

/// Logical equality: same `length`, same context ids, same backoffs.
/// Unlike `copy`, this ignores the unused tail, since two states can be
/// logically identical while carrying different leftover tail bytes.
pub fn states_equal(a: &[u8], b: &[u8], order: usize) -> bool {
    let va = StateView::new(a, order).expect("state buffer sized for order");
    let vb = StateView::new(b, order).expect("state buffer sized for order");
    va.length() == vb.length() && va.context() == vb.context() && va.backoff() == vb.backoff()
}
