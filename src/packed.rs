//! C2: `PackedIntArray`, a read-only, memory-mapped array of `N` unsigned
//! integers each `b` bits wide. `get(i)` is O(1) and branch-predictable: a
//! value never straddles more than two adjacent 64-bit loads, so reading
//! is always "load low word, maybe load the next word, shift, mask."
//!
//! The write side is a streaming sink: push values one at a time, then
//! `finish()` seeks back and patches the header with the final count.
//! This lets the indexer build a shard's `ids` array without knowing its
//! final length up front.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, Result};

const MAGIC: u32 = 0x504B_4931; // "PKI1"
const HEADER_LEN: usize = 16; // magic(4) + len(8) + bits(4)

/// Streaming writer for a packed-int array. Accepts any `Write + Seek` so
/// tests can target an in-memory cursor, while production code targets a
/// plain `File`.
pub struct PackedIntArraySink<W: Write + Seek> {
    writer: W,
    bits: u32,
    count: u64,
    acc: u128,
    acc_bits: u32,
}

impl<W: Write + Seek> PackedIntArraySink<W> {
    pub fn create(mut writer: W, bits: u32) -> io::Result<Self> {
        assert!(bits > 0 && bits <= 64, "bits must be in 1..=64, got {bits}");
        writer.write_all(&[0u8; HEADER_LEN])?;
        Ok(Self {
            writer,
            bits,
            count: 0,
            acc: 0,
            acc_bits: 0,
        })
    }

    pub fn push(&mut self, value: u64) -> io::Result<()> {
        debug_assert!(
            self.bits == 64 || value < (1u64 << self.bits),
            "value {value} does not fit in {} bits",
            self.bits
        );
        self.acc |= (value as u128) << self.acc_bits;
        self.acc_bits += self.bits;
        self.count += 1;

        while self.acc_bits >= 64 {
            let word = (self.acc & 0xFFFF_FFFF_FFFF_FFFFu128) as u64;
            self.writer.write_all(&word.to_le_bytes())?;
            self.acc >>= 64;
            self.acc_bits -= 64;
        }
        Ok(())
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = u64>) -> io::Result<()> {
        for v in values {
            self.push(v)?;
        }
        Ok(())
    }

    /// Flushes the trailing partial word, then rewrites the header with
    /// the final element count.
    pub fn finish(mut self) -> io::Result<()> {
        if self.acc_bits > 0 {
            let nbytes = ((self.acc_bits + 7) / 8) as usize;
            let word = (self.acc & 0xFFFF_FFFF_FFFF_FFFFu128) as u64;
            let bytes = word.to_le_bytes();
            self.writer.write_all(&bytes[..nbytes])?;
        }
        self.writer.flush()?;
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&MAGIC.to_le_bytes())?;
        self.writer.write_all(&self.count.to_le_bytes())?;
        self.writer.write_all(&self.bits.to_le_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Smallest bit width that can hold `max_value`, rounded up to a
/// byte-friendly width. Widths aren't forced to powers of two; plain
/// `ceil(log2(max_value + 1))` already keeps `get` branch-free.
pub fn bits_for_max_value(max_value: u64) -> u32 {
    if max_value == 0 {
        1
    } else {
        64 - max_value.leading_zeros()
    }
}

#[inline]
fn read_u64_le_at(data: &[u8], byte_offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    let avail = data.len().saturating_sub(byte_offset);
    let n = avail.min(8);
    if n > 0 {
        buf[..n].copy_from_slice(&data[byte_offset..byte_offset + n]);
    }
    u64::from_le_bytes(buf)
}

/// Read-only, memory-mapped packed-int array.
pub struct PackedIntArray {
    mmap: Mmap,
    len: u64,
    bits: u32,
    path: PathBuf,
}

impl PackedIntArray {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;

        if mmap.len() < HEADER_LEN {
            return Err(Error::corrupted(path, "file too small for packed-int header"));
        }
        let magic = u32::from_le_bytes(mmap[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::corrupted(
                path,
                format!("bad packed-int magic {magic:#010x}"),
            ));
        }
        let len = u64::from_le_bytes(mmap[4..12].try_into().unwrap());
        let bits = u32::from_le_bytes(mmap[12..16].try_into().unwrap());

        let required_bits = (len as u128) * (bits as u128);
        let required_bytes = ((required_bits + 7) / 8) as u64;
        let payload_available = (mmap.len() - HEADER_LEN) as u64;
        if payload_available < required_bytes {
            return Err(Error::corrupted(
                path,
                format!(
                    "declared N*b = {required_bits} bits ({required_bytes} bytes) exceeds file payload of {payload_available} bytes"
                ),
            ));
        }

        Ok(Self {
            mmap,
            len,
            bits,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn get(&self, i: usize) -> u64 {
        assert!(i < self.len(), "index {i} out of bounds (len {})", self.len());

        let bit_offset = i as u128 * self.bits as u128;
        let byte_offset = (bit_offset / 8) as usize + HEADER_LEN;
        let bit_in_byte = (bit_offset % 8) as u32;

        let mask = if self.bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        };

        let low = read_u64_le_at(&self.mmap, byte_offset);
        if bit_in_byte + self.bits <= 64 {
            (low >> bit_in_byte) & mask
        } else {
            let high = read_u64_le_at(&self.mmap, byte_offset + 8);
            ((low >> bit_in_byte) | (high << (64 - bit_in_byte))) & mask
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn size_bytes(&self) -> u64 {
        let required_bits = (self.len as u128) * (self.bits as u128);
        HEADER_LEN as u64 + ((required_bits + 7) / 8) as u64
    }
}

/// Convenience: pack an in-memory slice of values into a new file, picking
/// `bits` as the minimal width unless the caller already knows it.
pub fn write_packed_int_file(
    path: impl AsRef<Path>,
    bits: u32,
    values: impl IntoIterator<Item = u64>,
) -> io::Result<()> {
    let file = File::create(path.as_ref())?;
    let mut sink = PackedIntArraySink::create(file, bits)?;
    sink.extend(values)?;
    sink.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::io::Cursor;

    #[test]
    fn sequential_roundtrip_in_memory() {
        let values: Vec<u64> = (0..1024u64).collect();
        let bits = bits_for_max_value(1023);
        assert_eq!(bits, 10);

        let mut buf = Cursor::new(Vec::new());
        {
            let mut sink = PackedIntArraySink::create(&mut buf, bits).unwrap();
            sink.extend(values.iter().copied()).unwrap();
            sink.finish().unwrap();
        }
        let bytes = buf.into_inner();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packed.bin");
        std::fs::write(&path, &bytes).unwrap();

        let arr = PackedIntArray::open(&path).unwrap();
        assert_eq!(arr.len(), 1024);
        for (i, &expected) in values.iter().enumerate() {
            assert_eq!(arr.get(i), expected);
        }
        assert_eq!(arr.size_bytes(), (HEADER_LEN as u64) + (1024 * 10 + 7) / 8);
    }

    #[test]
    fn random_roundtrip() {
        let mut rng = StdRng::seed_from_u64(42);
        let bits = 37u32;
        let max_value = (1u64 << bits) - 1;
        let values: Vec<u64> = (0..5000).map(|_| rng.gen_range(0..=max_value)).collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packed.bin");
        write_packed_int_file(&path, bits, values.iter().copied()).unwrap();

        let arr = PackedIntArray::open(&path).unwrap();
        assert_eq!(arr.len(), values.len());
        for (i, &expected) in values.iter().enumerate() {
            assert_eq!(arr.get(i), expected, "mismatch at index {i}");
        }
    }

    #[test]
    fn corrupted_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        // declare 1000 elements at 64 bits but only write the header.
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&1000u64.to_le_bytes());
        buf.extend_from_slice(&64u32.to_le_bytes());
        std::fs::write(&path, &buf).unwrap();

        let err = PackedIntArray::open(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptedIndex { .. }));
    }
}
