//! The "rank-addressed bidirectional byte channel" spec §6 treats as an
//! external collaborator. Rather than a real process-launching/MPI layer
//! (explicitly out of scope, spec §1), each simulated rank is an OS thread
//! and each edge between ranks is a bounded `crossbeam-channel`, matching
//! spec §5's "bounded queue between a reducer's network thread and its
//! indexer thread" and §9's "no hidden coroutine state."
//!
//! Wire framing matches spec §6: `COUNT` frames carry zlib-compressed text
//! lines (`w₁ … wₖ c\n`), tagged with the sending mapper's rank so a
//! reducer can demultiplex several mapper streams sharing one channel.
//! `FILES`/`SIZE` are available for symmetry with spec §6 but the in-process
//! orchestrator in `indexer::mod` passes file lists and shard counts as
//! ordinary function arguments instead of wire frames, since there is no
//! separate process to address them to.

use std::io::{Read, Write};

use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Default bound on a mapper->reducer edge. Small on purpose: backpressure
/// should bite before a fast mapper can buffer an entire shard's output in
/// memory (spec §5, "bounded channels").
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One message on a mapper->reducer edge.
pub enum Msg {
    /// A batch of `w₁ … wₖ c\n` lines, zlib-compressed, from mapper rank
    /// `rank`.
    Count { rank: usize, payload: Vec<u8> },
    /// `rank` has sent its last `Count` frame for this order; after the
    /// final empty line and channel close, the reducer considers `rank`
    /// drained.
    End { rank: usize },
}

/// Zlib-compresses a batch of text lines, terminated by the spec's "lone
/// empty line" end-of-batch marker.
pub fn frame_count_lines(lines: &[String]) -> Result<Vec<u8>> {
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text.push('\n'); // spec §6: a lone empty line marks frame end.
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| Error::io("<count frame>", e))?;
    encoder.finish().map_err(|e| Error::io("<count frame>", e))
}

/// Inverse of `frame_count_lines`: decompresses and splits into lines,
/// dropping the trailing empty-line marker.
pub fn unframe_count_lines(payload: &[u8]) -> Result<Vec<String>> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut text = String::new();
    decoder.read_to_string(&mut text).map_err(|e| Error::io("<count frame>", e))?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
}

/// One shard's inbound edge: every mapper rank holds a clone of the
/// sender; the owning reducer holds the sole receiver.
pub fn reducer_edge() -> (Sender<Msg>, Receiver<Msg>) {
    bounded(DEFAULT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let lines = vec!["the dog ran 12".to_string(), "the dog sat 4".to_string()];
        let framed = frame_count_lines(&lines).unwrap();
        let back = unframe_count_lines(&framed).unwrap();
        assert_eq!(back, lines);
    }

    #[test]
    fn empty_batch_roundtrips_to_nothing() {
        let framed = frame_count_lines(&[]).unwrap();
        let back = unframe_count_lines(&framed).unwrap();
        assert!(back.is_empty());
    }
}
