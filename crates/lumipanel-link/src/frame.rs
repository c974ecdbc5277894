//! Frame reconstruction from raw serial deliveries.
//!
//! The display speaks two framings over the same wire. In normal
//! operation every message ends with `0xFF 0xFF 0xFF`. During a
//! firmware/GUI transfer the responses are raw unterminated chunks,
//! and the jump instruction arrives split in two: a lone `0x08`
//! marker chunk followed by a separate 4-byte offset chunk.

use tracing::{debug, warn};

use crate::event::JUMP_HEAD;
use crate::FRAME_TERMINATOR;

/// Bytes buffered without a terminator before the reader gives up
/// and drops them.
const READER_BUFFER_CAP: usize = 4096;

/// One reconstructed protocol message, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Raw deliveries from the serial byte pump.
#[derive(Debug)]
pub enum SerialEvent {
    /// A chunk of bytes read from the port, in arrival order.
    Data(Vec<u8>),
    /// The driver dropped buffered bytes; reader state must be reset.
    Overflow,
}

/// Reassembles discrete frames from chunked byte deliveries.
///
/// `push_terminated` is the normal-operation path, `push_raw` the
/// transfer-mode path. The caller decides which applies based on the
/// current link state.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    awaiting_jump_offset: bool,
    jump_staging: [u8; 5],
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates a chunk and emits one frame per terminator found.
    ///
    /// Partial frames stay buffered until the terminator arrives. A
    /// buffer that grows past the cap without a terminator is dropped
    /// wholesale; that is data loss, not a fatal condition.
    pub fn push_terminated(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = find_terminator(&self.buffer) {
            let body: Vec<u8> = self.buffer.drain(..pos + FRAME_TERMINATOR.len()).collect();
            if pos == 0 {
                debug!("empty frame before terminator, skipping");
                continue;
            }
            frames.push(Frame::from(body[..pos].to_vec()));
        }

        if self.buffer.len() > READER_BUFFER_CAP {
            warn!(
                "dropping {} unterminated buffered bytes",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        frames
    }

    /// Handles a raw transfer-mode chunk.
    ///
    /// A lone jump marker arms the two-phase reconstruction; the next
    /// chunk supplies the 4 offset bytes and the two are reassembled
    /// into a single 5-byte frame. Any other chunk passes through as
    /// one frame.
    pub fn push_raw(&mut self, chunk: &[u8]) -> Option<Frame> {
        if chunk.is_empty() {
            return None;
        }

        if self.awaiting_jump_offset {
            self.awaiting_jump_offset = false;
            if chunk.len() < 4 {
                warn!(
                    "expected 4 jump offset bytes, got {}; dropping",
                    chunk.len()
                );
                return None;
            }
            self.jump_staging[0] = JUMP_HEAD;
            self.jump_staging[1..5].copy_from_slice(&chunk[..4]);
            return Some(Frame::from(self.jump_staging.to_vec()));
        }

        if chunk[0] == JUMP_HEAD {
            // The offset arrives as a separate chunk; nothing to emit yet.
            self.awaiting_jump_offset = true;
            return None;
        }

        Some(Frame::from(chunk.to_vec()))
    }

    /// Discards all buffered bytes and pending reconstruction state.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            warn!("resetting reader, {} buffered bytes lost", self.buffer.len());
        }
        self.buffer.clear();
        self.awaiting_jump_offset = false;
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(FRAME_TERMINATOR.len())
        .position(|window| window == FRAME_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_frame_matches_preceding_bytes() {
        let mut reader = FrameReader::new();
        let frames = reader.push_terminated(b"comok 1,2\xFF\xFF\xFF");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), b"comok 1,2");
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut reader = FrameReader::new();
        assert!(reader.push_terminated(&[0x65, 2, 22]).is_empty());
        assert!(reader.push_terminated(&[1, 0xFF]).is_empty());
        let frames = reader.push_terminated(&[0xFF, 0xFF]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), &[0x65, 2, 22, 1]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut reader = FrameReader::new();
        let frames = reader.push_terminated(b"\x86\xFF\xFF\xFF\x87\xFF\xFF\xFF");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].bytes(), &[0x86]);
        assert_eq!(frames[1].bytes(), &[0x87]);
    }

    #[test]
    fn empty_frames_are_skipped() {
        let mut reader = FrameReader::new();
        let frames = reader.push_terminated(b"\xFF\xFF\xFF\x86\xFF\xFF\xFF");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), &[0x86]);
    }

    #[test]
    fn split_jump_instruction_reassembled() {
        let mut reader = FrameReader::new();
        assert!(reader.push_raw(&[0x08]).is_none());
        let frame = reader.push_raw(&[0x88, 0x13, 0x00, 0x00]).unwrap();
        assert_eq!(frame.bytes(), &[0x08, 0x88, 0x13, 0x00, 0x00]);
    }

    #[test]
    fn jump_offset_starting_with_marker_byte_still_reassembles() {
        // The offset bytes themselves may contain 0x08; while the
        // reconstruction is armed they must not re-arm it.
        let mut reader = FrameReader::new();
        assert!(reader.push_raw(&[0x08]).is_none());
        let frame = reader.push_raw(&[0x08, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(frame.bytes(), &[0x08, 0x08, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn short_jump_offset_chunk_is_dropped() {
        let mut reader = FrameReader::new();
        assert!(reader.push_raw(&[0x08]).is_none());
        assert!(reader.push_raw(&[0x01, 0x02]).is_none());
        // Reconstruction disarmed; the next raw chunk passes through.
        let frame = reader.push_raw(&[0x05]).unwrap();
        assert_eq!(frame.bytes(), &[0x05]);
    }

    #[test]
    fn raw_chunk_passes_through() {
        let mut reader = FrameReader::new();
        let frame = reader.push_raw(&[0x05]).unwrap();
        assert_eq!(frame.bytes(), &[0x05]);
    }

    #[test]
    fn oversized_unterminated_buffer_is_dropped() {
        let mut reader = FrameReader::new();
        let garbage = vec![0x42u8; READER_BUFFER_CAP + 1];
        assert!(reader.push_terminated(&garbage).is_empty());
        // Buffer was cleared; a fresh terminated frame still works.
        let frames = reader.push_terminated(b"\x86\xFF\xFF\xFF");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), &[0x86]);
    }

    #[test]
    fn reset_disarms_jump_reconstruction() {
        let mut reader = FrameReader::new();
        assert!(reader.push_raw(&[0x08]).is_none());
        reader.reset();
        let frame = reader.push_raw(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(frame.bytes(), &[0x01, 0x02, 0x03, 0x04]);
    }
}
