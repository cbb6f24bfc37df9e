//! Reassembly of schema messages split across multiple topic frames.
//!
//! A segmented message is a preamble frame `{idx: u32, len[0]: u32, ...}`
//! (lengths in 8-byte words) followed by one frame run per segment. Each
//! topic that carries segmented messages keeps its own context.

use crate::framer::TopicPacket;

/// Per-segment cap. Anything larger is a protocol violation.
pub const SEGMENT_MAX: usize = 0x100_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the preamble frame.
    Meta,
    /// Copying payload bytes into the current segment.
    Read,
}

/// Accumulator for one topic's segmented messages.
pub struct SegmentReader {
    num_segs: usize,
    segs: Vec<Vec<u8>>,
    expected: Vec<usize>,
    reading_idx: usize,
    /// Message index from the preamble.
    pub type_idx: u32,
    state: State,
}

impl SegmentReader {
    pub fn new(num_segs: usize) -> SegmentReader {
        SegmentReader {
            num_segs,
            segs: (0..num_segs).map(|_| Vec::new()).collect(),
            expected: vec![0; num_segs],
            reading_idx: 0,
            type_idx: 0,
            state: State::Meta,
        }
    }

    pub fn reset(&mut self) {
        for seg in &mut self.segs {
            seg.clear();
        }
        self.expected.iter_mut().for_each(|e| *e = 0);
        self.reading_idx = 0;
        self.state = State::Meta;
    }

    /// Consume one topic frame. Invokes `handler` with the completed segment
    /// array once all segments have been filled, then resets.
    pub fn consume(&mut self, pkt: &TopicPacket, handler: &mut dyn FnMut(u32, &[Vec<u8>])) {
        let payload = pkt.payload();
        if payload.len() < 8 {
            return;
        }

        // A frame the exact size of a preamble re-synchronizes the context;
        // a lost frame would otherwise wedge it mid-segment forever.
        if payload.len() == 4 * (self.num_segs + 1) && self.state == State::Read {
            log::debug!("segment context resync on {}-byte preamble", payload.len());
            self.reset();
        }

        match self.state {
            State::Meta => {
                if payload.len() < 4 * (self.num_segs + 1) {
                    log::warn!(
                        "segment preamble too short: {} bytes for {} segments",
                        payload.len(),
                        self.num_segs
                    );
                    return;
                }
                self.type_idx = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                for i in 0..self.num_segs {
                    let off = 4 + 4 * i;
                    let words =
                        u32::from_le_bytes([payload[off], payload[off + 1], payload[off + 2], payload[off + 3]]);
                    let len = words as usize * 8;
                    if len > SEGMENT_MAX {
                        log::warn!("segment {} length {:#x} exceeds cap, resetting", i, len);
                        self.reset();
                        return;
                    }
                    self.expected[i] = len;
                    self.segs[i].clear();
                }
                self.reading_idx = 0;
                self.state = State::Read;
                self.skip_complete_segments(handler);
            }
            State::Read => {
                let idx = self.reading_idx;
                let want = self.expected[idx] - self.segs[idx].len();
                if payload.len() > want {
                    log::warn!(
                        "segment overrun: got {} bytes, wanted {} for segment {}",
                        payload.len(),
                        want,
                        idx
                    );
                    self.reset();
                    return;
                }
                self.segs[idx].extend_from_slice(payload);
                if self.segs[idx].len() >= self.expected[idx] {
                    self.reading_idx += 1;
                    self.skip_complete_segments(handler);
                }
            }
        }
    }

    /// Advance past zero-length segments and fire the handler when the last
    /// segment completes.
    fn skip_complete_segments(&mut self, handler: &mut dyn FnMut(u32, &[Vec<u8>])) {
        while self.reading_idx < self.num_segs && self.expected[self.reading_idx] == 0 {
            self.reading_idx += 1;
        }
        if self.reading_idx >= self.num_segs {
            handler(self.type_idx, &self.segs);
            self.reset();
        }
    }
}
