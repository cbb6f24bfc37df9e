//! Topic frame layer: length-delimited frames multiplexed over the bulk
//! stream, with 4-byte alignment padding and 1024-byte filler frames.
//!
//! Frame header layout (8 bytes, little-endian):
//! - `[0]`: flag bits — bit0 `has_alignment_padding`, bit1
//!   `packet_version_is_internal`, bit2 version, bits 3..7 reserved
//! - `[1]`: topic
//! - `[2..3]`: reserved
//! - `[4..5]`: `num_words` — payload length in 4-byte words, plus one.
//!   The frame occupies `(num_words + 1) * 4` bytes on the wire.
//! - `[6..7]`: `sequence_num`
//!
//! When `has_alignment_padding` is set the final payload byte holds the pad
//! length (1..=3); the pad bytes before it are `0xDE`. After each data frame
//! the emitter appends one filler frame (topic 0) consuming the gap to the
//! next 1024-byte boundary whenever that gap is at least one header wide.

use crate::protocol::{topic_str, TOPIC_FILLER, TOPIC_MAX};
use crate::usb::Transport;
use crate::Result;

pub const HEADER_SIZE: usize = 8;

/// Outbound messages are padded to this boundary with filler frames.
pub const OUTPUT_BOUNDARY: usize = 0x400;

/// Largest payload a single topic frame can carry; bounded by the u16
/// `num_words` field. Larger submissions are chunked.
pub const MAX_FRAME_PAYLOAD: usize = 0x3FFF8;

const PAD_BYTE: u8 = 0xDE;

const FLAG_HAS_ALIGNMENT_PADDING: u8 = 1 << 0;
const FLAG_VERSION_IS_INTERNAL: u8 = 1 << 1;

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub has_alignment_padding: bool,
    pub packet_version_is_internal: bool,
    pub topic: u8,
    pub num_words: u16,
    pub sequence_num: u16,
}

impl FrameHeader {
    pub fn parse(b: &[u8]) -> FrameHeader {
        FrameHeader {
            has_alignment_padding: b[0] & FLAG_HAS_ALIGNMENT_PADDING != 0,
            packet_version_is_internal: b[0] & FLAG_VERSION_IS_INTERNAL != 0,
            topic: b[1],
            num_words: u16::from_le_bytes([b[4], b[5]]),
            sequence_num: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let mut flags = FLAG_VERSION_IS_INTERNAL;
        if self.has_alignment_padding {
            flags |= FLAG_HAS_ALIGNMENT_PADDING;
        }
        out.push(flags);
        out.push(self.topic);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.num_words.to_le_bytes());
        out.extend_from_slice(&self.sequence_num.to_le_bytes());
    }
}

/// Encode one data frame plus its trailing filler frame (if one fits) into
/// a single transfer buffer. Both frames carry the same sequence number.
pub fn encode_frame(topic: u8, data: &[u8], sequence_num: u16) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_FRAME_PAYLOAD);

    let align_up = (4 - data.len() % 4) % 4;
    let payload_len = data.len() + align_up;
    let msg_size = HEADER_SIZE + payload_len;

    let mut out = Vec::with_capacity((msg_size + OUTPUT_BOUNDARY - 1) & !(OUTPUT_BOUNDARY - 1));

    FrameHeader {
        has_alignment_padding: align_up != 0,
        packet_version_is_internal: true,
        topic,
        num_words: (payload_len / 4 + 1) as u16,
        sequence_num,
    }
    .write(&mut out);
    out.extend_from_slice(data);

    if align_up != 0 {
        for _ in 0..align_up - 1 {
            out.push(PAD_BYTE);
        }
        out.push(align_up as u8);
    }

    // Pad to the next 1024-byte boundary with one filler frame. A residual
    // gap of exactly 4 bytes cannot hold a header and is left unfilled.
    let gap = (OUTPUT_BOUNDARY - msg_size % OUTPUT_BOUNDARY) % OUTPUT_BOUNDARY;
    if gap >= HEADER_SIZE {
        let fill_payload = gap - HEADER_SIZE;
        FrameHeader {
            has_alignment_padding: false,
            packet_version_is_internal: true,
            topic: TOPIC_FILLER,
            num_words: (fill_payload / 4 + 1) as u16,
            sequence_num,
        }
        .write(&mut out);
        out.resize(out.len() + fill_payload, 0);
    }

    out
}

/// Outbound half of the framer: owns the monotonic sequence counter.
///
/// Callers hold the lock around this struct for the duration of one logical
/// message so that chunks of different messages on the same topic never
/// interleave.
pub struct TopicSender {
    sequence_num: u16,
}

impl TopicSender {
    pub fn new() -> TopicSender {
        TopicSender { sequence_num: 0 }
    }

    /// Submit a payload of arbitrary size to a topic, slicing it into
    /// frame-sized chunks.
    pub fn send_to_topic(&mut self, transport: &dyn Transport, topic: u8, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let frame = encode_frame(topic, chunk, self.sequence_num);
            self.sequence_num = self.sequence_num.wrapping_add(1);
            transport.send(&frame)?;
        }
        Ok(())
    }

    /// Send a schema message as a preamble frame (`{idx, len...}` in 8-byte
    /// words) followed by one frame run per segment.
    pub fn send_segmented(
        &mut self,
        transport: &dyn Transport,
        topic: u8,
        idx: u32,
        segments: &[&[u8]],
    ) -> Result<()> {
        let mut preamble = Vec::with_capacity(4 * (segments.len() + 1));
        preamble.extend_from_slice(&idx.to_le_bytes());
        for seg in segments {
            debug_assert!(seg.len() % 8 == 0);
            preamble.extend_from_slice(&((seg.len() / 8) as u32).to_le_bytes());
        }
        self.send_to_topic(transport, topic, &preamble)?;
        for seg in segments {
            self.send_to_topic(transport, topic, seg)?;
        }
        Ok(())
    }
}

/// A fully or partially received topic frame.
#[derive(Debug)]
pub struct TopicPacket {
    pub topic: u8,
    pub sequence_num: u16,
    pub recv_ns: i64,
    has_alignment_padding: bool,
    payload: Vec<u8>,
    missing: usize,
}

impl TopicPacket {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Inbound half of the framer: reassembles frames from raw bulk reads.
///
/// At most one frame is in flight; completed frames are handed to the sink
/// and any leftover bytes in the read become the head of the next frame.
pub struct FrameReader {
    working: Option<TopicPacket>,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader { working: None }
    }

    /// Drop any partially assembled frame (USB reconnect path).
    pub fn reset(&mut self) {
        self.working = None;
    }

    /// Feed one bulk read's worth of bytes, invoking `sink` for each
    /// completed non-filler frame.
    pub fn feed(&mut self, chunk: &[u8], recv_ns: i64, sink: &mut dyn FnMut(TopicPacket)) {
        let mut rest = chunk;

        loop {
            if let Some(mut pkt) = self.working.take() {
                let take = pkt.missing.min(rest.len());
                pkt.payload.extend_from_slice(&rest[..take]);
                pkt.missing -= take;
                rest = &rest[take..];
                if pkt.missing > 0 {
                    self.working = Some(pkt);
                    return;
                }
                Self::finish(pkt, sink);
            }

            if rest.is_empty() {
                return;
            }
            if rest.len() < HEADER_SIZE {
                log::warn!("discarding {}-byte frame remainder (stream desync)", rest.len());
                return;
            }

            let header = FrameHeader::parse(rest);
            if header.num_words == 0 || header.topic > TOPIC_MAX {
                log::warn!(
                    "bad topic frame header (topic {:#x}, num_words {:#x}), skipping",
                    header.topic,
                    header.num_words
                );
                rest = &rest[HEADER_SIZE..];
                continue;
            }

            let payload_len = (header.num_words as usize - 1) * 4;
            let take = payload_len.min(rest.len() - HEADER_SIZE);
            let mut payload = Vec::with_capacity(payload_len);
            payload.extend_from_slice(&rest[HEADER_SIZE..HEADER_SIZE + take]);
            rest = &rest[HEADER_SIZE + take..];

            self.working = Some(TopicPacket {
                topic: header.topic,
                sequence_num: header.sequence_num,
                recv_ns,
                has_alignment_padding: header.has_alignment_padding,
                payload,
                missing: payload_len - take,
            });
        }
    }

    fn finish(mut pkt: TopicPacket, sink: &mut dyn FnMut(TopicPacket)) {
        if pkt.has_alignment_padding {
            let pad = pkt.payload.last().copied().unwrap_or(0) as usize;
            if !(1..=3).contains(&pad) || pad > pkt.payload.len() {
                log::warn!(
                    "frame on topic {} with bad alignment byte {}, dropping",
                    topic_str(pkt.topic),
                    pad
                );
                return;
            }
            pkt.payload.truncate(pkt.payload.len() - pad);
        }
        if pkt.topic == TOPIC_FILLER {
            return;
        }
        sink(pkt);
    }
}
