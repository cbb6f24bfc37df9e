//! Peer clock synchronization over the hostinfo ECHO exchange.
//!
//! The host pings at least every 16 ms once the first exchange has
//! happened. A PONG carrying our own transmit time back lets us estimate
//! the peer-to-local clock offset as the symmetric NTP-style mean
//! `((recv - org) + (xmt - t_recv)) / 2`, folded into a running two-sample
//! average. The offset must be established before the first video frame
//! goes out; the handshake forces an exchange during both pairing rounds.

use crate::hostinfo::EchoPayload;

/// Minimum spacing between outbound pings.
pub const PING_INTERVAL_NS: i64 = 16_000_000;

#[derive(Debug, Default)]
pub struct EchoState {
    /// Monotonic index stamped into outbound pings.
    echo_idx: u32,
    /// Estimated peer-clock minus local-clock offset, nanoseconds.
    ns_offset: i64,
    /// Offset advertised by the peer in its pings. Advisory only; never
    /// folded into `ns_offset`.
    ns_offset_from_target: i64,
    /// Transmit time of the most recent inbound ping (echoed back in pongs).
    last_peer_xmt: i64,
    /// When we last sent a ping, local clock.
    req_sent_ns: i64,
    /// Whether at least one pong has been consumed.
    synced: bool,
}

impl EchoState {
    pub fn new() -> EchoState {
        EchoState {
            echo_idx: 1,
            ..EchoState::default()
        }
    }

    pub fn reset(&mut self) {
        *self = EchoState::new();
    }

    pub fn ns_offset(&self) -> i64 {
        self.ns_offset
    }

    pub fn ns_offset_from_target(&self) -> i64 {
        self.ns_offset_from_target
    }

    /// True once a pong has been folded into the estimate.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Local monotonic time to headset clock.
    pub fn to_target(&self, ts_ns: i64) -> i64 {
        ts_ns + self.ns_offset
    }

    /// Headset clock to local monotonic time.
    pub fn from_target(&self, ts_ns: i64) -> i64 {
        ts_ns - self.ns_offset
    }

    /// Whether the periodic ping is due. The first ping of a session is
    /// always due.
    pub fn ping_due(&self, now_ns: i64) -> bool {
        self.req_sent_ns == 0 || now_ns - self.req_sent_ns >= PING_INTERVAL_NS
    }

    /// Record a ping transmission and return `(echo_idx, payload)` for it.
    pub fn make_ping(&mut self, now_ns: i64) -> (u32, EchoPayload) {
        self.req_sent_ns = now_ns;
        let idx = self.echo_idx;
        self.echo_idx += 1;
        (
            idx,
            EchoPayload {
                org: 0,
                recv: 0,
                xmt: now_ns,
                offset: self.ns_offset,
            },
        )
    }

    /// Fold a pong into the offset estimate.
    ///
    /// `recv_ns` is the local receive time of the pong.
    pub fn on_pong(&mut self, payload: &EchoPayload, recv_ns: i64) {
        let sample = ((payload.recv - payload.org) + (payload.xmt - recv_ns)) / 2;
        if !self.synced {
            self.ns_offset = sample;
            self.synced = true;
        } else {
            self.ns_offset = (self.ns_offset + sample) / 2;
        }
    }

    /// Handle an inbound ping: note the peer's advertised offset and build
    /// the pong reply payload.
    ///
    /// `recv_ns` is the local receive time of the ping, `now_ns` the local
    /// transmit time of the reply.
    pub fn on_ping(&mut self, payload: &EchoPayload, recv_ns: i64, now_ns: i64) -> EchoPayload {
        self.last_peer_xmt = payload.xmt;
        if payload.offset != 0 {
            self.ns_offset_from_target = payload.offset;
        }
        EchoPayload {
            org: self.last_peer_xmt,
            recv: recv_ns,
            xmt: now_ns,
            offset: self.ns_offset,
        }
    }
}
