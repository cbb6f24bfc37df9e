//! Runtime IPC (RIPC): starting services on the headset and invoking
//! methods on them over `TOPIC_RUNTIME_IPC`.
//!
//! Every message is two segments: a preamble-wrapped header segment
//! ([`RuntimeIpcHeader`]) announcing the byte length of the opaque second
//! segment, then the second segment sent raw. Method identifiers are djb2
//! hashes of the method, return-type and argument-type names XORed
//! together; field tags inside the opaque payloads are `djb2(type) ^
//! djb2(name)`.

use std::collections::HashMap;

use crate::framer::TopicPacket;
use crate::messages::RuntimeIpcHeader;
use crate::protocol::{RIPC_MSG_CONNECT_TO_REMOTE_SERVER, RIPC_MSG_ENSURE_SERVICE_STARTED, RIPC_MSG_RPC};

/// Base client id this host identifies as; the three bootstrap services get
/// consecutive ids above it.
pub const CLIENT_ID_BASE: u32 = 0x4A60_DCCA;

// Reply-routing cookies used while a service connection is being brought
// up; the real client id takes over once connected.
pub const BOOTSTRAP_CLIENT_RUNTIME: u32 = 0x7FFF_FF01;
pub const BOOTSTRAP_CLIENT_BODYAPI: u32 = 0x7FFF_FF02;
pub const BOOTSTRAP_CLIENT_EYETRACK: u32 = 0x7FFF_FF03;

pub fn hash_djb2(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, c| h.wrapping_mul(33).wrapping_add(c as u32))
}

/// Tag for a named, typed field inside an RIPC payload.
pub fn field_hash(type_name: &str, field_name: &str) -> u32 {
    hash_djb2(type_name) ^ hash_djb2(field_name)
}

/// 64-bit-domain method identifier: `method ⊕ return ⊕ argument` hashes.
pub fn method_hash(method: &str, return_type: &str, arg_type: &str) -> u32 {
    hash_djb2(method) ^ hash_djb2(return_type) ^ hash_djb2(arg_type)
}

fn put_string_field(out: &mut Vec<u8>, tag: u32, value: &str) {
    out.extend_from_slice(&((value.len() + 4) as u32).to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// One outbound RIPC message: preamble-wrapped header segment plus the raw
/// body segment.
#[derive(Debug, Clone)]
pub struct RipcMessage {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

fn make_message(cmd_id: u32, client_id: u32, unk: u32, body: Vec<u8>, extra: Vec<u8>) -> RipcMessage {
    let header = RuntimeIpcHeader {
        cmd_id,
        next_size: body.len() as u32,
        client_id,
        unk,
        data: extra,
    }
    .encode();
    RipcMessage { header, body }
}

struct Service {
    ensure_package: &'static str,
    ensure_component: &'static str,
    connect_package: &'static str,
    process: &'static str,
    server: &'static str,
    bootstrap_client: u32,
}

/// The three services brought up on every session.
const SERVICES: [Service; 3] = [
    Service {
        ensure_package: "com.oculus.systemdriver",
        ensure_component: "com.oculus.vrruntimeservice.VrRuntimeService",
        connect_package: "com.oculus.systemdriver",
        process: "com.oculus.vrruntimeservice",
        server: "RuntimeServiceServer",
        bootstrap_client: BOOTSTRAP_CLIENT_RUNTIME,
    },
    Service {
        ensure_package: "com.oculus.bodyapiservice",
        ensure_component: "com.oculus.bodyapiservice.BodyApiService",
        connect_package: "com.oculus.bodyapiservice",
        process: "com.oculus.bodyapiservice",
        server: "BodyApiServiceServer",
        bootstrap_client: BOOTSTRAP_CLIENT_BODYAPI,
    },
    Service {
        ensure_package: "com.oculus.bodyapiservice",
        ensure_component: "com.oculus.eyetrackingservice.EyeTrackingService",
        connect_package: "com.oculus.bodyapiservice",
        process: "com.oculus.eyetrackingservice",
        server: "EyeTrackingServiceServer",
        bootstrap_client: BOOTSTRAP_CLIENT_EYETRACK,
    },
];

/// What the reply router wants done next.
#[derive(Debug)]
pub enum RipcAction {
    Send(RipcMessage),
    State { name: String, data: Vec<u8> },
}

/// Client-side RIPC session state: session counter, pending calls, and
/// which services have connected.
pub struct RipcState {
    client_id: u32,
    session_idx: u32,
    runtime_connected: bool,
    bodyapi_connected: bool,
    eyetrack_connected: bool,
    /// Pending requests keyed by `(client_id, cmd_id)`, mapped to a label
    /// for diagnostics.
    pending: HashMap<(u32, u32), &'static str>,
}

impl RipcState {
    pub fn new() -> RipcState {
        RipcState {
            client_id: CLIENT_ID_BASE,
            session_idx: 3,
            runtime_connected: false,
            bodyapi_connected: false,
            eyetrack_connected: false,
            pending: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = RipcState::new();
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn is_runtime_connected(&self) -> bool {
        self.runtime_connected
    }

    /// Request the peer start `component` from `package`.
    pub fn ensure_service_started(
        &mut self,
        client_id: u32,
        package: &'static str,
        component: &str,
    ) -> RipcMessage {
        let mut body = Vec::new();
        put_string_field(&mut body, field_hash("std::string", "PackageName"), package);
        put_string_field(&mut body, field_hash("std::string", "ServiceComponentName"), component);
        body.extend_from_slice(&0u32.to_le_bytes());

        let unk = self.session_idx;
        self.session_idx += 1;
        self.pending
            .insert((client_id, RIPC_MSG_ENSURE_SERVICE_STARTED), "ensure-service-started");
        make_message(RIPC_MSG_ENSURE_SERVICE_STARTED, client_id, unk, body, Vec::new())
    }

    /// Connect this client to a named server interface.
    pub fn connect_to_remote_server(
        &mut self,
        client_id: u32,
        package: &str,
        process: &str,
        server: &str,
    ) -> RipcMessage {
        let mut body = Vec::new();
        put_string_field(&mut body, field_hash("std::string", "PackageName"), package);
        put_string_field(&mut body, field_hash("std::string", "ProcessName"), process);
        put_string_field(&mut body, field_hash("std::string", "ServerName"), server);
        body.extend_from_slice(&0u32.to_le_bytes());

        self.pending
            .insert((client_id, RIPC_MSG_CONNECT_TO_REMOTE_SERVER), "connect-to-remote-server");
        make_message(
            RIPC_MSG_CONNECT_TO_REMOTE_SERVER,
            client_id,
            self.session_idx,
            body,
            Vec::new(),
        )
    }

    /// Invoke a `Void(bool)`-shaped method by name.
    pub fn rpc_void_bool(&mut self, client_id: u32, method: &'static str) -> RipcMessage {
        let hash = method_hash(method, "Void", "bool");

        let mut body = Vec::with_capacity(7);
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&hash.to_le_bytes());
        body.push(0);

        let mut extra = Vec::with_capacity(13);
        extra.extend_from_slice(&1u32.to_le_bytes());
        extra.extend_from_slice(&field_hash("bool", "oneWay").to_le_bytes());
        extra.push(0);
        extra.extend_from_slice(&hash.to_le_bytes());

        self.pending.insert((client_id, RIPC_MSG_RPC), method);
        make_message(RIPC_MSG_RPC, client_id, self.session_idx, body, extra)
    }

    /// Messages that bring up the runtime, body-API and eye-tracking
    /// services once pairing completes.
    pub fn bring_up_services(&mut self) -> Vec<RipcMessage> {
        let mut out = Vec::with_capacity(SERVICES.len() * 2);
        for (i, svc) in SERVICES.iter().enumerate() {
            out.push(self.ensure_service_started(
                self.client_id + i as u32,
                svc.ensure_package,
                svc.ensure_component,
            ));
            out.push(self.connect_to_remote_server(
                svc.bootstrap_client,
                svc.connect_package,
                svc.process,
                svc.server,
            ));
        }
        out
    }

    /// Route one inbound reply, returning follow-up sends and decoded state
    /// blobs.
    pub fn handle_reply(&mut self, header: &RuntimeIpcHeader, body: &[u8]) -> Vec<RipcAction> {
        if let Some(label) = self.pending.remove(&(header.client_id, header.cmd_id)) {
            log::debug!("ripc reply for {} (client {:#010x})", label, header.client_id);
        }

        let mut actions = Vec::new();
        let base = self.client_id;

        match header.client_id {
            BOOTSTRAP_CLIENT_RUNTIME => {
                if !self.runtime_connected {
                    let msg = self.connect_to_remote_server(
                        base,
                        SERVICES[0].connect_package,
                        SERVICES[0].process,
                        SERVICES[0].server,
                    );
                    actions.push(RipcAction::Send(msg));
                }
                self.push_states(body, &mut actions);
            }
            BOOTSTRAP_CLIENT_BODYAPI => {
                if !self.bodyapi_connected {
                    let msg = self.connect_to_remote_server(
                        base + 1,
                        SERVICES[1].connect_package,
                        SERVICES[1].process,
                        SERVICES[1].server,
                    );
                    actions.push(RipcAction::Send(msg));
                }
                self.push_states(body, &mut actions);
            }
            BOOTSTRAP_CLIENT_EYETRACK => {
                if !self.eyetrack_connected {
                    let msg = self.connect_to_remote_server(
                        base + 2,
                        SERVICES[2].connect_package,
                        SERVICES[2].process,
                        SERVICES[2].server,
                    );
                    actions.push(RipcAction::Send(msg));
                }
                self.push_states(body, &mut actions);
            }
            id if id == base => {
                if !self.runtime_connected {
                    self.runtime_connected = true;
                    let a = self.rpc_void_bool(base, "EnableEyeTrackingForPCLink");
                    let b = self.rpc_void_bool(base, "EnableFaceTrackingForPCLink");
                    actions.push(RipcAction::Send(a));
                    actions.push(RipcAction::Send(b));
                }
                self.push_states(body, &mut actions);
            }
            id if id == base + 1 => {
                self.bodyapi_connected = true;
                self.push_states(body, &mut actions);
            }
            id if id == base + 2 => {
                self.eyetrack_connected = true;
                self.push_states(body, &mut actions);
            }
            id => {
                log::debug!(
                    "ripc payload from unknown client {:#010x} (cmd {:#x}, {} bytes)",
                    id,
                    header.cmd_id,
                    body.len()
                );
            }
        }
        actions
    }

    fn push_states(&self, body: &[u8], actions: &mut Vec<RipcAction>) {
        for (name, data) in parse_states(body) {
            actions.push(RipcAction::State { name, data });
        }
    }
}

/// Parse the `Success + states[]` reply shape shared by the tracked
/// services: a sequence of named shared-memory snapshots.
pub fn parse_states(body: &[u8]) -> Vec<(String, Vec<u8>)> {
    let u32_at = |off: usize| -> Option<u32> {
        body.get(off..off + 4)
            .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    };

    let mut out = Vec::new();
    if u32_at(4) != Some(field_hash("bool", "Success")) {
        return out;
    }
    let Some(num_states) = u32_at(0x11) else {
        return out;
    };
    let mut off = 0x15usize;

    for _ in 0..num_states {
        if u32_at(off + 4) != Some(field_hash("std::string", "MemoryName")) {
            break;
        }
        let Some(name_len) = u32_at(off + 8).map(|l| (l as usize).min(63)) else {
            break;
        };
        let Some(name_raw) = body.get(off + 0xC..off + 0xC + name_len) else {
            break;
        };
        let name = String::from_utf8_lossy(name_raw).into_owned();
        off += 0xC + name_len;

        // MemoryId record.
        off += 0xC;

        let Some(data_len) = u32_at(off + 8).map(|l| l as usize + 0x10) else {
            break;
        };
        off += 0xC;
        let Some(data) = body.get(off..off + data_len) else {
            break;
        };
        out.push((name, data.to_vec()));
        off += data_len;
    }
    out
}

/// Reassembler for inbound two-segment RIPC messages. The second segment's
/// length is only known once the first has been decoded.
pub struct IpcReader {
    state: IpcReadState,
    seg0: Vec<u8>,
    seg0_expected: usize,
    header: Option<RuntimeIpcHeader>,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
enum IpcReadState {
    Meta,
    Header,
    Body,
}

impl IpcReader {
    pub fn new() -> IpcReader {
        IpcReader {
            state: IpcReadState::Meta,
            seg0: Vec::new(),
            seg0_expected: 0,
            header: None,
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = IpcReadState::Meta;
        self.seg0.clear();
        self.seg0_expected = 0;
        self.header = None;
        self.body.clear();
    }

    pub fn consume(&mut self, pkt: &TopicPacket, handler: &mut dyn FnMut(RuntimeIpcHeader, &[u8])) {
        let payload = pkt.payload();
        if payload.len() < 8 {
            return;
        }

        // A fresh `{0, len}` preamble resynchronizes a wedged context.
        if self.state != IpcReadState::Meta
            && payload.len() == 8
            && payload[0..4] == [0, 0, 0, 0]
        {
            log::debug!("ipc context resync on preamble");
            self.reset();
        }

        match self.state {
            IpcReadState::Meta => {
                let words = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                self.seg0_expected = words as usize * 8;
                self.seg0.clear();
                self.state = IpcReadState::Header;
            }
            IpcReadState::Header => {
                if self.seg0.len() + payload.len() > self.seg0_expected {
                    log::warn!(
                        "ipc header overrun ({} + {} > {})",
                        self.seg0.len(),
                        payload.len(),
                        self.seg0_expected
                    );
                    self.reset();
                    return;
                }
                self.seg0.extend_from_slice(payload);
                if self.seg0.len() >= self.seg0_expected {
                    match RuntimeIpcHeader::decode(&self.seg0) {
                        Ok(header) => {
                            let body_len = header.next_size as usize;
                            if body_len == 0 {
                                handler(header, &[]);
                                self.reset();
                            } else {
                                self.header = Some(header);
                                self.body.clear();
                                self.state = IpcReadState::Body;
                            }
                        }
                        Err(e) => {
                            log::warn!("ipc header decode failed: {}", e);
                            self.reset();
                        }
                    }
                }
            }
            IpcReadState::Body => {
                self.body.extend_from_slice(payload);
                let expected = self.header.as_ref().map(|h| h.next_size as usize).unwrap_or(0);
                if self.body.len() >= expected {
                    if let Some(header) = self.header.take() {
                        self.body.truncate(expected);
                        handler(header, &self.body);
                    }
                    self.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{encode_frame, FrameReader};
    use crate::protocol::TOPIC_RUNTIME_IPC;

    #[test]
    fn test_djb2_vectors() {
        assert_eq!(hash_djb2(""), 5381);
        // h("a") = 5381*33 + 97
        assert_eq!(hash_djb2("a"), 5381u32.wrapping_mul(33) + 97);
        assert_eq!(field_hash("bool", "oneWay"), hash_djb2("bool") ^ hash_djb2("oneWay"));
    }

    #[test]
    fn test_method_hash_commutes_over_xor() {
        let h = method_hash("EnableEyeTrackingForPCLink", "Void", "bool");
        assert_eq!(h, method_hash("EnableEyeTrackingForPCLink", "bool", "Void"));
        assert_eq!(
            h,
            hash_djb2("EnableEyeTrackingForPCLink") ^ hash_djb2("Void") ^ hash_djb2("bool")
        );
    }

    #[test]
    fn test_string_field_layout() {
        let mut buf = Vec::new();
        put_string_field(&mut buf, 0xDEAD_BEEF, "abc");
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..8], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&buf[8..12], &3u32.to_le_bytes());
        assert_eq!(&buf[12..], b"abc");
    }

    fn feed_message(reader: &mut IpcReader, msg: &RipcMessage) -> Vec<(RuntimeIpcHeader, Vec<u8>)> {
        let mut framer = FrameReader::new();
        let mut out = Vec::new();

        let mut preamble = 0u32.to_le_bytes().to_vec();
        preamble.extend_from_slice(&((msg.header.len() / 8) as u32).to_le_bytes());

        for frame in [&preamble, &msg.header, &msg.body] {
            if frame.is_empty() {
                continue;
            }
            let wire = encode_frame(TOPIC_RUNTIME_IPC, frame, 0);
            framer.feed(&wire, 0, &mut |pkt| {
                reader.consume(&pkt, &mut |hdr, body| out.push((hdr, body.to_vec())));
            });
        }
        out
    }

    #[test]
    fn test_ipc_reader_roundtrip() {
        let mut state = RipcState::new();
        let msg = state.ensure_service_started(
            CLIENT_ID_BASE,
            "com.oculus.systemdriver",
            "com.oculus.vrruntimeservice.VrRuntimeService",
        );

        let mut reader = IpcReader::new();
        let got = feed_message(&mut reader, &msg);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.cmd_id, RIPC_MSG_ENSURE_SERVICE_STARTED);
        assert_eq!(got[0].0.client_id, CLIENT_ID_BASE);
        assert_eq!(got[0].1, msg.body);
        // Context resets for the next message.
        let got = feed_message(&mut reader, &msg);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn test_bring_up_order_and_session_counter() {
        let mut state = RipcState::new();
        let msgs = state.bring_up_services();
        assert_eq!(msgs.len(), 6);

        let headers: Vec<RuntimeIpcHeader> =
            msgs.iter().map(|m| RuntimeIpcHeader::decode(&m.header).unwrap()).collect();
        // ensure, connect per service.
        assert_eq!(headers[0].cmd_id, RIPC_MSG_ENSURE_SERVICE_STARTED);
        assert_eq!(headers[1].cmd_id, RIPC_MSG_CONNECT_TO_REMOTE_SERVER);
        assert_eq!(headers[0].client_id, CLIENT_ID_BASE);
        assert_eq!(headers[2].client_id, CLIENT_ID_BASE + 1);
        assert_eq!(headers[4].client_id, CLIENT_ID_BASE + 2);
        assert_eq!(headers[1].client_id, BOOTSTRAP_CLIENT_RUNTIME);
        // The session counter ticks once per ensure.
        assert_eq!(headers[0].unk, 3);
        assert_eq!(headers[2].unk, 4);
        assert_eq!(headers[4].unk, 5);
    }

    #[test]
    fn test_reply_routing_connects_and_enables_tracking() {
        let mut state = RipcState::new();
        state.bring_up_services();

        // Bootstrap runtime reply triggers the real connect.
        let hdr = RuntimeIpcHeader {
            cmd_id: RIPC_MSG_CONNECT_TO_REMOTE_SERVER,
            next_size: 0,
            client_id: BOOTSTRAP_CLIENT_RUNTIME,
            unk: 0,
            data: Vec::new(),
        };
        let actions = state.handle_reply(&hdr, &[]);
        assert!(matches!(actions.as_slice(), [RipcAction::Send(_)]));

        // First reply on the real client id enables eye/face tracking.
        let hdr = RuntimeIpcHeader {
            cmd_id: RIPC_MSG_RPC,
            next_size: 0,
            client_id: CLIENT_ID_BASE,
            unk: 0,
            data: Vec::new(),
        };
        let actions = state.handle_reply(&hdr, &[]);
        assert_eq!(actions.len(), 2);
        assert!(state.is_runtime_connected());
        // Second reply does not re-send the enables.
        let actions = state.handle_reply(&hdr, &[]);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_parse_states_roundtrip() {
        // Build a reply: Success field, one state named "eyeGazes_".
        let name = b"eyeGazes_";
        let state_data = vec![0xAB; 0x20];

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&field_hash("bool", "Success").to_le_bytes());
        body.extend_from_slice(&[1u8; 9]); // value + filler up to 0x11
        body.extend_from_slice(&1u32.to_le_bytes()); // num_states at 0x11
        debug_assert_eq!(body.len(), 0x15);

        // MemoryName record.
        body.extend_from_slice(&((name.len() + 4) as u32).to_le_bytes());
        body.extend_from_slice(&field_hash("std::string", "MemoryName").to_le_bytes());
        body.extend_from_slice(&(name.len() as u32).to_le_bytes());
        body.extend_from_slice(name);
        // MemoryId record (skipped by the parser).
        body.extend_from_slice(&[0u8; 0xC]);
        // Data record: 0xC prefix whose u32 at +8 is len-0x10.
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&((state_data.len() - 0x10) as u32).to_le_bytes());
        body.extend_from_slice(&state_data);

        let states = parse_states(&body);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, "eyeGazes_");
        assert_eq!(states[0].1, state_data);
    }
}
