//! The multi-round pairing handshake on `TOPIC_HOSTINFO_ADV`.
//!
//! Two rounds of `INVITE / ACK / CODEGEN_ACK / PAIRING_ACK`, each answered
//! with crafted `OK / CODE_GENERATION / PAIRING` messages. The payload
//! templates are byte-for-byte what a paired headset expects; the second
//! OK gets the negotiated session parameters patched in at fixed offsets.

use crate::framer::TopicPacket;
use crate::hmd::HmdSource;
use crate::hostinfo::{craft_echo, craft_schema, EchoPayload, HostInfoMsg};
use crate::host::Link;
use crate::messages::{ChannelControl, CommandPacket, InviteInfo};
use crate::protocol::*;

const RESULT_OK: u16 = 0x2C8;
const RESULT_ROUND: u16 = 0xC8;
const RESULT_BYE: u16 = 0x3E6;

const OK_FIRST_PAYLOAD: [u8; 72] = [
    0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x2B,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x03, 0x00,
    0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Second-round OK template. Patched before sending:
/// `[8]` session type, `[10]` error code, `[14]` codec, `[16]` slice
/// count, `[24]` target fps.
const OK_SECOND_TEMPLATE: [u8; 72] = [
    0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x03, 0x00, 0x03, 0x00, 0x01, 0x00, 0x1F, 0x00, 0x00,
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x1B,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x55, 0x53, 0x42, 0x33,
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00,
];

const CODEGEN_FIRST_PAYLOAD: [u8; 24] = [
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const CODEGEN_SECOND_PAYLOAD: [u8; 24] = [
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const PAIRING_FIRST_PAYLOAD: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

const PAIRING_SECOND_PAYLOAD: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

const BYE_PAYLOAD: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

/// Opaque probe sent on the video topic after the first pairing round.
const VIDEO_PROBE_PAYLOAD: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

impl Link {
    pub(crate) fn handle_hostinfo(&self, pkt: &TopicPacket) {
        let msg = match HostInfoMsg::parse(pkt) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("bad hostinfo frame: {}", e);
                return;
            }
        };

        if msg.message_type == BUILTIN_ECHO {
            self.handle_echo(&msg);
            return;
        }

        let state = self.pairing_state();
        log::info!("handshake: {} while {:?}", builtin_str(msg.message_type), state);

        // Every INVITE carries the headset description; refresh our idea of
        // the device before answering.
        if msg.message_type == BUILTIN_INVITE {
            self.apply_invite(&msg);
        }

        match state {
            PairingState::WaitFirst => match msg.message_type {
                BUILTIN_INVITE => self.send_ok_first(),
                BUILTIN_ACK => self.send_codegen(false),
                BUILTIN_CODE_GENERATION_ACK => self.send_pairing(false),
                BUILTIN_PAIRING_ACK => {
                    self.send_video_probe();
                    self.send_ping();
                    self.set_pairing(PairingState::WaitSecond);
                }
                other => self.drop_unexpected(other, state),
            },
            PairingState::WaitSecond | PairingState::Pairing => match msg.message_type {
                BUILTIN_INVITE => {
                    self.set_pairing(PairingState::Pairing);
                    self.echo.lock().reset();
                    self.send_ok_second();
                }
                BUILTIN_ACK => self.send_codegen(true),
                BUILTIN_CODE_GENERATION_ACK => self.send_pairing(true),
                BUILTIN_PAIRING_ACK => {
                    self.finish_pairing();
                    self.set_pairing(PairingState::Paired);
                    self.note_paired();
                    self.emit_state_event(crate::types::HostEvent::Paired);
                    log::info!("session paired");
                }
                other => self.drop_unexpected(other, state),
            },
            PairingState::Paired => match msg.message_type {
                BUILTIN_BYE => {
                    log::warn!("headset said BYE, restarting session");
                    self.handle_disconnect();
                }
                other => self.drop_unexpected(other, state),
            },
        }
    }

    fn drop_unexpected(&self, message_type: u8, state: PairingState) {
        // Duplicates of an earlier round are idempotent no-ops; anything
        // else is logged and dropped without advancing the machine.
        log::debug!("ignoring {} while {:?}", builtin_str(message_type), state);
    }

    fn handle_echo(&self, msg: &HostInfoMsg) {
        let payload = match EchoPayload::parse(msg.payload()) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("bad echo payload: {}", e);
                return;
            }
        };

        if msg.result & 1 == ECHO_PONG {
            self.echo.lock().on_pong(&payload, msg.recv_ns);
        } else {
            let reply = self
                .echo
                .lock()
                .on_ping(&payload, msg.recv_ns, self.now_ns());
            self.send_or_log(TOPIC_HOSTINFO_ADV, &craft_echo(ECHO_PONG, msg.marker, &reply));
        }

        // Keep the exchange running while paired.
        if self.pairing_state() == PairingState::Paired {
            self.send_ping();
        }
    }

    fn apply_invite(&self, msg: &HostInfoMsg) {
        match InviteInfo::decode(msg.payload()) {
            Ok(info) => {
                self.hmd
                    .apply_invite(&info, self.transport.slow_link(), &self.overrides);
            }
            Err(e) => {
                // Keep the handshake going with the previous geometry.
                log::warn!("invite description undecodable, keeping defaults: {}", e);
            }
        }
    }

    fn send_ok_first(&self) {
        log::info!("sending session OK");
        let msg = craft_schema(BUILTIN_OK, RESULT_OK, 1, &OK_FIRST_PAYLOAD);
        self.send_or_log(TOPIC_HOSTINFO_ADV, &msg);
    }

    fn send_ok_second(&self) {
        let fps = self.hmd.fps();
        let mut payload = OK_SECOND_TEMPLATE;
        payload[8] = 0x03; // session type
        payload[10] = 0x01; // error code
        payload[14] = match self.codec {
            Codec::H264 => 0x00,
            Codec::Hevc => 0x01,
        };
        payload[16] = (self.video.num_slices() & 0xF) as u8;
        payload[24] = fps as u8;

        log::info!(
            "sending stream OK: {} slices, {:?}, {} fps",
            self.video.num_slices(),
            self.codec,
            fps
        );
        let msg = craft_schema(BUILTIN_OK, RESULT_OK, 1, &payload);
        self.send_or_log(TOPIC_HOSTINFO_ADV, &msg);
    }

    fn send_codegen(&self, second: bool) {
        let payload: &[u8] = if second {
            &CODEGEN_SECOND_PAYLOAD
        } else {
            &CODEGEN_FIRST_PAYLOAD
        };
        let msg = craft_schema(BUILTIN_CODE_GENERATION, RESULT_ROUND, 1, payload);
        self.send_or_log(TOPIC_HOSTINFO_ADV, &msg);
    }

    fn send_pairing(&self, second: bool) {
        let payload: &[u8] = if second {
            &PAIRING_SECOND_PAYLOAD
        } else {
            &PAIRING_FIRST_PAYLOAD
        };
        let msg = craft_schema(BUILTIN_PAIRING, RESULT_ROUND, 1, payload);
        self.send_or_log(TOPIC_HOSTINFO_ADV, &msg);
    }

    pub(crate) fn send_bye(&self) {
        log::info!("sending BYE");
        let msg = craft_schema(BUILTIN_BYE, RESULT_BYE, 1, &BYE_PAYLOAD);
        self.send_or_log(TOPIC_HOSTINFO_ADV, &msg);
    }

    fn send_video_probe(&self) {
        if let Err(e) = self.send_segmented(TOPIC_VIDEO, 0, &[&VIDEO_PROBE_PAYLOAD]) {
            log::warn!("video probe send failed: {}", e);
        }
    }

    fn send_channel_control(&self, topic: u8, control: ChannelControl) {
        if let Err(e) = self.send_segmented(topic, 0, &[&control.encode()]) {
            log::warn!("control send on {} failed: {}", topic_str(topic), e);
        }
    }

    /// The post-pairing burst: audio route, link sharpening, ASW, frame
    /// dropping, input surfaces, service bring-up and the rectify mesh.
    fn finish_pairing(&self) {
        self.send_channel_control(
            TOPIC_AUDIO_CONTROL,
            ChannelControl { a: 1, b: 1, c: 0, d: 0.0, e: 0.0 },
        );

        self.send_or_log(TOPIC_COMMAND, &CommandPacket::new(COMMAND_TOGGLE_CHEMX).encode());
        self.send_or_log(TOPIC_COMMAND, &CommandPacket::new(COMMAND_TOGGLE_ASW).encode());
        self.send_or_log(
            TOPIC_COMMAND,
            &CommandPacket::new(COMMAND_DROP_FRAMES_STATE).with_arg1(1).encode(),
        );

        // Hands then body.
        self.send_channel_control(
            TOPIC_INPUT_CONTROL,
            ChannelControl { a: 1, b: 1, c: 0, d: 0.0, e: 0.0 },
        );
        self.send_channel_control(
            TOPIC_INPUT_CONTROL,
            ChannelControl { a: 2, b: 1, c: 0, d: 0.0, e: 0.0 },
        );

        let bring_up = self.ripc.lock().bring_up_services();
        for msg in bring_up {
            self.send_ripc(&msg);
        }

        self.send_rectify_mesh();
    }

    fn send_rectify_mesh(&self) {
        let mesh = self.hmd.rectify_mesh();
        log::info!(
            "uploading rectify mesh {} ({} vertices)",
            mesh.mesh_id,
            mesh.vertices.len()
        );
        if let Err(e) = self.send_segmented(TOPIC_MESH, 2, &[&mesh.encode()]) {
            log::warn!("mesh upload failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::{deliver, hostinfo_in, make_link, run_clean_handshake, sent_trace};
    use crate::types::HostEvent;

    /// Expected labels must appear in order within the observed trace.
    fn assert_subsequence(observed: &[(u8, u8)], expected: &[(u8, u8)]) {
        let mut it = observed.iter();
        for want in expected {
            assert!(
                it.any(|got| got == want),
                "missing {:?} (in order) in trace {:?}",
                want,
                observed
            );
        }
    }

    #[test]
    fn test_clean_handshake_reaches_paired_with_expected_trace() {
        let (link, transport, rx) = make_link();
        run_clean_handshake(&link);

        assert_eq!(link.pairing_state(), PairingState::Paired);
        assert!(rx.try_iter().any(|e| matches!(e, HostEvent::Paired)));

        let trace = sent_trace(&transport);
        assert_subsequence(
            &trace,
            &[
                (TOPIC_HOSTINFO_ADV, BUILTIN_OK),
                (TOPIC_HOSTINFO_ADV, BUILTIN_CODE_GENERATION),
                (TOPIC_HOSTINFO_ADV, BUILTIN_PAIRING),
                (TOPIC_VIDEO, 0xFF),
                (TOPIC_HOSTINFO_ADV, BUILTIN_ECHO),
                (TOPIC_HOSTINFO_ADV, BUILTIN_OK),
                (TOPIC_HOSTINFO_ADV, BUILTIN_CODE_GENERATION),
                (TOPIC_HOSTINFO_ADV, BUILTIN_PAIRING),
                (TOPIC_AUDIO_CONTROL, 0xFF),
                (TOPIC_COMMAND, 0xFF),
                (TOPIC_COMMAND, 0xFF),
                (TOPIC_COMMAND, 0xFF),
                (TOPIC_INPUT_CONTROL, 0xFF),
                (TOPIC_INPUT_CONTROL, 0xFF),
                (TOPIC_RUNTIME_IPC, 0xFF),
                (TOPIC_MESH, 0xFF),
            ],
        );
    }

    #[test]
    fn test_state_advances_per_round() {
        let (link, _transport, _rx) = make_link();
        assert_eq!(link.pairing_state(), PairingState::WaitFirst);

        for msg in [BUILTIN_INVITE, BUILTIN_ACK, BUILTIN_CODE_GENERATION_ACK] {
            deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(msg));
            assert_eq!(link.pairing_state(), PairingState::WaitFirst);
        }
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_PAIRING_ACK));
        assert_eq!(link.pairing_state(), PairingState::WaitSecond);

        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_INVITE));
        assert_eq!(link.pairing_state(), PairingState::Pairing);

        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_ACK));
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_CODE_GENERATION_ACK));
        assert_eq!(link.pairing_state(), PairingState::Pairing);

        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_PAIRING_ACK));
        assert_eq!(link.pairing_state(), PairingState::Paired);
    }

    #[test]
    fn test_duplicate_messages_are_idempotent() {
        let (link, _transport, _rx) = make_link();
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_INVITE));
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_INVITE));
        assert_eq!(link.pairing_state(), PairingState::WaitFirst);

        run_clean_handshake(&link);
        assert_eq!(link.pairing_state(), PairingState::Paired);
        // A stray PAIRING_ACK after pairing does not regress anything.
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_PAIRING_ACK));
        assert_eq!(link.pairing_state(), PairingState::Paired);
    }

    #[test]
    fn test_ok_second_encodes_session_parameters() {
        let (link, transport, _rx) = make_link();
        // Walk to the second INVITE.
        for msg in [
            BUILTIN_INVITE,
            BUILTIN_ACK,
            BUILTIN_CODE_GENERATION_ACK,
            BUILTIN_PAIRING_ACK,
        ] {
            deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(msg));
        }
        transport.clear_sent();
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_INVITE));

        let sent = transport.sent();
        assert!(!sent.is_empty());
        let mut framer = crate::framer::FrameReader::new();
        let mut payload = None;
        framer.feed(&sent[0], 0, &mut |pkt| {
            let msg = HostInfoMsg::parse(&pkt).unwrap();
            assert_eq!(msg.message_type, BUILTIN_OK);
            payload = Some(msg.payload().to_vec());
        });
        let payload = payload.expect("no OK frame");
        assert_eq!(payload[8], 0x03); // session type
        assert_eq!(payload[10], 0x01); // error code
        assert_eq!(payload[14], 0x00); // H.264
        assert_eq!(payload[16], 1); // slice count
        assert_eq!(payload[24], 120); // Quest 2 on a fast link
        assert_eq!(&payload[56..60], b"USB3");
    }

    #[test]
    fn test_invite_on_slow_link_caps_fps() {
        let (link, transport, _rx) = make_link();
        transport.set_slow(true);
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_INVITE));
        assert_eq!(link.hmd.fps(), 90);
    }

    #[test]
    fn test_undecodable_invite_keeps_handshake_moving() {
        let (link, transport, _rx) = make_link();
        // INVITE with a truncated description still gets an OK back.
        let bad = crate::hostinfo::craft_schema(BUILTIN_INVITE, 0, 1, &[0u8; 8]);
        deliver(&link, TOPIC_HOSTINFO_ADV, &bad);
        let trace = sent_trace(&transport);
        assert_eq!(trace, vec![(TOPIC_HOSTINFO_ADV, BUILTIN_OK)]);
        // Geometry stayed at defaults.
        assert_eq!(link.hmd.fps(), 72);
    }

    #[test]
    fn test_second_invite_resets_echo() {
        let (link, _transport, _rx) = make_link();
        for msg in [
            BUILTIN_INVITE,
            BUILTIN_ACK,
            BUILTIN_CODE_GENERATION_ACK,
            BUILTIN_PAIRING_ACK,
        ] {
            deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(msg));
        }
        // The round-1 ping marked the echo state as in flight.
        {
            let mut echo = link.echo.lock();
            echo.on_pong(
                &EchoPayload { org: 0, recv: 500, xmt: 500, offset: 0 },
                0,
            );
            assert!(echo.is_synced());
        }
        deliver(&link, TOPIC_HOSTINFO_ADV, &hostinfo_in(BUILTIN_INVITE));
        assert!(!link.echo.lock().is_synced());
    }
}
