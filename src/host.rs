//! The session-owning host: reader/writer threads, per-topic dispatch and
//! the public API surface.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::SessionClock;
use crate::config::Overrides;
use crate::echo::EchoState;
use crate::error::XrspError;
use crate::framer::{FrameReader, TopicPacket, TopicSender};
use crate::hmd::{HmdSource, SharedHmd};
use crate::hostinfo;
use crate::messages::{ChannelControl, HapticEvent, LoggingPayload, PosePayload};
use crate::protocol::{
    topic_str, Codec, PairingState, TOPIC_BODY, TOPIC_HANDS, TOPIC_HAPTIC, TOPIC_HOSTINFO_ADV,
    TOPIC_LOGGING, TOPIC_POSE, TOPIC_RUNTIME_IPC, TOPIC_SKELETON, TOPIC_SLICE_0, TOPIC_SLICE_3,
};
use crate::ripc::{IpcReader, RipcAction, RipcMessage, RipcState};
use crate::segment::SegmentReader;
use crate::types::{DeviceLogLevel, HapticTarget, HapticType, HostEvent};
use crate::usb::{Transport, UsbTransport};
use crate::video::{build_slice_header, EncoderSink, VideoPipeline};
use crate::Result;

/// Meta Platforms USB vendor id.
pub const META_VID: u16 = 0x2833;
/// Product ids a link-mode headset may enumerate with.
pub const QUEST_XRSP_PIDS: [u16; 4] = [0x0137, 0x0182, 0x0183, 0x0186];

/// If nothing arrives for this long the link is considered stalled.
const STALL_TIMEOUT_NS: i64 = 1_000_000_000;
/// Delay between reaching PAIRED and opening the frame gate.
const READY_DELAY_NS: i64 = 1_000_000_000;
/// Reader poll timeout on the IN endpoint.
const READ_TIMEOUT: Duration = Duration::from_millis(1);
/// Writer wake interval.
const WRITE_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub vid: u16,
    pub pid: u16,
    pub interface: u8,
    /// Horizontal slice count per video frame (1..=4).
    pub num_slices: usize,
    pub codec: Codec,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            vid: META_VID,
            pid: QUEST_XRSP_PIDS[0],
            interface: 0,
            num_slices: 1,
            codec: Codec::H264,
        }
    }
}

/// Shared session state behind the `Host` facade.
pub(crate) struct Link {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) sender: Mutex<TopicSender>,
    pub(crate) clock: SessionClock,
    pub(crate) echo: Mutex<EchoState>,
    pub(crate) hmd: SharedHmd,
    pub(crate) video: VideoPipeline,
    pub(crate) ripc: Mutex<RipcState>,
    pub(crate) overrides: Overrides,
    pub(crate) codec: Codec,
    pairing: AtomicU8,
    pose_reader: Mutex<SegmentReader>,
    ipc_reader: Mutex<IpcReader>,
    events: Sender<HostEvent>,
    stop: AtomicBool,
    last_read_ns: AtomicI64,
    paired_ns: AtomicI64,
    inactive: AtomicBool,
}

impl Link {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        config: &HostConfig,
        events: Sender<HostEvent>,
    ) -> Arc<Link> {
        let clock = SessionClock::new();
        let hmd = SharedHmd::new();
        let video = VideoPipeline::new(config.num_slices, Arc::new(hmd.clone()), clock);
        Arc::new(Link {
            transport,
            sender: Mutex::new(TopicSender::new()),
            clock,
            echo: Mutex::new(EchoState::new()),
            hmd,
            video,
            ripc: Mutex::new(RipcState::new()),
            overrides: Overrides::from_env(),
            codec: config.codec,
            pairing: AtomicU8::new(PairingState::WaitFirst as u8),
            pose_reader: Mutex::new(SegmentReader::new(1)),
            ipc_reader: Mutex::new(IpcReader::new()),
            events,
            stop: AtomicBool::new(false),
            last_read_ns: AtomicI64::new(0),
            paired_ns: AtomicI64::new(0),
            inactive: AtomicBool::new(false),
        })
    }

    pub(crate) fn now_ns(&self) -> i64 {
        self.clock.now_ns()
    }

    pub(crate) fn pairing_state(&self) -> PairingState {
        PairingState::from_u8(self.pairing.load(Ordering::SeqCst))
    }

    pub(crate) fn set_pairing(&self, state: PairingState) {
        self.pairing.store(state as u8, Ordering::SeqCst);
    }

    // -- Outbound helpers --

    pub(crate) fn send_to_topic(&self, topic: u8, data: &[u8]) -> Result<()> {
        let res = self.sender.lock().send_to_topic(&*self.transport, topic, data);
        self.after_send(res)
    }

    pub(crate) fn send_segmented(&self, topic: u8, idx: u32, segments: &[&[u8]]) -> Result<()> {
        let res = self
            .sender
            .lock()
            .send_segmented(&*self.transport, topic, idx, segments);
        self.after_send(res)
    }

    /// A send that left the transport invalid regresses the handshake; the
    /// reader's stall policy then reopens the device.
    fn after_send(&self, res: Result<()>) -> Result<()> {
        if res.is_err() && !self.transport.is_valid() {
            log::warn!("transport invalidated by failed send, session falls back to pairing");
            self.reset_session_state();
        }
        res
    }

    pub(crate) fn send_or_log(&self, topic: u8, data: &[u8]) {
        if let Err(e) = self.send_to_topic(topic, data) {
            log::warn!("send on {} failed: {}", topic_str(topic), e);
        }
    }

    pub(crate) fn send_ripc(&self, msg: &RipcMessage) {
        let res = {
            let mut sender = self.sender.lock();
            sender
                .send_segmented(&*self.transport, TOPIC_RUNTIME_IPC, 0, &[&msg.header])
                .and_then(|_| sender.send_to_topic(&*self.transport, TOPIC_RUNTIME_IPC, &msg.body))
        };
        if let Err(e) = self.after_send(res) {
            log::warn!("ripc send failed: {}", e);
        }
    }

    /// Send a ping if the pacing interval has elapsed.
    pub(crate) fn send_ping(&self) {
        let now = self.now_ns();
        let crafted = {
            let mut echo = self.echo.lock();
            if !echo.ping_due(now) {
                return;
            }
            let (idx, payload) = echo.make_ping(now);
            hostinfo::craft_echo(crate::protocol::ECHO_PING, idx, &payload)
        };
        self.send_or_log(TOPIC_HOSTINFO_ADV, &crafted);
    }

    // -- Events --

    pub(crate) fn emit_state_event(&self, event: HostEvent) {
        // State changes are rare and must not be lost.
        self.events.send(event).ok();
    }

    pub(crate) fn emit_stream_event(&self, event: HostEvent) {
        if let Err(crossbeam_channel::TrySendError::Full(_)) = self.events.try_send(event) {
            log::trace!("event channel full, dropping sample");
        }
    }

    // -- Session reset --

    /// Tear the session down after a transport fault: reset and reopen the
    /// device, regress the handshake and drain the pipeline.
    pub(crate) fn handle_disconnect(&self) {
        log::warn!("link fault, resetting session");
        self.reset_session_state();
        if let Err(e) = self.transport.reconnect(true) {
            log::error!("device reopen failed: {}", e);
        }
        self.emit_state_event(HostEvent::SessionReset);
    }

    pub(crate) fn reset_session_state(&self) {
        self.set_pairing(PairingState::WaitFirst);
        self.video.set_ready(false);
        self.video.drain();
        self.echo.lock().reset();
        self.ripc.lock().reset();
        self.pose_reader.lock().reset();
        self.ipc_reader.lock().reset();
    }

    // -- Inbound dispatch --

    pub(crate) fn dispatch(&self, pkt: TopicPacket) {
        // Streaming topics are only meaningful in a paired session; seeing
        // them earlier means the peer kept an old session alive.
        if matches!(pkt.topic, TOPIC_POSE | TOPIC_SKELETON | TOPIC_LOGGING)
            && self.pairing_state() != PairingState::Paired
        {
            log::warn!(
                "{} frame while {:?}, forcing session restart",
                topic_str(pkt.topic),
                self.pairing_state()
            );
            self.send_bye();
            self.handle_disconnect();
            return;
        }

        match pkt.topic {
            TOPIC_HOSTINFO_ADV => self.handle_hostinfo(&pkt),
            TOPIC_POSE => {
                let mut reader = self.pose_reader.lock();
                reader.consume(&pkt, &mut |_, segs| self.handle_pose(&segs[0]));
            }
            TOPIC_HANDS => self.emit_stream_event(HostEvent::Hands(pkt.into_payload())),
            TOPIC_SKELETON => self.emit_stream_event(HostEvent::Skeleton(pkt.into_payload())),
            TOPIC_BODY => self.emit_stream_event(HostEvent::Body(pkt.into_payload())),
            TOPIC_LOGGING => self.handle_logging(&pkt),
            TOPIC_RUNTIME_IPC => {
                let mut actions = Vec::new();
                {
                    let mut reader = self.ipc_reader.lock();
                    let mut ripc = self.ripc.lock();
                    reader.consume(&pkt, &mut |hdr, body| {
                        actions.append(&mut ripc.handle_reply(&hdr, body));
                    });
                }
                for action in actions {
                    match action {
                        RipcAction::Send(msg) => self.send_ripc(&msg),
                        RipcAction::State { name, data } => {
                            self.emit_stream_event(HostEvent::RuntimeState { name, data })
                        }
                    }
                }
            }
            t if (TOPIC_SLICE_0..=TOPIC_SLICE_3).contains(&t) => {
                log::debug!("slice status on {} ({} bytes)", topic_str(t), pkt.payload().len());
            }
            t => {
                log::debug!("dropping frame on unhandled topic {} ({:#04x})", topic_str(t), t);
            }
        }
    }

    fn handle_pose(&self, seg: &[u8]) {
        let payload = match PosePayload::decode(seg) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("pose decode failed: {}", e);
                return;
            }
        };
        let local_ns = self.echo.lock().from_target(payload.timestamp);
        self.hmd.apply_pose(&payload, local_ns);
        self.inactive.store(false, Ordering::Relaxed);
        self.emit_stream_event(HostEvent::HeadPose(payload.to_sample(|_| local_ns)));
    }

    fn handle_logging(&self, pkt: &TopicPacket) {
        let decoded = match LoggingPayload::decode(pkt.payload()) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("device log decode failed: {}", e);
                return;
            }
        };
        for (level, message) in decoded.entries {
            match level {
                DeviceLogLevel::Error => log::error!("headset: {}", message),
                DeviceLogLevel::Warn => log::warn!("headset: {}", message),
                DeviceLogLevel::Info => log::info!("headset: {}", message),
                DeviceLogLevel::Debug => log::debug!("headset: {}", message),
            }
            self.emit_stream_event(HostEvent::DeviceLog { level, message });
        }
    }

    // -- Video emission --

    /// Emit the oldest fully-ready frame, if any. One frame per call.
    pub(crate) fn try_send_frame(&self) {
        if self.pairing_state() != PairingState::Paired || !self.video.is_ready() {
            return;
        }
        let Some(index) = self.video.select_ready() else {
            return;
        };

        let frame_idx = self.video.frame_idx();
        let (_, encode_height) = self.hmd.encode_size();
        let fps = self.hmd.fps();
        let num_slices = self.video.num_slices();
        let mesh_id = crate::messages::MESH_FOVEATED;

        for slice in 0..num_slices {
            let Some(tx) = self.video.begin_slice_tx(index, slice) else {
                continue;
            };

            // The first frame of a session must be a keyframe.
            if tx.csd.is_empty() && self.video.needs_keyframe() {
                log::debug!("suppressing non-keyframe {} before first keyframe", frame_idx);
                self.video.finish_slice_tx(index, slice, tx);
                continue;
            }

            let row = self.video.row_info(index);
            let header = {
                let echo = self.echo.lock();
                build_slice_header(
                    frame_idx,
                    slice,
                    num_slices,
                    encode_height,
                    fps,
                    mesh_id,
                    &row,
                    &tx,
                    |t| echo.to_target(t),
                )
            };

            let topic = TOPIC_SLICE_0 + slice as u8;
            let mut ok = self.send_segmented(topic, 0, &[&header.encode()]).is_ok();
            if ok && !tx.csd.is_empty() {
                ok = self.send_to_topic(topic, &tx.csd).is_ok();
            }
            if ok {
                ok = self.send_to_topic(topic, &tx.idr).is_ok();
            }
            if ok {
                self.video.mark_first_frame_sent();
            } else {
                log::warn!("slice {} of frame {} failed to send", slice, frame_idx);
            }
            self.video.finish_slice_tx(index, slice, tx);
        }
        self.video.advance_frame();
    }

    // -- Periodic policy, shared by the threads and the tests --

    /// Reader-side policy: reopen a dead device once the link has been
    /// quiet for a second.
    pub(crate) fn reader_tick(&self, framer: &mut FrameReader, buf: &mut [u8]) {
        let now = self.now_ns();
        if now - self.last_read_ns.load(Ordering::Relaxed) > STALL_TIMEOUT_NS
            && self.pairing_state() == PairingState::WaitFirst
            && !self.transport.is_valid()
        {
            if self.transport.reconnect(false).is_ok() {
                framer.reset();
            }
            self.last_read_ns.store(now, Ordering::Relaxed);
        }

        loop {
            match self.transport.recv(buf, READ_TIMEOUT) {
                Ok(0) => break,
                Ok(n) => {
                    let now = self.now_ns();
                    self.last_read_ns.store(now, Ordering::Relaxed);
                    let mut completed = Vec::new();
                    framer.feed(&buf[..n], now, &mut |pkt| completed.push(pkt));
                    for pkt in completed {
                        self.dispatch(pkt);
                    }
                }
                Err(e) => {
                    if e.is_fatal_transport() {
                        framer.reset();
                        self.handle_disconnect();
                        self.last_read_ns.store(self.now_ns(), Ordering::Relaxed);
                    } else {
                        log::warn!("bulk read failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    /// Writer-side policy: frame emission, the post-pairing frame gate,
    /// periodic pings, and the stalled-but-valid BYE.
    pub(crate) fn writer_tick(&self) {
        self.try_send_frame();

        let now = self.now_ns();
        let paired = self.pairing_state() == PairingState::Paired;

        if paired
            && !self.video.is_ready()
            && now - self.paired_ns.load(Ordering::Relaxed) > READY_DELAY_NS
        {
            log::info!("opening video frame gate");
            self.video.set_ready(true);
        }

        if paired {
            self.send_ping();
        }

        if now - self.last_read_ns.load(Ordering::Relaxed) > STALL_TIMEOUT_NS
            && self.pairing_state() == PairingState::WaitFirst
            && self.transport.is_valid()
        {
            self.send_bye();
            self.last_read_ns.store(now, Ordering::Relaxed);
        }

        let pose_ns = self.hmd.last_pose_ns();
        self.inactive
            .store(pose_ns != 0 && now - pose_ns > STALL_TIMEOUT_NS, Ordering::Relaxed);
    }

    pub(crate) fn note_paired(&self) {
        self.paired_ns.store(self.now_ns(), Ordering::Relaxed);
    }
}

fn reader_loop(link: Arc<Link>) {
    log::info!("packet reader started");
    let mut framer = FrameReader::new();
    let mut buf = [0u8; 1024];
    while !link.stop.load(Ordering::Relaxed) {
        link.reader_tick(&mut framer, &mut buf);
        std::thread::sleep(Duration::from_micros(100));
    }
    log::debug!("packet reader exiting");
}

fn writer_loop(link: Arc<Link>) {
    log::info!("packet writer started");
    while !link.stop.load(Ordering::Relaxed) {
        link.writer_tick();
        std::thread::sleep(WRITE_TICK);
    }
    log::debug!("packet writer exiting");
}

/// Cloneable handle the external encoder uses to push encoded slices.
#[derive(Clone)]
pub struct EncoderHandle {
    link: Arc<Link>,
}

impl EncoderSink for EncoderHandle {
    fn start_encode(&self, index: usize, slice: usize, target_ns: i64) {
        self.link.video.start_encode(index, slice, target_ns);
    }

    fn send_csd(&self, index: usize, slice: usize, data: &[u8]) {
        self.link.video.send_csd(index, slice, data);
    }

    fn send_idr(&self, index: usize, slice: usize, data: &[u8]) {
        self.link.video.send_idr(index, slice, data);
    }

    fn flush_stream(&self, index: usize, slice: usize, target_ns: i64) {
        self.link.video.flush_stream(index, slice, target_ns);
    }
}

/// An open link session: owns the reader and writer threads.
pub struct Host {
    link: Arc<Link>,
    events: Receiver<HostEvent>,
    read_thread: Option<std::thread::JoinHandle<()>>,
    write_thread: Option<std::thread::JoinHandle<()>>,
}

impl Host {
    /// Open the headset over USB and start the session threads. The
    /// handshake proceeds as the headset sends its INVITE rounds.
    pub fn open(config: HostConfig) -> Result<Host> {
        let transport = UsbTransport::open(config.vid, config.pid, config.interface)?;
        Host::with_transport(Box::new(transport), config)
    }

    /// Run a session over a caller-supplied transport.
    pub fn with_transport(transport: Box<dyn Transport>, config: HostConfig) -> Result<Host> {
        let (events_tx, events_rx) = crossbeam_channel::bounded(256);
        let link = Link::new(transport, &config, events_tx);

        let read_link = link.clone();
        let read_thread = std::thread::Builder::new()
            .name("xrsp-read".into())
            .spawn(move || reader_loop(read_link))
            .map_err(|e| XrspError::Protocol(format!("failed to spawn reader: {}", e)))?;

        let write_link = link.clone();
        let write_thread = std::thread::Builder::new()
            .name("xrsp-write".into())
            .spawn(move || writer_loop(write_link))
            .map_err(|e| XrspError::Protocol(format!("failed to spawn writer: {}", e)))?;

        Ok(Host {
            link,
            events: events_rx,
            read_thread: Some(read_thread),
            write_thread: Some(write_thread),
        })
    }

    /// Channel of session and tracking events.
    pub fn events(&self) -> &Receiver<HostEvent> {
        &self.events
    }

    /// Sink the external video encoder pushes encoded slices into.
    pub fn encoder(&self) -> EncoderHandle {
        EncoderHandle { link: self.link.clone() }
    }

    /// Shared HMD state (pose, FOV, stream geometry).
    pub fn hmd(&self) -> SharedHmd {
        self.link.hmd.clone()
    }

    pub fn pairing_state(&self) -> PairingState {
        self.link.pairing_state()
    }

    /// False once no headset pose has arrived for a second.
    pub fn is_active(&self) -> bool {
        !self.link.inactive.load(Ordering::Relaxed)
    }

    /// Amplitude-only rumble on one controller.
    pub fn send_simple_haptic(&self, target: HapticTarget, amplitude: f32) {
        self.send_haptic(HapticEvent {
            timestamp: self.link.now_ns(),
            target,
            haptic_type: HapticType::Simple,
            amplitude,
            pose_timestamp: 0,
            data: Vec::new(),
        });
    }

    /// Waveform haptics; `samples` beyond the wire cap are truncated.
    pub fn send_buffered_haptic(&self, target: HapticTarget, samples: &[u8]) {
        self.send_haptic(HapticEvent {
            timestamp: self.link.now_ns(),
            target,
            haptic_type: HapticType::Buffered,
            amplitude: 1.0,
            pose_timestamp: self.link.echo.lock().to_target(self.link.now_ns()),
            data: samples.to_vec(),
        });
    }

    fn send_haptic(&self, event: HapticEvent) {
        if self.link.pairing_state() != PairingState::Paired || !self.link.video.is_ready() {
            return;
        }
        if let Err(e) = self.link.send_segmented(TOPIC_HAPTIC, 0, &[&event.encode()]) {
            log::warn!("haptic send failed: {}", e);
        }
    }

    /// Route audio through the headset speakers or the host.
    pub fn send_audio_control(&self, control: ChannelControl) {
        if let Err(e) = self.link.send_segmented(crate::protocol::TOPIC_AUDIO_CONTROL, 0, &[&control.encode()]) {
            log::warn!("audio control send failed: {}", e);
        }
    }

    /// Stop the session threads and release the device.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.link.stop.store(true, Ordering::Relaxed);
        self.link.video.drain();
        if let Some(t) = self.read_thread.take() {
            t.join().ok();
        }
        if let Some(t) = self.write_thread.take() {
            t.join().ok();
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::framer::encode_frame;
    use crate::hostinfo::{craft_schema, EchoPayload, HostInfoMsg};
    use crate::messages::{InviteInfo, LensAngles, SliceHeader};
    use crate::protocol::*;
    use crate::usb::testing::MemoryTransport;

    pub(crate) fn make_link() -> (Arc<Link>, Arc<MemoryTransport>, Receiver<HostEvent>) {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, rx) = crossbeam_channel::bounded(256);
        let config = HostConfig {
            num_slices: 1,
            ..HostConfig::default()
        };
        struct Shared(Arc<MemoryTransport>);
        impl Transport for Shared {
            fn send(&self, d: &[u8]) -> Result<()> {
                self.0.send(d)
            }
            fn recv(&self, b: &mut [u8], t: Duration) -> Result<usize> {
                self.0.recv(b, t)
            }
            fn reconnect(&self, r: bool) -> Result<()> {
                self.0.reconnect(r)
            }
            fn is_valid(&self) -> bool {
                self.0.is_valid()
            }
            fn invalidate(&self) {
                self.0.invalidate()
            }
            fn slow_link(&self) -> bool {
                self.0.slow_link()
            }
        }
        let link = Link::new(Box::new(Shared(transport.clone())), &config, tx);
        (link, transport, rx)
    }

    /// Deliver one already-framed topic payload to the dispatcher.
    pub(crate) fn deliver(link: &Link, topic: u8, payload: &[u8]) {
        let wire = encode_frame(topic, payload, 0);
        let mut framer = FrameReader::new();
        let mut pkts = Vec::new();
        framer.feed(&wire, link.now_ns(), &mut |pkt| pkts.push(pkt));
        for pkt in pkts {
            link.dispatch(pkt);
        }
    }

    /// Label every sent frame for trace assertions: hostinfo frames by
    /// builtin type, everything else by topic.
    pub(crate) fn sent_trace(transport: &MemoryTransport) -> Vec<(u8, u8)> {
        let mut framer = FrameReader::new();
        let mut out = Vec::new();
        for buf in transport.sent() {
            framer.feed(&buf, 0, &mut |pkt| {
                if pkt.topic == TOPIC_HOSTINFO_ADV {
                    let word0 = u32::from_le_bytes([
                        pkt.payload()[0],
                        pkt.payload()[1],
                        pkt.payload()[2],
                        pkt.payload()[3],
                    ]);
                    out.push((TOPIC_HOSTINFO_ADV, (word0 & 0xF) as u8));
                } else {
                    out.push((pkt.topic, 0xFF));
                }
            });
        }
        out
    }

    pub(crate) fn invite_payload() -> Vec<u8> {
        InviteInfo {
            device_type: DeviceType::Quest2 as u32,
            resolution_width: 3664,
            resolution_height: 1920,
            refresh_rate_hz: 90.0,
            left_lens: LensAngles {
                up: 42.0,
                down: 43.0,
                left: 52.0,
                right: 49.0,
            },
            right_lens: LensAngles {
                up: 42.0,
                down: 43.0,
                left: 49.0,
                right: 52.0,
            },
        }
        .encode()
    }

    pub(crate) fn hostinfo_in(message_type: u8) -> Vec<u8> {
        let payload = if message_type == BUILTIN_INVITE {
            invite_payload()
        } else {
            vec![0u8; 16]
        };
        craft_schema(message_type, 0, 1, &payload)
    }

    pub(crate) fn run_clean_handshake(link: &Link) {
        for msg in [
            BUILTIN_INVITE,
            BUILTIN_ACK,
            BUILTIN_CODE_GENERATION_ACK,
            BUILTIN_PAIRING_ACK,
            BUILTIN_INVITE,
            BUILTIN_ACK,
            BUILTIN_CODE_GENERATION_ACK,
            BUILTIN_PAIRING_ACK,
        ] {
            deliver(link, TOPIC_HOSTINFO_ADV, &hostinfo_in(msg));
        }
    }

    #[test]
    fn test_unknown_topic_dropped() {
        let (link, transport, _rx) = make_link();
        deliver(&link, TOPIC_CAMERA_STREAM, &[0u8; 16]);
        assert!(transport.sent().is_empty());
        assert_eq!(link.pairing_state(), PairingState::WaitFirst);
    }

    #[test]
    fn test_pose_before_paired_forces_restart() {
        let (link, transport, rx) = make_link();
        deliver(&link, TOPIC_POSE, &[0u8; 16]);

        let trace = sent_trace(&transport);
        assert!(trace.contains(&(TOPIC_HOSTINFO_ADV, BUILTIN_BYE)));
        assert_eq!(transport.reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(link.pairing_state(), PairingState::WaitFirst);
        assert!(rx.try_iter().any(|e| matches!(e, HostEvent::SessionReset)));
    }

    #[test]
    fn test_reader_reopens_invalid_transport_after_stall() {
        let (link, transport, _rx) = make_link();
        transport.invalidate();
        // Stall: last_read_ns stays 0 while the clock advances.
        std::thread::sleep(Duration::from_millis(5));
        link.last_read_ns.store(link.now_ns() - 2 * STALL_TIMEOUT_NS, Ordering::Relaxed);

        let mut framer = FrameReader::new();
        let mut buf = [0u8; 1024];
        link.reader_tick(&mut framer, &mut buf);

        assert_eq!(transport.reconnects.load(Ordering::Relaxed), 1);
        assert!(transport.is_valid());
        assert_eq!(link.pairing_state(), PairingState::WaitFirst);
    }

    #[test]
    fn test_writer_sends_bye_on_valid_stall() {
        let (link, transport, _rx) = make_link();
        link.last_read_ns.store(link.now_ns() - 2 * STALL_TIMEOUT_NS, Ordering::Relaxed);
        link.writer_tick();
        let trace = sent_trace(&transport);
        assert_eq!(trace, vec![(TOPIC_HOSTINFO_ADV, BUILTIN_BYE)]);
    }

    #[test]
    fn test_disconnect_drains_pipeline() {
        let (link, transport, _rx) = make_link();
        run_clean_handshake(&link);
        link.video.set_ready(true);
        link.video.start_encode(0, 0, 1);
        link.video.send_idr(0, 0, &[1, 2, 3]);
        link.video.flush_stream(0, 0, 1);
        assert!(link.video.select_ready().is_some());

        transport.invalidate();
        link.handle_disconnect();
        assert_eq!(link.pairing_state(), PairingState::WaitFirst);
        assert!(link.video.select_ready().is_none());
        assert!(!link.video.is_ready());
    }

    fn encode_test_frame(link: &Link, index: usize, target_ns: i64, with_csd: bool) {
        link.video.start_encode(index, 0, target_ns);
        if with_csd {
            link.video.send_csd(index, 0, &[0xC5; 8]);
        }
        link.video.send_idr(index, 0, &[0x1D; 24]);
        link.video.flush_stream(index, 0, target_ns);
    }

    fn slice_frames(transport: &MemoryTransport) -> Vec<Vec<u8>> {
        let mut framer = FrameReader::new();
        let mut out = Vec::new();
        for buf in transport.sent() {
            framer.feed(&buf, 0, &mut |pkt| {
                if pkt.topic == TOPIC_SLICE_0 {
                    out.push(pkt.into_payload());
                }
            });
        }
        out
    }

    #[test]
    fn test_keyframe_first_rule() {
        let (link, transport, _rx) = make_link();
        run_clean_handshake(&link);
        link.video.set_ready(true);
        transport.clear_sent();

        // A delta frame before any keyframe is suppressed.
        encode_test_frame(&link, 0, 100, false);
        link.try_send_frame();
        assert!(slice_frames(&transport).is_empty());

        // The keyframe goes out, with the CSD bit set in its header.
        encode_test_frame(&link, 1, 200, true);
        link.try_send_frame();
        let frames = slice_frames(&transport);
        // Preamble, header segment, CSD bytes, IDR bytes.
        assert_eq!(frames.len(), 4);
        let header = SliceHeader::decode(&frames[1]).unwrap();
        assert!(header.flags.contains(crate::messages::SliceFlags::CSD_PRESENT));
        assert!(header.csd_size > 0);

        // Delta frames flow afterwards.
        transport.clear_sent();
        encode_test_frame(&link, 2, 300, false);
        link.try_send_frame();
        let frames = slice_frames(&transport);
        assert_eq!(frames.len(), 3);
        let header = SliceHeader::decode(&frames[1]).unwrap();
        assert!(!header.flags.contains(crate::messages::SliceFlags::CSD_PRESENT));
    }

    #[test]
    fn test_frame_gate_opens_after_delay() {
        let (link, _transport, _rx) = make_link();
        run_clean_handshake(&link);
        assert!(!link.video.is_ready());
        // Pretend pairing happened over a second ago.
        link.paired_ns.store(link.now_ns() - READY_DELAY_NS - 1, Ordering::Relaxed);
        link.writer_tick();
        assert!(link.video.is_ready());
    }

    #[test]
    fn test_paired_writer_pings() {
        let (link, transport, _rx) = make_link();
        run_clean_handshake(&link);
        link.last_read_ns.store(link.now_ns(), Ordering::Relaxed);
        transport.clear_sent();
        link.writer_tick();
        let trace = sent_trace(&transport);
        assert!(trace.contains(&(TOPIC_HOSTINFO_ADV, BUILTIN_ECHO)));
    }

    #[test]
    fn test_pose_updates_hmd_and_emits_event() {
        let (link, _transport, rx) = make_link();
        run_clean_handshake(&link);
        while rx.try_recv().is_ok() {}

        let pose = PosePayload {
            pose: crate::types::Pose {
                orientation: [0.0, 0.0, 0.0, 1.0],
                position: [0.0, 1.7, 0.0],
            },
            linear_velocity: [0.0; 3],
            linear_acceleration: [0.0; 3],
            angular_velocity: [0.0; 3],
            angular_acceleration: [0.0; 3],
            timestamp: 1_000_000,
            ipd_meters: 0.063,
        };
        let body = pose.encode();
        let mut preamble = 1u32.to_le_bytes().to_vec();
        preamble.extend_from_slice(&((body.len() / 8) as u32).to_le_bytes());
        deliver(&link, TOPIC_POSE, &preamble);
        deliver(&link, TOPIC_POSE, &body);

        assert!(rx.try_iter().any(|e| matches!(e, HostEvent::HeadPose(_))));
        let (got, _) = link.hmd.pose_at(0);
        assert_eq!(got.position[1], 1.7);
    }

    #[test]
    fn test_device_logs_forwarded() {
        let (link, _transport, rx) = make_link();
        run_clean_handshake(&link);
        while rx.try_recv().is_ok() {}

        let payload = LoggingPayload {
            entries: vec![(DeviceLogLevel::Info, "Frame 74 decoded".into())],
        };
        deliver(&link, TOPIC_LOGGING, &payload.encode());
        assert!(rx.try_iter().any(|e| matches!(
            e,
            HostEvent::DeviceLog { level: DeviceLogLevel::Info, .. }
        )));
    }

    #[test]
    fn test_echo_ping_gets_pong() {
        let (link, transport, _rx) = make_link();
        let ping = EchoPayload {
            org: 0,
            recv: 0,
            xmt: 12345,
            offset: 0,
        };
        deliver(
            &link,
            TOPIC_HOSTINFO_ADV,
            &hostinfo::craft_echo(ECHO_PING, 1, &ping),
        );

        let mut framer = FrameReader::new();
        let mut pong = None;
        for buf in transport.sent() {
            framer.feed(&buf, 0, &mut |pkt| {
                if pkt.topic == TOPIC_HOSTINFO_ADV {
                    let msg = HostInfoMsg::parse(&pkt).unwrap();
                    if msg.message_type == BUILTIN_ECHO && msg.result & 1 == ECHO_PONG {
                        pong = Some(EchoPayload::parse(msg.payload()).unwrap());
                    }
                }
            });
        }
        let pong = pong.expect("no pong sent");
        assert_eq!(pong.org, 12345);
    }
}
