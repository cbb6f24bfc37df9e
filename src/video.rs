//! Triple-buffered, multi-slice video pipeline.
//!
//! The external encoder pushes CSD and IDR bytes per `(frame index, slice)`
//! slot through the [`EncoderSink`] half; the writer thread drains whole
//! frames through the selection half. Each slot has its own lock and a
//! condition variable the writer signals when it finishes draining, which
//! is what `start_encode` blocks on when the pipeline is backed up.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::clock::SessionClock;
use crate::hmd::HmdSource;
use crate::messages::{SliceFlags, SliceHeader};
use crate::types::Pose;

/// Frames in flight per slice.
pub const SWAPCHAIN_DEPTH: usize = 3;

/// Upper bound on the configurable slice count.
pub const MAX_SLICES: usize = 4;

/// Per-buffer cap; appends past this are dropped with a pipeline error.
pub const STREAM_BUFFER_MAX: usize = 0x100_0000;

/// Consecutive pipeline faults tolerated before the whole pipeline resets.
const FAULT_RESET_THRESHOLD: u32 = 8;

/// Interface the external video encoder drives, in strict per-slot order:
/// `start_encode`, zero or more `send_csd`, one or more `send_idr`, then
/// `flush_stream`.
pub trait EncoderSink: Send + Sync {
    /// Blocks while the slot still holds an undrained frame, then captures
    /// the HMD pose for `target_ns` into the slot.
    fn start_encode(&self, index: usize, slice: usize, target_ns: i64);
    fn send_csd(&self, index: usize, slice: usize, data: &[u8]);
    fn send_idr(&self, index: usize, slice: usize, data: &[u8]);
    /// Finalizes the slot and hands it to the writer.
    fn flush_stream(&self, index: usize, slice: usize, target_ns: i64);
}

#[derive(Default)]
struct SlotState {
    csd: Vec<u8>,
    idr: Vec<u8>,
    needs_flush: bool,
    stream_started_ns: i64,
    encode_started_ns: i64,
    encode_done_ns: i64,
    tx_started_ns: i64,
    tx_done_ns: i64,
    pose: Pose,
    pose_ns: i64,
}

impl SlotState {
    fn clear(&mut self) {
        self.csd.clear();
        self.idr.clear();
        self.needs_flush = false;
    }
}

struct Slot {
    state: Mutex<SlotState>,
    drained: Condvar,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            state: Mutex::new(SlotState::default()),
            drained: Condvar::new(),
        }
    }
}

/// Everything the writer copies out of a slot to transmit one slice.
pub struct SliceTx {
    pub csd: Vec<u8>,
    pub idr: Vec<u8>,
    pub encode_done_ns: i64,
}

/// Row-wide data read from slice 0, authoritative for the whole frame.
#[derive(Debug, Clone, Copy)]
pub struct RowInfo {
    pub pose: Pose,
    pub pose_ns: i64,
    pub encode_started_ns: i64,
    pub tx_started_ns: i64,
    pub stream_started_ns: i64,
}

pub struct VideoPipeline {
    slots: Vec<Slot>,
    num_slices: usize,
    clock: SessionClock,
    hmd: Arc<dyn HmdSource>,
    ready_to_send: AtomicBool,
    sent_first_frame: AtomicBool,
    frame_idx: AtomicU64,
    fault_count: AtomicU32,
}

impl VideoPipeline {
    pub fn new(num_slices: usize, hmd: Arc<dyn HmdSource>, clock: SessionClock) -> VideoPipeline {
        let num_slices = num_slices.clamp(1, MAX_SLICES);
        VideoPipeline {
            slots: (0..num_slices * SWAPCHAIN_DEPTH).map(|_| Slot::new()).collect(),
            num_slices,
            clock,
            hmd,
            ready_to_send: AtomicBool::new(false),
            sent_first_frame: AtomicBool::new(false),
            frame_idx: AtomicU64::new(0),
            fault_count: AtomicU32::new(0),
        }
    }

    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    fn slot(&self, slice: usize, index: usize) -> &Slot {
        &self.slots[slice * SWAPCHAIN_DEPTH + index]
    }

    /// Gate frame emission. Turning the gate on clears every slot and
    /// re-arms the keyframe-first rule; turning it off just pauses.
    pub fn set_ready(&self, ready: bool) {
        if ready {
            self.drain();
            self.sent_first_frame.store(false, Ordering::SeqCst);
        }
        self.ready_to_send.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready_to_send.load(Ordering::SeqCst)
    }

    /// Clear all slots and wake any encoder threads parked on them
    /// (disconnect and session-reset path).
    pub fn drain(&self) {
        for slot in &self.slots {
            slot.state.lock().clear();
            slot.drained.notify_all();
        }
    }

    /// The first frame of a (re)paired session must carry CSD.
    pub fn needs_keyframe(&self) -> bool {
        !self.sent_first_frame.load(Ordering::SeqCst)
    }

    pub fn mark_first_frame_sent(&self) {
        self.sent_first_frame.store(true, Ordering::SeqCst);
    }

    pub fn frame_idx(&self) -> u64 {
        self.frame_idx.load(Ordering::SeqCst)
    }

    pub fn advance_frame(&self) {
        self.frame_idx.fetch_add(1, Ordering::SeqCst);
        self.fault_count.store(0, Ordering::Relaxed);
    }

    /// Record an encoder-contract fault; a run of them resets the pipeline.
    fn note_fault(&self) {
        let faults = self.fault_count.fetch_add(1, Ordering::Relaxed) + 1;
        if faults >= FAULT_RESET_THRESHOLD {
            log::error!("{} consecutive pipeline faults, resetting pipeline", faults);
            self.drain();
            self.fault_count.store(0, Ordering::Relaxed);
        }
    }

    /// Pick the oldest frame index whose every slice is flushed and ready.
    pub fn select_ready(&self) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        for index in 0..SWAPCHAIN_DEPTH {
            let all_ready = (0..self.num_slices).all(|s| self.slot(s, index).state.lock().needs_flush);
            if !all_ready {
                continue;
            }
            let started = self.slot(0, index).state.lock().stream_started_ns;
            if best.map(|(_, b)| started < b).unwrap_or(true) {
                best = Some((index, started));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Slice-0 data applied to every slice of the frame.
    pub fn row_info(&self, index: usize) -> RowInfo {
        let st = self.slot(0, index).state.lock();
        RowInfo {
            pose: st.pose,
            pose_ns: st.pose_ns,
            encode_started_ns: st.encode_started_ns,
            tx_started_ns: st.tx_started_ns,
            stream_started_ns: st.stream_started_ns,
        }
    }

    /// Take a flushed slot's buffers for transmission, stamping its
    /// transmission start time. The slot stays blocked for the encoder
    /// until [`VideoPipeline::finish_slice_tx`] returns the buffers.
    pub fn begin_slice_tx(&self, index: usize, slice: usize) -> Option<SliceTx> {
        let mut st = self.slot(slice, index).state.lock();
        if !st.needs_flush {
            return None;
        }
        st.tx_started_ns = self.clock.now_ns();
        Some(SliceTx {
            csd: std::mem::take(&mut st.csd),
            idr: std::mem::take(&mut st.idr),
            encode_done_ns: st.encode_done_ns,
        })
    }

    /// Return a slot's buffers (capacity preserved), clear its flush flag
    /// under the slot lock, and wake the encoder.
    pub fn finish_slice_tx(&self, index: usize, slice: usize, mut tx: SliceTx) {
        let slot = self.slot(slice, index);
        {
            let mut st = slot.state.lock();
            tx.csd.clear();
            tx.idr.clear();
            st.csd = tx.csd;
            st.idr = tx.idr;
            st.needs_flush = false;
            st.tx_done_ns = self.clock.now_ns();
        }
        slot.drained.notify_all();
    }
}

impl EncoderSink for VideoPipeline {
    fn start_encode(&self, index: usize, slice: usize, target_ns: i64) {
        let slot = self.slot(slice, index);
        let mut st = slot.state.lock();
        while st.needs_flush {
            slot.drained.wait(&mut st);
        }
        st.encode_started_ns = self.clock.now_ns();
        let (pose, _) = self.hmd.pose_at(target_ns);
        st.pose = pose;
        st.pose_ns = target_ns;
    }

    fn send_csd(&self, index: usize, slice: usize, data: &[u8]) {
        let slot = self.slot(slice, index);
        let mut st = slot.state.lock();
        while st.needs_flush {
            slot.drained.wait(&mut st);
        }
        if st.csd.len() + data.len() > STREAM_BUFFER_MAX {
            log::error!("csd buffer overflow on slot ({}, {}), dropping {} bytes", index, slice, data.len());
            drop(st);
            self.note_fault();
            return;
        }
        st.csd.extend_from_slice(data);
    }

    fn send_idr(&self, index: usize, slice: usize, data: &[u8]) {
        let slot = self.slot(slice, index);
        let mut st = slot.state.lock();
        while st.needs_flush {
            slot.drained.wait(&mut st);
        }
        if st.idr.len() + data.len() > STREAM_BUFFER_MAX {
            log::error!("idr buffer overflow on slot ({}, {}), dropping {} bytes", index, slice, data.len());
            drop(st);
            self.note_fault();
            return;
        }
        st.idr.extend_from_slice(data);
    }

    fn flush_stream(&self, index: usize, slice: usize, target_ns: i64) {
        if !self.is_ready() {
            return;
        }
        let slot = self.slot(slice, index);
        let mut st = slot.state.lock();
        st.encode_done_ns = self.clock.now_ns();
        if !st.csd.is_empty() || !st.idr.is_empty() {
            st.needs_flush = true;
            st.stream_started_ns = target_ns;
        }
    }
}

/// Build the schema header for one slice, deriving the headset's deadline
/// plan from the row's encode timing.
#[allow(clippy::too_many_arguments)]
pub fn build_slice_header(
    frame_idx: u64,
    slice: usize,
    num_slices: usize,
    encode_height: u32,
    fps: u32,
    mesh_id: u32,
    row: &RowInfo,
    tx: &SliceTx,
    to_target: impl Fn(i64) -> i64,
) -> SliceHeader {
    let mut flags = SliceFlags::empty();
    if !tx.csd.is_empty() {
        flags |= SliceFlags::CSD_PRESENT;
    }
    if slice == num_slices - 1 {
        flags |= SliceFlags::LAST_SLICE;
    }

    let pred_delta = tx.encode_done_ns - row.encode_started_ns;
    let base = to_target(row.encode_started_ns);
    let duration_a = 1_000_000_000 / fps.max(1) as i64;
    let duration_c = pred_delta;
    let duration_b = duration_a + duration_c;

    SliceHeader {
        frame_idx: frame_idx as u32,
        rectify_mesh_id: mesh_id,
        pose: row.pose,
        pose_timestamp: to_target(row.pose_ns),
        slice_num: slice as u32,
        flags,
        blit_y_pos: (encode_height / num_slices as u32) * slice as u32,
        crop_blocks: encode_height / 16 / num_slices as u32,
        csd_size: tx.csd.len() as u32,
        video_size: tx.idr.len() as u32,
        pipeline_pred_delta: pred_delta,
        timestamp_09: to_target(row.tx_started_ns) - pred_delta,
        timestamp_0d: base + duration_a,
        timestamp_0c: base + duration_a + duration_b,
        timestamp_0b: base + duration_a + duration_b + duration_c,
    }
}
