//! Bulk USB transport.
//!
//! One claimed interface, first OUT and first IN bulk endpoint. Link speed
//! maps to a `slow_link` flag consumers use to halve render resolution and
//! cap refresh rate.

use std::time::Duration;

use parking_lot::Mutex;
use rusb::{Direction, TransferType, UsbContext};

use crate::error::XrspError;
use crate::Result;

/// Byte-stream transport under the topic framer.
///
/// `recv` returns `Ok(0)` on a poll timeout; fatal conditions surface as
/// errors and flip the transport invalid until `reconnect` succeeds.
pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<()>;
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    /// Close and reopen the device, optionally issuing a device-level reset
    /// first. On success the transport is valid again.
    fn reconnect(&self, reset: bool) -> Result<()>;
    fn is_valid(&self) -> bool;
    fn invalidate(&self);
    /// True for links at or below USB high speed.
    fn slow_link(&self) -> bool;
}

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_RETRIES: usize = 10;
const RESET_RETRY_DELAY: Duration = Duration::from_millis(500);

struct Endpoints {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    ep_in: u8,
    ep_out: u8,
}

/// rusb-backed bulk transport for the headset link.
pub struct UsbTransport {
    vid: u16,
    pid: u16,
    if_num: u8,
    inner: Mutex<Option<Endpoints>>,
    valid: std::sync::atomic::AtomicBool,
    slow: std::sync::atomic::AtomicBool,
}

impl UsbTransport {
    /// Open the headset at `(vid, pid)` and claim `if_num`.
    pub fn open(vid: u16, pid: u16, if_num: u8) -> Result<UsbTransport> {
        let transport = UsbTransport {
            vid,
            pid,
            if_num,
            inner: Mutex::new(None),
            valid: std::sync::atomic::AtomicBool::new(false),
            slow: std::sync::atomic::AtomicBool::new(false),
        };
        transport.open_device()?;
        Ok(transport)
    }

    fn open_device(&self) -> Result<()> {
        let devices = rusb::GlobalContext::default().devices()?;
        let device = devices
            .iter()
            .find(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == self.vid && desc.product_id() == self.pid)
                    .unwrap_or(false)
            })
            .ok_or(XrspError::DeviceNotFound)?;

        let handle = device.open()?;
        handle.claim_interface(self.if_num)?;

        // First OUT then first IN bulk endpoint on the claimed interface.
        let config = device.active_config_descriptor()?;
        let mut ep_in = 0u8;
        let mut ep_out = 0u8;
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                if desc.interface_number() != self.if_num {
                    continue;
                }
                for ep in desc.endpoint_descriptors() {
                    if ep.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::Out if ep_out == 0 => ep_out = ep.address(),
                        Direction::In if ep_in == 0 => ep_in = ep.address(),
                        _ => {}
                    }
                }
            }
        }
        if ep_in == 0 || ep_out == 0 {
            return Err(XrspError::Protocol(format!(
                "interface {} has no bulk endpoint pair",
                self.if_num
            )));
        }

        let slow = !matches!(device.speed(), rusb::Speed::Super | rusb::Speed::SuperPlus);
        if slow {
            log::warn!("headset link is at or below 480 Mbit/s, reducing stream quality");
        } else {
            log::info!("headset link is SuperSpeed");
        }

        handle.clear_halt(ep_in).ok();
        handle.clear_halt(ep_out).ok();

        self.slow.store(slow, std::sync::atomic::Ordering::Relaxed);
        *self.inner.lock() = Some(Endpoints { handle, ep_in, ep_out });
        self.valid.store(true, std::sync::atomic::Ordering::Relaxed);
        log::info!("claimed interface {} (in {:#04x}, out {:#04x})", self.if_num, ep_in, ep_out);
        Ok(())
    }

    fn on_io_error(&self, err: rusb::Error) -> XrspError {
        match err {
            rusb::Error::NoDevice => {
                self.invalidate();
                XrspError::NoDevice
            }
            rusb::Error::Timeout => XrspError::Timeout,
            other => other.into(),
        }
    }
}

impl Transport for UsbTransport {
    fn send(&self, data: &[u8]) -> Result<()> {
        let guard = self.inner.lock();
        let ep = guard.as_ref().ok_or(XrspError::NoDevice)?;
        match ep.handle.write_bulk(ep.ep_out, data, SEND_TIMEOUT) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                log::error!("short bulk write: {} of {} bytes", n, data.len());
                self.valid.store(false, std::sync::atomic::Ordering::Relaxed);
                Err(XrspError::NoDevice)
            }
            Err(e) => {
                log::error!("bulk write of {} bytes failed: {}", data.len(), e);
                if matches!(e, rusb::Error::NoDevice | rusb::Error::Timeout) {
                    self.valid.store(false, std::sync::atomic::Ordering::Relaxed);
                }
                Err(self.on_io_error(e))
            }
        }
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let guard = self.inner.lock();
        let ep = guard.as_ref().ok_or(XrspError::NoDevice)?;
        match ep.handle.read_bulk(ep.ep_in, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(self.on_io_error(e)),
        }
    }

    fn reconnect(&self, reset: bool) -> Result<()> {
        log::info!("(re)initializing headset USB device (reset: {})", reset);
        self.valid.store(false, std::sync::atomic::Ordering::Relaxed);

        if let Some(ep) = self.inner.lock().take() {
            if reset {
                match ep.handle.reset() {
                    Ok(()) => {}
                    Err(rusb::Error::NotFound) => {
                        // The device fell off the bus and will re-enumerate.
                        log::info!("device needs re-enumeration");
                    }
                    Err(e) => log::warn!("device reset failed: {}", e),
                }
            }
            // Handle drops here, releasing the interface.
        }

        let mut last_err = XrspError::DeviceNotFound;
        for attempt in 1..=RESET_RETRIES {
            match self.open_device() {
                Ok(()) => {
                    if attempt > 1 {
                        log::info!("reopened headset (attempt {})", attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("reopen attempt {}/{} failed: {}", attempt, RESET_RETRIES, e);
                    last_err = e;
                    std::thread::sleep(RESET_RETRY_DELAY);
                }
            }
        }
        log::error!("failed to reopen headset after {} attempts", RESET_RETRIES);
        Err(last_err)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn invalidate(&self) {
        self.valid.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    fn slow_link(&self) -> bool {
        self.slow.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Some(ep) = self.inner.lock().take() {
            ep.handle.release_interface(self.if_num).ok();
        }
    }
}

/// List `(bus, address)` pairs of devices matching `(vid, pid)`.
pub fn enumerate(vid: u16, pid: u16) -> Result<Vec<(u8, u8)>> {
    let devices = rusb::GlobalContext::default().devices()?;
    Ok(devices
        .iter()
        .filter(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
                .unwrap_or(false)
        })
        .map(|d| (d.bus_number(), d.address()))
        .collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory transport: records outbound transfers, serves queued
    /// inbound chunks, and can simulate disconnects.
    pub struct MemoryTransport {
        pub outbound: Mutex<Vec<Vec<u8>>>,
        pub inbound: Mutex<VecDeque<Vec<u8>>>,
        valid: std::sync::atomic::AtomicBool,
        slow: std::sync::atomic::AtomicBool,
        pub reconnects: std::sync::atomic::AtomicUsize,
    }

    impl MemoryTransport {
        pub fn new() -> MemoryTransport {
            MemoryTransport {
                outbound: Mutex::new(Vec::new()),
                inbound: Mutex::new(VecDeque::new()),
                valid: std::sync::atomic::AtomicBool::new(true),
                slow: std::sync::atomic::AtomicBool::new(false),
                reconnects: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.outbound.lock().clone()
        }

        pub fn clear_sent(&self) {
            self.outbound.lock().clear();
        }

        pub fn queue_inbound(&self, chunk: Vec<u8>) {
            self.inbound.lock().push_back(chunk);
        }

        pub fn set_slow(&self, slow: bool) {
            self.slow.store(slow, std::sync::atomic::Ordering::Relaxed);
        }
    }

    impl Transport for MemoryTransport {
        fn send(&self, data: &[u8]) -> Result<()> {
            if !self.is_valid() {
                return Err(XrspError::NoDevice);
            }
            self.outbound.lock().push(data.to_vec());
            Ok(())
        }

        fn recv(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            if !self.is_valid() {
                return Err(XrspError::NoDevice);
            }
            match self.inbound.lock().pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn reconnect(&self, _reset: bool) -> Result<()> {
            self.reconnects.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.valid.store(true, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }

        fn is_valid(&self) -> bool {
            self.valid.load(std::sync::atomic::Ordering::Relaxed)
        }

        fn invalidate(&self) {
            self.valid.store(false, std::sync::atomic::Ordering::Relaxed);
        }

        fn slow_link(&self) -> bool {
            self.slow.load(std::sync::atomic::Ordering::Relaxed)
        }
    }
}
