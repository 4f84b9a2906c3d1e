//! In-memory board simulation.
//!
//! Implements [`RegisterTransport`] over a register file with just enough
//! device behaviour for the driver to run end to end: the light-cache and
//! DAG generators report completion as soon as they are triggered, the PLL
//! is always locked, and counters can be set to advance on every read.
//! Every write, bulk write and copy is recorded so tests can assert on the
//! exact register traffic. Failures can be injected per address.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Connector, InterruptWait, RegisterTransport, Result, TransportError};
use crate::config::Endpoint;
use crate::fpga::regs;
use crate::tracing::prelude::*;

/// Recorded `write_bulk` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWrite {
    pub addr: u32,
    pub bytes: Vec<u8>,
    pub endian_flip: bool,
}

/// Recorded `copy_device_to_device` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCopy {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
}

#[derive(Default)]
struct SimState {
    regs: HashMap<u32, u32>,
    scripted: HashMap<u32, VecDeque<u32>>,
    advance: HashMap<u32, u32>,
    read_failures: HashSet<u32>,
    write_failures: HashSet<u32>,
    read_counts: HashMap<u32, usize>,
    writes: Vec<(u32, u32)>,
    bulk_writes: Vec<BulkWrite>,
    host_copies: Vec<(u64, usize)>,
    host_copy_failures: HashMap<u64, usize>,
    device_copies: Vec<DeviceCopy>,
    device_copy_fail_at: Option<usize>,
    nonces: VecDeque<u64>,
    nonce_every: Option<u32>,
    waits: u32,
    interrupt_error: bool,
    hold_completion: bool,
    interrupt_mask: u32,
    timeout: Option<Duration>,
    connected: bool,
}

/// Handle to a simulated board. Clones share the same device, which lets a
/// test inspect the board while the driver owns its own handle.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
    irq: Arc<Notify>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A healthy board at a 500MHz core clock (2000MHz VCO, divisor 4).
    pub fn new() -> Self {
        let mut state = SimState {
            connected: true,
            ..Default::default()
        };
        state.regs.extend([
            (regs::DEVICE_TYPE, u32::from_be_bytes(*b"HBM1")),
            (regs::BITSTREAM_VERSION, 0x0302_0001),
            (regs::IDENTITY_LO, 0x4000_1234),
            (regs::IDENTITY_MID, 0x0123_4567),
            (regs::IDENTITY_HI, 0x89ab_cdef),
            (regs::PLL_VCO, 0x0000_0a01),
            (regs::PLL_CLK0, 0x0000_0004),
            (regs::PLL_STATUS, 0x1),
            (regs::SYSMON_TEMP, 42_533),
            (regs::SYSMON_SUPPLY, 18_568),
            (regs::STACK_HEALTH, 0x3 | (45 << 3) | (46 << 11)),
        ]);
        state.advance.insert(regs::STALL_COUNT, 1);
        Self {
            state: Arc::new(Mutex::new(state)),
            irq: Arc::new(Notify::new()),
        }
    }

    /// A board that also produces hashrate and the occasional nonce, for
    /// running the daemon without hardware.
    pub fn mining() -> Self {
        let dev = Self::new();
        dev.advance_on_read(regs::TARGET_CHECKS_LO, 250_000);
        dev.state().nonce_every = Some(50);
        dev
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_register(&self, addr: u32, value: u32) {
        self.state().regs.insert(addr, value);
    }

    pub fn register(&self, addr: u32) -> u32 {
        self.state().regs.get(&addr).copied().unwrap_or(0)
    }

    /// Return `values` from successive reads of `addr` before falling back
    /// to the register file.
    pub fn script_reads(&self, addr: u32, values: impl IntoIterator<Item = u32>) {
        self.state()
            .scripted
            .entry(addr)
            .or_default()
            .extend(values);
    }

    /// Add `step` to the register after each read of it.
    pub fn advance_on_read(&self, addr: u32, step: u32) {
        self.state().advance.insert(addr, step);
    }

    pub fn stop_advancing(&self, addr: u32) {
        self.state().advance.remove(&addr);
    }

    pub fn fail_reads(&self, addr: u32) {
        self.state().read_failures.insert(addr);
    }

    pub fn fail_writes(&self, addr: u32) {
        self.state().write_failures.insert(addr);
    }

    /// Fail the next `times` host copies targeting `addr`.
    pub fn fail_host_copy(&self, addr: u64, times: usize) {
        self.state().host_copy_failures.insert(addr, times);
    }

    /// Fail the device-to-device copy with this zero-based index.
    pub fn fail_device_copy_at(&self, index: usize) {
        self.state().device_copy_fail_at = Some(index);
    }

    /// Keep generator status bits clear after a trigger.
    pub fn hold_completion(&self) {
        self.state().hold_completion = true;
    }

    pub fn fail_interrupts(&self) {
        self.state().interrupt_error = true;
    }

    /// Queue a candidate nonce to be delivered by the next interrupt wait.
    pub fn push_nonce(&self, nonce: u64) {
        self.state().nonces.push_back(nonce);
        self.irq.notify_one();
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state().writes.clone()
    }

    /// Values written to one address, in order.
    pub fn writes_to(&self, addr: u32) -> Vec<u32> {
        self.state()
            .writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn read_count(&self, addr: u32) -> usize {
        self.state().read_counts.get(&addr).copied().unwrap_or(0)
    }

    pub fn bulk_writes(&self) -> Vec<BulkWrite> {
        self.state().bulk_writes.clone()
    }

    pub fn host_copies(&self) -> Vec<(u64, usize)> {
        self.state().host_copies.clone()
    }

    pub fn device_copies(&self) -> Vec<DeviceCopy> {
        self.state().device_copies.clone()
    }

    pub fn interrupt_mask(&self) -> u32 {
        self.state().interrupt_mask
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state().timeout
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Forget recorded traffic, keeping register contents.
    pub fn clear_log(&self) {
        let mut st = self.state();
        st.writes.clear();
        st.bulk_writes.clear();
        st.host_copies.clear();
        st.device_copies.clear();
        st.read_counts.clear();
    }

    // Generator side effects of a register write.
    fn apply_write(st: &mut SimState, addr: u32, value: u32) {
        st.regs.insert(addr, value);
        let complete = !st.hold_completion;
        match (addr, value) {
            (regs::CACHE_CONTROL, regs::CACHE_START) if complete => {
                st.regs.insert(regs::CACHE_CONTROL, regs::CACHE_DONE);
            }
            (regs::DAG_CONTROL, regs::DAG_START) if complete => {
                st.regs.insert(regs::DAG_CONTROL, regs::DAG_DONE);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RegisterTransport for SimDevice {
    async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.state().timeout = Some(timeout);
        Ok(())
    }

    async fn enable_interrupts(&self, mask: u32) -> Result<()> {
        self.state().interrupt_mask |= mask;
        Ok(())
    }

    async fn read32(&self, addr: u32) -> Result<u32> {
        let mut st = self.state();
        *st.read_counts.entry(addr).or_default() += 1;
        if st.read_failures.contains(&addr) {
            return Err(TransportError::Io(format!("read 0x{:04x} failed", addr)));
        }
        if let Some(v) = st.scripted.get_mut(&addr).and_then(|q| q.pop_front()) {
            return Ok(v);
        }
        let value = st.regs.get(&addr).copied().unwrap_or(0);
        if let Some(step) = st.advance.get(&addr).copied() {
            st.regs.insert(addr, value.wrapping_add(step));
        }
        Ok(value)
    }

    async fn write32(&self, value: u32, addr: u32, _verify: bool) -> Result<()> {
        let mut st = self.state();
        if st.write_failures.contains(&addr) {
            return Err(TransportError::Io(format!("write 0x{:04x} failed", addr)));
        }
        trace!(addr = format_args!("0x{:04x}", addr), value = format_args!("0x{:08x}", value), "sim write");
        st.writes.push((addr, value));
        Self::apply_write(&mut st, addr, value);
        Ok(())
    }

    async fn write_bulk(&self, bytes: &[u8], addr: u32, endian_flip: bool) -> Result<()> {
        let mut st = self.state();
        if st.write_failures.contains(&addr) {
            return Err(TransportError::Io(format!("bulk write 0x{:04x} failed", addr)));
        }
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            let value = if endian_flip {
                u32::from_be_bytes(word)
            } else {
                u32::from_le_bytes(word)
            };
            st.regs.insert(addr + 4 * i as u32, value);
        }
        st.bulk_writes.push(BulkWrite {
            addr,
            bytes: bytes.to_vec(),
            endian_flip,
        });
        Ok(())
    }

    async fn copy_from_host(&self, bytes: &[u8], addr: u64) -> Result<()> {
        let mut st = self.state();
        if let Some(left) = st.host_copy_failures.get_mut(&addr) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Timeout);
            }
        }
        st.host_copies.push((addr, bytes.len()));
        Ok(())
    }

    async fn copy_device_to_device(&self, src: u64, dst: u64, len: u64) -> Result<()> {
        let mut st = self.state();
        if st.device_copy_fail_at == Some(st.device_copies.len()) {
            return Err(TransportError::Io("copy engine fault".into()));
        }
        st.device_copies.push(DeviceCopy { src, dst, len });
        Ok(())
    }

    async fn wait_for_interrupt(&self, _mask: u32, timeout: Duration) -> Result<InterruptWait> {
        {
            let mut st = self.state();
            if st.interrupt_error {
                return Err(TransportError::Disconnected);
            }
            st.waits = st.waits.wrapping_add(1);
            if let Some(every) = st.nonce_every {
                if st.waits % every == 0 {
                    let lo = st.regs.get(&regs::START_NONCE_LO).copied().unwrap_or(0) as u64;
                    let hi = st.regs.get(&regs::START_NONCE_HI).copied().unwrap_or(0) as u64;
                    let nonce = ((hi << 32) | lo).wrapping_add(u64::from(st.waits));
                    st.nonces.push_back(nonce);
                }
            }
            if let Some(nonce) = st.nonces.pop_front() {
                return Ok(InterruptWait::Fired(nonce));
            }
        }

        let _ = tokio::time::timeout(timeout, self.irq.notified()).await;

        Ok(match self.state().nonces.pop_front() {
            Some(nonce) => InterruptWait::Fired(nonce),
            None => InterruptWait::TimedOut,
        })
    }

    async fn kick_interrupts(&self) {
        self.irq.notify_one();
    }

    async fn disconnect(&self) {
        self.state().connected = false;
    }
}

/// Hands out simulated boards.
///
/// By default every connection gets a fresh [`SimDevice::mining`] board; a
/// connector built with [`SimConnector::with_device`] always hands out
/// clones of that one device.
#[derive(Clone, Default)]
pub struct SimConnector {
    device: Option<SimDevice>,
    refuse: bool,
}

impl SimConnector {
    pub fn with_device(device: SimDevice) -> Self {
        Self {
            device: Some(device),
            refuse: false,
        }
    }

    /// A connector whose boards are all unreachable.
    pub fn refusing() -> Self {
        Self {
            device: None,
            refuse: true,
        }
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Transport = SimDevice;

    async fn connect(&self, endpoint: &Endpoint) -> Result<SimDevice> {
        if self.refuse {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        debug!(%endpoint, "connecting simulated board");
        Ok(self.device.clone().unwrap_or_else(SimDevice::mining))
    }
}
