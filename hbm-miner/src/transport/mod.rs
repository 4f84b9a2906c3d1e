//! Register transport contract.
//!
//! The wire protocol that carries register reads, writes, bulk copies and
//! interrupts to the board is implemented elsewhere; the driver only sees
//! these traits. Addresses below 4GiB are register space, the wider
//! `u64` addresses used by the copy primitives are HBM space.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::Endpoint;

pub mod sim;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("transaction timed out")]
    Timeout,

    #[error("disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outcome of a bounded interrupt wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptWait {
    /// The board raised the interrupt; payload is the candidate nonce.
    Fired(u64),
    /// Nothing arrived in time, or the wait was kicked.
    TimedOut,
}

/// Opens connections to boards.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: RegisterTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Transport>;
}

/// One open connection to a board.
///
/// Methods take `&self` so that [`kick_interrupts`](Self::kick_interrupts)
/// can run while another task is parked in
/// [`wait_for_interrupt`](Self::wait_for_interrupt). Serializing every other
/// call is the caller's job.
#[async_trait]
pub trait RegisterTransport: Send + Sync + 'static {
    async fn set_timeout(&self, timeout: Duration) -> Result<()>;

    async fn enable_interrupts(&self, mask: u32) -> Result<()>;

    async fn read32(&self, addr: u32) -> Result<u32>;

    /// Write a register, optionally reading it back to confirm.
    async fn write32(&self, value: u32, addr: u32, verify: bool) -> Result<()>;

    /// Write consecutive 32-bit registers from a byte buffer, swapping byte
    /// order within each word when `endian_flip` is set.
    async fn write_bulk(&self, bytes: &[u8], addr: u32, endian_flip: bool) -> Result<()>;

    async fn copy_from_host(&self, bytes: &[u8], addr: u64) -> Result<()>;

    async fn copy_device_to_device(&self, src: u64, dst: u64, len: u64) -> Result<()>;

    async fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> Result<InterruptWait>;

    /// Wake any task blocked in `wait_for_interrupt`.
    async fn kick_interrupts(&self);

    async fn disconnect(&self);
}
