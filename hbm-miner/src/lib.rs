//! Control-plane driver for HBM FPGA ethash accelerators.
//!
//! Each board is reached through a [`transport::RegisterTransport`]. The
//! [`fpga`] module owns everything that happens on the board: DAG
//! generation, voltage and clock control, the nonce search and telemetry.
//! A [`worker::Worker`] drives one board from a [`worker::WorkSource`], and
//! the [`daemon::Daemon`] ties the workers to the process lifecycle.

pub mod config;
pub mod daemon;
pub mod dummy;
pub mod error;
pub mod fpga;
pub mod hashrate;
pub mod tracing;
pub mod transport;
pub mod tuner;
pub mod types;
pub mod u256;
pub mod worker;
