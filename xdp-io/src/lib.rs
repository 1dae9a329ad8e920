//! xdp-io: kernel-bypass UDP packet I/O over AF_XDP.
//!
//! A runtime-generated XDP program steers UDP datagrams for registered ports
//! into per-queue AF_XDP sockets; everything else continues up the normal
//! kernel stack. Layers, bottom to top:
//!   - `umem` / `ring`: the shared frame pool and the four lock-free rings
//!   - `bpf_sys`:       raw `bpf(2)` commands behind the `BpfBackend` trait
//!   - `bytecode`:      the filter program, emitted as eBPF instructions
//!   - `xdp_program`:   load / attach lifecycle of one filter
//!   - `xdp_manager`:   one shared filter per interface, refcounted by socket
//!   - `af_xdp`:        a bound socket with batched RX/TX
//!   - `io`:            the handle a transport layer holds
//!
//! `ops` and `watchdog` back the `xdp-recover` tool.

pub mod af_xdp;
pub mod bpf_sys;
pub mod bytecode;
pub mod config;
pub mod error;
pub mod io;
pub mod ops;
pub mod ring;
pub mod umem;
pub mod watchdog;
pub mod xdp_manager;
pub mod xdp_program;

#[cfg(test)]
mod testing;

pub use af_xdp::{KernelStats, RxBatch, XskMode, XskSocket, XskStats};
pub use config::{AttachMode, BindMode, BusyPollConfig, XdpConfig};
pub use error::{Result, XdpError};
pub use io::XdpIo;
pub use umem::FrameLedger;
pub use xdp_manager::{ProgramHandle, ProgramManager};
pub use xdp_program::{ProgramState, XdpProgram};
