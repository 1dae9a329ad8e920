//! Typed errors surfaced to the I/O facade.
//!
//! Setup-time failures (UMEM registration, bind, verifier rejection, attach)
//! are reported here so the caller can fall back to another I/O backend.
//! Data-path faults never reach this type; they are counted in
//! [`XskStats`](crate::af_xdp::XskStats) instead.

use std::io;

use thiserror::Error;

use crate::xdp_program::ProgramState;

pub type Result<T> = std::result::Result<T, XdpError>;

#[derive(Debug, Error)]
pub enum XdpError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("{op}: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kernel verifier refused the generated program. `log` holds the
    /// complete verifier output.
    #[error("XDP program rejected by verifier: {source}\n{log}")]
    Verifier {
        #[source]
        source: io::Error,
        log: String,
    },

    #[error("an XDP program is already attached to ifindex {ifindex}")]
    AlreadyAttached { ifindex: u32 },

    #[error("{op} is not valid in state {state:?}")]
    InvalidState { op: &'static str, state: ProgramState },

    #[error(
        "binding AF_XDP socket to ifindex={ifindex} queue={queue_id} failed \
         (zero-copy: {zero_copy}, copy: {copy})"
    )]
    Bind {
        ifindex: u32,
        queue_id: u32,
        zero_copy: String,
        copy: io::Error,
    },

    #[error("attach refused: queues {missing:?} have no registered socket")]
    MissingSockets { missing: Vec<u32> },

    #[error("queue {0} has no registered socket")]
    UnknownQueue(u32),
}

impl XdpError {
    /// Wrap the current `errno` for a failed syscall.
    pub(crate) fn last_os(op: &'static str) -> Self {
        XdpError::Syscall {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn syscall(op: &'static str, source: io::Error) -> Self {
        XdpError::Syscall { op, source }
    }

    /// OS error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            XdpError::Syscall { source, .. } | XdpError::Verifier { source, .. } => {
                source.raw_os_error()
            }
            XdpError::Bind { copy, .. } => copy.raw_os_error(),
            _ => None,
        }
    }
}
