//! One XDP program per interface, shared by every socket on it.
//!
//! An interface runs a single XDP program. Two independent load+attach
//! sequences would either fail (link-based attach) or silently replace one
//! another (netlink attach), orphaning the first program's sockets. The
//! manager keeps one [`XdpProgram`] per ifindex, hands out
//! [`ProgramHandle`]s to it, and reference-counts it by registered socket:
//! the last `release` detaches and tears the program down. Each `acquire`
//! also holds a claim on the program until the caller settles it, so a
//! concurrent release cannot remove it before the new sockets register.
//!
//! All map mutation for a shared program goes through the manager's mutex.
//! Only setup and teardown take it; the data path never does.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bpf_sys::{BpfBackend, Syscall};
use crate::config::XdpConfig;
use crate::error::{Result, XdpError};
use crate::xdp_program::{ProgramState, XdpProgram};

struct Shared {
    program: XdpProgram,
    /// `acquire` calls not yet settled.
    claims: usize,
}

/// Process-wide registry of XDP programs by interface.
pub struct ProgramManager {
    backend: Arc<dyn BpfBackend>,
    programs: Mutex<HashMap<u32, Shared>>,
}

impl ProgramManager {
    pub fn new(backend: Arc<dyn BpfBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            programs: Mutex::new(HashMap::new()),
        })
    }

    /// The manager backed by the real kernel.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ProgramManager>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| ProgramManager::new(Arc::new(Syscall)))
            .clone()
    }

    /// Get the interface's program, loading it (not attaching) on first use.
    /// `ports` are enabled on an existing program as well. The program stays
    /// up at least until the caller calls [`ProgramHandle::settle`].
    pub fn acquire(
        self: &Arc<Self>,
        ifindex: u32,
        config: &XdpConfig,
        ports: &[u16],
    ) -> Result<ProgramHandle> {
        let mut programs = self.programs.lock();
        match programs.get_mut(&ifindex) {
            Some(shared) => {
                for &port in ports {
                    shared.program.add_port(port)?;
                }
                shared.claims += 1;
                info!(ifindex, "reusing shared XDP program");
            }
            None => {
                let program =
                    XdpProgram::init_without_attach(self.backend.clone(), ifindex, config, ports)?;
                programs.insert(ifindex, Shared { program, claims: 1 });
                info!(ifindex, "created shared XDP program");
            }
        }
        Ok(ProgramHandle {
            manager: self.clone(),
            ifindex,
        })
    }

    fn with_program<R>(
        &self,
        ifindex: u32,
        f: impl FnOnce(&mut XdpProgram) -> Result<R>,
    ) -> Result<R> {
        let mut programs = self.programs.lock();
        let shared = programs.get_mut(&ifindex).ok_or(XdpError::InvalidState {
            op: "shared program access",
            state: ProgramState::Detached,
        })?;
        let result = f(&mut shared.program);
        remove_if_unused(&mut programs, ifindex);
        result
    }

    /// State of the interface's program; `None` once it has been torn down.
    pub fn state(&self, ifindex: u32) -> Option<ProgramState> {
        self.programs.lock().get(&ifindex).map(|s| s.program.state())
    }

    fn settle(&self, ifindex: u32) {
        let mut programs = self.programs.lock();
        if let Some(shared) = programs.get_mut(&ifindex) {
            shared.claims = shared.claims.saturating_sub(1);
        }
        remove_if_unused(&mut programs, ifindex);
    }
}

/// Tear down the interface's program once no socket is registered and no
/// `acquire` is pending. Runs under the registry lock.
fn remove_if_unused(programs: &mut HashMap<u32, Shared>, ifindex: u32) {
    let unused = programs
        .get(&ifindex)
        .is_some_and(|s| s.claims == 0 && s.program.registered_queues().next().is_none());
    if unused {
        if let Some(mut shared) = programs.remove(&ifindex) {
            shared.program.deinit();
            info!(ifindex, "last socket released; XDP program removed");
        }
    }
}

/// A reference to an interface's shared program.
#[derive(Clone)]
pub struct ProgramHandle {
    manager: Arc<ProgramManager>,
    ifindex: u32,
}

impl ProgramHandle {
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Register a socket for `queue_id` and enable `port`. The socket goes
    /// in first so the port never matches without a redirect target.
    pub fn add_socket(&self, queue_id: u32, socket_fd: RawFd, port: u16) -> Result<()> {
        self.manager.with_program(self.ifindex, |program| {
            program.register_socket(queue_id, socket_fd)?;
            program.add_port(port)
        })
    }

    /// Attach the shared program. Fails with `AlreadyAttached` on every call
    /// after the first, and when another program owns the interface.
    pub fn attach(&self) -> Result<()> {
        self.manager.with_program(self.ifindex, |program| program.attach())
    }

    /// Attach once every queue in `expected` has a registered socket.
    pub fn attach_expecting(&self, expected: &[u32]) -> Result<()> {
        self.manager.with_program(self.ifindex, |program| {
            let missing: Vec<u32> = expected
                .iter()
                .copied()
                .filter(|q| !program.is_registered(*q))
                .collect();
            if !missing.is_empty() {
                warn!(
                    ifindex = self.ifindex,
                    ?missing,
                    "refusing to attach with unregistered queues"
                );
                return Err(XdpError::MissingSockets { missing });
            }
            program.attach()
        })
    }

    pub fn is_attached(&self) -> bool {
        self.manager.state(self.ifindex) == Some(ProgramState::Attached)
    }

    /// Deregister `queue_id`'s socket. Releasing the last one detaches and
    /// destroys the shared program.
    pub fn release(&self, queue_id: u32) -> Result<()> {
        self.manager
            .with_program(self.ifindex, |program| program.deregister_socket(queue_id))
    }

    /// Give up the claim taken by `acquire`, once its sockets are registered
    /// or setup has failed. A program with no sockets left is torn down.
    pub fn settle(&self) {
        self.manager.settle(self.ifindex);
    }
}
