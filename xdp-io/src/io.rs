//! Kernel-bypass I/O handle for one (interface, queue, port).
//!
//! [`XdpIo`] is what a transport layer holds: an AF_XDP socket registered in
//! the interface's shared XDP program. Setup errors are returned so the
//! caller can fall back to an ordinary UDP socket; once set up, the data path
//! only counts faults.
//!
//! Ordering on the way up: program loaded, every socket bound and registered,
//! then a single attach. On the way down each handle deregisters its socket
//! before the socket closes, and the last one out detaches the program.

use std::sync::Arc;

use tracing::{info, warn};

use crate::af_xdp::{RxBatch, XskSocket, XskStats};
use crate::bpf_sys::bump_memlock_rlimit;
use crate::config::XdpConfig;
use crate::error::{Result, XdpError};
use crate::xdp_manager::{ProgramHandle, ProgramManager};

pub struct XdpIo {
    socket: XskSocket,
    program: ProgramHandle,
    released: bool,
}

impl XdpIo {
    /// Bind one queue of `interface` and redirect UDP traffic for
    /// `bind_port` to it.
    pub fn try_init(
        interface: &str,
        queue_id: u32,
        bind_port: u16,
        config: &XdpConfig,
    ) -> Result<Self> {
        let mut group = Self::try_init_group(interface, &[(queue_id, bind_port)], config)?;
        group.pop().ok_or(XdpError::MissingSockets {
            missing: vec![queue_id],
        })
    }

    /// Bind several `(queue, port)` pairs on one interface. The program is
    /// attached only after every socket is registered.
    pub fn try_init_group(
        interface: &str,
        members: &[(u32, u16)],
        config: &XdpConfig,
    ) -> Result<Vec<Self>> {
        config.validate()?;
        let ifindex = nix::net::if_::if_nametoindex(interface)
            .map_err(|_| XdpError::InterfaceNotFound(interface.to_string()))?;
        bump_memlock_rlimit();
        Self::init_group_with(
            &ProgramManager::global(),
            ifindex,
            members,
            config,
            XskSocket::create,
        )
    }

    pub(crate) fn init_group_with(
        manager: &Arc<ProgramManager>,
        ifindex: u32,
        members: &[(u32, u16)],
        config: &XdpConfig,
        mut open: impl FnMut(u32, u32, &XdpConfig) -> Result<XskSocket>,
    ) -> Result<Vec<Self>> {
        if members.is_empty() {
            return Err(XdpError::InvalidConfig("no queues requested".to_string()));
        }
        let ports: Vec<u16> = members.iter().map(|&(_, port)| port).collect();
        let program = manager.acquire(ifindex, config, &ports)?;

        let mut opened: Vec<XdpIo> = Vec::with_capacity(members.len());
        for &(queue_id, port) in members {
            let socket = match open(ifindex, queue_id, config) {
                Ok(socket) => socket,
                Err(e) => {
                    drop(opened);
                    program.settle();
                    return Err(e);
                }
            };
            if let Err(e) = program.add_socket(queue_id, socket.fd(), port) {
                // The slot may have been written before the port failed.
                let _ = program.release(queue_id);
                drop(opened);
                program.settle();
                return Err(e);
            }
            opened.push(XdpIo {
                socket,
                program: program.clone(),
                released: false,
            });
        }

        if !program.is_attached() {
            let queues: Vec<u32> = members.iter().map(|&(queue, _)| queue).collect();
            if let Err(e) = program.attach_expecting(&queues) {
                drop(opened);
                program.settle();
                return Err(e);
            }
        }
        program.settle();

        info!(
            ifindex,
            sockets = opened.len(),
            ?ports,
            "XDP I/O ready"
        );
        Ok(opened)
    }

    pub fn ifindex(&self) -> u32 {
        self.socket.ifindex()
    }

    pub fn queue_id(&self) -> u32 {
        self.socket.queue_id()
    }

    pub fn socket(&self) -> &XskSocket {
        &self.socket
    }

    pub fn stats(&self) -> &Arc<XskStats> {
        self.socket.stats()
    }

    /// Up to `max` received packets, valid until the batch is dropped.
    pub fn receive_batch(&mut self, max: u32) -> RxBatch<'_> {
        self.socket.receive(max)
    }

    /// Queue packets for transmission; returns how many were consumed.
    pub fn send_batch<P: AsRef<[u8]>>(&mut self, packets: &[P]) -> usize {
        self.socket.send_batch(packets)
    }

    /// Deregister the socket, then close it.
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        self.program.release(self.socket.queue_id())
    }
}

impl Drop for XdpIo {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let queue_id = self.socket.queue_id();
        if let Err(e) = self.program.release(queue_id) {
            warn!(
                ifindex = self.program.ifindex(),
                queue_id,
                error = %e,
                "failed to deregister AF_XDP socket"
            );
        }
    }
}
