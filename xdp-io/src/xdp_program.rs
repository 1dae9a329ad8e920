//! Two-phase XDP program lifecycle: load, then attach.
//!
//! [`XdpProgram::init_without_attach`] creates the socket map and port filter
//! map, generates the filter and has the kernel verify it. The NIC is not
//! touched until [`XdpProgram::attach`], which the caller issues once every
//! socket the program can redirect to is registered. A program attached
//! before its sockets exist redirects into empty XSKMAP slots; the
//! generated fallback turns that into `XDP_PASS`, but the window is still
//! closed here by construction.
//!
//! ```text
//! Unloaded ──load──▶ Loaded ──attach──▶ Attached ──detach──▶ Detached
//!                      │                                  ▲
//!                      └──────────────deinit──────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bpf_sys::{
    BpfBackend, MapSpec, ProgramSpec, BPF_ANY, BPF_MAP_TYPE_HASH, BPF_MAP_TYPE_XSKMAP,
    XDP_FLAGS_DRV_MODE, XDP_FLAGS_SKB_MODE,
};
use crate::bytecode;
use crate::config::{AttachMode, XdpConfig};
use crate::error::{Result, XdpError};

const SOCKET_MAP_NAME: &str = "xsks_map";
const PORT_MAP_NAME: &str = "port_filter";
const PROGRAM_NAME: &str = "xdp_filter_prog";
const LICENSE: &str = "GPL";

/// Port filter value: redirect.
const PORT_ENABLED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Unloaded,
    Loaded,
    Attached,
    /// Terminal. Maps and program may still be open until `deinit`.
    Detached,
}

/// One XDP filter program and its two maps, bound to one interface.
pub struct XdpProgram {
    backend: Arc<dyn BpfBackend>,
    ifindex: u32,
    attach_mode: AttachMode,
    socket_map_entries: u32,
    port_map_entries: u32,
    state: ProgramState,
    socket_map: Option<RawFd>,
    port_map: Option<RawFd>,
    prog: Option<RawFd>,
    link: Option<RawFd>,
    sockets: BTreeMap<u32, RawFd>,
    ports: BTreeSet<u16>,
}

impl XdpProgram {
    pub fn new(backend: Arc<dyn BpfBackend>, ifindex: u32, config: &XdpConfig) -> Self {
        Self {
            backend,
            ifindex,
            attach_mode: config.attach_mode,
            socket_map_entries: config.xsk_map_entries,
            port_map_entries: config.port_map_entries,
            state: ProgramState::Unloaded,
            socket_map: None,
            port_map: None,
            prog: None,
            link: None,
            sockets: BTreeMap::new(),
            ports: BTreeSet::new(),
        }
    }

    /// Create the maps and load the filter without attaching it.
    pub fn init_without_attach(
        backend: Arc<dyn BpfBackend>,
        ifindex: u32,
        config: &XdpConfig,
        initial_ports: &[u16],
    ) -> Result<Self> {
        let mut program = Self::new(backend, ifindex, config);
        program.load(initial_ports)?;
        Ok(program)
    }

    /// `Unloaded → Loaded`. On failure every object created so far is
    /// closed again and the state stays `Unloaded`.
    pub fn load(&mut self, initial_ports: &[u16]) -> Result<()> {
        self.expect_state("load", &[ProgramState::Unloaded])?;
        if let Err(e) = self.try_load(initial_ports) {
            self.close_objects();
            self.ports.clear();
            return Err(e);
        }
        self.state = ProgramState::Loaded;
        info!(
            ifindex = self.ifindex,
            ports = ?self.ports,
            "loaded XDP filter program"
        );
        Ok(())
    }

    fn try_load(&mut self, initial_ports: &[u16]) -> Result<()> {
        let socket_map = self.backend.map_create(&MapSpec {
            map_type: BPF_MAP_TYPE_XSKMAP,
            key_size: 4,
            value_size: 4,
            max_entries: self.socket_map_entries,
            name: SOCKET_MAP_NAME,
        })?;
        self.socket_map = Some(socket_map);

        let port_map = self.backend.map_create(&MapSpec {
            map_type: BPF_MAP_TYPE_HASH,
            key_size: 2,
            value_size: 1,
            max_entries: self.port_map_entries,
            name: PORT_MAP_NAME,
        })?;
        self.port_map = Some(port_map);

        for &port in initial_ports {
            self.write_port(port_map, port)?;
        }

        let insns = bytecode::generate(socket_map, port_map, initial_ports);
        debug!(insns = insns.len(), "generated XDP filter");
        let prog = self.backend.prog_load(&ProgramSpec {
            insns: &insns,
            license: LICENSE,
            name: PROGRAM_NAME,
        })?;
        self.prog = Some(prog);
        Ok(())
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn ports(&self) -> &BTreeSet<u16> {
        &self.ports
    }

    /// Queues with a socket in the XSKMAP.
    pub fn registered_queues(&self) -> impl Iterator<Item = u32> + '_ {
        self.sockets.keys().copied()
    }

    pub fn is_registered(&self, queue_id: u32) -> bool {
        self.sockets.contains_key(&queue_id)
    }

    fn expect_state(&self, op: &'static str, allowed: &[ProgramState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(XdpError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn live_maps(&self, op: &'static str) -> Result<(RawFd, RawFd)> {
        self.expect_state(op, &[ProgramState::Loaded, ProgramState::Attached])?;
        match (self.socket_map, self.port_map) {
            (Some(sockets), Some(ports)) => Ok((sockets, ports)),
            _ => Err(XdpError::InvalidState {
                op,
                state: self.state,
            }),
        }
    }

    /// Point `queue_id`'s XSKMAP slot at an AF_XDP socket. Re-registering
    /// overwrites the slot.
    pub fn register_socket(&mut self, queue_id: u32, socket_fd: RawFd) -> Result<()> {
        let (socket_map, _) = self.live_maps("register_socket")?;
        self.backend.map_update(
            socket_map,
            &queue_id.to_ne_bytes(),
            &(socket_fd as u32).to_ne_bytes(),
            BPF_ANY,
        )?;
        self.sockets.insert(queue_id, socket_fd);
        info!(
            ifindex = self.ifindex,
            queue_id, socket_fd, "registered AF_XDP socket in XSKMAP"
        );
        Ok(())
    }

    /// Clear `queue_id`'s XSKMAP slot. Traffic for that queue falls back to
    /// `XDP_PASS`.
    pub fn deregister_socket(&mut self, queue_id: u32) -> Result<()> {
        let (socket_map, _) = self.live_maps("deregister_socket")?;
        if !self.sockets.contains_key(&queue_id) {
            return Err(XdpError::UnknownQueue(queue_id));
        }
        match self.backend.map_delete(socket_map, &queue_id.to_ne_bytes()) {
            Err(e) if e.raw_os_error() != Some(libc::ENOENT) => return Err(e),
            _ => {}
        }
        self.sockets.remove(&queue_id);
        info!(ifindex = self.ifindex, queue_id, "deregistered AF_XDP socket");
        Ok(())
    }

    /// Enable redirect for a UDP destination port.
    pub fn add_port(&mut self, port: u16) -> Result<()> {
        let (_, port_map) = self.live_maps("add_port")?;
        if self.ports.contains(&port) {
            return Ok(());
        }
        self.write_port(port_map, port)?;
        info!(ifindex = self.ifindex, port, "registered port in XDP filter");
        Ok(())
    }

    fn write_port(&mut self, port_map: RawFd, port: u16) -> Result<()> {
        // Keyed by the port as it appears on the wire.
        self.backend
            .map_update(port_map, &port.to_be_bytes(), &[PORT_ENABLED], BPF_ANY)?;
        self.ports.insert(port);
        Ok(())
    }

    /// `Loaded → Attached`.
    ///
    /// Only call once every socket the filter may redirect to has been
    /// registered. A second call fails with `AlreadyAttached`, as does an
    /// interface that already runs another XDP program.
    pub fn attach(&mut self) -> Result<()> {
        if self.state == ProgramState::Attached {
            return Err(XdpError::AlreadyAttached {
                ifindex: self.ifindex,
            });
        }
        self.expect_state("attach", &[ProgramState::Loaded])?;
        let prog = self.prog.ok_or(XdpError::InvalidState {
            op: "attach",
            state: self.state,
        })?;

        let modes: &[(u32, &str)] = match self.attach_mode {
            AttachMode::Auto => &[(XDP_FLAGS_DRV_MODE, "native"), (XDP_FLAGS_SKB_MODE, "skb")],
            AttachMode::Native => &[(XDP_FLAGS_DRV_MODE, "native")],
            AttachMode::Skb => &[(XDP_FLAGS_SKB_MODE, "skb")],
        };

        let mut last_err = None;
        for &(flags, mode) in modes {
            match self.backend.link_create(prog, self.ifindex, flags) {
                Ok(link) => {
                    self.link = Some(link);
                    self.state = ProgramState::Attached;
                    info!(
                        ifindex = self.ifindex,
                        mode,
                        queues = ?self.sockets.keys().collect::<Vec<_>>(),
                        "attached XDP program"
                    );
                    return Ok(());
                }
                Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY) | Some(libc::EEXIST)) => {
                    warn!(
                        ifindex = self.ifindex,
                        "interface already runs an XDP program"
                    );
                    return Err(XdpError::AlreadyAttached {
                        ifindex: self.ifindex,
                    });
                }
                Err(e) => {
                    warn!(
                        ifindex = self.ifindex,
                        mode,
                        error = %e,
                        "XDP attach failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(XdpError::InvalidState {
            op: "attach",
            state: self.state,
        }))
    }

    /// `Attached → Detached`: remove the link. Maps and program stay open
    /// until [`deinit`](Self::deinit).
    pub fn detach(&mut self) -> Result<()> {
        self.expect_state("detach", &[ProgramState::Attached])?;
        if let Some(link) = self.link.take() {
            self.backend.close(link);
        }
        self.state = ProgramState::Detached;
        info!(ifindex = self.ifindex, "detached XDP program");
        Ok(())
    }

    /// Remove the link if any, then close the program and both maps.
    /// Safe to call in any state.
    pub fn deinit(&mut self) {
        if self.state == ProgramState::Attached {
            // Only fails on state, which was just checked.
            let _ = self.detach();
        }
        let had_objects = self.prog.is_some() || self.socket_map.is_some();
        self.close_objects();
        self.sockets.clear();
        if self.state != ProgramState::Unloaded || had_objects {
            self.state = ProgramState::Detached;
        }
        debug!(ifindex = self.ifindex, "released XDP program and maps");
    }

    fn close_objects(&mut self) {
        for fd in [
            self.link.take(),
            self.prog.take(),
            self.port_map.take(),
            self.socket_map.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.backend.close(fd);
        }
    }
}

impl Drop for XdpProgram {
    fn drop(&mut self) {
        self.deinit();
    }
}
