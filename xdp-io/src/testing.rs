//! In-memory kernel doubles.
//!
//! [`FakeKernel`] stands in for `bpf(2)`: maps, loaded programs and XDP links
//! live in a table keyed by fake fds, and an interface accepts one link at a
//! time exactly like the real kernel. [`FakeKernel::run`] executes whatever
//! program is attached to an interface against a synthetic packet through a
//! small eBPF interpreter. [`KernelPeer`] plays the kernel side of an
//! AF_XDP socket's four rings.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::af_xdp::XskSocket;
use crate::bpf_sys::{
    BpfBackend, MapSpec, ProgramSpec, BPF_MAP_TYPE_HASH, BPF_MAP_TYPE_XSKMAP, XDP_FLAGS_DRV_MODE,
};
use crate::bytecode::*;
use crate::config::XdpConfig;
use crate::error::{Result, XdpError};
use crate::ring::{ConsRing, ProdRing, XdpDesc};

fn os_err(op: &'static str, errno: i32) -> XdpError {
    XdpError::syscall(op, io::Error::from_raw_os_error(errno))
}

// ---------------------------------------------------------------------------
// Fake bpf(2)
// ---------------------------------------------------------------------------

struct FakeMap {
    spec: MapSpec,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

struct FakeLink {
    prog_fd: RawFd,
    ifindex: u32,
    flags: u32,
}

struct KernelState {
    next_fd: RawFd,
    maps: HashMap<RawFd, FakeMap>,
    progs: HashMap<RawFd, Vec<BpfInsn>>,
    links: HashMap<RawFd, FakeLink>,
    refuse_driver_mode: bool,
    verifier_log: Option<String>,
}

impl Default for KernelState {
    fn default() -> Self {
        Self {
            next_fd: 100,
            maps: HashMap::new(),
            progs: HashMap::new(),
            links: HashMap::new(),
            refuse_driver_mode: false,
            verifier_log: None,
        }
    }
}

impl KernelState {
    fn alloc_fd(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }
}

#[derive(Default)]
pub(crate) struct FakeKernel {
    state: Mutex<KernelState>,
}

impl FakeKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make driver-mode attach fail with `EOPNOTSUPP`, as on a NIC without
    /// native XDP.
    pub fn refuse_driver_mode(&self) {
        self.state.lock().refuse_driver_mode = true;
    }

    /// Reject every program load with the given verifier log.
    pub fn reject_loads(&self, log: &str) {
        self.state.lock().verifier_log = Some(log.to_string());
    }

    pub fn map_named(&self, name: &str) -> Option<RawFd> {
        let state = self.state.lock();
        let mut fds: Vec<RawFd> = state
            .maps
            .iter()
            .filter(|(_, m)| m.spec.name == name)
            .map(|(fd, _)| *fd)
            .collect();
        fds.sort();
        fds.pop()
    }

    pub fn map_lookup(&self, fd: RawFd, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().maps.get(&fd)?.entries.get(key).cloned()
    }

    pub fn map_len(&self, fd: RawFd) -> usize {
        self.state.lock().maps.get(&fd).map_or(0, |m| m.entries.len())
    }

    /// Program fd and attach flags of the link on `ifindex`.
    pub fn attached(&self, ifindex: u32) -> Option<(RawFd, u32)> {
        self.state
            .lock()
            .links
            .values()
            .find(|l| l.ifindex == ifindex)
            .map(|l| (l.prog_fd, l.flags))
    }

    pub fn program(&self, fd: RawFd) -> Option<Vec<BpfInsn>> {
        self.state.lock().progs.get(&fd).cloned()
    }

    /// Maps, programs and links still open.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.maps.len() + state.progs.len() + state.links.len()
    }

    /// Run the program attached to `ifindex` on one packet. An interface
    /// without a program passes everything.
    pub fn run(
        &self,
        ifindex: u32,
        packet: &[u8],
        rx_queue: u32,
        helper: RedirectHelper,
    ) -> std::result::Result<Verdict, String> {
        let state = self.state.lock();
        let Some(link) = state.links.values().find(|l| l.ifindex == ifindex) else {
            return Ok(Verdict::Pass);
        };
        let prog = state
            .progs
            .get(&link.prog_fd)
            .ok_or_else(|| "attached program vanished".to_string())?;
        Machine::new(&state, packet, ifindex, rx_queue, helper).run(prog)
    }
}

impl BpfBackend for FakeKernel {
    fn map_create(&self, spec: &MapSpec) -> Result<RawFd> {
        if spec.max_entries == 0 || spec.key_size == 0 {
            return Err(os_err("BPF_MAP_CREATE", libc::EINVAL));
        }
        let mut state = self.state.lock();
        let fd = state.alloc_fd();
        state.maps.insert(
            fd,
            FakeMap {
                spec: *spec,
                entries: BTreeMap::new(),
            },
        );
        Ok(fd)
    }

    fn map_update(&self, map_fd: RawFd, key: &[u8], value: &[u8], _flags: u64) -> Result<()> {
        let op = "BPF_MAP_UPDATE_ELEM";
        let mut state = self.state.lock();
        let map = state.maps.get_mut(&map_fd).ok_or_else(|| os_err(op, libc::EBADF))?;
        if key.len() != map.spec.key_size as usize || value.len() != map.spec.value_size as usize {
            return Err(os_err(op, libc::EINVAL));
        }
        match map.spec.map_type {
            BPF_MAP_TYPE_XSKMAP => {
                let idx = u32::from_ne_bytes([key[0], key[1], key[2], key[3]]);
                if idx >= map.spec.max_entries {
                    return Err(os_err(op, libc::E2BIG));
                }
            }
            BPF_MAP_TYPE_HASH => {
                if !map.entries.contains_key(key)
                    && map.entries.len() >= map.spec.max_entries as usize
                {
                    return Err(os_err(op, libc::E2BIG));
                }
            }
            _ => return Err(os_err(op, libc::EINVAL)),
        }
        map.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn map_delete(&self, map_fd: RawFd, key: &[u8]) -> Result<()> {
        let op = "BPF_MAP_DELETE_ELEM";
        let mut state = self.state.lock();
        let map = state.maps.get_mut(&map_fd).ok_or_else(|| os_err(op, libc::EBADF))?;
        map.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| os_err(op, libc::ENOENT))
    }

    fn prog_load(&self, prog: &ProgramSpec<'_>) -> Result<RawFd> {
        let mut state = self.state.lock();
        if let Some(log) = &state.verifier_log {
            return Err(XdpError::Verifier {
                source: io::Error::from_raw_os_error(libc::EACCES),
                log: log.clone(),
            });
        }
        for insn in prog.insns {
            if insn.code == BPF_LD | BPF_DW | BPF_IMM
                && insn.src() == BPF_PSEUDO_MAP_FD
                && !state.maps.contains_key(&insn.imm)
            {
                return Err(os_err("BPF_PROG_LOAD", libc::EBADF));
            }
        }
        let fd = state.alloc_fd();
        state.progs.insert(fd, prog.insns.to_vec());
        Ok(fd)
    }

    fn link_create(&self, prog_fd: RawFd, ifindex: u32, xdp_flags: u32) -> Result<RawFd> {
        let op = "BPF_LINK_CREATE";
        let mut state = self.state.lock();
        if !state.progs.contains_key(&prog_fd) {
            return Err(os_err(op, libc::EBADF));
        }
        if state.links.values().any(|l| l.ifindex == ifindex) {
            return Err(os_err(op, libc::EBUSY));
        }
        if state.refuse_driver_mode && xdp_flags & XDP_FLAGS_DRV_MODE != 0 {
            return Err(os_err(op, libc::EOPNOTSUPP));
        }
        let fd = state.alloc_fd();
        state.links.insert(
            fd,
            FakeLink {
                prog_fd,
                ifindex,
                flags: xdp_flags,
            },
        );
        Ok(fd)
    }

    fn close(&self, fd: RawFd) {
        let mut state = self.state.lock();
        state.maps.remove(&fd);
        state.progs.remove(&fd);
        state.links.remove(&fd);
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// How `bpf_redirect_map` behaves during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedirectHelper {
    /// Kernel semantics: redirect on an XSKMAP hit, otherwise return the
    /// action carried in the low bits of `flags`.
    Kernel,
    /// Return this value without redirecting.
    Returns(i64),
}

/// Effective fate of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Pass,
    Drop,
    Aborted,
    Tx,
    Redirect { queue: u32, socket_fd: RawFd },
    /// A return code the kernel does not recognise; the packet is dropped.
    Invalid(u64),
}

impl Verdict {
    pub fn reaches_socket(&self) -> bool {
        matches!(self, Verdict::Redirect { .. })
    }
}

const CTX_BASE: u64 = 0x1000_0000;
const PKT_BASE: u64 = 0x2000_0000;
const STACK_BASE: u64 = 0x3000_0000;
const STACK_SIZE: usize = 512;
const VALUE_BASE: u64 = 0x4000_0000;
const MAP_BASE: u64 = 0x5000_0000;
const REGION_MASK: u64 = 0xf000_0000;
const STEP_LIMIT: usize = 4096;
const CLOBBERED: u64 = 0xdead_beef_dead_beef;

/// `BPF_F_ACTION_MASK`: `XDP_ABORTED | XDP_DROP | XDP_PASS | XDP_TX`.
const REDIRECT_ACTION_MASK: u64 = 0x3;

struct Machine<'a> {
    kernel: &'a KernelState,
    regs: [u64; 11],
    stack: [u8; STACK_SIZE],
    packet: &'a [u8],
    ifindex: u32,
    rx_queue: u32,
    helper: RedirectHelper,
    values: Vec<Vec<u8>>,
    redirect: Option<(u32, RawFd)>,
}

type Step<T> = std::result::Result<T, String>;

fn from_ne(bytes: &[u8]) -> u64 {
    match bytes.len() {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
        4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        _ => {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            u64::from_ne_bytes(b)
        }
    }
}

fn size_of_access(code: u8) -> usize {
    match code & 0x18 {
        BPF_B => 1,
        BPF_H => 2,
        BPF_W => 4,
        _ => 8,
    }
}

impl<'a> Machine<'a> {
    fn new(
        kernel: &'a KernelState,
        packet: &'a [u8],
        ifindex: u32,
        rx_queue: u32,
        helper: RedirectHelper,
    ) -> Self {
        let mut regs = [0u64; 11];
        regs[1] = CTX_BASE;
        regs[10] = STACK_BASE + STACK_SIZE as u64;
        Self {
            kernel,
            regs,
            stack: [0; STACK_SIZE],
            packet,
            ifindex,
            rx_queue,
            helper,
            values: Vec::new(),
            redirect: None,
        }
    }

    fn load(&self, addr: u64, size: usize) -> Step<u64> {
        let region = addr & REGION_MASK;
        let off = (addr - region) as usize;
        match region {
            CTX_BASE => {
                if size != 4 {
                    return Err(format!("ctx access of size {}", size));
                }
                match off {
                    0 | 8 => Ok(PKT_BASE),
                    4 => Ok(PKT_BASE + self.packet.len() as u64),
                    12 => Ok(self.ifindex as u64),
                    16 => Ok(self.rx_queue as u64),
                    _ => Err(format!("invalid ctx offset {}", off)),
                }
            }
            PKT_BASE => self
                .packet
                .get(off..off + size)
                .map(from_ne)
                .ok_or_else(|| format!("packet read [{}, {}) beyond {}", off, off + size, self.packet.len())),
            STACK_BASE => self
                .stack
                .get(off..off + size)
                .map(from_ne)
                .ok_or_else(|| format!("stack read at {}", off)),
            VALUE_BASE => {
                let value = self
                    .values
                    .get(off >> 12)
                    .ok_or_else(|| "dangling map value pointer".to_string())?;
                let inner = off & 0xfff;
                value
                    .get(inner..inner + size)
                    .map(from_ne)
                    .ok_or_else(|| format!("map value read at {}", inner))
            }
            _ => Err(format!("load from unmapped address {:#x}", addr)),
        }
    }

    fn store(&mut self, addr: u64, size: usize, value: u64) -> Step<()> {
        if addr & REGION_MASK != STACK_BASE {
            return Err(format!("store to non-stack address {:#x}", addr));
        }
        let off = (addr - STACK_BASE) as usize;
        let bytes = value.to_ne_bytes();
        #[cfg(target_endian = "little")]
        let src = &bytes[..size];
        #[cfg(target_endian = "big")]
        let src = &bytes[8 - size..];
        self.stack
            .get_mut(off..off + size)
            .ok_or_else(|| format!("stack write at {}", off))?
            .copy_from_slice(src);
        Ok(())
    }

    fn map(&self, handle: u64) -> Step<(RawFd, &'a FakeMap)> {
        if handle & REGION_MASK != MAP_BASE {
            return Err(format!("{:#x} is not a map pointer", handle));
        }
        let fd = (handle - MAP_BASE) as RawFd;
        let kernel: &'a KernelState = self.kernel;
        let map = kernel
            .maps
            .get(&fd)
            .ok_or_else(|| format!("map fd {} closed", fd))?;
        Ok((fd, map))
    }

    fn call(&mut self, helper: i32) -> Step<u64> {
        match helper {
            BPF_FUNC_MAP_LOOKUP_ELEM => {
                let (_, map) = self.map(self.regs[1])?;
                let key = (0..map.spec.key_size as u64)
                    .map(|i| self.load(self.regs[2] + i, 1).map(|b| b as u8))
                    .collect::<Step<Vec<u8>>>()?;
                match map.entries.get(&key) {
                    Some(value) => {
                        self.values.push(value.clone());
                        Ok(VALUE_BASE + ((self.values.len() as u64 - 1) << 12))
                    }
                    None => Ok(0),
                }
            }
            BPF_FUNC_REDIRECT_MAP => {
                let (_, map) = self.map(self.regs[1])?;
                if map.spec.map_type != BPF_MAP_TYPE_XSKMAP {
                    return Err("redirect into a non-XSKMAP".to_string());
                }
                match self.helper {
                    RedirectHelper::Returns(code) => Ok(code as u64),
                    RedirectHelper::Kernel => {
                        let queue = self.regs[2] as u32;
                        match map.entries.get(&queue.to_ne_bytes()[..]) {
                            Some(fd) => {
                                let fd = from_ne(fd) as RawFd;
                                self.redirect = Some((queue, fd));
                                Ok(XdpAction::Redirect as u64)
                            }
                            None => Ok(self.regs[3] & REDIRECT_ACTION_MASK),
                        }
                    }
                }
            }
            other => Err(format!("unknown helper {}", other)),
        }
    }

    fn run(mut self, prog: &[BpfInsn]) -> Step<Verdict> {
        let mut pc = 0usize;
        for _ in 0..STEP_LIMIT {
            let insn = *prog.get(pc).ok_or_else(|| format!("fell off the program at {}", pc))?;
            let dst = insn.dst() as usize;
            let src = insn.src() as usize;
            let imm = insn.imm as i64 as u64;
            let off = insn.off as i64 as u64;
            pc += 1;

            match insn.code {
                c if c == BPF_ALU64 | BPF_MOV | BPF_K => self.regs[dst] = imm,
                c if c == BPF_ALU64 | BPF_MOV | BPF_X => self.regs[dst] = self.regs[src],
                c if c == BPF_ALU64 | BPF_ADD | BPF_K => {
                    self.regs[dst] = self.regs[dst].wrapping_add(imm)
                }
                c if c == BPF_ALU64 | BPF_ADD | BPF_X => {
                    self.regs[dst] = self.regs[dst].wrapping_add(self.regs[src])
                }
                c if c == BPF_ALU64 | BPF_AND | BPF_K => self.regs[dst] &= imm,
                c if c == BPF_ALU64 | BPF_LSH | BPF_K => self.regs[dst] <<= imm & 63,
                c if c & 0xe7 == BPF_LDX | BPF_MEM => {
                    let addr = self.regs[src].wrapping_add(off);
                    self.regs[dst] = self.load(addr, size_of_access(c))?;
                }
                c if c & 0xe7 == BPF_STX | BPF_MEM => {
                    let addr = self.regs[dst].wrapping_add(off);
                    self.store(addr, size_of_access(c), self.regs[src])?;
                }
                c if c == BPF_LD | BPF_DW | BPF_IMM => {
                    let next = *prog.get(pc).ok_or("truncated lddw")?;
                    pc += 1;
                    self.regs[dst] = if insn.src() == BPF_PSEUDO_MAP_FD {
                        self.map(MAP_BASE + insn.imm as u64)?;
                        MAP_BASE + insn.imm as u64
                    } else {
                        ((next.imm as u32 as u64) << 32) | insn.imm as u32 as u64
                    };
                }
                c if c == BPF_JMP | BPF_CALL => {
                    self.regs[0] = self.call(insn.imm)?;
                    for r in 1..=5 {
                        self.regs[r] = CLOBBERED;
                    }
                }
                c if c == BPF_JMP | BPF_EXIT => return Ok(self.verdict()),
                c if c & 0x07 == BPF_JMP => {
                    let lhs = self.regs[dst];
                    let rhs = if c & BPF_X != 0 { self.regs[src] } else { imm };
                    let taken = match c & 0xf0 {
                        BPF_JA => true,
                        BPF_JEQ => lhs == rhs,
                        BPF_JNE => lhs != rhs,
                        BPF_JGT => lhs > rhs,
                        BPF_JLT => lhs < rhs,
                        op => return Err(format!("unsupported jump {:#x}", op)),
                    };
                    if taken {
                        pc = (pc as i64 + insn.off as i64) as usize;
                    }
                }
                c => return Err(format!("unsupported opcode {:#x} at {}", c, pc - 1)),
            }
        }
        Err("step limit exceeded".to_string())
    }

    fn verdict(&self) -> Verdict {
        let ret = self.regs[0];
        match XdpAction::from_ret(ret) {
            Some(XdpAction::Pass) => Verdict::Pass,
            Some(XdpAction::Drop) => Verdict::Drop,
            Some(XdpAction::Aborted) => Verdict::Aborted,
            Some(XdpAction::Tx) => Verdict::Tx,
            Some(XdpAction::Redirect) => match self.redirect {
                Some((queue, socket_fd)) => Verdict::Redirect { queue, socket_fd },
                None => Verdict::Invalid(ret),
            },
            None => Verdict::Invalid(ret),
        }
    }
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Ethernet + IPv4 (with `ihl` 32-bit words of header) + UDP.
pub(crate) fn udp_packet_ihl(ihl: u8, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let ip_len = ihl.max(5) as usize * 4;
    let mut pkt = vec![0u8; 14 + ip_len + 8];
    pkt[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    pkt[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    pkt[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    pkt[14] = 0x40 | (ihl & 0x0f);
    let total = (ip_len + 8 + payload.len()) as u16;
    pkt[16..18].copy_from_slice(&total.to_be_bytes());
    pkt[22] = 64;
    pkt[23] = 17;
    pkt[26..30].copy_from_slice(&[10, 0, 0, 1]);
    pkt[30..34].copy_from_slice(&[10, 0, 0, 2]);
    let udp = 14 + ip_len;
    pkt[udp..udp + 2].copy_from_slice(&40000u16.to_be_bytes());
    pkt[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
    pkt[udp + 4..udp + 6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

pub(crate) fn udp_packet(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    udp_packet_ihl(5, dst_port, payload)
}

/// Same headers with IP protocol 6; the port field sits where UDP's would.
pub(crate) fn tcp_packet(dst_port: u16) -> Vec<u8> {
    let mut pkt = udp_packet(dst_port, &[0; 12]);
    pkt[23] = 6;
    pkt
}

pub(crate) fn ipv6_packet() -> Vec<u8> {
    let mut pkt = udp_packet(9004, b"v6");
    pkt[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
    pkt
}

// ---------------------------------------------------------------------------
// Kernel side of an AF_XDP socket
// ---------------------------------------------------------------------------

/// A 16-frame pool with 8-entry rings: half the frames prefill Fill, half
/// stay free for TX.
pub(crate) fn small_config() -> XdpConfig {
    XdpConfig {
        frame_count: 16,
        frame_size: 2048,
        fill_ring_size: 8,
        completion_ring_size: 8,
        rx_ring_size: 8,
        tx_ring_size: 8,
        batch_size: 8,
        ..XdpConfig::default()
    }
}

/// Opposite ends of a socket's rings, driven by the test.
pub(crate) struct KernelPeer {
    fill: ConsRing<u64>,
    comp: ProdRing<u64>,
    rx: ProdRing<XdpDesc>,
    tx: ConsRing<XdpDesc>,
}

impl KernelPeer {
    pub fn new(
        fill: ConsRing<u64>,
        comp: ProdRing<u64>,
        rx: ProdRing<XdpDesc>,
        tx: ConsRing<XdpDesc>,
    ) -> Self {
        Self { fill, comp, rx, tx }
    }

    /// Receive `packet` into the next Fill frame and post it on RX. Returns
    /// `false` when either ring leaves no room, which the kernel counts as
    /// a drop.
    pub fn deliver(&mut self, sock: &mut XskSocket, packet: &[u8]) -> bool {
        let headroom = sock.umem().headroom() as u64;
        let len = packet.len() as u32;
        self.deliver_with(sock, move |addr| (addr + headroom, len), packet)
    }

    /// Post a descriptor whose length runs past the end of its frame.
    pub fn deliver_overlong(&mut self, sock: &mut XskSocket) -> bool {
        let len = sock.frame_size() + 1;
        self.deliver_with(sock, |addr| (addr, len), &[])
    }

    fn deliver_with(
        &mut self,
        sock: &mut XskSocket,
        desc: impl FnOnce(u64) -> (u64, u32),
        packet: &[u8],
    ) -> bool {
        let slot = self.rx.reserve(1);
        if slot.is_empty() {
            return false;
        }
        let frame = self.fill.peek(1);
        if frame.is_empty() {
            self.rx.cancel(1);
            return false;
        }
        let base = self.fill.read(frame.start);
        self.fill.release(1);

        let (addr, len) = desc(base);
        if let Some(buf) = sock.umem_mut().frame_mut(addr, packet.len() as u32) {
            buf.copy_from_slice(packet);
        }
        self.rx.write(slot.start, XdpDesc { addr, len, options: 0 });
        self.rx.submit(1);
        true
    }

    /// Drain TX, returning the transmitted bytes and completing every frame.
    pub fn transmit(&mut self, sock: &XskSocket) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let slots = self.tx.peek(64);
            if slots.is_empty() {
                return out;
            }
            let comp = self.comp.reserve(slots.len);
            assert_eq!(comp.len, slots.len, "completion ring overflow");
            for (idx, cidx) in slots.iter().zip(comp.iter()) {
                let desc = self.tx.read(idx);
                let bytes = sock.umem().frame(desc.addr, desc.len).unwrap_or_default();
                out.push(bytes.to_vec());
                self.comp.write(cidx, desc.addr);
            }
            self.tx.release(slots.len);
            self.comp.submit(comp.len);
        }
    }

    /// Frames the socket has posted to Fill that the peer has not taken.
    pub fn fill_available(&mut self) -> u32 {
        let mut total = 0;
        loop {
            let slots = self.fill.peek(u32::MAX);
            if slots.is_empty() {
                break;
            }
            total += slots.len;
        }
        // Counting only; the frames stay in the ring.
        self.fill.unpeek(total);
        total
    }

    pub fn set_tx_needs_wakeup(&self, on: bool) {
        self.tx.set_needs_wakeup(on);
    }

    pub fn set_fill_needs_wakeup(&self, on: bool) {
        self.fill.set_needs_wakeup(on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf_sys::BPF_ANY;

    fn load_filter(kernel: &FakeKernel, ports: &[u16]) -> (RawFd, RawFd, RawFd) {
        let xsk = kernel
            .map_create(&MapSpec {
                map_type: BPF_MAP_TYPE_XSKMAP,
                key_size: 4,
                value_size: 4,
                max_entries: 64,
                name: "xsks_map",
            })
            .unwrap();
        let filter = kernel
            .map_create(&MapSpec {
                map_type: BPF_MAP_TYPE_HASH,
                key_size: 2,
                value_size: 1,
                max_entries: 16,
                name: "port_filter",
            })
            .unwrap();
        let insns = generate(xsk, filter, ports);
        let prog = kernel
            .prog_load(&ProgramSpec {
                insns: &insns,
                license: "GPL",
                name: "xdp_filter_prog",
            })
            .unwrap();
        kernel.link_create(prog, 1, 0).unwrap();
        (xsk, filter, prog)
    }

    #[test]
    fn test_interpreter_follows_map_lookup() {
        let kernel = FakeKernel::new();
        let (xsk, filter, _) = load_filter(&kernel, &[]);
        kernel.map_update(xsk, &0u32.to_ne_bytes(), &77u32.to_ne_bytes(), BPF_ANY).unwrap();

        let pkt = udp_packet(5000, b"x");
        assert_eq!(kernel.run(1, &pkt, 0, RedirectHelper::Kernel), Ok(Verdict::Pass));

        kernel.map_update(filter, &5000u16.to_be_bytes(), &[1], BPF_ANY).unwrap();
        assert_eq!(
            kernel.run(1, &pkt, 0, RedirectHelper::Kernel),
            Ok(Verdict::Redirect { queue: 0, socket_fd: 77 })
        );

        // A zero flag disables the port again.
        kernel.map_update(filter, &5000u16.to_be_bytes(), &[0], BPF_ANY).unwrap();
        assert_eq!(kernel.run(1, &pkt, 0, RedirectHelper::Kernel), Ok(Verdict::Pass));
    }

    #[test]
    fn test_link_exclusive_per_interface() {
        let kernel = FakeKernel::new();
        let (_, _, prog) = load_filter(&kernel, &[]);
        let err = kernel.link_create(prog, 1, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        assert!(kernel.link_create(prog, 2, 0).is_ok());
    }

    #[test]
    fn test_prog_load_needs_live_maps() {
        let kernel = FakeKernel::new();
        let insns = generate(5, 6, &[]);
        let err = kernel
            .prog_load(&ProgramSpec {
                insns: &insns,
                license: "GPL",
                name: "xdp_filter_prog",
            })
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_hash_map_capacity() {
        let kernel = FakeKernel::new();
        let (_, filter, _) = load_filter(&kernel, &[]);
        for port in 0..16u16 {
            kernel.map_update(filter, &port.to_be_bytes(), &[1], BPF_ANY).unwrap();
        }
        let err = kernel.map_update(filter, &99u16.to_be_bytes(), &[1], BPF_ANY).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::E2BIG));
        // Overwriting an existing key still works when full.
        kernel.map_update(filter, &3u16.to_be_bytes(), &[0], BPF_ANY).unwrap();
    }

    #[test]
    fn test_packet_builder_layout() {
        let pkt = udp_packet_ihl(6, 9004, b"abc");
        assert_eq!(pkt.len(), 14 + 24 + 8 + 3);
        assert_eq!(pkt[14], 0x46);
        assert_eq!(&pkt[14 + 24 + 2..14 + 24 + 4], &9004u16.to_be_bytes());
    }
}
