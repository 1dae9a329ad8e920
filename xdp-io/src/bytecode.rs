//! Runtime generation of the XDP filter program.
//!
//! The program is assembled here instruction by instruction, so no eBPF
//! toolchain is needed at build or run time. Per packet it:
//!
//! 1. bounds-checks Ethernet, IPv4 and UDP headers against `data_end`
//!    before reading any of their fields;
//! 2. passes anything that is not IPv4/UDP;
//! 3. matches the UDP destination port against a few inline ports, then
//!    against the port filter map;
//! 4. redirects matches into the XSKMAP slot of the ingress queue;
//! 5. checks the redirect helper's return value and answers `XDP_PASS` on
//!    any failure.
//!
//! Every exit returns either `XDP_REDIRECT` (only after the helper reported
//! success) or `XDP_PASS`. A program that hands the helper's raw error code
//! back to the kernel turns a missing socket into an unconditional drop.
//!
//! [`generate`] is pure: the same inputs produce the same instructions.

use std::os::fd::RawFd;

// ---------------------------------------------------------------------------
// Instruction encoding (from <linux/bpf.h>, <linux/bpf_common.h>)
// ---------------------------------------------------------------------------

pub const BPF_LD: u8 = 0x00;
pub const BPF_LDX: u8 = 0x01;
pub const BPF_STX: u8 = 0x03;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_ALU64: u8 = 0x07;

pub const BPF_W: u8 = 0x00;
pub const BPF_H: u8 = 0x08;
pub const BPF_B: u8 = 0x10;
pub const BPF_DW: u8 = 0x18;

pub const BPF_IMM: u8 = 0x00;
pub const BPF_MEM: u8 = 0x60;

pub const BPF_ADD: u8 = 0x00;
pub const BPF_AND: u8 = 0x50;
pub const BPF_LSH: u8 = 0x60;
pub const BPF_MOV: u8 = 0xb0;

pub const BPF_K: u8 = 0x00;
pub const BPF_X: u8 = 0x08;

pub const BPF_JA: u8 = 0x00;
pub const BPF_JEQ: u8 = 0x10;
pub const BPF_JGT: u8 = 0x20;
pub const BPF_JNE: u8 = 0x50;
pub const BPF_JLT: u8 = 0xa0;
pub const BPF_CALL: u8 = 0x80;
pub const BPF_EXIT: u8 = 0x90;

/// `src_reg` marker on a 64-bit immediate load: the immediate is a map fd
/// and the verifier rewrites it into a map pointer.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;

pub const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;
pub const BPF_FUNC_REDIRECT_MAP: i32 = 51;

pub const R0: u8 = 0;
pub const R1: u8 = 1;
pub const R2: u8 = 2;
pub const R3: u8 = 3;
pub const R4: u8 = 4;
pub const R5: u8 = 5;
pub const R6: u8 = 6;
pub const R7: u8 = 7;
pub const R10: u8 = 10;

/// XDP program return codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpAction {
    Aborted = 0,
    Drop = 1,
    Pass = 2,
    Tx = 3,
    Redirect = 4,
}

impl XdpAction {
    pub fn from_ret(ret: u64) -> Option<Self> {
        match ret {
            0 => Some(XdpAction::Aborted),
            1 => Some(XdpAction::Drop),
            2 => Some(XdpAction::Pass),
            3 => Some(XdpAction::Tx),
            4 => Some(XdpAction::Redirect),
            _ => None,
        }
    }
}

/// One eBPF instruction (`struct bpf_insn`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u8,
    regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl BpfInsn {
    pub const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        // `dst_reg:4, src_reg:4` bitfields follow the target's bit order.
        #[cfg(target_endian = "little")]
        let regs = (src << 4) | (dst & 0x0f);
        #[cfg(target_endian = "big")]
        let regs = (dst << 4) | (src & 0x0f);
        BpfInsn {
            code,
            regs,
            off,
            imm,
        }
    }

    pub fn dst(&self) -> u8 {
        #[cfg(target_endian = "little")]
        return self.regs & 0x0f;
        #[cfg(target_endian = "big")]
        return self.regs >> 4;
    }

    pub fn src(&self) -> u8 {
        #[cfg(target_endian = "little")]
        return self.regs >> 4;
        #[cfg(target_endian = "big")]
        return self.regs & 0x0f;
    }

    /// Instruction class (low three bits of the opcode).
    pub fn class(&self) -> u8 {
        self.code & 0x07
    }

    /// The instruction as the kernel reads it from memory.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.code;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.off.to_ne_bytes());
        out[4..8].copy_from_slice(&self.imm.to_ne_bytes());
        out
    }
}

/// Flatten a program into the byte image handed to `BPF_PROG_LOAD`.
pub fn to_bytes(insns: &[BpfInsn]) -> Vec<u8> {
    insns.iter().flat_map(|i| i.to_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Packet layout
// ---------------------------------------------------------------------------

/// `struct xdp_md` field offsets.
const MD_DATA: i16 = 0;
const MD_DATA_END: i16 = 4;
const MD_RX_QUEUE_INDEX: i16 = 16;

const ETH_HLEN: i32 = 14;
const ETH_TYPE_OFF: i16 = 12;
const IPV4_MIN_HLEN: i32 = 20;
const IP_VER_IHL_OFF: i16 = 14;
const IP_PROTO_OFF: i16 = 14 + 9;
const UDP_HLEN: i32 = 8;
const UDP_DPORT_OFF: i16 = 2;

const ETH_P_IP: u16 = 0x0800;
const IPPROTO_UDP: i32 = 17;

/// Stack slot holding the port filter key.
const KEY_SLOT: i16 = -8;

/// Ports compared inline before the map lookup.
pub const MAX_INLINE_PORTS: usize = 8;

/// A big-endian 16-bit wire field as a half-word load sees it on this host.
fn wire_u16(value: u16) -> i32 {
    u16::from_ne_bytes(value.to_be_bytes()) as i32
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Redirect,
    Pass,
}

/// Straight-line assembler with forward-jump fixups.
#[derive(Default)]
struct Asm {
    insns: Vec<BpfInsn>,
    fixups: Vec<(usize, Label)>,
    redirect: Option<usize>,
    pass: Option<usize>,
}

impl Asm {
    fn emit(&mut self, insn: BpfInsn) {
        self.insns.push(insn);
    }

    fn mov_reg(&mut self, dst: u8, src: u8) {
        self.emit(BpfInsn::new(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0));
    }

    fn mov_imm(&mut self, dst: u8, imm: i32) {
        self.emit(BpfInsn::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm));
    }

    fn alu_imm(&mut self, op: u8, dst: u8, imm: i32) {
        self.emit(BpfInsn::new(BPF_ALU64 | op | BPF_K, dst, 0, 0, imm));
    }

    fn alu_reg(&mut self, op: u8, dst: u8, src: u8) {
        self.emit(BpfInsn::new(BPF_ALU64 | op | BPF_X, dst, src, 0, 0));
    }

    fn load(&mut self, size: u8, dst: u8, src: u8, off: i16) {
        self.emit(BpfInsn::new(BPF_LDX | size | BPF_MEM, dst, src, off, 0));
    }

    fn store(&mut self, size: u8, dst: u8, src: u8, off: i16) {
        self.emit(BpfInsn::new(BPF_STX | size | BPF_MEM, dst, src, off, 0));
    }

    /// Two-slot `lddw` carrying a map fd with the pseudo-map-fd marker.
    fn load_map_fd(&mut self, dst: u8, map_fd: RawFd) {
        self.emit(BpfInsn::new(
            BPF_LD | BPF_DW | BPF_IMM,
            dst,
            BPF_PSEUDO_MAP_FD,
            0,
            map_fd,
        ));
        self.emit(BpfInsn::new(0, 0, 0, 0, 0));
    }

    fn call(&mut self, helper: i32) {
        self.emit(BpfInsn::new(BPF_JMP | BPF_CALL, 0, 0, 0, helper));
    }

    fn exit(&mut self) {
        self.emit(BpfInsn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0));
    }

    fn jmp_imm(&mut self, op: u8, dst: u8, imm: i32, target: Label) {
        self.fixups.push((self.insns.len(), target));
        self.emit(BpfInsn::new(BPF_JMP | op | BPF_K, dst, 0, 0, imm));
    }

    fn jmp_reg(&mut self, op: u8, dst: u8, src: u8, target: Label) {
        self.fixups.push((self.insns.len(), target));
        self.emit(BpfInsn::new(BPF_JMP | op | BPF_X, dst, src, 0, 0));
    }

    fn bind(&mut self, label: Label) {
        let here = Some(self.insns.len());
        match label {
            Label::Redirect => self.redirect = here,
            Label::Pass => self.pass = here,
        }
    }

    fn finish(mut self) -> Vec<BpfInsn> {
        for &(at, label) in &self.fixups {
            let target = match label {
                Label::Redirect => self.redirect,
                Label::Pass => self.pass,
            };
            // Both labels are bound unconditionally by `generate`.
            let target = target.unwrap_or(at + 1);
            self.insns[at].off = (target as i64 - at as i64 - 1) as i16;
        }
        self.insns
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// The inline port list: first occurrences, in caller order, capped at
/// [`MAX_INLINE_PORTS`].
pub fn inline_ports(ports: &[u16]) -> Vec<u16> {
    let mut out: Vec<u16> = Vec::with_capacity(MAX_INLINE_PORTS);
    for &port in ports {
        if out.len() == MAX_INLINE_PORTS {
            break;
        }
        if !out.contains(&port) {
            out.push(port);
        }
    }
    out
}

/// Build the filter program.
///
/// `socket_map_fd` is the XSKMAP (queue id → AF_XDP socket),
/// `port_filter_map_fd` the hash map (network-order UDP port → `u8` flag),
/// `ports` the ports known at load time.
pub fn generate(socket_map_fd: RawFd, port_filter_map_fd: RawFd, ports: &[u16]) -> Vec<BpfInsn> {
    let mut a = Asm::default();

    // r6 = ctx, r2 = data, r3 = data_end
    a.mov_reg(R6, R1);
    a.load(BPF_W, R2, R6, MD_DATA);
    a.load(BPF_W, R3, R6, MD_DATA_END);

    // Ethernet header in bounds, EtherType IPv4.
    a.mov_reg(R4, R2);
    a.alu_imm(BPF_ADD, R4, ETH_HLEN);
    a.jmp_reg(BPF_JGT, R4, R3, Label::Pass);
    a.load(BPF_H, R5, R2, ETH_TYPE_OFF);
    a.jmp_imm(BPF_JNE, R5, wire_u16(ETH_P_IP), Label::Pass);

    // Fixed IPv4 header in bounds, protocol UDP, sane IHL.
    a.mov_reg(R4, R2);
    a.alu_imm(BPF_ADD, R4, ETH_HLEN + IPV4_MIN_HLEN);
    a.jmp_reg(BPF_JGT, R4, R3, Label::Pass);
    a.load(BPF_B, R5, R2, IP_PROTO_OFF);
    a.jmp_imm(BPF_JNE, R5, IPPROTO_UDP, Label::Pass);
    a.load(BPF_B, R5, R2, IP_VER_IHL_OFF);
    a.alu_imm(BPF_AND, R5, 0x0f);
    a.jmp_imm(BPF_JLT, R5, 5, Label::Pass);
    a.alu_imm(BPF_LSH, R5, 2);

    // r4 = UDP header (after IP options); whole header in bounds.
    a.mov_reg(R4, R2);
    a.alu_reg(BPF_ADD, R4, R5);
    a.alu_imm(BPF_ADD, R4, ETH_HLEN);
    a.mov_reg(R5, R4);
    a.alu_imm(BPF_ADD, R5, UDP_HLEN);
    a.jmp_reg(BPF_JGT, R5, R3, Label::Pass);
    a.load(BPF_H, R7, R4, UDP_DPORT_OFF);

    for port in inline_ports(ports) {
        a.jmp_imm(BPF_JEQ, R7, wire_u16(port), Label::Redirect);
    }

    // flag = port_filter[dport]; absent or zero → pass.
    a.store(BPF_H, R10, R7, KEY_SLOT);
    a.mov_reg(R2, R10);
    a.alu_imm(BPF_ADD, R2, KEY_SLOT as i32);
    a.load_map_fd(R1, port_filter_map_fd);
    a.call(BPF_FUNC_MAP_LOOKUP_ELEM);
    a.jmp_imm(BPF_JEQ, R0, 0, Label::Pass);
    a.load(BPF_B, R1, R0, 0);
    a.jmp_imm(BPF_JEQ, R1, 0, Label::Pass);

    // bpf_redirect_map(xskmap, rx_queue_index, XDP_PASS). Only a reported
    // XDP_REDIRECT is returned as-is; anything else becomes XDP_PASS.
    a.bind(Label::Redirect);
    a.load(BPF_W, R2, R6, MD_RX_QUEUE_INDEX);
    a.load_map_fd(R1, socket_map_fd);
    a.mov_imm(R3, XdpAction::Pass as i32);
    a.call(BPF_FUNC_REDIRECT_MAP);
    a.jmp_imm(BPF_JNE, R0, XdpAction::Redirect as i32, Label::Pass);
    a.exit();

    a.bind(Label::Pass);
    a.mov_imm(R0, XdpAction::Pass as i32);
    a.exit();

    a.finish()
}
