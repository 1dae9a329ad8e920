//! AF_XDP socket: one bound (interface, queue) endpoint.
//!
//! Each socket owns its UMEM and the four rings over it:
//! 1. Fill: user space hands empty frames to the kernel
//! 2. RX: the kernel hands back frames holding received packets
//! 3. TX: user space queues frames for transmission
//! 4. Completion: the kernel returns transmitted frames
//!
//! Received frames are lent to the caller through [`RxBatch`] and go straight
//! back to the Fill ring when the batch is dropped. Frames for transmission
//! come from the UMEM free list and return to it through the Completion ring.
//!
//! Setup:
//! - Zero-copy bind with a single copy-mode retry (`BindMode::Auto`)
//! - `XDP_USE_NEED_WAKEUP`, so the notify syscalls are only issued when the
//!   kernel side has gone idle
//! - Optional `SO_BUSY_POLL` tuning
//!
//! Data-path faults are never returned as errors. Malformed RX descriptors
//! and oversized TX packets are dropped and counted, and a full ring simply
//! accepts less work this cycle.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{BindMode, BusyPollConfig, XdpConfig};
use crate::error::{Result, XdpError};
use crate::ring::{ConsRing, ProdRing, RingOffsets, XdpDesc};
use crate::umem::{FrameLedger, Umem};

// ---------------------------------------------------------------------------
// Linux AF_XDP Constants (from <linux/if_xdp.h>)
// ---------------------------------------------------------------------------

const SOL_XDP: i32 = 283;
const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_RX_RING: i32 = 2;
const XDP_TX_RING: i32 = 3;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;
const XDP_STATISTICS: i32 = 7;

// mmap page offsets for each ring
const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_PGOFF_TX_RING: i64 = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x180000000;

// Bind flags
const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

// Busy poll socket options (from <asm-generic/socket.h>)
const SO_BUSY_POLL: i32 = 46;
const SO_PREFER_BUSY_POLL: i32 = 69;
const SO_BUSY_POLL_BUDGET: i32 = 70;

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: RingOffsets,
    tx: RingOffsets,
    fr: RingOffsets, // fill ring
    cr: RingOffsets, // completion ring
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// Kernel-side drop counters (`struct xdp_statistics`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    pub rx_ring_full: u64,
    pub rx_fill_ring_empty_descs: u64,
    pub tx_ring_empty_descs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XskMode {
    ZeroCopy,
    Copy,
}

impl XskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            XskMode::ZeroCopy => "zero-copy",
            XskMode::Copy => "copy",
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct XskStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    /// RX descriptors pointing outside the UMEM or past their frame.
    pub rx_malformed: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// TX packets larger than a frame.
    pub tx_oversized: AtomicU64,
    /// Send calls cut short by a full TX ring or an empty free list.
    pub tx_ring_full: AtomicU64,
    /// Returned RX frames parked on the free list for lack of Fill slots.
    pub fill_ring_full: AtomicU64,
    pub wakeups: AtomicU64,
}

/// Per-batch accumulator, flushed into [`XskStats`] once per call.
#[derive(Default)]
struct LocalStats {
    rx_packets: u64,
    rx_bytes: u64,
    rx_malformed: u64,
    tx_packets: u64,
    tx_bytes: u64,
    tx_oversized: u64,
    tx_ring_full: u64,
    fill_ring_full: u64,
    wakeups: u64,
}

impl LocalStats {
    #[inline]
    fn flush(&mut self, stats: &XskStats) {
        let pairs = [
            (&mut self.rx_packets, &stats.rx_packets),
            (&mut self.rx_bytes, &stats.rx_bytes),
            (&mut self.rx_malformed, &stats.rx_malformed),
            (&mut self.tx_packets, &stats.tx_packets),
            (&mut self.tx_bytes, &stats.tx_bytes),
            (&mut self.tx_oversized, &stats.tx_oversized),
            (&mut self.tx_ring_full, &stats.tx_ring_full),
            (&mut self.fill_ring_full, &stats.fill_ring_full),
            (&mut self.wakeups, &stats.wakeups),
        ];
        for (local, shared) in pairs {
            if *local > 0 {
                shared.fetch_add(*local, Ordering::Relaxed);
                *local = 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AF_XDP Socket
// ---------------------------------------------------------------------------

pub struct XskSocket {
    /// Dropped first: the socket must close before its rings and UMEM unmap.
    fd: OwnedFd,
    ifindex: u32,
    queue_id: u32,
    mode: XskMode,
    need_wakeup: bool,
    batch_size: u32,
    umem: Umem,
    fill: ProdRing<u64>,
    comp: ConsRing<u64>,
    rx: ConsRing<XdpDesc>,
    tx: ProdRing<XdpDesc>,
    /// Frames posted to Fill and not yet read back from RX.
    kernel_rx: u32,
    /// Frames lent out through the current `RxBatch`.
    rx_held: u32,
    /// Frames submitted on TX and not yet reaped from Completion.
    tx_outstanding: u32,
    /// Fill slots owed from batches that found the ring full.
    fill_deficit: u32,
    rx_descs: Vec<XdpDesc>,
    recycle: Vec<u64>,
    stats: Arc<XskStats>,
    local: LocalStats,
}

impl XskSocket {
    /// Create, configure and bind an AF_XDP socket, then pre-fill its Fill
    /// ring. Any failure closes everything created so far.
    pub fn create(ifindex: u32, queue_id: u32, config: &XdpConfig) -> Result<Self> {
        config.validate()?;

        let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(XdpError::last_os("socket(AF_XDP)"));
        }
        // SAFETY: freshly created descriptor, owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        debug!(fd = raw, "created AF_XDP socket");

        if let Some(busy_poll) = &config.busy_poll {
            try_set_busy_poll(raw, busy_poll);
        }

        let umem = Umem::init(
            raw,
            config.frame_count,
            config.frame_size,
            config.frame_headroom,
        )?;

        for (opt, size, name) in [
            (XDP_UMEM_FILL_RING, config.fill_ring_size, "XDP_UMEM_FILL_RING"),
            (
                XDP_UMEM_COMPLETION_RING,
                config.completion_ring_size,
                "XDP_UMEM_COMPLETION_RING",
            ),
            (XDP_RX_RING, config.rx_ring_size, "XDP_RX_RING"),
            (XDP_TX_RING, config.tx_ring_size, "XDP_TX_RING"),
        ] {
            set_xdp_opt(raw, opt, &size, name)?;
        }

        let offsets = mmap_offsets(raw)?;
        debug!(?offsets, "got XDP mmap offsets");

        let fill = ProdRing::<u64>::map(
            raw,
            XDP_UMEM_PGOFF_FILL_RING,
            offsets.fr,
            config.fill_ring_size,
        )?;
        let comp = ConsRing::<u64>::map(
            raw,
            XDP_UMEM_PGOFF_COMPLETION_RING,
            offsets.cr,
            config.completion_ring_size,
        )?;
        let rx = ConsRing::<XdpDesc>::map(raw, XDP_PGOFF_RX_RING, offsets.rx, config.rx_ring_size)?;
        let tx = ProdRing::<XdpDesc>::map(raw, XDP_PGOFF_TX_RING, offsets.tx, config.tx_ring_size)?;

        let mode = bind_socket(raw, ifindex, queue_id, config)?;

        let mut sock = Self::assemble(fd, ifindex, queue_id, mode, config, umem, fill, comp, rx, tx);
        sock.prefill();

        info!(
            ifindex,
            queue_id,
            mode = mode.as_str(),
            need_wakeup = config.need_wakeup,
            frames = config.frame_count,
            "AF_XDP socket bound"
        );
        Ok(sock)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        fd: OwnedFd,
        ifindex: u32,
        queue_id: u32,
        mode: XskMode,
        config: &XdpConfig,
        umem: Umem,
        fill: ProdRing<u64>,
        comp: ConsRing<u64>,
        rx: ConsRing<XdpDesc>,
        tx: ProdRing<XdpDesc>,
    ) -> Self {
        let batch = config.batch_size as usize;
        Self {
            fd,
            ifindex,
            queue_id,
            mode,
            need_wakeup: config.need_wakeup,
            batch_size: config.batch_size,
            umem,
            fill,
            comp,
            rx,
            tx,
            kernel_rx: 0,
            rx_held: 0,
            tx_outstanding: 0,
            fill_deficit: 0,
            rx_descs: Vec::with_capacity(batch),
            recycle: Vec::with_capacity(batch),
            stats: Arc::new(XskStats::default()),
            local: LocalStats::default(),
        }
    }

    /// Hand the kernel as many frames as the Fill ring holds. The rest of
    /// the pool stays on the free list for transmission.
    fn prefill(&mut self) {
        let want = self.fill.size().min(self.umem.free_count());
        let filled = self.push_fill_from_free(want);
        debug!(frames = filled, "pre-filled fill ring");
    }

    fn push_fill_from_free(&mut self, n: u32) -> u32 {
        let slots = self.fill.reserve(n.min(self.umem.free_count()));
        let mut pushed = 0;
        for idx in slots.iter() {
            let Some(addr) = self.umem.alloc_frame() else {
                break;
            };
            self.fill.write(idx, addr);
            pushed += 1;
        }
        self.fill.cancel(slots.len - pushed);
        self.fill.submit(pushed);
        self.kernel_rx += pushed;
        pushed
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn mode(&self) -> XskMode {
        self.mode
    }

    pub fn frame_size(&self) -> u32 {
        self.umem.frame_size()
    }

    pub fn stats(&self) -> &Arc<XskStats> {
        &self.stats
    }

    /// Where each UMEM frame currently is.
    pub fn ledger(&self) -> FrameLedger {
        FrameLedger {
            total: self.umem.frame_count(),
            free: self.umem.free_count(),
            fill: self.kernel_rx,
            rx_held: self.rx_held,
            tx_outstanding: self.tx_outstanding,
        }
    }

    /// Take up to `max` received packets (capped at the configured batch
    /// size). The frames return to the Fill ring when the batch is dropped.
    pub fn receive(&mut self, max: u32) -> RxBatch<'_> {
        if self.fill_deficit > 0 {
            let repaid = self.push_fill_from_free(self.fill_deficit);
            self.fill_deficit -= repaid;
        }

        let slots = self.rx.peek(max.min(self.batch_size));
        if slots.is_empty() {
            if self.need_wakeup && self.fill.needs_wakeup() {
                self.wake_rx();
            }
            self.local.flush(&self.stats);
            return RxBatch { sock: self };
        }

        for idx in slots.iter() {
            let desc = self.rx.read(idx);
            if self.umem.contains(desc.addr, desc.len) {
                self.local.rx_packets += 1;
                self.local.rx_bytes += desc.len as u64;
                self.rx_descs.push(desc);
            } else {
                self.local.rx_malformed += 1;
                if (desc.addr as usize) < self.umem.len() {
                    self.recycle.push(self.umem.frame_base(desc.addr));
                }
            }
        }
        self.rx.release(slots.len);
        self.kernel_rx -= slots.len;
        self.rx_held = (self.rx_descs.len() + self.recycle.len()) as u32;

        let malformed = slots.len - self.rx_descs.len() as u32;
        if malformed > 0 {
            debug!(
                queue_id = self.queue_id,
                malformed, "dropped malformed RX descriptors"
            );
        }
        RxBatch { sock: self }
    }

    /// Return every frame lent out by the current batch to Fill, or to the
    /// free list where Fill has no room.
    fn return_rx_frames(&mut self) {
        let mut frames = mem::take(&mut self.recycle);
        frames.extend(self.rx_descs.drain(..).map(|d| self.umem.frame_base(d.addr)));

        let slots = self.fill.reserve(frames.len() as u32);
        for (idx, &addr) in slots.iter().zip(frames.iter()) {
            self.fill.write(idx, addr);
        }
        self.fill.submit(slots.len);
        self.kernel_rx += slots.len;

        let parked = &frames[slots.len as usize..];
        if !parked.is_empty() {
            for &addr in parked {
                self.umem.free_frame(addr);
            }
            self.fill_deficit += parked.len() as u32;
            self.local.fill_ring_full += 1;
        }

        self.rx_held = 0;
        frames.clear();
        self.recycle = frames;
        self.local.flush(&self.stats);
    }

    /// Queue packets for transmission. Returns how many packets from the
    /// front of `packets` were consumed, either queued or dropped as
    /// oversized; the remainder hit backpressure and can be retried.
    pub fn send_batch<P: AsRef<[u8]>>(&mut self, packets: &[P]) -> usize {
        self.reap_completions();

        let frame_cap = self.umem.frame_size() as usize;
        let want = (packets.len().min(u32::MAX as usize) as u32).min(self.umem.free_count());
        let slots = self.tx.reserve(want);

        let mut queued = 0u32;
        let mut consumed = 0usize;
        for pkt in packets {
            let pkt = pkt.as_ref();
            if pkt.len() > frame_cap {
                self.local.tx_oversized += 1;
                consumed += 1;
                continue;
            }
            if queued == slots.len {
                self.local.tx_ring_full += 1;
                break;
            }
            let Some(addr) = self.umem.alloc_frame() else {
                self.local.tx_ring_full += 1;
                break;
            };
            let Some(buf) = self.umem.frame_mut(addr, pkt.len() as u32) else {
                self.umem.free_frame(addr);
                self.local.tx_oversized += 1;
                consumed += 1;
                continue;
            };
            buf.copy_from_slice(pkt);
            self.tx.write(
                slots.start.wrapping_add(queued),
                XdpDesc {
                    addr,
                    len: pkt.len() as u32,
                    options: 0,
                },
            );
            queued += 1;
            consumed += 1;
            self.local.tx_bytes += pkt.len() as u64;
        }

        self.tx.cancel(slots.len - queued);
        if queued > 0 {
            self.tx.submit(queued);
            self.tx_outstanding += queued;
            self.local.tx_packets += queued as u64;
            self.kick_tx();
        }
        self.local.flush(&self.stats);
        consumed
    }

    /// Move transmitted frames from the Completion ring back to the free
    /// list.
    pub fn reap_completions(&mut self) -> u32 {
        let slots = self.comp.peek(self.comp.size());
        for idx in slots.iter() {
            let addr = self.comp.read(idx);
            self.umem.free_frame(addr);
        }
        self.comp.release(slots.len);
        self.tx_outstanding = self.tx_outstanding.saturating_sub(slots.len);
        slots.len
    }

    /// Kernel-side counters (`XDP_STATISTICS`).
    pub fn kernel_stats(&self) -> Result<KernelStats> {
        let mut stats = KernelStats::default();
        let mut optlen = mem::size_of::<KernelStats>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd(),
                SOL_XDP,
                XDP_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            return Err(XdpError::last_os("XDP_STATISTICS"));
        }
        Ok(stats)
    }

    fn kick_tx(&mut self) {
        if self.need_wakeup && !self.tx.needs_wakeup() {
            return;
        }
        self.local.wakeups += 1;
        let ret = unsafe {
            libc::sendto(
                self.fd(),
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };
        if ret < 0 {
            log_wakeup_error("TX");
        }
    }

    fn wake_rx(&mut self) {
        self.local.wakeups += 1;
        let ret = unsafe {
            libc::recvfrom(
                self.fd(),
                std::ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            log_wakeup_error("RX");
        }
    }
}

fn log_wakeup_error(ring: &'static str) {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ENOBUFS) | Some(libc::ENETDOWN) => {}
        _ => debug!(ring, error = %err, "AF_XDP wakeup failed"),
    }
}

/// Packets lent out of the UMEM by [`XskSocket::receive`].
pub struct RxBatch<'a> {
    sock: &'a mut XskSocket,
}

impl<'a> RxBatch<'a> {
    pub fn len(&self) -> usize {
        self.sock.rx_descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sock.rx_descs.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&[u8]> {
        let desc = self.sock.rx_descs.get(i)?;
        self.sock.umem.frame(desc.addr, desc.len)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.sock
            .rx_descs
            .iter()
            .filter_map(move |d| self.sock.umem.frame(d.addr, d.len))
    }

    pub fn ledger(&self) -> FrameLedger {
        self.sock.ledger()
    }
}

impl Drop for RxBatch<'_> {
    fn drop(&mut self) {
        if self.sock.rx_held > 0 {
            self.sock.return_rx_frames();
        }
    }
}

// ---------------------------------------------------------------------------
// Socket setup helpers
// ---------------------------------------------------------------------------

fn set_xdp_opt<T>(fd: RawFd, opt: i32, value: &T, name: &'static str) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_XDP,
            opt,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(XdpError::last_os(name));
    }
    Ok(())
}

fn mmap_offsets(fd: RawFd) -> Result<XdpMmapOffsets> {
    let mut offsets = XdpMmapOffsets::default();
    let mut optlen = mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            SOL_XDP,
            XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        return Err(XdpError::last_os("XDP_MMAP_OFFSETS"));
    }
    Ok(offsets)
}

fn try_bind(fd: RawFd, ifindex: u32, queue_id: u32, flags: u16) -> io::Result<()> {
    let sxdp = SockaddrXdp {
        sxdp_family: libc::AF_XDP as u16,
        sxdp_flags: flags,
        sxdp_ifindex: ifindex,
        sxdp_queue_id: queue_id,
        sxdp_shared_umem_fd: 0,
    };
    let ret = unsafe {
        libc::bind(
            fd,
            &sxdp as *const _ as *const libc::sockaddr,
            mem::size_of::<SockaddrXdp>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind per `config.bind_mode`. `Auto` tries zero-copy, then copy mode once.
fn bind_socket(fd: RawFd, ifindex: u32, queue_id: u32, config: &XdpConfig) -> Result<XskMode> {
    let wakeup = if config.need_wakeup {
        XDP_USE_NEED_WAKEUP
    } else {
        0
    };

    match config.bind_mode {
        BindMode::ZeroCopy => try_bind(fd, ifindex, queue_id, XDP_ZEROCOPY | wakeup)
            .map(|_| XskMode::ZeroCopy)
            .map_err(|e| XdpError::syscall("bind(XDP_ZEROCOPY)", e)),
        BindMode::Copy => try_bind(fd, ifindex, queue_id, XDP_COPY | wakeup)
            .map(|_| XskMode::Copy)
            .map_err(|e| XdpError::syscall("bind(XDP_COPY)", e)),
        BindMode::Auto => {
            let zc_err = match try_bind(fd, ifindex, queue_id, XDP_ZEROCOPY | wakeup) {
                Ok(()) => return Ok(XskMode::ZeroCopy),
                Err(e) => e,
            };
            warn!(
                ifindex,
                queue_id,
                error = %zc_err,
                "XDP_ZEROCOPY bind failed, trying XDP_COPY mode"
            );
            try_bind(fd, ifindex, queue_id, XDP_COPY | wakeup)
                .map(|_| XskMode::Copy)
                .map_err(|copy| XdpError::Bind {
                    ifindex,
                    queue_id,
                    zero_copy: zc_err.to_string(),
                    copy,
                })
        }
    }
}

fn set_sol_socket(fd: RawFd, opt: i32, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Try to enable busy polling on the AF_XDP socket.
/// This is best-effort; older kernels just keep interrupt-driven NAPI.
fn try_set_busy_poll(fd: RawFd, config: &BusyPollConfig) {
    let opts = [
        (SO_PREFER_BUSY_POLL, 1, "SO_PREFER_BUSY_POLL"),
        (SO_BUSY_POLL, config.timeout_us as i32, "SO_BUSY_POLL"),
        (SO_BUSY_POLL_BUDGET, config.budget as i32, "SO_BUSY_POLL_BUDGET"),
    ];
    for (opt, value, name) in opts {
        if let Err(e) = set_sol_socket(fd, opt, value) {
            debug!(option = name, error = %e, "busy poll option not supported");
            return;
        }
    }
    info!(
        timeout_us = config.timeout_us,
        budget = config.budget,
        "AF_XDP busy polling enabled"
    );
}

// ---------------------------------------------------------------------------
// Simulated kernel side
// ---------------------------------------------------------------------------

#[cfg(test)]
impl XskSocket {
    /// A socket over anonymous rings, driven by the returned peer.
    pub(crate) fn with_peer(
        ifindex: u32,
        queue_id: u32,
        config: &XdpConfig,
    ) -> Result<(Self, crate::testing::KernelPeer)> {
        use crate::ring::anonymous_pair;

        let fd: OwnedFd = std::fs::File::open("/dev/null")
            .map_err(|e| XdpError::syscall("open /dev/null", e))?
            .into();
        let umem = Umem::new(config.frame_count, config.frame_size, config.frame_headroom)?;
        let (fill, peer_fill) = anonymous_pair::<u64>(config.fill_ring_size)?;
        let (peer_comp, comp) = anonymous_pair::<u64>(config.completion_ring_size)?;
        let (peer_rx, rx) = anonymous_pair::<XdpDesc>(config.rx_ring_size)?;
        let (tx, peer_tx) = anonymous_pair::<XdpDesc>(config.tx_ring_size)?;

        let mut sock = Self::assemble(
            fd,
            ifindex,
            queue_id,
            XskMode::Copy,
            config,
            umem,
            fill,
            comp,
            rx,
            tx,
        );
        sock.prefill();
        let peer = crate::testing::KernelPeer::new(peer_fill, peer_comp, peer_rx, peer_tx);
        Ok((sock, peer))
    }

    pub(crate) fn umem(&self) -> &Umem {
        &self.umem
    }

    pub(crate) fn umem_mut(&mut self) -> &mut Umem {
        &mut self.umem
    }
}
