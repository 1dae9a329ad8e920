//! Lock-free single-producer/single-consumer rings shared with the kernel.
//!
//! Each AF_XDP socket has four of these (Fill, Completion, RX, TX). The
//! producer and consumer indices live in memory the kernel also writes;
//! each side keeps a local copy of the peer's index and only re-reads the
//! shared one when the local view says there is not enough room/data.
//!
//! Indices are free-running `u32`s. Slot positions are always
//! `index & (size - 1)`, never a modulo.

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Result, XdpError};

/// Kernel sets this in a ring's flags word when it has gone idle and needs
/// an explicit syscall to resume (`XDP_RING_NEED_WAKEUP`).
pub const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

/// RX/TX descriptor (`struct xdp_desc`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// Byte offsets of one ring's fields inside its mmap (`struct xdp_ring_offset`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingOffsets {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

impl RingOffsets {
    /// Layout for rings placed in anonymous memory (no kernel involved).
    /// Each index gets its own cache line.
    pub const ANONYMOUS: RingOffsets = RingOffsets {
        producer: 0,
        consumer: 64,
        flags: 128,
        desc: 192,
    };

    /// Bytes needed to map a ring of `size` entries of `T`.
    pub fn map_len<T>(&self, size: u32) -> usize {
        self.desc as usize + size as usize * mem::size_of::<T>()
    }
}

// ---------------------------------------------------------------------------
// Owned mappings
// ---------------------------------------------------------------------------

/// An owned `mmap` region, unmapped on drop.
#[derive(Debug)]
pub(crate) struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory; synchronization of its contents is
// the job of the ring protocol and the UMEM ownership rules.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Map a ring exported by an AF_XDP socket at page offset `pgoff`.
    pub(crate) fn map_socket(fd: RawFd, len: usize, pgoff: i64) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        Self::from_mmap(ptr, len)
    }

    /// Private anonymous, pre-faulted memory.
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        Self::from_mmap(ptr, len)
    }

    fn from_mmap(ptr: *mut libc::c_void, len: usize) -> io::Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// ---------------------------------------------------------------------------
// Ring core
// ---------------------------------------------------------------------------

/// A run of ring positions handed out by `reserve` or `peek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slots {
    pub start: u32,
    pub len: u32,
}

impl Slots {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute ring indices covered by this run.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        let start = self.start;
        (0..self.len).map(move |i| start.wrapping_add(i))
    }
}

struct RingCore<T> {
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    flags: NonNull<AtomicU32>,
    descs: NonNull<T>,
    size: u32,
    mask: u32,
    /// Positions handed out by reserve/peek.
    local: u32,
    /// Positions made visible to the peer by submit/release.
    committed: u32,
    /// Last observed value of the peer's index.
    cached_peer: u32,
    _region: Arc<MmapRegion>,
    _marker: PhantomData<T>,
}

// SAFETY: a ring end is driven by one thread at a time; the shared indices
// are only touched through atomics.
unsafe impl<T: Send> Send for RingCore<T> {}

impl<T: Copy> RingCore<T> {
    fn new(region: Arc<MmapRegion>, offsets: RingOffsets, size: u32) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(XdpError::InvalidConfig(format!(
                "ring size must be a power of two, got {}",
                size
            )));
        }
        if offsets.map_len::<T>(size) > region.len() {
            return Err(XdpError::InvalidConfig(format!(
                "ring of {} entries does not fit a {}-byte mapping",
                size,
                region.len()
            )));
        }
        let aligned = |off: u64, align: usize| off as usize % align == 0;
        if !aligned(offsets.producer, 4)
            || !aligned(offsets.consumer, 4)
            || !aligned(offsets.flags, 4)
            || !aligned(offsets.desc, mem::align_of::<T>())
        {
            return Err(XdpError::InvalidConfig(format!(
                "misaligned ring offsets {:?}",
                offsets
            )));
        }

        let base = region.as_ptr();
        // SAFETY: offsets were bounds- and alignment-checked above; the
        // region is non-null, so the derived pointers are too.
        let (producer, consumer, flags, descs) = unsafe {
            (
                NonNull::new_unchecked(base.add(offsets.producer as usize) as *mut AtomicU32),
                NonNull::new_unchecked(base.add(offsets.consumer as usize) as *mut AtomicU32),
                NonNull::new_unchecked(base.add(offsets.flags as usize) as *mut AtomicU32),
                NonNull::new_unchecked(base.add(offsets.desc as usize) as *mut T),
            )
        };

        Ok(Self {
            producer,
            consumer,
            flags,
            descs,
            size,
            mask: size - 1,
            local: 0,
            committed: 0,
            cached_peer: 0,
            _region: region,
            _marker: PhantomData,
        })
    }

    #[inline(always)]
    fn producer(&self) -> &AtomicU32 {
        unsafe { self.producer.as_ref() }
    }

    #[inline(always)]
    fn consumer(&self) -> &AtomicU32 {
        unsafe { self.consumer.as_ref() }
    }

    #[inline(always)]
    fn needs_wakeup(&self) -> bool {
        unsafe { self.flags.as_ref() }.load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
    }

    #[inline(always)]
    fn slot(&self, idx: u32) -> *mut T {
        // SAFETY: masked index is always < size, which fits the mapping.
        unsafe { self.descs.as_ptr().add((idx & self.mask) as usize) }
    }

    /// `true` if `idx` lies in the handed-out but not yet committed window.
    #[inline(always)]
    fn in_window(&self, idx: u32) -> bool {
        idx.wrapping_sub(self.committed) < self.local.wrapping_sub(self.committed)
    }
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Producer end of a ring (Fill and TX from user space).
pub struct ProdRing<T> {
    core: RingCore<T>,
}

impl<T: Copy> ProdRing<T> {
    fn from_core(mut core: RingCore<T>) -> Self {
        core.local = core.producer().load(Ordering::Relaxed);
        core.committed = core.local;
        core.cached_peer = core.consumer().load(Ordering::Acquire);
        Self { core }
    }

    /// Map the producer end of a socket ring.
    pub(crate) fn map(fd: RawFd, pgoff: i64, offsets: RingOffsets, size: u32) -> Result<Self> {
        let len = offsets.map_len::<T>(size);
        let region = MmapRegion::map_socket(fd, len, pgoff)
            .map_err(|e| XdpError::syscall("mmap ring", e))?;
        RingCore::new(Arc::new(region), offsets, size).map(Self::from_core)
    }

    pub fn size(&self) -> u32 {
        self.core.size
    }

    /// Free slots according to the cached consumer index.
    #[inline(always)]
    fn cached_free(&self) -> u32 {
        self.core.size - self.core.local.wrapping_sub(self.core.cached_peer)
    }

    /// Reserve up to `n` slots. Re-reads the shared consumer index once if
    /// the cached view is short; never blocks.
    #[inline]
    pub fn reserve(&mut self, n: u32) -> Slots {
        let mut free = self.cached_free();
        if free < n {
            self.core.cached_peer = self.core.consumer().load(Ordering::Acquire);
            free = self.cached_free();
        }
        let len = n.min(free);
        let start = self.core.local;
        self.core.local = start.wrapping_add(len);
        Slots { start, len }
    }

    /// Write an entry into a reserved slot.
    #[inline(always)]
    pub fn write(&mut self, idx: u32, value: T) {
        debug_assert!(self.core.in_window(idx), "write outside reserved slots");
        unsafe { self.core.slot(idx).write(value) }
    }

    /// Publish the next `n` reserved slots to the consumer.
    #[inline]
    pub fn submit(&mut self, n: u32) {
        debug_assert!(
            n <= self.core.local.wrapping_sub(self.core.committed),
            "submit beyond reservation"
        );
        self.core.committed = self.core.committed.wrapping_add(n);
        // Descriptor writes must be visible before the index bump.
        fence(Ordering::Release);
        self.core
            .producer()
            .store(self.core.committed, Ordering::Relaxed);
    }

    /// Hand back reserved-but-unsubmitted slots.
    pub fn cancel(&mut self, n: u32) {
        let reserved = self.core.local.wrapping_sub(self.core.committed);
        self.core.local = self.core.local.wrapping_sub(n.min(reserved));
    }

    /// Entries submitted but not yet consumed by the peer, as of the last
    /// shared read.
    pub fn in_flight(&mut self) -> u32 {
        self.core.cached_peer = self.core.consumer().load(Ordering::Acquire);
        self.core.committed.wrapping_sub(self.core.cached_peer)
    }

    #[inline(always)]
    pub fn needs_wakeup(&self) -> bool {
        self.core.needs_wakeup()
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Consumer end of a ring (RX and Completion from user space).
pub struct ConsRing<T> {
    core: RingCore<T>,
}

impl<T: Copy> ConsRing<T> {
    fn from_core(mut core: RingCore<T>) -> Self {
        core.local = core.consumer().load(Ordering::Relaxed);
        core.committed = core.local;
        core.cached_peer = core.producer().load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        Self { core }
    }

    /// Map the consumer end of a socket ring.
    pub(crate) fn map(fd: RawFd, pgoff: i64, offsets: RingOffsets, size: u32) -> Result<Self> {
        let len = offsets.map_len::<T>(size);
        let region = MmapRegion::map_socket(fd, len, pgoff)
            .map_err(|e| XdpError::syscall("mmap ring", e))?;
        RingCore::new(Arc::new(region), offsets, size).map(Self::from_core)
    }

    pub fn size(&self) -> u32 {
        self.core.size
    }

    #[inline(always)]
    fn cached_avail(&self) -> u32 {
        self.core.cached_peer.wrapping_sub(self.core.local)
    }

    /// Take up to `n` filled slots. Re-reads the shared producer index once
    /// when the cached view is empty.
    #[inline]
    pub fn peek(&mut self, n: u32) -> Slots {
        let mut avail = self.cached_avail();
        if avail == 0 {
            self.core.cached_peer = self.core.producer().load(Ordering::Relaxed);
            // Descriptor reads must not be hoisted above the index read.
            fence(Ordering::Acquire);
            avail = self.cached_avail();
        }
        let len = n.min(avail);
        let start = self.core.local;
        self.core.local = start.wrapping_add(len);
        Slots { start, len }
    }

    #[inline(always)]
    pub fn read(&self, idx: u32) -> T {
        debug_assert!(self.core.in_window(idx), "read outside peeked slots");
        unsafe { self.core.slot(idx).read() }
    }

    /// Return the next `n` peeked slots to the producer.
    #[inline]
    pub fn release(&mut self, n: u32) {
        debug_assert!(
            n <= self.core.local.wrapping_sub(self.core.committed),
            "release beyond peek"
        );
        self.core.committed = self.core.committed.wrapping_add(n);
        fence(Ordering::Release);
        self.core
            .consumer()
            .store(self.core.committed, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn needs_wakeup(&self) -> bool {
        self.core.needs_wakeup()
    }
}

// ---------------------------------------------------------------------------
// Anonymous rings
// ---------------------------------------------------------------------------

/// Both ends of a ring placed in anonymous memory, for driving a socket's
/// data path against a simulated kernel peer.
#[cfg(test)]
pub(crate) fn anonymous_pair<T: Copy>(size: u32) -> Result<(ProdRing<T>, ConsRing<T>)> {
    let offsets = RingOffsets::ANONYMOUS;
    let region = MmapRegion::anonymous(offsets.map_len::<T>(size.max(1)))
        .map_err(|e| XdpError::syscall("mmap anonymous ring", e))?;
    let region = Arc::new(region);
    let prod = RingCore::new(region.clone(), offsets, size).map(ProdRing::from_core)?;
    let cons = RingCore::new(region, offsets, size).map(ConsRing::from_core)?;
    Ok((prod, cons))
}

#[cfg(test)]
impl<T> ProdRing<T> {
    pub(crate) fn set_needs_wakeup(&self, on: bool) {
        set_flag(&self.core, on);
    }
}

#[cfg(test)]
impl<T> ConsRing<T> {
    pub(crate) fn set_needs_wakeup(&self, on: bool) {
        set_flag(&self.core, on);
    }

    /// Give back the last `n` peeked but unreleased slots.
    pub(crate) fn unpeek(&mut self, n: u32) {
        let peeked = self.core.local.wrapping_sub(self.core.committed);
        self.core.local = self.core.local.wrapping_sub(n.min(peeked));
    }
}

#[cfg(test)]
fn set_flag<T>(core: &RingCore<T>, on: bool) {
    let flags = unsafe { core.flags.as_ref() };
    if on {
        flags.fetch_or(XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
    } else {
        flags.fetch_and(!XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
    }
}
