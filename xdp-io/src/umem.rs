//! UMEM: the frame pool backing every AF_XDP descriptor.
//!
//! A single anonymous mapping of `frame_count * frame_size` bytes, registered
//! with the kernel through `XDP_UMEM_REG` (which pins the pages). Descriptors
//! carry offsets into this region; packet bytes are never copied out of it
//! between allocation and reception/transmission.

use std::mem;
use std::os::fd::RawFd;

use tracing::info;

use crate::error::{Result, XdpError};
use crate::ring::MmapRegion;

const SOL_XDP: i32 = 283;
const XDP_UMEM_REG: i32 = 4;

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    /// Added in 6.8. Must be zero: older layouts leave this word as padding
    /// and the kernel reads the full struct when `optlen` covers it.
    tx_metadata_len: u32,
}

const _: () = {
    use std::mem::offset_of;
    assert!(offset_of!(XdpUmemReg, flags) == 24);
    assert!(offset_of!(XdpUmemReg, tx_metadata_len) == 28);
    assert!(mem::size_of::<XdpUmemReg>() == 32);
};

/// Where every frame of a pool currently lives.
///
/// `free + fill + rx_held + tx_outstanding == total` at all times.
/// `fill` counts frames posted to the Fill ring and not yet read back from
/// RX; frames sitting in the Completion ring stay in `tx_outstanding` until
/// they are reaped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameLedger {
    pub total: u32,
    pub free: u32,
    pub fill: u32,
    pub rx_held: u32,
    pub tx_outstanding: u32,
}

impl FrameLedger {
    pub fn is_balanced(&self) -> bool {
        self.free + self.fill + self.rx_held + self.tx_outstanding == self.total
    }
}

pub struct Umem {
    region: MmapRegion,
    frame_size: u32,
    frame_count: u32,
    headroom: u32,
    free: Vec<u64>,
    /// One bit per frame, set while the frame is outside the free list.
    in_use: Vec<u64>,
}

impl Umem {
    /// Allocate the pool without registering it.
    pub fn new(frame_count: u32, frame_size: u32, headroom: u32) -> Result<Self> {
        if !frame_count.is_power_of_two() {
            return Err(XdpError::InvalidConfig(format!(
                "frame_count must be a power of two, got {}",
                frame_count
            )));
        }
        if !frame_size.is_power_of_two() || headroom >= frame_size {
            return Err(XdpError::InvalidConfig(format!(
                "invalid frame_size {} / headroom {}",
                frame_size, headroom
            )));
        }

        let len = frame_count as usize * frame_size as usize;
        let region =
            MmapRegion::anonymous(len).map_err(|e| XdpError::syscall("mmap UMEM", e))?;

        // Lowest addresses are handed out first.
        let free = (0..frame_count)
            .rev()
            .map(|i| i as u64 * frame_size as u64)
            .collect();

        Ok(Self {
            region,
            frame_size,
            frame_count,
            headroom,
            free,
            in_use: vec![0; (frame_count as usize).div_ceil(64)],
        })
    }

    /// Allocate the pool and register it on an AF_XDP socket.
    pub fn init(fd: RawFd, frame_count: u32, frame_size: u32, headroom: u32) -> Result<Self> {
        let umem = Self::new(frame_count, frame_size, headroom)?;
        umem.register(fd)?;
        info!(
            umem_size = umem.len(),
            frame_size, frame_count, "registered UMEM"
        );
        Ok(umem)
    }

    fn registration(&self) -> XdpUmemReg {
        XdpUmemReg {
            addr: self.region.as_ptr() as u64,
            len: self.region.len() as u64,
            chunk_size: self.frame_size,
            headroom: self.headroom,
            flags: 0,
            tx_metadata_len: 0,
        }
    }

    fn register(&self, fd: RawFd) -> Result<()> {
        let reg = self.registration();
        let ret = unsafe {
            libc::setsockopt(
                fd,
                SOL_XDP,
                XDP_UMEM_REG,
                &reg as *const _ as *const libc::c_void,
                mem::size_of::<XdpUmemReg>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(XdpError::last_os("XDP_UMEM_REG"));
        }
        Ok(())
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.len() == 0
    }

    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Chunk-aligned base of the frame containing `addr`.
    #[inline(always)]
    pub fn frame_base(&self, addr: u64) -> u64 {
        addr & !(self.frame_size as u64 - 1)
    }

    #[inline(always)]
    fn bit(&self, base: u64) -> (usize, u64) {
        let idx = (base / self.frame_size as u64) as usize;
        (idx / 64, 1u64 << (idx % 64))
    }

    /// Take a frame off the free list.
    #[inline]
    pub fn alloc_frame(&mut self) -> Option<u64> {
        let addr = self.free.pop()?;
        let (word, mask) = self.bit(addr);
        self.in_use[word] |= mask;
        Some(addr)
    }

    /// Put a frame back on the free list. Any address inside the frame is
    /// accepted. Freeing a frame twice is a caller bug.
    #[inline]
    pub fn free_frame(&mut self, addr: u64) {
        let base = self.frame_base(addr);
        debug_assert!((base as usize) < self.len(), "frame {:#x} outside UMEM", addr);
        let (word, mask) = self.bit(base);
        debug_assert!(self.in_use[word] & mask != 0, "double free of frame {:#x}", base);
        self.in_use[word] &= !mask;
        self.free.push(base);
    }

    /// Checks a descriptor against the pool: inside the region and not
    /// spilling over its frame boundary.
    #[inline]
    pub fn contains(&self, addr: u64, len: u32) -> bool {
        let base = self.frame_base(addr);
        (addr as usize) < self.len()
            && addr.checked_add(len as u64)
                .is_some_and(|end| end <= base + self.frame_size as u64)
    }

    /// Packet bytes referenced by a descriptor.
    #[inline]
    pub fn frame(&self, addr: u64, len: u32) -> Option<&[u8]> {
        if !self.contains(addr, len) {
            return None;
        }
        // SAFETY: bounds checked against the mapping above.
        Some(unsafe {
            std::slice::from_raw_parts(self.region.as_ptr().add(addr as usize), len as usize)
        })
    }

    #[inline]
    pub fn frame_mut(&mut self, addr: u64, len: u32) -> Option<&mut [u8]> {
        if !self.contains(addr, len) {
            return None;
        }
        // SAFETY: bounds checked; `&mut self` keeps user-side access exclusive.
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.region.as_ptr().add(addr as usize), len as usize)
        })
    }
}
