//! `TPACKET_V3` receive ring.
//!
//! The kernel fills fixed-size blocks inside a region shared with user
//! space. Ownership of each block is handed back and forth through the
//! `block_status` word of its descriptor: the kernel sets `TP_STATUS_USER`
//! when it retires a block, user space stores `TP_STATUS_KERNEL` to give it
//! back. Nothing else is synchronized, so every header read here is a
//! volatile load and the status word goes through acquire/release atomics.

mod frame;
#[cfg(test)]
pub(crate) mod sim;

use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::CaptureConfig;

pub use self::frame::{Frame, Frames, PacketType};

// ---------------------------------------------------------------------------
// Kernel ABI (linux/if_packet.h)
// ---------------------------------------------------------------------------

pub const SOL_PACKET: libc::c_int = 263;
pub const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
pub const PACKET_RX_RING: libc::c_int = 5;
pub const PACKET_STATISTICS: libc::c_int = 6;
pub const PACKET_VERSION: libc::c_int = 10;
pub const PACKET_MR_PROMISC: u16 = 1;

pub const TPACKET_V3: libc::c_int = 2;

pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1;

const TP_FT_REQ_FILL_RXHASH: u32 = 1;

// struct tpacket_block_desc / tpacket_hdr_v1 field offsets.
const BLK_VERSION: usize = 0;
const BLK_OFFSET_TO_PRIV: usize = 4;
const BLK_STATUS: usize = 8;
const BLK_NUM_PKTS: usize = 12;
const BLK_OFFSET_TO_FIRST_PKT: usize = 16;
const BLK_LEN: usize = 20;
const BLK_SEQ_NUM: usize = 24;
const BLK_TS_FIRST: usize = 32;
const BLK_TS_LAST: usize = 40;
/// Size of the block descriptor.
pub const BLOCK_DESC_LEN: usize = 48;

/// `struct tpacket_req3`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpacketReq3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

const _: () = assert!(std::mem::size_of::<TpacketReq3>() == 28);

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Shape of the ring as requested from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
}

impl RingGeometry {
    pub fn from_config(cfg: &CaptureConfig) -> Self {
        Self {
            block_size: cfg.block_size,
            block_count: cfg.block_count,
            frame_size: cfg.frame_size,
        }
    }

    /// `(block_size * block_count) / frame_size`, truncated.
    pub fn frame_count(&self) -> u32 {
        let total = self.block_size as u64 * self.block_count as u64;
        total.checked_div(self.frame_size as u64).unwrap_or(0) as u32
    }

    /// Bytes to map.
    pub fn map_len(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    /// The `PACKET_RX_RING` request for this geometry.
    pub fn request(&self, retire: Duration, fill_rxhash: bool) -> TpacketReq3 {
        TpacketReq3 {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count(),
            tp_retire_blk_tov: retire.as_millis().min(u32::MAX as u128) as u32,
            tp_sizeof_priv: 0,
            tp_feature_req_word: if fill_rxhash { TP_FT_REQ_FILL_RXHASH } else { 0 },
        }
    }
}

// ---------------------------------------------------------------------------
// Socket options
// ---------------------------------------------------------------------------

fn setsockopt<T>(fd: impl AsFd, level: libc::c_int, name: libc::c_int, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_fd().as_raw_fd(),
            level,
            name,
            val as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Switch the socket to `TPACKET_V3` framing.
pub fn set_packet_version(fd: impl AsFd) -> io::Result<()> {
    setsockopt(fd, SOL_PACKET, PACKET_VERSION, &TPACKET_V3)
}

/// Ask the kernel to allocate the receive ring.
pub fn request_ring(fd: impl AsFd, req: &TpacketReq3) -> io::Result<()> {
    setsockopt(fd, SOL_PACKET, PACKET_RX_RING, req)
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// One `mmap` region, unmapped exactly once on drop.
struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    fn map(fd: libc::c_int, len: usize, flags: libc::c_int) -> io::Result<Self> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            log::warn!(
                "munmap of {} byte ring failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

/// A mapped receive ring.
pub struct Ring {
    region: MappedRegion,
    geometry: RingGeometry,
}

// The mapping is owned exclusively; the kernel is the only other party.
unsafe impl Send for Ring {}

impl Ring {
    /// Map the ring the kernel allocated for `fd`.
    pub fn map(fd: impl AsFd, geometry: RingGeometry) -> io::Result<Self> {
        let region = MappedRegion::map(
            fd.as_fd().as_raw_fd(),
            geometry.map_len(),
            libc::MAP_SHARED | libc::MAP_LOCKED,
        )?;
        Ok(Self { region, geometry })
    }

    /// A zero-filled ring with no socket behind it, every block owned by
    /// the kernel. Blocks only change hands when something writes them.
    pub fn anonymous(geometry: RingGeometry) -> io::Result<Self> {
        let region = MappedRegion::map(
            -1,
            geometry.map_len(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        )?;
        Ok(Self { region, geometry })
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn block_count(&self) -> usize {
        self.geometry.block_count as usize
    }

    /// View of block `index`.
    ///
    /// # Panics
    ///
    /// If `index` is not below [`block_count`](Self::block_count).
    pub fn block(&self, index: usize) -> BlockView<'_> {
        assert!(
            index < self.block_count(),
            "block index {index} out of range for {} blocks",
            self.block_count()
        );
        let size = self.geometry.block_size as usize;
        BlockView {
            base: unsafe { self.region.ptr.as_ptr().add(index * size) },
            len: size,
            index,
            _ring: PhantomData,
        }
    }

    /// Hand block `index` back to the kernel.
    pub fn flush(&self, index: usize) {
        self.block(index).release_to_kernel();
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("addr", &self.region.ptr)
            .field("len", &self.region.len)
            .field("geometry", &self.geometry)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Borrowed view of one block and its descriptor.
#[derive(Clone, Copy)]
pub struct BlockView<'a> {
    base: *mut u8,
    len: usize,
    index: usize,
    _ring: PhantomData<&'a Ring>,
}

impl<'a> BlockView<'a> {
    fn read_u32(&self, off: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(off) as *const u32) }
    }

    fn status_word(&self) -> &'a AtomicU32 {
        // Blocks start on page boundaries, so the word is aligned.
        unsafe { AtomicU32::from_ptr(self.base.add(BLK_STATUS) as *mut u32) }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> u32 {
        self.status_word().load(Ordering::Acquire)
    }

    pub fn is_user_owned(&self) -> bool {
        self.status() & TP_STATUS_USER != 0
    }

    /// Store `TP_STATUS_KERNEL`; the block must not be read afterwards.
    pub fn release_to_kernel(&self) {
        self.status_word().store(TP_STATUS_KERNEL, Ordering::Release);
    }

    pub fn version(&self) -> u32 {
        self.read_u32(BLK_VERSION)
    }

    pub fn offset_to_priv(&self) -> u32 {
        self.read_u32(BLK_OFFSET_TO_PRIV)
    }

    pub fn num_packets(&self) -> u32 {
        self.read_u32(BLK_NUM_PKTS)
    }

    pub fn offset_to_first_pkt(&self) -> u32 {
        self.read_u32(BLK_OFFSET_TO_FIRST_PKT)
    }

    /// Bytes of the block in use, descriptor included.
    pub fn blk_len(&self) -> u32 {
        self.read_u32(BLK_LEN)
    }

    pub fn seq_num(&self) -> u64 {
        unsafe { ptr::read_volatile(self.base.add(BLK_SEQ_NUM) as *const u64) }
    }

    /// Timestamp of the first frame in the block.
    pub fn first_timestamp(&self) -> Duration {
        self.timestamp_at(BLK_TS_FIRST)
    }

    /// Timestamp of the last frame in the block.
    pub fn last_timestamp(&self) -> Duration {
        self.timestamp_at(BLK_TS_LAST)
    }

    fn timestamp_at(&self, off: usize) -> Duration {
        Duration::new(self.read_u32(off) as u64, self.read_u32(off + 4))
    }

    /// Iterate the frames of a user-owned block.
    pub fn frames(&self) -> Frames<'a> {
        Frames::new(
            self.base as *const u8,
            self.len,
            self.offset_to_first_pkt() as usize,
            self.num_packets(),
        )
    }
}

impl std::fmt::Debug for BlockView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockView")
            .field("index", &self.index)
            .field("status", &self.status())
            .field("num_packets", &self.num_packets())
            .field("seq_num", &self.seq_num())
            .finish()
    }
}
