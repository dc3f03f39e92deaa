// Stand-in for the kernel side of the ring: lays out retired blocks the
// way `prb_retire_current_block` leaves them, then flips them to user.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use super::frame::{SOCKADDR_LL_LEN, TPACKET3_HDR_LEN};
use super::{
    BLK_LEN, BLK_NUM_PKTS, BLK_OFFSET_TO_FIRST_PKT, BLK_OFFSET_TO_PRIV, BLK_SEQ_NUM, BLK_STATUS,
    BLK_TS_FIRST, BLK_TS_LAST, BLK_VERSION, BLOCK_DESC_LEN, Ring, TP_STATUS_USER,
};

/// Offset of the Ethernet header from the frame header.
const MAC_OFFSET: usize = (TPACKET3_HDR_LEN + SOCKADDR_LL_LEN + 15) & !15;
const BASE_SEC: u32 = 1_700_000_000;

#[derive(Debug, Clone)]
pub(crate) struct SimFrame {
    pub data: Vec<u8>,
    pub wire_len: u32,
    pub pkttype: u8,
    pub rxhash: u32,
    pub vlan_tci: u32,
}

impl SimFrame {
    pub fn incoming(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            wire_len: data.len() as u32,
            pkttype: 0,
            rxhash: 0,
            vlan_tci: 0,
        }
    }

    pub fn outgoing(data: &[u8]) -> Self {
        Self {
            pkttype: 4,
            ..Self::incoming(data)
        }
    }
}

/// Write access to a ring's blocks, detached from the `Ring` borrow so a
/// test waiter can retire blocks while a reader owns the ring. Only valid
/// while the ring it came from is alive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Kernel {
    base: *mut u8,
    block_size: usize,
    block_count: usize,
}

impl Kernel {
    pub fn of(ring: &Ring) -> Self {
        Self {
            base: ring.region.ptr.as_ptr(),
            block_size: ring.geometry.block_size as usize,
            block_count: ring.block_count(),
        }
    }

    fn block_base(&self, index: usize) -> *mut u8 {
        assert!(index < self.block_count);
        unsafe { self.base.add(index * self.block_size) }
    }

    fn status(&self, index: usize) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.block_base(index).add(BLK_STATUS) as *mut u32) }
    }

    pub fn is_user_owned(&self, index: usize) -> bool {
        self.status(index).load(Ordering::Acquire) & TP_STATUS_USER != 0
    }

    /// Overwrite one 32-bit word of block `index`.
    pub fn poke_u32(&self, index: usize, off: usize, v: u32) {
        put_u32(self.block_base(index), off, v);
    }

    /// Fill block `index` with `frames` and hand it to user space.
    ///
    /// Frame `i` is stamped `BASE_SEC` seconds plus `i` microseconds.
    pub fn retire(&self, index: usize, seq: u64, frames: &[SimFrame]) {
        let base = self.block_base(index);

        let mut off = BLOCK_DESC_LEN;
        for (i, f) in frames.iter().enumerate() {
            let frame_len = (MAC_OFFSET + f.data.len() + 15) & !15;
            assert!(off + frame_len <= self.block_size, "simulated frames overflow the block");

            let hdr = unsafe { base.add(off) };
            let last = i + 1 == frames.len();
            put_u32(hdr, 0, if last { 0 } else { frame_len as u32 });
            put_u32(hdr, 4, BASE_SEC);
            put_u32(hdr, 8, i as u32 * 1_000);
            put_u32(hdr, 12, f.data.len() as u32);
            put_u32(hdr, 16, f.wire_len);
            put_u32(hdr, 20, TP_STATUS_USER);
            put_u16(hdr, 24, MAC_OFFSET as u16);
            put_u16(hdr, 26, (MAC_OFFSET + 14) as u16);
            put_u32(hdr, 28, f.rxhash);
            put_u32(hdr, 32, f.vlan_tci);
            put_u16(hdr, 36, if f.vlan_tci != 0 { 0x8100 } else { 0 });

            let sll = unsafe { hdr.add(TPACKET3_HDR_LEN) };
            put_u16(sll, 0, libc::AF_PACKET as u16);
            unsafe {
                ptr::write_volatile(sll.add(10), f.pkttype);
                ptr::copy_nonoverlapping(f.data.as_ptr(), hdr.add(MAC_OFFSET), f.data.len());
            }
            off += frame_len;
        }

        put_u32(base, BLK_VERSION, 1);
        put_u32(base, BLK_OFFSET_TO_PRIV, BLOCK_DESC_LEN as u32);
        put_u32(base, BLK_NUM_PKTS, frames.len() as u32);
        put_u32(base, BLK_OFFSET_TO_FIRST_PKT, BLOCK_DESC_LEN as u32);
        put_u32(base, BLK_LEN, off as u32);
        unsafe { ptr::write_volatile(base.add(BLK_SEQ_NUM) as *mut u64, seq) };
        let (first, last) = match frames.len() {
            0 => ((0, 0), (0, 0)),
            n => ((BASE_SEC, 0), (BASE_SEC, (n as u32 - 1) * 1_000)),
        };
        put_u32(base, BLK_TS_FIRST, first.0);
        put_u32(base, BLK_TS_FIRST + 4, first.1);
        put_u32(base, BLK_TS_LAST, last.0);
        put_u32(base, BLK_TS_LAST + 4, last.1);

        self.status(index).store(TP_STATUS_USER, Ordering::Release);
    }

    /// Retire block `index` with `count` small UDP-looking frames.
    pub fn retire_n(&self, index: usize, seq: u64, count: usize) {
        let frames: Vec<SimFrame> = (0..count)
            .map(|i| SimFrame::incoming(&[i as u8; 64]))
            .collect();
        self.retire(index, seq, &frames);
    }

    /// Retire block `index` with no frames in it.
    pub fn retire_empty(&self, index: usize, seq: u64) {
        self.retire(index, seq, &[]);
    }
}

fn put_u32(base: *mut u8, off: usize, v: u32) {
    unsafe { ptr::write_volatile(base.add(off) as *mut u32, v) }
}

fn put_u16(base: *mut u8, off: usize, v: u16) {
    unsafe { ptr::write_volatile(base.add(off) as *mut u16, v) }
}

pub(crate) fn first_frame_offset() -> usize {
    BLOCK_DESC_LEN
}

pub(crate) fn retire(ring: &Ring, index: usize, seq: u64, frames: &[SimFrame]) {
    Kernel::of(ring).retire(index, seq, frames);
}

pub(crate) fn poke_u32(ring: &Ring, index: usize, off: usize, v: u32) {
    Kernel::of(ring).poke_u32(index, off, v);
}
