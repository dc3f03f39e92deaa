use std::marker::PhantomData;
use std::ptr;
use std::time::Duration;

// struct tpacket3_hdr field offsets.
const TP_NEXT_OFFSET: usize = 0;
const TP_SEC: usize = 4;
const TP_NSEC: usize = 8;
const TP_SNAPLEN: usize = 12;
const TP_LEN: usize = 16;
const TP_STATUS: usize = 20;
const TP_MAC: usize = 24;
const TP_NET: usize = 26;
const TP_RXHASH: usize = 28;
const TP_VLAN_TCI: usize = 32;
const TP_VLAN_TPID: usize = 36;
/// `TPACKET_ALIGN(sizeof(struct tpacket3_hdr))`; the `sockaddr_ll` follows.
pub(crate) const TPACKET3_HDR_LEN: usize = 48;
pub(crate) const SOCKADDR_LL_LEN: usize = 20;
const SLL_PKTTYPE: usize = 10;

/// Link-layer packet type reported in the frame's `sockaddr_ll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Host,
    Broadcast,
    Multicast,
    OtherHost,
    /// Sent by this machine and looped back to the capturing socket.
    Outgoing,
    Other(u8),
}

impl From<u8> for PacketType {
    fn from(v: u8) -> Self {
        match v {
            0 => PacketType::Host,
            1 => PacketType::Broadcast,
            2 => PacketType::Multicast,
            3 => PacketType::OtherHost,
            4 => PacketType::Outgoing,
            other => PacketType::Other(other),
        }
    }
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Host => "host",
            PacketType::Broadcast => "broadcast",
            PacketType::Multicast => "multicast",
            PacketType::OtherHost => "otherhost",
            PacketType::Outgoing => "outgoing",
            PacketType::Other(_) => "other",
        }
    }
}

/// One captured frame inside a held block.
///
/// `data()` borrows straight from the shared mapping; nothing is copied.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    timestamp: Duration,
    snaplen: u32,
    len: u32,
    status: u32,
    mac: u16,
    net: u16,
    rxhash: u32,
    vlan_tci: u32,
    vlan_tpid: u16,
    packet_type: PacketType,
    data: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Captured bytes (at most the filter's accept length).
    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    /// Length of the frame on the wire.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    /// Offset of the link-layer header from the frame header.
    pub fn mac_offset(&self) -> u16 {
        self.mac
    }

    /// Offset of the network header from the frame header.
    pub fn net_offset(&self) -> u16 {
        self.net
    }

    pub fn rxhash(&self) -> u32 {
        self.rxhash
    }

    pub fn vlan_tci(&self) -> u32 {
        self.vlan_tci
    }

    pub fn vlan_tpid(&self) -> u16 {
        self.vlan_tpid
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Locally transmitted traffic seen by the capturing socket.
    pub fn is_outgoing(&self) -> bool {
        self.packet_type == PacketType::Outgoing
    }

    /// The captured bytes, starting at the Ethernet header.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Walks `tp_next_offset` through a block. Stops early, rather than read
/// outside the block or misaligned, if a header points past its end or off
/// a 4-byte boundary.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    base: *const u8,
    block_len: usize,
    offset: usize,
    remaining: u32,
    _block: PhantomData<&'a [u8]>,
}

impl<'a> Frames<'a> {
    pub(super) fn new(base: *const u8, block_len: usize, first: usize, count: u32) -> Self {
        Self {
            base,
            block_len,
            offset: first,
            remaining: count,
            _block: PhantomData,
        }
    }

    fn u32_at(&self, off: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(self.offset + off) as *const u32) }
    }

    fn u16_at(&self, off: usize) -> u16 {
        unsafe { ptr::read_volatile(self.base.add(self.offset + off) as *const u16) }
    }

    fn stop(&mut self) -> Option<Frame<'a>> {
        self.remaining = 0;
        None
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Frame<'a>;

    fn next(&mut self) -> Option<Frame<'a>> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset % 4 != 0 {
            log::debug!("frame header at offset {} is misaligned", self.offset);
            return self.stop();
        }
        if self.offset + TPACKET3_HDR_LEN + SOCKADDR_LL_LEN > self.block_len {
            log::debug!("frame header at offset {} runs past the block", self.offset);
            return self.stop();
        }

        let snaplen = self.u32_at(TP_SNAPLEN);
        let mac = self.u16_at(TP_MAC);
        let data_start = self.offset + mac as usize;
        if data_start + snaplen as usize > self.block_len {
            log::debug!(
                "frame at offset {} claims {} bytes past the block",
                self.offset,
                snaplen
            );
            return self.stop();
        }

        let pkttype = unsafe {
            ptr::read_volatile(self.base.add(self.offset + TPACKET3_HDR_LEN + SLL_PKTTYPE))
        };
        let frame = Frame {
            timestamp: Duration::new(self.u32_at(TP_SEC) as u64, self.u32_at(TP_NSEC)),
            snaplen,
            len: self.u32_at(TP_LEN),
            status: self.u32_at(TP_STATUS),
            mac,
            net: self.u16_at(TP_NET),
            rxhash: self.u32_at(TP_RXHASH),
            vlan_tci: self.u32_at(TP_VLAN_TCI),
            vlan_tpid: self.u16_at(TP_VLAN_TPID),
            packet_type: PacketType::from(pkttype),
            data: unsafe { std::slice::from_raw_parts(self.base.add(data_start), snaplen as usize) },
        };

        self.remaining -= 1;
        let next = self.u32_at(TP_NEXT_OFFSET) as usize;
        if next == 0 {
            self.remaining = 0;
        } else {
            self.offset += next;
        }
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
