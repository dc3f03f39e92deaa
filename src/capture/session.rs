use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use serde::Serialize;

use crate::bpf::{self, CompiledFilter};
use crate::config::{CaptureConfig, PollTimeout};
use crate::error::CaptureError;
use crate::ring::{self, BlockView, Frame, Frames, Ring, RingGeometry};

use super::reader::{RingReader, WaitPolicy};
use super::wait::PollWaiter;

const ETH_P_ALL: u16 = 0x0003;

#[allow(non_camel_case_types)]
#[repr(C)]
struct packet_mreq {
    mr_ifindex: i32,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct tpacket_stats_v3 {
    tp_packets: u32,
    tp_drops: u32,
    tp_freeze_q_cnt: u32,
}

/// Lifecycle of a [`CaptureSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        })
    }
}

/// Kernel counters since the previous read. Reading resets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames that passed the filter.
    pub packets: u32,
    /// Frames dropped because no block was free.
    pub drops: u32,
    /// Times the ring was frozen waiting for user space.
    pub freeze_count: u32,
}

/// A block currently held by the consumer.
///
/// Borrows the session, so the block cannot outlive
/// [`CaptureSession::release_block`].
#[derive(Debug, Clone, Copy)]
pub struct BlockRef<'a> {
    view: BlockView<'a>,
}

impl<'a> BlockRef<'a> {
    /// Position of the block in the ring.
    pub fn index(&self) -> usize {
        self.view.index()
    }

    /// Frames in the block, outgoing ones included.
    pub fn num_packets(&self) -> u32 {
        self.view.num_packets()
    }

    /// Kernel sequence number, increasing by one per retired block.
    pub fn seq_num(&self) -> u64 {
        self.view.seq_num()
    }

    pub fn first_timestamp(&self) -> Duration {
        self.view.first_timestamp()
    }

    pub fn last_timestamp(&self) -> Duration {
        self.view.last_timestamp()
    }

    /// Bytes of the block in use.
    pub fn len(&self) -> u32 {
        self.view.blk_len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_packets() == 0
    }

    pub fn frames(&self) -> Frames<'a> {
        self.view.frames()
    }

    /// Frames not sent by this host.
    pub fn incoming(&self) -> impl Iterator<Item = Frame<'a>> + 'a {
        self.view.frames().filter(|f| !f.is_outgoing())
    }
}

struct Active {
    // Field order is teardown order: unmap the ring, then close the socket.
    reader: RingReader<PollWaiter>,
    socket: OwnedFd,
}

/// One capture socket with its filter and mapped ring.
///
/// A session is used from one thread at a time; it can be moved between
/// threads.
pub struct CaptureSession {
    config: CaptureConfig,
    filter: Option<CompiledFilter>,
    active: Option<Active>,
    state: SessionState,
    last_error: String,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            filter: None,
            active: None,
            state: SessionState::Uninitialized,
            last_error: String::new(),
        }
    }

    /// Compile the filter, open the socket and map the ring.
    ///
    /// On failure everything acquired so far is released, the session stays
    /// inactive and [`last_error`](Self::last_error) describes the failed
    /// step. Calling this on an active session does nothing; a closed
    /// session cannot be reopened.
    pub fn initialize(&mut self) -> Result<(), CaptureError> {
        match self.state {
            SessionState::Active => {
                log::debug!("capture session already active");
                return Ok(());
            }
            SessionState::Closed => {
                let err = CaptureError::NotActive(SessionState::Closed);
                self.last_error = err.to_string();
                return Err(err);
            }
            SessionState::Uninitialized => {}
        }
        match self.setup() {
            Ok((filter, active)) => {
                self.filter = Some(filter);
                self.active = Some(active);
                self.state = SessionState::Active;
                self.last_error.clear();
                Ok(())
            }
            Err(e) => {
                log::warn!("capture setup failed: {e}");
                self.last_error = e.to_string();
                Err(e)
            }
        }
    }

    fn setup(&self) -> Result<(CompiledFilter, Active), CaptureError> {
        let cfg = &self.config;
        cfg.validate()?;

        let filter = bpf::compile(&cfg.filter, cfg.snaplen)?;

        let socket = open_socket().map_err(CaptureError::Socket)?;
        bpf::attach(&socket, &filter).map_err(CaptureError::AttachFilter)?;
        ring::set_packet_version(&socket).map_err(CaptureError::PacketVersion)?;

        let geometry = RingGeometry::from_config(cfg);
        let req = geometry.request(cfg.block_timeout, cfg.fill_rxhash);
        ring::request_ring(&socket, &req).map_err(CaptureError::RingGeometry)?;
        let ring = Ring::map(&socket, geometry).map_err(CaptureError::Mmap)?;

        if let Some(name) = &cfg.interface {
            let bind_err = |source| CaptureError::Bind {
                interface: name.clone(),
                source,
            };
            let if_index = if_nametoindex(name).map_err(bind_err)?;
            bind_interface(&socket, if_index).map_err(bind_err)?;
            if cfg.promiscuous {
                enable_promiscuous(&socket, name, if_index);
            }
        }

        log::info!(
            "capture ring mapped: {} blocks x {} bytes, {} frames of {} bytes, retire {:?}, filter {:?} ({} insns){}",
            geometry.block_count,
            geometry.block_size,
            req.tp_frame_nr,
            geometry.frame_size,
            cfg.block_timeout,
            filter.expression(),
            filter.len(),
            cfg.interface
                .as_deref()
                .map(|i| format!(", bound to {i}"))
                .unwrap_or_default()
        );

        let waiter = PollWaiter::new(socket.as_raw_fd());
        Ok((
            filter,
            Active {
                reader: RingReader::new(ring, waiter),
                socket,
            },
        ))
    }

    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            blocking: self.config.blocking,
            poll_timeout: self.config.effective_poll_timeout(),
            empty_wakeup_is_timeout: self.config.empty_wakeup_is_timeout,
        }
    }

    fn active_mut(&mut self) -> Result<&mut Active, CaptureError> {
        self.active
            .as_mut()
            .ok_or(CaptureError::NotActive(self.state))
    }

    /// Wait for the next block with frames in it.
    ///
    /// `Ok(None)` means the poll interval passed without one (non-blocking
    /// mode only). The returned block stays valid until
    /// [`release_block`](Self::release_block).
    pub fn hold_block(&mut self) -> Result<Option<BlockRef<'_>>, CaptureError> {
        let policy = self.wait_policy();
        let active = self.active_mut()?;
        match active.reader.hold(&policy) {
            Ok(view) => Ok(view.map(|view| BlockRef { view })),
            Err(e) => Err(CaptureError::Wait(e)),
        }
    }

    /// Hand the block under the cursor back to the kernel and move on.
    pub fn release_block(&mut self) -> Result<(), CaptureError> {
        self.active_mut()?.reader.release();
        Ok(())
    }

    /// Release every already-filled block without reading it. Returns how
    /// many blocks were dropped.
    pub fn clear_buffer(&mut self) -> Result<usize, CaptureError> {
        let released = self.active_mut()?.reader.clear();
        if released > 0 {
            log::debug!("discarded {released} filled blocks");
        }
        Ok(released)
    }

    /// The block under the cursor if it is ready, without waiting.
    pub fn current_block(&self) -> Option<BlockRef<'_>> {
        let view = self.active.as_ref()?.reader.current()?;
        Some(BlockRef { view })
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.config.blocking = blocking;
    }

    pub fn is_blocking(&self) -> bool {
        self.config.blocking
    }

    /// `PollTimeout::FromBlockTimeout` (or `from_millis(-1)`) polls for
    /// twice the block retire timeout.
    pub fn set_poll_timeout(&mut self, timeout: PollTimeout) {
        self.config.poll_timeout = timeout;
    }

    /// Poll interval currently in effect.
    pub fn poll_timeout(&self) -> Duration {
        self.config.effective_poll_timeout()
    }

    /// Reason the last `initialize` failed; empty after a successful one.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// The filter attached by the last successful `initialize`.
    pub fn filter(&self) -> Option<&CompiledFilter> {
        self.filter.as_ref()
    }

    /// Socket descriptor, for callers that multiplex it themselves.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.active.as_ref().map(|a| a.socket.as_raw_fd())
    }

    /// Kernel packet and drop counters since the previous call.
    pub fn stats(&self) -> Result<CaptureStats, CaptureError> {
        let active = self
            .active
            .as_ref()
            .ok_or(CaptureError::NotActive(self.state))?;
        let st = read_stats(&active.socket).map_err(CaptureError::Stats)?;
        Ok(CaptureStats {
            packets: st.tp_packets,
            drops: st.tp_drops,
            freeze_count: st.tp_freeze_q_cnt,
        })
    }

    /// Unmap the ring and close the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            log::debug!("closing capture socket {}", active.socket.as_raw_fd());
            drop(active);
        }
        self.state = SessionState::Closed;
    }

    /// Make an active session over an existing ring, without a packet socket.
    #[cfg(test)]
    pub(crate) fn activate_offline(&mut self, ring: Ring, socket: OwnedFd) {
        let waiter = PollWaiter::new(socket.as_raw_fd());
        self.active = Some(Active {
            reader: RingReader::new(ring, waiter),
            socket,
        });
        self.state = SessionState::Active;
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state)
            .field("filter", &self.config.filter)
            .field("fd", &self.raw_fd())
            .field("last_error", &self.last_error)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Socket helpers
// ---------------------------------------------------------------------------

fn open_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            ETH_P_ALL.to_be() as libc::c_int,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn if_nametoindex(name: &str) -> io::Result<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(idx)
}

fn bind_interface(fd: impl AsFd, if_index: u32) -> io::Result<()> {
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = ETH_P_ALL.to_be();
    sll.sll_ifindex = if_index as i32;

    let ret = unsafe {
        libc::bind(
            fd.as_fd().as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Membership is dropped by the kernel when the socket closes.
fn enable_promiscuous(fd: impl AsFd, interface: &str, if_index: u32) {
    let mreq = packet_mreq {
        mr_ifindex: if_index as i32,
        mr_type: ring::PACKET_MR_PROMISC,
        mr_alen: 0,
        mr_address: [0u8; 8],
    };
    let ret = unsafe {
        libc::setsockopt(
            fd.as_fd().as_raw_fd(),
            ring::SOL_PACKET,
            ring::PACKET_ADD_MEMBERSHIP,
            &mreq as *const packet_mreq as *const libc::c_void,
            std::mem::size_of::<packet_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        log::warn!(
            "PACKET_MR_PROMISC failed on {}: {} (continuing without promiscuous mode)",
            interface,
            io::Error::last_os_error()
        );
    }
}

fn read_stats(fd: impl AsFd) -> io::Result<tpacket_stats_v3> {
    let mut st = tpacket_stats_v3::default();
    let mut len = std::mem::size_of::<tpacket_stats_v3>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_fd().as_raw_fd(),
            ring::SOL_PACKET,
            ring::PACKET_STATISTICS,
            &mut st as *mut tpacket_stats_v3 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}
