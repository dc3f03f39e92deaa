//! Zero-copy packet capture over a memory-mapped `AF_PACKET` ring.
//!
//! A [`CaptureSession`] opens a raw socket, attaches a BPF program compiled
//! from a tcpdump-style expression, negotiates a `TPACKET_V3` receive ring
//! with the kernel and maps it into the process. The consumer then takes
//! blocks of frames directly out of the shared mapping:
//!
//! ```no_run
//! use zerocap::{CaptureConfig, CaptureSession};
//!
//! let mut session = CaptureSession::new(CaptureConfig {
//!     filter: "dst port 34567".to_string(),
//!     ..CaptureConfig::default()
//! });
//! session.initialize()?;
//!
//! loop {
//!     let Some(block) = session.hold_block()? else {
//!         continue; // poll timeout
//!     };
//!     let received = block.incoming().count();
//!     println!("block {}: {received} frames", block.index());
//!     session.release_block()?;
//! }
//! # Ok::<(), zerocap::CaptureError>(())
//! ```
//!
//! Frames flagged as outgoing are locally transmitted traffic looped back to
//! the capturing socket. The engine counts them in the block's packet count;
//! consumers that do not want to see their own transmissions should iterate
//! [`BlockRef::incoming`] instead of [`BlockRef::frames`].

pub mod bpf;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod output;
pub mod privilege;
pub mod ring;

pub use capture::{BlockRef, CaptureSession, CaptureStats, SessionState};
pub use config::{CaptureConfig, PollTimeout};
pub use error::CaptureError;
pub use ring::{Frame, PacketType};
