pub mod json;
pub mod text;

use std::io::Write;
use std::time::Duration;

use serde::Serialize;

use crate::capture::{BlockRef, CaptureStats};
use crate::cli::OutputFormat;
use crate::error::CaptureError;

/// What one held block contained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockSummary {
    pub seq: u64,
    pub index: usize,
    /// Frames in the block, outgoing included.
    pub frames: u32,
    pub incoming: usize,
    pub outgoing: usize,
    /// Captured bytes of incoming frames.
    pub bytes: u64,
    /// Timestamp of the first frame, seconds since the epoch.
    pub first_ts: f64,
    pub last_ts: f64,
}

impl BlockSummary {
    pub fn from_block(block: &BlockRef<'_>) -> Self {
        let mut incoming = 0;
        let mut outgoing = 0;
        let mut bytes = 0u64;
        for frame in block.frames() {
            if frame.is_outgoing() {
                outgoing += 1;
            } else {
                incoming += 1;
                bytes += frame.snaplen() as u64;
            }
        }
        Self {
            seq: block.seq_num(),
            index: block.index(),
            frames: block.num_packets(),
            incoming,
            outgoing,
            bytes,
            first_ts: block.first_timestamp().as_secs_f64(),
            last_ts: block.last_timestamp().as_secs_f64(),
        }
    }
}

/// Totals reported when the receiver stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub blocks: u64,
    pub incoming: u64,
    pub bytes: u64,
    /// Holds that returned without a block.
    pub timeouts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<CaptureStats>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn record(&mut self, block: &BlockSummary) {
        self.blocks += 1;
        self.incoming += block.incoming as u64;
        self.bytes += block.bytes;
    }
}

pub fn write_block(
    block: &BlockSummary,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), CaptureError> {
    match format {
        OutputFormat::Text => text::write_block(block, writer),
        OutputFormat::Json => json::write_block(block, writer),
    }
}

pub fn write_summary(
    summary: &RunSummary,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), CaptureError> {
    match format {
        OutputFormat::Text => text::write_summary(summary, writer),
        OutputFormat::Json => json::write_summary(summary, writer),
    }
}

#[cfg(test)]
pub(crate) fn sample_block() -> BlockSummary {
    BlockSummary {
        seq: 42,
        index: 3,
        frames: 10,
        incoming: 9,
        outgoing: 1,
        bytes: 5400,
        first_ts: 1_700_000_000.5,
        last_ts: 1_700_000_000.75,
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;

    use super::*;
    use crate::capture::CaptureSession;
    use crate::config::CaptureConfig;
    use crate::ring::sim::{Kernel, SimFrame};
    use crate::ring::{Ring, RingGeometry};

    #[test]
    fn summary_counts_incoming_only() {
        let ring = Ring::anonymous(RingGeometry {
            block_size: 16 * 1024,
            block_count: 2,
            frame_size: 2048,
        })
        .unwrap();
        let kernel = Kernel::of(&ring);
        let (sock, _peer) = UnixDatagram::pair().unwrap();
        let mut session = CaptureSession::new(CaptureConfig::default());
        session.activate_offline(ring, OwnedFd::from(sock));

        kernel.retire(
            0,
            5,
            &[
                SimFrame::incoming(&[0; 100]),
                SimFrame::outgoing(&[0; 60]),
                SimFrame::incoming(&[0; 200]),
            ],
        );
        let block = session.hold_block().unwrap().unwrap();
        let summary = BlockSummary::from_block(&block);
        assert_eq!(summary.seq, 5);
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.incoming, 2);
        assert_eq!(summary.outgoing, 1);
        assert_eq!(summary.bytes, 300);
        assert_eq!(summary.first_ts, 1_700_000_000.0);

        let mut run = RunSummary::default();
        run.record(&summary);
        run.record(&summary);
        assert_eq!(run.blocks, 2);
        assert_eq!(run.incoming, 4);
        assert_eq!(run.bytes, 600);
    }
}
