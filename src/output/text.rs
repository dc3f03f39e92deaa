use std::io::Write;

use crate::error::CaptureError;

use super::{BlockSummary, RunSummary};

pub fn write_block(b: &BlockSummary, writer: &mut impl Write) -> Result<(), CaptureError> {
    writeln!(
        writer,
        "block seq={} idx={} frames={} incoming={} outgoing={} bytes={} ts={:.6}",
        b.seq, b.index, b.frames, b.incoming, b.outgoing, b.bytes, b.first_ts
    )
    .map_err(CaptureError::Serialization)
}

pub fn write_summary(s: &RunSummary, writer: &mut impl Write) -> Result<(), CaptureError> {
    let secs = s.elapsed.as_secs_f64();
    let rate = if secs > 0.0 { s.incoming as f64 / secs } else { 0.0 };
    writeln!(
        writer,
        "{} blocks, {} frames, {} bytes, {} timeouts in {:.1}s ({:.0} frames/s)",
        s.blocks, s.incoming, s.bytes, s.timeouts, secs, rate
    )
    .map_err(CaptureError::Serialization)?;
    if let Some(k) = &s.kernel {
        writeln!(
            writer,
            "kernel: {} packets, {} dropped, {} freezes",
            k.packets, k.drops, k.freeze_count
        )
        .map_err(CaptureError::Serialization)?;
    }
    Ok(())
}
