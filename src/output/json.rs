use std::io::Write;

use crate::error::CaptureError;

use super::{BlockSummary, RunSummary};

fn to_line<T: serde::Serialize>(value: &T, writer: &mut impl Write) -> Result<(), CaptureError> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| CaptureError::Serialization(std::io::Error::other(e.to_string())))?;
    writeln!(writer).map_err(CaptureError::Serialization)
}

/// One JSON object per line.
pub fn write_block(block: &BlockSummary, writer: &mut impl Write) -> Result<(), CaptureError> {
    to_line(block, writer)
}

pub fn write_summary(summary: &RunSummary, writer: &mut impl Write) -> Result<(), CaptureError> {
    to_line(summary, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureStats;
    use crate::output::sample_block;

    #[test]
    fn block_is_one_line_of_json() {
        let mut buf = Vec::new();
        write_block(&sample_block(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);

        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["seq"], 42);
        assert_eq!(v["incoming"], 9);
        assert_eq!(v["bytes"], 5400);
    }

    #[test]
    fn summary_includes_kernel_counters_when_present() {
        let mut summary = RunSummary {
            blocks: 3,
            ..RunSummary::default()
        };
        let mut buf = Vec::new();
        write_summary(&summary, &mut buf).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(v.get("kernel").is_none());
        assert!(v.get("elapsed").is_none());

        summary.kernel = Some(CaptureStats {
            packets: 30,
            drops: 2,
            freeze_count: 1,
        });
        buf.clear();
        write_summary(&summary, &mut buf).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["kernel"]["drops"], 2);
        assert_eq!(v["blocks"], 3);
    }
}
