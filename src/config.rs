// Capture session tunables.
//
// Defaults mirror the ring geometry the receiver has always shipped with:
// 256 blocks of 4 MiB, 2 KiB frames and a 250 ms block retire timeout.

use std::time::Duration;

use crate::error::CaptureError;

/// Bytes per ring block. Must be a multiple of the kernel page size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;
/// Number of blocks in the ring.
pub const DEFAULT_BLOCK_COUNT: u32 = 256;
/// Frame size handed to the kernel. Must be a power of two.
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
/// Time after which the kernel retires a partially filled block.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(250);
/// How long one poll for a ready block may last.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Accept length returned by compiled filters (jumbo-frame MTU).
pub const DEFAULT_SNAPLEN: u32 = 9000;

/// Poll timeout setting for block acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Twice the block retire timeout.
    FromBlockTimeout,
    /// A fixed interval.
    After(Duration),
}

impl PollTimeout {
    /// Millisecond form used by callers that pass `-1` for "derive".
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            PollTimeout::FromBlockTimeout
        } else {
            PollTimeout::After(Duration::from_millis(ms as u64))
        }
    }

    /// Resolve to a concrete interval.
    ///
    /// A block timeout of zero means "kernel default", which has no fixed
    /// value in user space; the derived poll interval then falls back to twice
    /// [`DEFAULT_BLOCK_TIMEOUT`] so polling never degenerates into spinning.
    pub fn resolve(self, block_timeout: Duration) -> Duration {
        match self {
            PollTimeout::After(d) => d,
            PollTimeout::FromBlockTimeout if block_timeout.is_zero() => DEFAULT_BLOCK_TIMEOUT * 2,
            PollTimeout::FromBlockTimeout => block_timeout * 2,
        }
    }
}

impl Default for PollTimeout {
    fn default() -> Self {
        PollTimeout::After(DEFAULT_POLL_TIMEOUT)
    }
}

/// Everything a [`CaptureSession`](crate::CaptureSession) needs to set up
/// its socket and ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// tcpdump-style capture expression. Must not be empty.
    pub filter: String,
    /// Bytes per block (page aligned).
    pub block_size: u32,
    /// Blocks in the ring.
    pub block_count: u32,
    /// Frame size (power of two). `block_size * block_count` must be a
    /// multiple of it; the kernel decides what happens otherwise.
    pub frame_size: u32,
    /// Block retire timeout. Zero lets the kernel choose.
    pub block_timeout: Duration,
    pub poll_timeout: PollTimeout,
    /// Retry internally across poll timeouts instead of returning `None`.
    pub blocking: bool,
    /// Bytes of each matching frame the filter tells the kernel to keep.
    pub snaplen: u32,
    /// Bind the socket to this interface. `None` captures on all of them.
    pub interface: Option<String>,
    /// Put `interface` in promiscuous mode for the session's lifetime.
    pub promiscuous: bool,
    /// Ask the kernel to fill the per-frame receive hash.
    pub fill_rxhash: bool,
    /// Some kernels wake poll(2) while the current block still holds no
    /// frames. When set, a non-blocking hold treats that wake-up as a
    /// timeout and returns `None`, which existing consumers rely on for
    /// their retry pacing.
    pub empty_wakeup_is_timeout: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            filter: String::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            poll_timeout: PollTimeout::default(),
            blocking: false,
            snaplen: DEFAULT_SNAPLEN,
            interface: None,
            promiscuous: false,
            fill_rxhash: true,
            empty_wakeup_is_timeout: true,
        }
    }
}

impl CaptureConfig {
    /// Reject values that would make ring arithmetic meaningless.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.block_size == 0 {
            return Err(CaptureError::Config("block size must be non-zero".to_string()));
        }
        if self.block_count == 0 {
            return Err(CaptureError::Config("block count must be non-zero".to_string()));
        }
        if self.frame_size == 0 {
            return Err(CaptureError::Config("frame size must be non-zero".to_string()));
        }
        if (self.block_size as u64) * (self.block_count as u64) > usize::MAX as u64 {
            return Err(CaptureError::Config(format!(
                "ring of {} x {} bytes does not fit the address space",
                self.block_count, self.block_size
            )));
        }
        if self.snaplen == 0 {
            return Err(CaptureError::Config("snaplen must be non-zero".to_string()));
        }
        if self.block_timeout.as_millis() > u32::MAX as u128 {
            return Err(CaptureError::Config(
                "block timeout does not fit in 32-bit milliseconds".to_string(),
            ));
        }
        if let Some(name) = &self.interface {
            if name.is_empty() {
                return Err(CaptureError::Config("interface name is empty".to_string()));
            }
        }
        if self.promiscuous && self.interface.is_none() {
            return Err(CaptureError::Config(
                "promiscuous mode needs an interface".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective poll interval for this configuration.
    pub fn effective_poll_timeout(&self) -> Duration {
        self.poll_timeout.resolve(self.block_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipping_geometry() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.block_size, 4_194_304);
        assert_eq!(cfg.block_count, 256);
        assert_eq!(cfg.frame_size, 2048);
        assert_eq!(cfg.block_timeout, Duration::from_millis(250));
        assert_eq!(cfg.effective_poll_timeout(), Duration::from_millis(500));
        assert!(!cfg.blocking);
        assert!(cfg.empty_wakeup_is_timeout);
        cfg.validate().unwrap();
    }

    #[test]
    fn negative_poll_timeout_derives_from_block_timeout() {
        assert_eq!(PollTimeout::from_millis(-1), PollTimeout::FromBlockTimeout);
        assert_eq!(
            PollTimeout::from_millis(-1).resolve(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(
            PollTimeout::from_millis(0).resolve(Duration::from_millis(100)),
            Duration::ZERO
        );
    }

    #[test]
    fn derived_poll_timeout_with_kernel_default_block_timeout() {
        let d = PollTimeout::FromBlockTimeout.resolve(Duration::ZERO);
        assert_eq!(d, Duration::from_millis(500));
    }

    #[test]
    fn zero_geometry_is_rejected() {
        for cfg in [
            CaptureConfig { block_size: 0, ..Default::default() },
            CaptureConfig { block_count: 0, ..Default::default() },
            CaptureConfig { frame_size: 0, ..Default::default() },
        ] {
            assert!(matches!(cfg.validate(), Err(CaptureError::Config(_))));
        }
    }

    #[test]
    fn indivisible_frame_size_is_not_checked() {
        // The kernel owns this decision.
        let cfg = CaptureConfig { frame_size: 3000, ..Default::default() };
        cfg.validate().unwrap();
    }

    #[test]
    fn promiscuous_requires_interface() {
        let cfg = CaptureConfig { promiscuous: true, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = CaptureConfig {
            promiscuous: true,
            interface: Some("eth0".to_string()),
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_interface_name_is_rejected() {
        let cfg = CaptureConfig { interface: Some(String::new()), ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
