use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::{self, CaptureConfig, PollTimeout};

#[derive(Parser, Debug)]
#[command(
    name = "zcrecv",
    version,
    about = "Receive frames from a memory-mapped AF_PACKET ring and report per-block counts"
)]
pub struct Cli {
    /// Capture filter in tcpdump syntax, e.g. `dst port 34567`
    #[arg(required = true, value_name = "EXPRESSION")]
    pub filter: Vec<String>,

    /// Bind to this interface instead of capturing on all of them
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Put the interface in promiscuous mode (needs --interface)
    #[arg(long, requires = "interface")]
    pub promisc: bool,

    /// Ring block size in bytes, a multiple of 4096 [default: 4194304]
    #[arg(long, default_value_t = config::DEFAULT_BLOCK_SIZE, value_parser = validate_block_size)]
    pub block_size: u32,

    /// Number of ring blocks [default: 256]
    #[arg(long, default_value_t = config::DEFAULT_BLOCK_COUNT, value_parser = validate_block_count)]
    pub block_count: u32,

    /// Frame size in bytes, a power of two [default: 2048]
    #[arg(long, default_value_t = config::DEFAULT_FRAME_SIZE, value_parser = validate_frame_size)]
    pub frame_size: u32,

    /// Block retire timeout in milliseconds; 0 lets the kernel pick [default: 250]
    #[arg(long, default_value_t = 250)]
    pub block_timeout_ms: u32,

    /// Poll timeout in milliseconds; -1 uses twice the block timeout [default: 500]
    #[arg(long, default_value_t = 500, allow_negative_numbers = true, value_parser = validate_poll_timeout)]
    pub poll_timeout_ms: i64,

    /// Keep waiting across poll timeouts
    #[arg(long)]
    pub blocking: bool,

    /// Bytes of each frame to capture [default: 9000]
    #[arg(long, default_value_t = config::DEFAULT_SNAPLEN, value_parser = validate_snaplen)]
    pub snaplen: u32,

    /// Do not ask the kernel for receive hashes
    #[arg(long)]
    pub no_rxhash: bool,

    /// Keep waiting when poll wakes up before a block is ready
    #[arg(long)]
    pub strict_wakeup: bool,

    /// Stop after this many blocks
    #[arg(long)]
    pub count: Option<u64>,

    /// Output format [default: text]
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    s.parse().map_err(|_| format!("'{s}' is not a valid integer"))
}

fn validate_block_size(s: &str) -> Result<u32, String> {
    let val = parse_u32(s)?;
    if val < 4096 || val % 4096 != 0 {
        Err("block-size must be a non-zero multiple of 4096".to_string())
    } else {
        Ok(val)
    }
}

fn validate_block_count(s: &str) -> Result<u32, String> {
    let val = parse_u32(s)?;
    if val == 0 {
        Err("block-count must be at least 1".to_string())
    } else if val > 65_536 {
        Err("block-count must be at most 65536".to_string())
    } else {
        Ok(val)
    }
}

fn validate_frame_size(s: &str) -> Result<u32, String> {
    let val = parse_u32(s)?;
    if val < 64 || !val.is_power_of_two() {
        Err("frame-size must be a power of two of at least 64".to_string())
    } else {
        Ok(val)
    }
}

fn validate_poll_timeout(s: &str) -> Result<i64, String> {
    let val: i64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val < -1 {
        Err("poll-timeout-ms must be -1 or more".to_string())
    } else {
        Ok(val)
    }
}

fn validate_snaplen(s: &str) -> Result<u32, String> {
    let val = parse_u32(s)?;
    if val == 0 {
        Err("snaplen must be at least 1".to_string())
    } else {
        Ok(val)
    }
}

impl Cli {
    /// The filter words joined back into one expression.
    pub fn expression(&self) -> String {
        self.filter.join(" ")
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            filter: self.expression(),
            block_size: self.block_size,
            block_count: self.block_count,
            frame_size: self.frame_size,
            block_timeout: Duration::from_millis(self.block_timeout_ms as u64),
            poll_timeout: PollTimeout::from_millis(self.poll_timeout_ms),
            blocking: self.blocking,
            snaplen: self.snaplen,
            interface: self.interface.clone(),
            promiscuous: self.promisc,
            fill_rxhash: !self.no_rxhash,
            empty_wakeup_is_timeout: !self.strict_wakeup,
        }
    }
}
