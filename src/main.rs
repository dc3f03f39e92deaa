use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use zerocap::cli::Cli;
use zerocap::output::{self, BlockSummary, RunSummary};
use zerocap::privilege;
use zerocap::{CaptureError, CaptureSession};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn exit_code(err: &CaptureError) -> i32 {
    match err {
        CaptureError::InsufficientPermission(_) => 1,
        CaptureError::Config(_)
        | CaptureError::FilterCompile(_)
        | CaptureError::Socket(_)
        | CaptureError::AttachFilter(_)
        | CaptureError::PacketVersion(_)
        | CaptureError::RingGeometry(_)
        | CaptureError::Mmap(_)
        | CaptureError::Bind { .. } => 2,
        _ => 3,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> Result<(), CaptureError> {
    install_signal_handlers();
    privilege::check_capture_access()?;

    let mut session = CaptureSession::new(cli.capture_config());
    session.initialize()?;
    log::info!(
        "capturing '{}' with {} blocks of {} bytes, poll timeout {:?}",
        cli.expression(),
        cli.block_count,
        cli.block_size,
        session.poll_timeout()
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut summary = RunSummary::default();
    let started = Instant::now();

    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        if cli.count.is_some_and(|n| summary.blocks >= n) {
            break;
        }
        let block = match session.hold_block()? {
            Some(block) => BlockSummary::from_block(&block),
            None => {
                summary.timeouts += 1;
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };
        session.release_block()?;
        summary.record(&block);
        output::write_block(&block, cli.format, &mut out)?;
    }

    summary.elapsed = started.elapsed();
    summary.kernel = match session.stats() {
        Ok(stats) => Some(stats),
        Err(e) => {
            log::warn!("{e}");
            None
        }
    };
    session.close();

    output::write_summary(&summary, cli.format, &mut out)?;
    out.flush().map_err(CaptureError::Serialization)
}
