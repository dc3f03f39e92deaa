//! Capture filter compiler.
//!
//! Turns a tcpdump-style expression into a classic BPF program that the
//! kernel runs against every frame before it lands in the ring.
//! Compilation goes through the system libpcap (the default `libpcap`
//! feature). Builds with default features off use a built-in compiler for
//! the commonly used subset of the pcap-filter grammar instead, for hosts
//! without libpcap.

#[cfg(not(feature = "libpcap"))]
mod codegen;
#[cfg(not(feature = "libpcap"))]
mod expr;
pub mod filter;
#[cfg(feature = "libpcap")]
pub mod libpcap;

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

pub use self::filter::SockFilter;

/// Serializes every compilation in the process. Older libpcap releases keep
/// parser state in globals, so concurrent `pcap_compile` calls corrupt each
/// other.
static COMPILE_LOCK: Mutex<()> = Mutex::new(());

/// Deepest nesting of parentheses, `not`s or chained operators accepted in
/// an expression.
pub const MAX_NESTING: usize = 256;

/// A capture expression that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{detail} (at offset {offset})")]
pub struct FilterError {
    /// Byte offset into the expression where the problem was found.
    pub offset: usize,
    pub detail: String,
}

impl FilterError {
    pub(crate) fn new(offset: usize, detail: impl Into<String>) -> Self {
        Self {
            offset,
            detail: detail.into(),
        }
    }
}

/// A compiled, immutable BPF program and the expression it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    expression: String,
    instructions: Vec<SockFilter>,
}

impl CompiledFilter {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn instructions(&self) -> &[SockFilter] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Run the program over `frame` and return the accept length
    /// (0 = drop), exactly as the kernel would.
    pub fn run(&self, frame: &[u8]) -> u32 {
        filter::run(&self.instructions, frame)
    }

    /// Whether the kernel would deliver `frame`.
    pub fn matches(&self, frame: &[u8]) -> bool {
        self.run(frame) != 0
    }

    /// Structural checks the kernel performs on attach.
    pub fn validate(&self) -> Result<(), String> {
        filter::validate(&self.instructions)
    }
}

/// Compile `expression` into a program that accepts `snaplen` bytes of each
/// matching frame.
///
/// Compilation is serialized process-wide. On failure no program is
/// produced and the error carries a human-readable reason.
pub fn compile(expression: &str, snaplen: u32) -> Result<CompiledFilter, FilterError> {
    if snaplen == 0 {
        return Err(FilterError::new(0, "snaplen must be non-zero"));
    }

    check_nesting(expression)?;

    let start = Instant::now();
    let instructions = {
        let _guard = COMPILE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        backend(expression, snaplen)?
    };

    filter::validate(&instructions)
        .map_err(|e| FilterError::new(0, format!("generated program rejected: {e}")))?;

    log::debug!(
        "compiled filter {:?} into {} instructions in {:?}",
        expression,
        instructions.len(),
        start.elapsed()
    );

    Ok(CompiledFilter {
        expression: expression.to_string(),
        instructions,
    })
}

/// Reject runaway parenthesis nesting before any backend recurses over it.
fn check_nesting(expression: &str) -> Result<(), FilterError> {
    let mut depth = 0usize;
    for (offset, c) in expression.char_indices() {
        match c {
            '(' => {
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(FilterError::new(
                        offset,
                        format!("expression nested more than {MAX_NESTING} levels deep"),
                    ));
                }
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(not(feature = "libpcap"))]
fn backend(expression: &str, snaplen: u32) -> Result<Vec<SockFilter>, FilterError> {
    let ast = expr::parse(expression)?;
    codegen::generate(&ast, snaplen)
}

#[cfg(feature = "libpcap")]
fn backend(expression: &str, snaplen: u32) -> Result<Vec<SockFilter>, FilterError> {
    if expression.trim().is_empty() {
        return Err(FilterError::new(0, "empty capture expression"));
    }
    libpcap::compile(expression, snaplen)
}

// ---------------------------------------------------------------------------
// Kernel attach
// ---------------------------------------------------------------------------

#[allow(non_camel_case_types)]
#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *const SockFilter,
}

/// Attach `filter` to a socket with `SO_ATTACH_FILTER`.
///
/// The kernel copies the program, so `filter` only has to outlive the call.
pub fn attach(fd: impl AsFd, filter: &CompiledFilter) -> io::Result<()> {
    let insns = filter.instructions();
    let len = u16::try_from(insns.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "filter program too long"))?;
    let prog = sock_fprog {
        len,
        filter: insns.as_ptr(),
    };

    let ret = unsafe {
        libc::setsockopt(
            fd.as_fd().as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const sock_fprog as *const libc::c_void,
            std::mem::size_of::<sock_fprog>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
