// Block acquisition and the capture session built on it.
//
// `session` owns the socket and the mapped ring; `reader` walks the ring
// in order; `wait` is the only place that sleeps.

mod reader;
mod session;
mod wait;

pub use reader::{RingReader, WaitPolicy};
pub use session::{BlockRef, CaptureSession, CaptureStats, SessionState};
pub use wait::{PollWaiter, Readiness, Wait};
