// Block acquisition loop.
//
// The reader owns the ring and a cursor naming the next block to consume.
// Blocks are consumed strictly in ring order; a block is only touched while
// its status word says user space owns it.

use std::io;
use std::time::{Duration, Instant};

use crate::ring::{BlockView, Ring};

use super::wait::{Readiness, Wait};

/// How `hold` behaves when no block is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Keep waiting across poll timeouts instead of returning `None`.
    pub blocking: bool,
    /// Length of one wait.
    pub poll_timeout: Duration,
    /// In non-blocking mode, treat a wake-up that leaves the current block
    /// without frames as a timeout.
    pub empty_wakeup_is_timeout: bool,
}

pub struct RingReader<W> {
    ring: Ring,
    cursor: usize,
    waiter: W,
}

impl<W: Wait> RingReader<W> {
    pub fn new(ring: Ring, waiter: W) -> Self {
        Self {
            ring,
            cursor: 0,
            waiter,
        }
    }

    /// Index of the block the next `hold` looks at.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// The block under the cursor, if user space owns it and it has frames.
    pub fn current(&self) -> Option<BlockView<'_>> {
        let block = self.ring.block(self.cursor);
        (block.is_user_owned() && block.num_packets() != 0).then_some(block)
    }

    /// Wait for the block under the cursor to become user-owned and
    /// non-empty, skipping empty retired blocks on the way.
    ///
    /// Returns `Ok(None)` in non-blocking mode when nothing arrived within
    /// one poll interval, and in either mode when a signal interrupted the
    /// wait. Holding again without releasing returns the same block
    /// immediately.
    pub fn hold(&mut self, policy: &WaitPolicy) -> io::Result<Option<BlockView<'_>>> {
        // An interval too long to represent has no deadline.
        let deadline = if policy.blocking {
            None
        } else {
            Instant::now().checked_add(policy.poll_timeout)
        };

        loop {
            let (owned, packets) = {
                let block = self.ring.block(self.cursor);
                (block.is_user_owned(), block.num_packets())
            };
            if owned {
                if packets != 0 {
                    return Ok(Some(self.ring.block(self.cursor)));
                }
                log::trace!("skipping empty block {}", self.cursor);
                self.release();
                continue;
            }

            let timeout = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => policy.poll_timeout,
            };
            match self.waiter.wait(timeout)? {
                Readiness::Interrupted => return Ok(None),
                Readiness::TimedOut if policy.blocking => {}
                Readiness::TimedOut => return Ok(None),
                Readiness::Ready if policy.blocking => {}
                Readiness::Ready => {
                    if self.ring.block(self.cursor).num_packets() == 0 {
                        if policy.empty_wakeup_is_timeout {
                            log::debug!(
                                "woken with block {} still empty, reporting a timeout",
                                self.cursor
                            );
                            return Ok(None);
                        }
                        if deadline.is_some_and(|d| Instant::now() >= d) {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Give the block under the cursor back to the kernel and advance.
    pub fn release(&mut self) {
        self.ring.flush(self.cursor);
        self.cursor = (self.cursor + 1) % self.ring.block_count();
    }

    /// Release every consecutive user-owned block from the cursor on,
    /// stopping at the first kernel-owned one. Returns how many were
    /// released; never more than one lap of the ring.
    pub fn clear(&mut self) -> usize {
        let mut released = 0;
        for _ in 0..self.ring.block_count() {
            if !self.ring.block(self.cursor).is_user_owned() {
                break;
            }
            self.release();
            released += 1;
        }
        released
    }
}

impl<W> std::fmt::Debug for RingReader<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("ring", &self.ring)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::ring::sim::Kernel;
    use crate::ring::{RingGeometry, TP_STATUS_KERNEL};

    /// What the scripted waiter does on its next call.
    enum Step {
        Timeout,
        Ready,
        /// The kernel retires `block` with `frames` frames during the wait.
        Retire { block: usize, frames: usize },
        Fail(i32),
        Interrupt,
    }

    struct Scripted {
        kernel: Kernel,
        steps: VecDeque<Step>,
        calls: Vec<Duration>,
    }

    impl Wait for Scripted {
        fn wait(&mut self, timeout: Duration) -> io::Result<Readiness> {
            self.calls.push(timeout);
            match self.steps.pop_front() {
                None | Some(Step::Timeout) => Ok(Readiness::TimedOut),
                Some(Step::Ready) => Ok(Readiness::Ready),
                Some(Step::Retire { block, frames }) => {
                    self.kernel.retire_n(block, block as u64, frames);
                    Ok(Readiness::Ready)
                }
                Some(Step::Fail(errno)) => Err(io::Error::from_raw_os_error(errno)),
                Some(Step::Interrupt) => Ok(Readiness::Interrupted),
            }
        }
    }

    fn reader(blocks: u32, steps: Vec<Step>) -> (RingReader<Scripted>, Kernel) {
        let ring = Ring::anonymous(RingGeometry {
            block_size: 16 * 1024,
            block_count: blocks,
            frame_size: 2048,
        })
        .unwrap();
        let kernel = Kernel::of(&ring);
        let waiter = Scripted {
            kernel,
            steps: steps.into(),
            calls: Vec::new(),
        };
        (RingReader::new(ring, waiter), kernel)
    }

    fn nonblocking() -> WaitPolicy {
        WaitPolicy {
            blocking: false,
            poll_timeout: Duration::from_millis(500),
            empty_wakeup_is_timeout: true,
        }
    }

    fn blocking() -> WaitPolicy {
        WaitPolicy {
            blocking: true,
            ..nonblocking()
        }
    }

    #[test]
    fn ready_block_is_returned_without_waiting() {
        let (mut r, k) = reader(4, vec![]);
        k.retire_n(0, 1, 3);
        let block = r.hold(&nonblocking()).unwrap().unwrap();
        assert_eq!(block.index(), 0);
        assert_eq!(block.num_packets(), 3);
        assert!(block.is_user_owned());
        assert!(r.waiter.calls.is_empty());
    }

    #[test]
    fn release_returns_ownership_and_advances() {
        let (mut r, k) = reader(4, vec![]);
        k.retire_n(0, 1, 1);
        assert!(r.hold(&nonblocking()).unwrap().is_some());
        r.release();
        assert_eq!(r.cursor(), 1);
        assert_eq!(r.ring().block(0).status(), TP_STATUS_KERNEL);
        assert!(!k.is_user_owned(0));
    }

    #[test]
    fn cursor_wraps_around() {
        let (mut r, k) = reader(3, vec![]);
        for round in 0..7 {
            let idx = round % 3;
            k.retire_n(idx, round as u64, 1);
            let block = r.hold(&nonblocking()).unwrap().unwrap();
            assert_eq!(block.index(), idx);
            r.release();
            assert_eq!(r.cursor(), (idx + 1) % 3);
        }
    }

    #[test]
    fn empty_blocks_are_skipped_and_flushed() {
        let (mut r, k) = reader(4, vec![]);
        k.retire_empty(0, 1);
        k.retire_empty(1, 2);
        k.retire_n(2, 3, 5);
        let block = r.hold(&nonblocking()).unwrap().unwrap();
        assert_eq!(block.index(), 2);
        assert!(!k.is_user_owned(0));
        assert!(!k.is_user_owned(1));
        assert!(r.waiter.calls.is_empty());
    }

    #[test]
    fn interrupted_wait_ends_a_blocking_hold() {
        let (mut r, _k) = reader(4, vec![Step::Timeout, Step::Ready, Step::Interrupt]);
        assert!(r.hold(&blocking()).unwrap().is_none());
        assert_eq!(r.waiter.calls.len(), 3);
        assert_eq!(r.cursor(), 0);
    }

    #[test]
    fn interrupted_wait_ends_a_nonblocking_hold() {
        let policy = WaitPolicy {
            empty_wakeup_is_timeout: false,
            ..nonblocking()
        };
        let (mut r, _k) = reader(4, vec![Step::Interrupt, Step::Retire { block: 0, frames: 2 }]);
        assert!(r.hold(&policy).unwrap().is_none());
        assert_eq!(r.waiter.calls.len(), 1);
    }

    #[test]
    fn unrepresentable_poll_timeout_does_not_panic() {
        let policy = WaitPolicy {
            poll_timeout: Duration::MAX,
            ..nonblocking()
        };
        let (mut r, _k) = reader(4, vec![Step::Timeout]);
        assert!(r.hold(&policy).unwrap().is_none());
        assert_eq!(r.waiter.calls, vec![Duration::MAX]);

        let (mut r, _k) = reader(4, vec![Step::Retire { block: 0, frames: 1 }]);
        assert_eq!(r.hold(&policy).unwrap().unwrap().num_packets(), 1);
    }

    #[test]
    fn nonblocking_timeout_returns_none_after_one_wait() {
        let (mut r, _k) = reader(4, vec![Step::Timeout]);
        assert!(r.hold(&nonblocking()).unwrap().is_none());
        assert_eq!(r.waiter.calls.len(), 1);
        assert!(r.waiter.calls[0] <= Duration::from_millis(500));
        assert_eq!(r.cursor(), 0);
    }

    #[test]
    fn blocking_hold_waits_across_timeouts() {
        let (mut r, _k) = reader(
            4,
            vec![Step::Timeout, Step::Timeout, Step::Retire { block: 0, frames: 2 }],
        );
        let block = r.hold(&blocking()).unwrap().unwrap();
        assert_eq!(block.index(), 0);
        assert_eq!(block.num_packets(), 2);
        assert_eq!(r.waiter.calls, vec![Duration::from_millis(500); 3]);
    }

    #[test]
    fn blocking_hold_skips_empty_block_retired_while_waiting() {
        let (mut r, k) = reader(
            4,
            vec![Step::Retire { block: 0, frames: 0 }, Step::Retire { block: 1, frames: 4 }],
        );
        let block = r.hold(&blocking()).unwrap().unwrap();
        assert_eq!(block.index(), 1);
        assert!(!k.is_user_owned(0));
    }

    #[test]
    fn nonblocking_wakeup_with_frames_returns_block() {
        let (mut r, _k) = reader(4, vec![Step::Retire { block: 0, frames: 1 }]);
        let block = r.hold(&nonblocking()).unwrap().unwrap();
        assert_eq!(block.index(), 0);
    }

    #[test]
    fn spurious_wakeup_reports_timeout_by_default() {
        let (mut r, _k) = reader(4, vec![Step::Ready, Step::Retire { block: 0, frames: 1 }]);
        assert!(r.hold(&nonblocking()).unwrap().is_none());
        assert_eq!(r.waiter.calls.len(), 1);
    }

    #[test]
    fn spurious_wakeup_keeps_waiting_when_shim_disabled() {
        let policy = WaitPolicy {
            empty_wakeup_is_timeout: false,
            ..nonblocking()
        };
        let (mut r, _k) = reader(4, vec![Step::Ready, Step::Retire { block: 0, frames: 1 }]);
        let block = r.hold(&policy).unwrap().unwrap();
        assert_eq!(block.index(), 0);
        assert_eq!(r.waiter.calls.len(), 2);
        // The second wait only gets what is left of the interval.
        assert!(r.waiter.calls[1] <= r.waiter.calls[0]);

        let (mut r, _k) = reader(4, vec![Step::Ready, Step::Timeout]);
        assert!(r.hold(&policy).unwrap().is_none());
    }

    #[test]
    fn wait_errors_propagate() {
        let (mut r, _k) = reader(4, vec![Step::Fail(libc::EBADF)]);
        let err = r.hold(&blocking()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn holding_twice_returns_same_block() {
        let (mut r, k) = reader(4, vec![]);
        k.retire_n(0, 1, 1);
        k.retire_n(1, 2, 1);
        assert_eq!(r.hold(&nonblocking()).unwrap().unwrap().index(), 0);
        assert_eq!(r.hold(&nonblocking()).unwrap().unwrap().index(), 0);
        assert_eq!(r.current().map(|b| b.index()), Some(0));
    }

    #[test]
    fn clear_stops_at_kernel_owned_block() {
        let (mut r, k) = reader(8, vec![]);
        for i in 0..3 {
            k.retire_n(i, i as u64, 1);
        }
        k.retire_n(4, 4, 1);
        assert_eq!(r.clear(), 3);
        assert_eq!(r.cursor(), 3);
        for i in 0..3 {
            assert!(!k.is_user_owned(i));
        }
        assert!(k.is_user_owned(4));
        assert_eq!(r.clear(), 0);
    }

    #[test]
    fn clear_is_bounded_by_one_lap() {
        let (mut r, k) = reader(4, vec![]);
        for i in 0..4 {
            k.retire_n(i, i as u64, 1);
        }
        assert_eq!(r.clear(), 4);
        assert_eq!(r.cursor(), 0);
        assert!((0..4).all(|i| !k.is_user_owned(i)));
    }

    #[test]
    fn three_block_capture_then_timeout() {
        let ring = Ring::anonymous(RingGeometry {
            block_size: 4 * 1024 * 1024,
            block_count: 8,
            frame_size: 2048,
        })
        .unwrap();
        let k = Kernel::of(&ring);
        let mut r = RingReader::new(
            ring,
            Scripted {
                kernel: k,
                steps: VecDeque::new(),
                calls: Vec::new(),
            },
        );
        let policy = WaitPolicy {
            blocking: false,
            poll_timeout: Duration::from_millis(500),
            empty_wakeup_is_timeout: true,
        };

        for i in 0..3 {
            k.retire_n(i, i as u64 + 1, 10);
        }
        let mut total = 0;
        for i in 0..3 {
            let block = r.hold(&policy).unwrap().unwrap();
            assert_eq!(block.index(), i);
            total += block.frames().count();
            r.release();
        }
        assert_eq!(total, 30);
        assert!(r.hold(&policy).unwrap().is_none());
        assert_eq!(r.cursor(), 3);
    }
}
