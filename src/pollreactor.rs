// src/pollreactor.rs
// Single threaded fd and timer event loop, built on mio.
//
// Timer and fd callbacks receive the owner's state plus a `ReactorTimers`
// handle so they can reschedule timers or request loop exit.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::error;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

pub const PR_NOW: f64 = 0.0;
pub const PR_NEVER: f64 = 9_999_999_999_999_999.0;

/// Timer callback: returns the next wake time for this timer.
pub type TimerCallback<T> = fn(&mut T, &mut ReactorTimers, f64) -> f64;
/// Fd (or waker) readiness callback.
pub type FdCallback<T> = fn(&mut T, &mut ReactorTimers, f64);

/// Return the current monotonic time in seconds
pub fn get_monotonic() -> f64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    if ret != 0 {
        error!("clock_gettime: {}", io::Error::last_os_error());
        return 0.0;
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 0.000_000_001
}

/// Timer table shared with callbacks while the loop runs.
#[derive(Debug)]
pub struct ReactorTimers {
    waketimes: Vec<f64>,
    next_timer: f64,
    must_exit: Arc<AtomicBool>,
}

impl ReactorTimers {
    pub fn new(num_timers: usize) -> Self {
        Self {
            waketimes: vec![PR_NEVER; num_timers],
            next_timer: PR_NEVER,
            must_exit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the wake time of a timer. Lowers the loop deadline if needed.
    pub fn update_timer(&mut self, pos: usize, waketime: f64) {
        self.waketimes[pos] = waketime;
        if waketime < self.next_timer {
            self.next_timer = waketime;
        }
    }

    pub fn get_timer(&self, pos: usize) -> f64 {
        self.waketimes[pos]
    }

    /// Signal the loop to stop after the current callback.
    pub fn do_exit(&self) {
        self.must_exit.store(true, Ordering::Release);
    }

    pub fn is_exit(&self) -> bool {
        self.must_exit.load(Ordering::Acquire)
    }

    /// Handle that can stop the loop from another thread.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.must_exit.clone()
    }
}

pub struct PollReactor<T> {
    poll: Poll,
    timers: ReactorTimers,
    timer_callbacks: Vec<Option<TimerCallback<T>>>,
    fd_callbacks: Vec<Option<FdCallback<T>>>,
}

impl<T> PollReactor<T> {
    pub fn new(num_fds: usize, num_timers: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            timers: ReactorTimers::new(num_timers),
            timer_callbacks: vec![None; num_timers],
            fd_callbacks: vec![None; num_fds],
        })
    }

    /// Watch a file descriptor for input. Write-only descriptors are not
    /// polled; they are simply written to by their owner.
    pub fn add_fd(&mut self, pos: usize, fd: RawFd, callback: FdCallback<T>, write_only: bool) -> io::Result<()> {
        if !write_only {
            self.poll.registry().register(&mut SourceFd(&fd), Token(pos), Interest::READABLE)?;
        }
        self.fd_callbacks[pos] = Some(callback);
        Ok(())
    }

    /// Create a cross-thread waker that triggers `callback` in the loop.
    pub fn add_waker(&mut self, pos: usize, callback: FdCallback<T>) -> io::Result<Arc<Waker>> {
        let waker = Waker::new(self.poll.registry(), Token(pos))?;
        self.fd_callbacks[pos] = Some(callback);
        Ok(Arc::new(waker))
    }

    pub fn add_timer(&mut self, pos: usize, callback: TimerCallback<T>) {
        self.timer_callbacks[pos] = Some(callback);
        self.timers.waketimes[pos] = PR_NEVER;
    }

    pub fn timers(&mut self) -> &mut ReactorTimers {
        &mut self.timers
    }

    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.timers.exit_flag()
    }

    // Run any timers that are due and return the poll timeout
    fn check_timers(&mut self, data: &mut T, eventtime: f64, mut busy: bool) -> Duration {
        if eventtime >= self.timers.next_timer {
            self.timers.next_timer = PR_NEVER;
            for pos in 0..self.timer_callbacks.len() {
                let mut waketime = self.timers.waketimes[pos];
                if eventtime >= waketime {
                    if let Some(callback) = self.timer_callbacks[pos] {
                        busy = true;
                        waketime = callback(data, &mut self.timers, eventtime);
                        self.timers.waketimes[pos] = waketime;
                    }
                }
                if waketime < self.timers.next_timer {
                    self.timers.next_timer = waketime;
                }
            }
        }
        if busy {
            return Duration::ZERO;
        }
        let timeout = ((self.timers.next_timer - eventtime) * 1000.0).ceil();
        Duration::from_millis(timeout.clamp(1.0, 1000.0) as u64)
    }

    /// Main loop: dispatch timers and fd events until exit is requested.
    pub fn run(&mut self, data: &mut T) {
        let mut events = Events::with_capacity(16);
        let mut eventtime = get_monotonic();
        let mut busy = true;
        while !self.timers.is_exit() {
            let timeout = self.check_timers(data, eventtime, busy);
            busy = false;
            if self.timers.is_exit() {
                break;
            }
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    eventtime = get_monotonic();
                    continue;
                }
                error!("pollreactor poll: {}", e);
                self.timers.do_exit();
                break;
            }
            eventtime = get_monotonic();
            for event in events.iter() {
                let Token(pos) = event.token();
                if let Some(Some(callback)) = self.fd_callbacks.get(pos) {
                    busy = true;
                    callback(data, &mut self.timers, eventtime);
                    if self.timers.is_exit() {
                        break;
                    }
                }
            }
        }
    }
}

/// Put a file descriptor into non-blocking mode
pub fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller supplied descriptor; errors are reported.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
