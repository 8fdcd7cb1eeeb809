// src/stepcompress.rs
// Stepper pulse schedule compression
//
// Step times are queued as absolute mcu clocks and compressed into
// "queue_step" commands: a starting interval, a step count and an
// interval delta ("add") applied after every step. Each emitted step may
// land up to `max_error` ticks before its requested time, never after.
// In high precision mode the commands carry a second order delta and a
// fixed point shift; see `stepcompress_hp`.

use std::collections::VecDeque;
use std::fmt;

use log::{error, trace};
use thiserror::Error;

use crate::itersolve::StepSink;
use crate::msgblock::{MsgBlockError, QueueMessage};
use crate::stepcompress_hp;

pub(crate) const CLOCK_DIFF_MAX: u64 = 3 << 28;
const QUADRATIC_DEV: i64 = 11;
const SDS_FILTER_TIME: f64 = 0.000750;
pub(crate) const MAX_RUN: usize = 65535;
const QUEUE_COMPACT: usize = 4096;

/// Seconds of step history kept for position queries.
pub const HISTORY_EXPIRE: f64 = 30.0;

/// One compressed run of steps.
///
/// Step `k` (1 based) fires `step_offset(k)` ticks after the clock of the
/// step preceding the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepMove {
    pub interval: u32,
    pub count: u32,
    pub add: i32,
    pub add2: i32,
    pub shift: u8,
}

impl StepMove {
    pub fn new(interval: u32, count: u32, add: i32) -> Self {
        Self { interval, count, add, ..Self::default() }
    }

    /// Clock offset of step `k` relative to the step before the run.
    pub fn step_offset(&self, k: u32) -> i64 {
        let k = k as i128;
        let pos = k * self.interval as i128
            + self.add as i128 * (k * (k - 1) / 2)
            + self.add2 as i128 * (k * (k - 1) * (k - 2) / 6);
        (pos >> self.shift) as i64
    }

    /// Number of steps of this run fired at or before `offset`.
    pub fn steps_before(&self, offset: i64) -> u32 {
        if offset < self.step_offset(1) {
            return 0;
        }
        if offset >= self.step_offset(self.count) {
            return self.count;
        }
        let mut guess = if self.add2 == 0 && self.shift == 0 {
            let (iv, add, ticks) = (self.interval as f64, self.add as f64, offset as f64);
            if self.add == 0 {
                ticks / iv
            } else {
                let (a, b, c) = (0.5 * add, iv - 0.5 * add, -ticks);
                ((b * b - 4.0 * a * c).sqrt() - b) / (2.0 * a)
            }
        } else {
            -1.0
        };
        if !(guess.is_finite() && guess >= 1.0 && guess < self.count as f64) {
            // Offsets are monotonic within a validated run
            let (mut lo, mut hi) = (1, self.count);
            while hi - lo > 1 {
                let mid = lo + (hi - lo) / 2;
                if self.step_offset(mid) <= offset {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            guess = lo as f64;
        }
        let mut k = guess as u32;
        while k < self.count && self.step_offset(k + 1) <= offset {
            k += 1;
        }
        while k > 0 && self.step_offset(k) > offset {
            k -= 1;
        }
        k
    }
}

impl fmt::Display for StepMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i={} c={} a={}", self.interval as i32, self.count, self.add)?;
        if self.add2 != 0 || self.shift != 0 {
            write!(f, " a2={} s={}", self.add2, self.shift)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepCompressError {
    #[error("stepcompress o={oid} {mv}: Invalid sequence")]
    InvalidSequence { oid: u32, mv: StepMove },
    #[error("stepcompress o={oid} {mv}: Point {point}: {pos} not in {minp}:{maxp}")]
    PointOutOfRange {
        oid: u32,
        mv: StepMove,
        point: u32,
        pos: i64,
        minp: i64,
        maxp: i64,
    },
    #[error("stepcompress o={oid} {mv}: Point {point}: interval overflow {interval}")]
    IntervalOverflow { oid: u32, mv: StepMove, point: u32, interval: i64 },
    #[error("stepcompress o={oid}: {source}")]
    Encode { oid: u32, source: MsgBlockError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    #[default]
    Standard,
    HighPrecision,
}

/// Allowed window, relative to the last emitted step, for one queued step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Points {
    pub minp: i64,
    pub maxp: i64,
}

// Determine the "error" of a point
fn minmax_point(queue: &[u32], idx: usize, lsc: u64, max_error: u32) -> Points {
    let lsc = lsc as u32;
    let point = queue[idx].wrapping_sub(lsc) as i64;
    let prevpoint = if idx > 0 { queue[idx - 1].wrapping_sub(lsc) as i64 } else { 0 };
    let max_error = ((point - prevpoint) / 2).min(max_error as i64);
    Points { minp: point - max_error, maxp: point }
}

fn idiv_up(n: i64, d: i64) -> i64 {
    if n >= 0 {
        (n + d - 1) / d
    } else {
        n / d
    }
}

fn idiv_down(n: i64, d: i64) -> i64 {
    if n >= 0 {
        n / d
    } else {
        (n - d + 1) / d
    }
}

// Find a 'step_move' that covers a series of step times
fn compress_bisect_add(queue: &[u32], lsc: u64, max_error: u32) -> StepMove {
    let qlast = queue.len().min(MAX_RUN);
    let point = minmax_point(queue, 0, lsc, max_error);
    let (mut outer_mininterval, mut outer_maxinterval) = (point.minp, point.maxp);
    let (mut add, mut minadd, mut maxadd) = (0i64, -0x8000i64, 0x7fffi64);
    let (mut bestinterval, mut bestcount, mut bestadd, mut bestreach) = (0i64, 1i64, 1i64, i64::MIN);
    let (mut zerointerval, mut zerocount) = (0i64, 0i64);

    loop {
        // Find longest valid sequence with the given 'add'
        let mut nextmininterval = outer_mininterval;
        let mut nextmaxinterval = outer_maxinterval;
        let mut interval = nextmaxinterval;
        let mut nextcount = 1i64;
        let nextpoint = loop {
            nextcount += 1;
            if nextcount as usize - 1 >= qlast {
                let count = nextcount - 1;
                return StepMove::new(interval as u32, count as u32, add as i32);
            }
            let nextpoint = minmax_point(queue, nextcount as usize - 1, lsc, max_error);
            let nextaddfactor = nextcount * (nextcount - 1) / 2;
            let c = add * nextaddfactor;
            if nextmininterval * nextcount < nextpoint.minp - c {
                nextmininterval = idiv_up(nextpoint.minp - c, nextcount);
            }
            if nextmaxinterval * nextcount > nextpoint.maxp - c {
                nextmaxinterval = idiv_down(nextpoint.maxp - c, nextcount);
            }
            if nextmininterval > nextmaxinterval {
                break nextpoint;
            }
            interval = nextmaxinterval;
        };

        // Check if this is the best sequence found so far
        let count = nextcount - 1;
        let addfactor = count * (count - 1) / 2;
        let reach = add * addfactor + interval * count;
        if reach > bestreach || (reach == bestreach && interval > bestinterval) {
            bestinterval = interval;
            bestcount = count;
            bestadd = add;
            bestreach = reach;
            if add == 0 {
                zerointerval = interval;
                zerocount = count;
            }
            if count > 0x200 {
                // No 'add' will improve sequence
                break;
            }
        }

        // Check if a greater or lesser add could extend the sequence
        let nextaddfactor = nextcount * (nextcount - 1) / 2;
        let nextreach = add * nextaddfactor + interval * nextcount;
        if nextreach < nextpoint.minp {
            minadd = add + 1;
            outer_maxinterval = nextmaxinterval;
        } else {
            maxadd = add - 1;
            outer_mininterval = nextmininterval;
        }

        // The maximum valid deviation between two quadratic sequences
        // can be calculated and used to further limit the add range.
        if count > 1 {
            let errdelta = max_error as i64 * QUADRATIC_DEV / (count * count);
            minadd = minadd.max(add - errdelta);
            maxadd = maxadd.min(add + errdelta);
        }

        // See if next point would further limit the add range
        let c = outer_maxinterval * nextcount;
        if minadd * nextaddfactor < nextpoint.minp - c {
            minadd = idiv_up(nextpoint.minp - c, nextaddfactor);
        }
        let c = outer_mininterval * nextcount;
        if maxadd * nextaddfactor > nextpoint.maxp - c {
            maxadd = idiv_down(nextpoint.maxp - c, nextaddfactor);
        }

        // Bisect valid add range and try again with new 'add'
        if minadd > maxadd {
            break;
        }
        add = maxadd - (maxadd - minadd) / 4;
    }
    if zerocount + zerocount / 16 >= bestcount {
        // Prefer add=0 if it's similar to the best found sequence
        return StepMove::new(zerointerval as u32, zerocount as u32, 0);
    }
    StepMove::new(bestinterval as u32, bestcount as u32, bestadd as i32)
}

/// Reason a candidate run does not reproduce the queued steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineFault {
    Invalid,
    Point { point: u32, pos: i64, minp: i64, maxp: i64 },
    Overflow { point: u32, interval: i64 },
}

// Check a run against the allowed window of every step it covers
pub(crate) fn test_step_move(mv: &StepMove, band: impl Fn(usize) -> Points) -> Result<(), LineFault> {
    let standard = mv.add2 == 0 && mv.shift == 0;
    if mv.count == 0
        || mv.count as usize > MAX_RUN
        || (mv.interval == 0 && mv.add == 0 && mv.add2 == 0 && mv.count > 1)
        || mv.interval >= 0x8000_0000
        || (standard && i16::try_from(mv.add).is_err())
    {
        return Err(LineFault::Invalid);
    }
    let mut interval = mv.interval as i64;
    let mut add = mv.add as i64;
    for i in 0..mv.count {
        let point = band(i as usize);
        let pos = mv.step_offset(i + 1);
        if pos < point.minp || pos > point.maxp {
            return Err(LineFault::Point { point: i + 1, pos, minp: point.minp, maxp: point.maxp });
        }
        if !(0..0x8000_0000).contains(&interval) {
            return Err(LineFault::Overflow { point: i + 1, interval });
        }
        interval += add;
        add += mv.add2 as i64;
    }
    Ok(())
}

// Verify that a given 'step_move' matches the actual step times
pub(crate) fn check_line(oid: u32, mv: &StepMove, band: impl Fn(usize) -> Points) -> Result<(), StepCompressError> {
    let err = match test_step_move(mv, band) {
        Ok(()) => return Ok(()),
        Err(LineFault::Invalid) => StepCompressError::InvalidSequence { oid, mv: *mv },
        Err(LineFault::Point { point, pos, minp, maxp }) => {
            StepCompressError::PointOutOfRange { oid, mv: *mv, point, pos, minp, maxp }
        }
        Err(LineFault::Overflow { point, interval }) => {
            StepCompressError::IntervalOverflow { oid, mv: *mv, point, interval }
        }
    };
    error!("{}", err);
    Err(err)
}

/// A record of a compressed run, kept for position queries.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct HistorySteps {
    first_clock: u64,
    last_clock: u64,
    start_position: i64,
    step_count: i32,
    mv: StepMove,
}

/// Snapshot of a history record handed out by `extract_old`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PullHistorySteps {
    pub first_clock: u64,
    pub last_clock: u64,
    pub start_position: i64,
    pub step_count: i32,
    pub interval: u32,
    pub add: i32,
    pub add2: i32,
    pub shift: u8,
}

/// Step queue and compressor for one stepper.
#[derive(Debug)]
pub struct StepCompress {
    queue: Vec<u32>,
    queue_pos: usize,
    max_error: u32,
    mcu_time_offset: f64,
    mcu_freq: f64,
    last_step_print_time: f64,
    last_step_clock: u64,
    msg_queue: VecDeque<QueueMessage>,
    oid: u32,
    queue_step_msgtag: i32,
    set_next_step_dir_msgtag: i32,
    sdir: Option<bool>,
    invert_sdir: bool,
    next_step_clock: u64,
    next_step_dir: bool,
    last_position: i64,
    history: VecDeque<HistorySteps>,
    mode: CompressMode,
}

impl StepCompress {
    pub fn new(oid: u32, mode: CompressMode) -> Self {
        Self {
            queue: Vec::new(),
            queue_pos: 0,
            max_error: 0,
            mcu_time_offset: 0.0,
            mcu_freq: 1.0,
            last_step_print_time: 0.0,
            last_step_clock: 0,
            msg_queue: VecDeque::new(),
            oid,
            queue_step_msgtag: 0,
            set_next_step_dir_msgtag: 0,
            sdir: None,
            invert_sdir: false,
            next_step_clock: 0,
            next_step_dir: false,
            last_position: 0,
            history: VecDeque::new(),
            mode,
        }
    }

    /// Fill message id information
    pub fn fill(&mut self, max_error: u32, queue_step_msgtag: i32, set_next_step_dir_msgtag: i32) {
        self.max_error = max_error;
        self.queue_step_msgtag = queue_step_msgtag;
        self.set_next_step_dir_msgtag = set_next_step_dir_msgtag;
    }

    /// Set the inverted stepper direction flag
    pub fn set_invert_sdir(&mut self, invert_sdir: bool) {
        if invert_sdir != self.invert_sdir {
            self.invert_sdir = invert_sdir;
            self.sdir = self.sdir.map(|d| !d);
        }
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    pub fn mode(&self) -> CompressMode {
        self.mode
    }

    pub fn last_step_clock(&self) -> u64 {
        self.last_step_clock
    }

    pub fn last_position(&self) -> i64 {
        self.last_position
    }

    pub fn mcu_freq(&self) -> f64 {
        self.mcu_freq
    }

    fn calc_last_step_print_time(&mut self) {
        let lsc = self.last_step_clock as f64;
        self.last_step_print_time = self.mcu_time_offset + (lsc - 0.5) / self.mcu_freq;
    }

    /// Set the conversion rate of 'print_time' to mcu clock
    pub fn set_time(&mut self, time_offset: f64, mcu_freq: f64) {
        self.mcu_time_offset = time_offset;
        self.mcu_freq = mcu_freq;
        self.calc_last_step_print_time();
    }

    fn encode(&self, data: &[u32]) -> Result<QueueMessage, StepCompressError> {
        QueueMessage::encode(data).map_err(|source| StepCompressError::Encode { oid: self.oid, source })
    }

    // Convert previously scheduled steps into commands for the mcu
    fn queue_flush(&mut self, move_clock: u64) -> Result<(), StepCompressError> {
        if self.queue_pos >= self.queue.len() {
            return Ok(());
        }
        while self.last_step_clock < move_clock {
            let pending = &self.queue[self.queue_pos..];
            let lsc = self.last_step_clock;
            let max_error = self.max_error;
            let mv = match self.mode {
                CompressMode::Standard => {
                    let mv = compress_bisect_add(pending, lsc, max_error);
                    check_line(self.oid, &mv, |i| minmax_point(pending, i, lsc, max_error))?;
                    mv
                }
                CompressMode::HighPrecision => {
                    let mv = stepcompress_hp::compress(pending, lsc, max_error);
                    check_line(self.oid, &mv, |i| stepcompress_hp::band(pending, i, lsc, max_error))?;
                    mv
                }
            };
            let first_clock = lsc.wrapping_add(mv.step_offset(1) as u64);
            self.add_move(first_clock, &mv)?;

            if self.queue_pos + mv.count as usize >= self.queue.len() {
                self.queue.clear();
                self.queue_pos = 0;
                break;
            }
            self.queue_pos += mv.count as usize;
        }
        if self.queue_pos >= QUEUE_COMPACT && self.queue_pos * 2 >= self.queue.len() {
            self.queue.drain(..self.queue_pos);
            self.queue_pos = 0;
        }
        self.calc_last_step_print_time();
        Ok(())
    }

    // Generate a queue_step for a step far in the future from the last step
    fn queue_flush_far(&mut self, abs_step_clock: u64) -> Result<(), StepCompressError> {
        let interval = abs_step_clock.wrapping_sub(self.last_step_clock) as u32;
        let mv = StepMove::new(interval, 1, 0);
        self.add_move(abs_step_clock, &mv)?;
        self.calc_last_step_print_time();
        Ok(())
    }

    // Create and queue the command for a run of steps
    fn add_move(&mut self, first_clock: u64, mv: &StepMove) -> Result<(), StepCompressError> {
        let last_clock = if mv.count > 1 {
            first_clock.wrapping_add((mv.step_offset(mv.count) - mv.step_offset(1)) as u64)
        } else {
            first_clock
        };

        let mut qm = match self.mode {
            CompressMode::Standard => self.encode(&[
                self.queue_step_msgtag as u32,
                self.oid,
                mv.interval,
                mv.count,
                mv.add as u32,
            ])?,
            CompressMode::HighPrecision => self.encode(&[
                self.queue_step_msgtag as u32,
                self.oid,
                mv.interval,
                mv.count,
                mv.add as u32,
                mv.add2 as u32,
                mv.shift as u32,
            ])?,
        };
        qm.min_clock = self.last_step_clock;
        qm.req_clock = self.last_step_clock;
        if mv.count == 1 && first_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            qm.req_clock = first_clock;
        }
        self.msg_queue.push_back(qm);
        self.last_step_clock = last_clock;

        // Store the run in history tracking
        let count = mv.count as i32;
        let step_count = if self.sdir == Some(true) { count } else { -count };
        self.history.push_front(HistorySteps {
            first_clock,
            last_clock,
            start_position: self.last_position,
            step_count,
            mv: *mv,
        });
        self.last_position += step_count as i64;
        Ok(())
    }

    // Send the set_next_step_dir command
    fn set_next_step_dir(&mut self, sdir: bool) -> Result<(), StepCompressError> {
        if self.sdir == Some(sdir) {
            return Ok(());
        }
        self.queue_flush(u64::MAX)?;
        self.sdir = Some(sdir);
        let dir = (sdir ^ self.invert_sdir) as u32;
        let mut qm = self.encode(&[self.set_next_step_dir_msgtag as u32, self.oid, dir])?;
        qm.req_clock = self.last_step_clock;
        self.msg_queue.push_back(qm);
        trace!("stepcompress o={} dir={} at {}", self.oid, dir, self.last_step_clock);
        Ok(())
    }

    // Add the pending step to the queue
    fn queue_append(&mut self) -> Result<(), StepCompressError> {
        if Some(self.next_step_dir) != self.sdir {
            self.set_next_step_dir(self.next_step_dir)?;
        }
        let step_clock = self.next_step_clock;
        self.next_step_clock = 0;
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.queue_append_far(step_clock);
        }
        if self.queue.len() - self.queue_pos > MAX_RUN + 2000 {
            // No point in keeping more than 64K steps in memory
            let flush = self.queue[self.queue.len() - MAX_RUN].wrapping_sub(self.last_step_clock as u32);
            self.queue_flush(self.last_step_clock + flush as u64)?;
        }
        self.queue.push(step_clock as u32);
        Ok(())
    }

    fn queue_append_far(&mut self, step_clock: u64) -> Result<(), StepCompressError> {
        self.queue_flush(step_clock - CLOCK_DIFF_MAX + 1)?;
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.queue_flush_far(step_clock);
        }
        self.queue.push(step_clock as u32);
        Ok(())
    }

    /// Add next step time
    pub fn append(&mut self, sdir: bool, print_time: f64, step_time: f64) -> Result<(), StepCompressError> {
        // Calculate step clock
        let offset = print_time - self.last_step_print_time;
        let rel_sc = (step_time + offset) * self.mcu_freq;
        let step_clock = self.last_step_clock + rel_sc as u64;
        // Flush previous pending step (if any)
        if self.next_step_clock != 0 {
            if sdir != self.next_step_dir {
                let diff = step_clock.wrapping_sub(self.next_step_clock) as i64 as f64;
                if diff < SDS_FILTER_TIME * self.mcu_freq {
                    // Rollback last step to avoid rapid step+dir+step
                    self.next_step_clock = 0;
                    self.next_step_dir = sdir;
                    return Ok(());
                }
            }
            self.queue_append()?;
        }
        // Store this step as the next pending step
        self.next_step_clock = step_clock;
        self.next_step_dir = sdir;
        Ok(())
    }

    /// Commit next pending step (ie, do not allow a rollback)
    pub fn commit(&mut self) -> Result<(), StepCompressError> {
        if self.next_step_clock != 0 {
            return self.queue_append();
        }
        Ok(())
    }

    /// Flush pending steps
    pub fn flush(&mut self, move_clock: u64) -> Result<(), StepCompressError> {
        if self.next_step_clock != 0 && move_clock >= self.next_step_clock {
            self.queue_append()?;
        }
        self.queue_flush(move_clock)
    }

    /// Reset the internal state of the stepcompress object
    pub fn reset(&mut self, last_step_clock: u64) -> Result<(), StepCompressError> {
        self.flush(u64::MAX)?;
        self.last_step_clock = last_step_clock;
        self.sdir = None;
        self.calc_last_step_print_time();
        Ok(())
    }

    /// Set last_position in the stepcompress object
    pub fn set_last_position(&mut self, clock: u64, last_position: i64) -> Result<(), StepCompressError> {
        self.flush(u64::MAX)?;
        self.last_position = last_position;
        // Add a marker to the history list
        self.history.push_front(HistorySteps {
            first_clock: clock,
            last_clock: clock,
            start_position: last_position,
            ..HistorySteps::default()
        });
        Ok(())
    }

    /// Search history of moves to find a past position at a given clock
    pub fn find_past_position(&self, clock: u64) -> i64 {
        let mut last_position = self.last_position;
        for hs in self.history.iter() {
            if clock < hs.first_clock {
                last_position = hs.start_position;
                continue;
            }
            if clock >= hs.last_clock {
                return hs.start_position + hs.step_count as i64;
            }
            let base_offset = hs.mv.step_offset(1);
            let offset = (clock - hs.first_clock) as i64 + base_offset;
            let steps = hs.mv.steps_before(offset) as i64;
            if hs.step_count < 0 {
                return hs.start_position - steps;
            }
            return hs.start_position + steps;
        }
        last_position
    }

    /// Queue an mcu command to go out in order with stepper commands
    pub fn queue_msg(&mut self, data: &[u32]) -> Result<(), StepCompressError> {
        self.flush(u64::MAX)?;
        let mut qm = self.encode(data)?;
        qm.req_clock = self.last_step_clock;
        self.msg_queue.push_back(qm);
        Ok(())
    }

    /// Queue an mcu command that will consume space in the mcu move queue
    pub fn queue_mq_msg(&mut self, req_clock: u64, data: &[u8]) -> Result<(), StepCompressError> {
        self.flush(u64::MAX)?;
        let mut qm =
            QueueMessage::fill(data).map_err(|source| StepCompressError::Encode { oid: self.oid, source })?;
        qm.min_clock = req_clock;
        qm.req_clock = req_clock;
        self.msg_queue.push_back(qm);
        Ok(())
    }

    /// Return history of queue_step commands, newest first
    pub fn extract_old(&self, max: usize, start_clock: u64, end_clock: u64) -> Vec<PullHistorySteps> {
        let mut res = Vec::new();
        for hs in self.history.iter() {
            if start_clock >= hs.last_clock || res.len() >= max {
                break;
            }
            if end_clock <= hs.first_clock {
                continue;
            }
            res.push(PullHistorySteps {
                first_clock: hs.first_clock,
                last_clock: hs.last_clock,
                start_position: hs.start_position,
                step_count: hs.step_count,
                interval: hs.mv.interval,
                add: hs.mv.add,
                add2: hs.mv.add2,
                shift: hs.mv.shift,
            });
        }
        res
    }

    /// Free history entries that ended at or before `end_clock`
    pub fn history_expire(&mut self, end_clock: u64) {
        while let Some(hs) = self.history.back() {
            if hs.last_clock > end_clock {
                break;
            }
            self.history.pop_back();
        }
    }

    pub(crate) fn msg_queue_mut(&mut self) -> &mut VecDeque<QueueMessage> {
        &mut self.msg_queue
    }
}

impl StepSink for StepCompress {
    fn get_step_dir(&self) -> bool {
        self.next_step_dir
    }

    fn append(&mut self, sdir: bool, print_time: f64, step_time: f64) -> Result<(), StepCompressError> {
        StepCompress::append(self, sdir, print_time, step_time)
    }

    fn commit(&mut self) -> Result<(), StepCompressError> {
        StepCompress::commit(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::msgblock::parse_int;

    pub(crate) fn fields(qm: &QueueMessage) -> Vec<i64> {
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < qm.len() {
            out.push(parse_int(qm.data(), &mut pos).unwrap() as i32 as i64);
        }
        out
    }

    // Replay queued step commands into absolute clocks
    pub(crate) fn replay(sc: &mut StepCompress, start_clock: u64) -> Vec<u64> {
        let mut clock = start_clock;
        let mut out = Vec::new();
        let hp = sc.mode() == CompressMode::HighPrecision;
        for qm in sc.msg_queue_mut().drain(..) {
            let f = fields(&qm);
            if f[0] != 20 {
                continue;
            }
            let mv = StepMove {
                interval: f[2] as u32,
                count: f[3] as u32,
                add: f[4] as i32,
                add2: if hp { f[5] as i32 } else { 0 },
                shift: if hp { f[6] as u8 } else { 0 },
            };
            for k in 1..=mv.count {
                out.push(clock + mv.step_offset(k) as u64);
            }
            clock += mv.step_offset(mv.count) as u64;
        }
        out
    }

    fn new_sc(max_error: u32) -> StepCompress {
        let mut sc = StepCompress::new(7, CompressMode::Standard);
        sc.fill(max_error, 20, 21);
        sc.set_time(0.0, 1_000_000.0);
        sc
    }

    fn push_clocks(sc: &mut StepCompress, sdir: bool, clocks: &[u64]) {
        for &c in clocks {
            sc.append(sdir, 0.0, c as f64 / 1_000_000.0).unwrap();
        }
    }

    #[test]
    fn constant_interval_single_command() {
        let mut sc = new_sc(10);
        let clocks: Vec<u64> = (1..=10).map(|k| k * 100).collect();
        push_clocks(&mut sc, true, &clocks);
        sc.flush(u64::MAX).unwrap();
        let msgs: Vec<Vec<i64>> = sc.msg_queue_mut().iter().map(fields).collect();
        assert_eq!(msgs, vec![vec![21, 7, 1], vec![20, 7, 100, 10, 0]]);
        assert_eq!(sc.last_step_clock(), 1000);
        assert_eq!(sc.last_position(), 10);
    }

    #[test]
    fn accelerating_steps_within_error() {
        let mut sc = new_sc(20);
        let clocks: Vec<u64> = (1..=200u64).map(|k| 5000 * k - 10 * k * (k - 1) / 2).collect();
        push_clocks(&mut sc, true, &clocks);
        sc.flush(u64::MAX).unwrap();
        let got = replay(&mut sc, 0);
        assert_eq!(got.len(), clocks.len());
        for (g, c) in got.iter().zip(clocks.iter()) {
            assert!(*g <= *c && *g + 20 >= *c, "step {} vs {}", g, c);
        }
    }

    // Step clocks with a drifting interval, occasional jumps and jitter
    fn random_clocks(rng: &mut fastrand::Rng, count: usize) -> Vec<u64> {
        let mut interval = 100.0 + rng.f64() * 5000.0;
        let mut drift = 0.0;
        let mut t = 0.0;
        let mut clocks = Vec::with_capacity(count);
        for _ in 0..count {
            if rng.u8(..) < 8 {
                drift = (rng.f64() - 0.5) * interval * 0.02;
            }
            if rng.u8(..) < 2 {
                interval = 50.0 + rng.f64() * 20000.0;
            }
            interval = (interval + drift).clamp(50.0, 50000.0);
            t += interval + (rng.f64() - 0.5) * 2.0;
            clocks.push(t as u64);
        }
        clocks
    }

    #[test]
    fn random_sequences_replay_within_band() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for run in 0..80 {
            let mode = if run % 2 == 0 { CompressMode::Standard } else { CompressMode::HighPrecision };
            let max_error = rng.u32(5..=40);
            let count = rng.usize(1..800);
            let clocks = random_clocks(&mut rng, count);

            let mut sc = StepCompress::new(7, mode);
            sc.fill(max_error, 20, 21);
            sc.set_time(0.0, 1_000_000.0);
            for (i, &c) in clocks.iter().enumerate() {
                sc.append(true, 0.0, c as f64 / 1_000_000.0).unwrap();
                if i % 97 == 96 {
                    // Partial flush up to an earlier step
                    sc.flush(clocks[i - rng.usize(1..50)]).unwrap();
                }
            }
            sc.flush(u64::MAX).unwrap();

            let got = replay(&mut sc, 0);
            assert_eq!(got.len(), clocks.len(), "run {}", run);
            // Steps may be early by max_error; high precision may also be
            // late by half of it
            let late = if mode == CompressMode::HighPrecision { max_error as u64 / 2 } else { 0 };
            for (i, (&g, &c)) in got.iter().zip(clocks.iter()).enumerate() {
                assert!(
                    g + max_error as u64 >= c && g <= c + late,
                    "run {} {:?} step {}: {} vs {} (max_error {})",
                    run,
                    mode,
                    i,
                    g,
                    c,
                    max_error
                );
            }
            assert!(got.windows(2).all(|w| w[0] < w[1]), "run {}", run);
            assert_eq!(sc.last_position(), clocks.len() as i64);
        }
    }

    #[test]
    fn direction_change_and_invert() {
        let mut sc = new_sc(10);
        sc.set_invert_sdir(true);
        push_clocks(&mut sc, true, &[1000, 2000, 3000]);
        push_clocks(&mut sc, false, &[10000, 11000]);
        sc.flush(u64::MAX).unwrap();
        let msgs: Vec<Vec<i64>> = sc.msg_queue_mut().iter().map(fields).collect();
        assert_eq!(msgs[0], vec![21, 7, 0]);
        assert_eq!(msgs[1][..4], [20, 7, 1000, 3]);
        assert_eq!(msgs[2], vec![21, 7, 1]);
        assert_eq!((msgs[3][0], msgs[3][1], msgs[3][3]), (20, 7, 2));
        assert_eq!(sc.last_position(), 1);
    }

    #[test]
    fn rapid_reversal_is_filtered() {
        let mut sc = new_sc(10);
        push_clocks(&mut sc, true, &[1000]);
        // 0.1ms later in the other direction: both steps are dropped
        push_clocks(&mut sc, false, &[1100]);
        sc.flush(u64::MAX).unwrap();
        assert!(sc.msg_queue_mut().is_empty());
        assert_eq!(sc.last_position(), 0);
    }

    #[test]
    fn commit_prevents_rollback() {
        let mut sc = new_sc(10);
        push_clocks(&mut sc, true, &[1000]);
        sc.commit().unwrap();
        push_clocks(&mut sc, false, &[1100]);
        sc.flush(u64::MAX).unwrap();
        assert_eq!(sc.last_position(), 0);
        assert_eq!(sc.msg_queue_mut().len(), 4);
    }

    #[test]
    fn far_step_uses_own_deadline() {
        let mut sc = new_sc(10);
        let far = CLOCK_DIFF_MAX + 5000;
        push_clocks(&mut sc, true, &[far]);
        sc.flush(u64::MAX).unwrap();
        let qm = sc.msg_queue_mut().back().cloned().unwrap();
        assert_eq!(fields(&qm)[..4], [20, 7, far as i64, 1]);
        assert_eq!(qm.req_clock, far);
        assert_eq!(qm.min_clock, 0);
        assert_eq!(sc.last_step_clock(), far);
    }

    #[test]
    fn flush_stops_at_move_clock() {
        let mut sc = new_sc(10);
        let clocks: Vec<u64> = (1..=10).map(|k| k * 1000).collect();
        push_clocks(&mut sc, true, &clocks);
        // pending final step is not yet due
        sc.flush(5000).unwrap();
        assert_eq!(sc.last_step_clock(), 9000);
        sc.flush(10_000).unwrap();
        assert_eq!(sc.last_step_clock(), 10_000);
    }

    #[test]
    fn queue_msg_ordered_after_steps() {
        let mut sc = new_sc(10);
        push_clocks(&mut sc, true, &[1000, 2000]);
        sc.queue_msg(&[30, 7, 1]).unwrap();
        let qm = sc.msg_queue_mut().back().cloned().unwrap();
        assert_eq!(fields(&qm), vec![30, 7, 1]);
        assert_eq!(qm.req_clock, 2000);
        assert_eq!(qm.min_clock, 0);
        sc.queue_mq_msg(2500, &[1, 2, 3]).unwrap();
        let qm = sc.msg_queue_mut().back().cloned().unwrap();
        assert_eq!(qm.data(), &[1, 2, 3]);
        assert_eq!(qm.min_clock, 2500);
    }

    #[test]
    fn past_position_lookup() {
        let mut sc = new_sc(0);
        let clocks: Vec<u64> = (1..=50u64).map(|k| 1000 + 400 * k + 3 * k * (k - 1) / 2).collect();
        push_clocks(&mut sc, true, &clocks);
        push_clocks(&mut sc, false, &[40_000, 40_500]);
        sc.flush(u64::MAX).unwrap();
        assert_eq!(sc.find_past_position(0), 0);
        assert_eq!(sc.find_past_position(clocks[0] - 1), 0);
        for (i, &c) in clocks.iter().enumerate() {
            assert_eq!(sc.find_past_position(c), i as i64 + 1, "clock {}", c);
        }
        assert_eq!(sc.find_past_position(40_000), 49);
        assert_eq!(sc.find_past_position(1_000_000), 48);
    }

    #[test]
    fn last_position_marker() {
        let mut sc = new_sc(10);
        push_clocks(&mut sc, true, &[1000, 2000, 3000]);
        sc.set_last_position(5000, 100).unwrap();
        assert_eq!(sc.find_past_position(6000), 100);
        assert_eq!(sc.find_past_position(2500), 2);
        sc.reset(8000).unwrap();
        push_clocks(&mut sc, true, &[9000]);
        sc.flush(u64::MAX).unwrap();
        assert_eq!(sc.find_past_position(9000), 101);
    }

    #[test]
    fn history_extract_and_expire() {
        let mut sc = new_sc(10);
        push_clocks(&mut sc, true, &[1000, 2000, 3000]);
        push_clocks(&mut sc, false, &[10_000, 11_000]);
        sc.flush(u64::MAX).unwrap();
        let old = sc.extract_old(10, 0, u64::MAX);
        assert_eq!(old.len(), 2);
        assert_eq!(old[0].step_count, -2);
        assert_eq!(old[1].step_count, 3);
        assert_eq!(old[1].first_clock, 1000);
        assert_eq!(old[1].last_clock, 3000);
        assert_eq!(sc.extract_old(10, 5000, u64::MAX).len(), 1);
        sc.history_expire(3000);
        assert_eq!(sc.extract_old(10, 0, u64::MAX).len(), 1);
    }

    #[test]
    fn check_line_rejects_bad_moves() {
        let pts = [100u32, 200, 300];
        let band = |i| minmax_point(&pts, i, 0, 5);
        assert!(check_line(1, &StepMove::new(100, 3, 0), band).is_ok());
        assert!(matches!(
            check_line(1, &StepMove::new(0, 0, 0), band),
            Err(StepCompressError::InvalidSequence { .. })
        ));
        assert!(matches!(
            check_line(1, &StepMove::new(90, 3, 0), band),
            Err(StepCompressError::PointOutOfRange { point: 1, .. })
        ));
        assert!(matches!(
            check_line(1, &StepMove::new(0x8000_0000, 1, 0), band),
            Err(StepCompressError::InvalidSequence { .. })
        ));
        let err = check_line(1, &StepMove::new(101, 3, 0), band).unwrap_err();
        assert_eq!(err.to_string(), "stepcompress o=1 i=101 c=3 a=0: Point 1: 101 not in 95:100");
    }

    #[test]
    fn steps_before_matches_offsets() {
        let mv = StepMove::new(1000, 40, -7);
        for k in 1..=40 {
            let off = mv.step_offset(k);
            assert_eq!(mv.steps_before(off), k);
            assert_eq!(mv.steps_before(off - 1), k - 1);
        }
        let hp = StepMove { interval: 1000 << 8, count: 30, add: 500, add2: -3, shift: 8 };
        for k in 1..=30 {
            assert_eq!(hp.steps_before(hp.step_offset(k)), k);
        }
    }
}
