// src/batch.rs
// Batch runner: feed a file of moves through step generation, step
// compression and the serial transport.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::configfile::{McuConfig, StepperConfig};
use crate::itersolve::StepperKinematics;
use crate::kinematics::CartesianStepper;
use crate::pollreactor::get_monotonic;
use crate::serialqueue::{SerialQueue, TransportKind};
use crate::stepcompress::{CompressMode, StepCompress, StepCompressError, HISTORY_EXPIRE};
use crate::steppersync::{SteppersSync, SteppersSyncError};
use crate::trapq::{Coord, TrapQ};

// Keep this much motion queued ahead of the flush point
const FLUSH_LOOKAHEAD: f64 = 0.250;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("moves line {0}: {1}")]
    Parse(usize, String),
    #[error("stepper_{0}: unsupported axis")]
    Axis(char),
    #[error(transparent)]
    Step(#[from] StepCompressError),
    #[error(transparent)]
    Sync(#[from] SteppersSyncError),
    #[error("batch: transport disconnected with {0} bytes unsent")]
    Disconnected(usize),
}

/// One trapezoidal move as read from a moves file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveLine {
    pub print_time: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
    pub start_v: f64,
    pub cruise_v: f64,
    pub accel: f64,
}

impl MoveLine {
    pub fn end_time(&self) -> f64 {
        self.print_time + self.accel_t + self.cruise_t + self.decel_t
    }
}

/// Parse a moves file: one move per line as 13 whitespace separated
/// numbers (print_time accel_t cruise_t decel_t start_x start_y start_z
/// axes_r_x axes_r_y axes_r_z start_v cruise_v accel). Blank lines and
/// '#' comments are ignored.
pub fn parse_moves(content: &str) -> Result<Vec<MoveLine>, BatchError> {
    let mut moves = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let vals = line
            .split_whitespace()
            .map(|tok| tok.parse::<f64>().map_err(|_| BatchError::Parse(lineno + 1, format!("bad number '{}'", tok))))
            .collect::<Result<Vec<f64>, _>>()?;
        if vals.len() != 13 {
            return Err(BatchError::Parse(lineno + 1, format!("expected 13 values, got {}", vals.len())));
        }
        let mv = MoveLine {
            print_time: vals[0],
            accel_t: vals[1],
            cruise_t: vals[2],
            decel_t: vals[3],
            start_pos: Coord::new(vals[4], vals[5], vals[6]),
            axes_r: Coord::new(vals[7], vals[8], vals[9]),
            start_v: vals[10],
            cruise_v: vals[11],
            accel: vals[12],
        };
        if let Some(prev) = moves.last().map(|m: &MoveLine| m.end_time()) {
            if mv.print_time < prev - 1e-9 {
                return Err(BatchError::Parse(lineno + 1, "move starts before the previous one ends".into()));
            }
        }
        moves.push(mv);
    }
    Ok(moves)
}

/// Final positions and transport statistics of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub positions: Vec<(char, i64)>,
    pub stats: String,
}

pub struct BatchRunner {
    trapq: TrapQ,
    axes: Vec<char>,
    kinematics: Vec<StepperKinematics>,
    sync: SteppersSync,
    sq: Arc<SerialQueue>,
    mcu_freq: f64,
    last_flush_time: f64,
    end_time: f64,
}

impl BatchRunner {
    pub fn new(mcu: &McuConfig, steppers: &[StepperConfig], sq: Arc<SerialQueue>) -> Result<Self, BatchError> {
        match mcu.transport {
            TransportKind::Uart | TransportKind::Can { .. } => sq.set_wire_frequency(mcu.baud as f64),
            TransportKind::DebugFile => {}
        }
        if mcu.receive_window > 0 {
            sq.set_receive_window(mcu.receive_window as usize);
        }
        // Nothing paces a batch run, so every clock counts as already reachable
        sq.set_clock_est(mcu.clock_freq, get_monotonic(), 1u64 << 62, 1u64 << 62);

        let mut axes = Vec::new();
        let mut kinematics = Vec::new();
        let mut compressors = Vec::new();
        for cfg in steppers {
            let kin = CartesianStepper::new(cfg.axis).ok_or(BatchError::Axis(cfg.axis))?;
            let mode = if cfg.high_precision { CompressMode::HighPrecision } else { CompressMode::Standard };
            let mut sc = StepCompress::new(cfg.oid, mode);
            let max_error = (cfg.max_error * mcu.clock_freq) as u32;
            sc.fill(max_error, mcu.queue_step_msgtag as i32, mcu.set_next_step_dir_msgtag as i32);
            sc.set_invert_sdir(cfg.invert_dir);
            compressors.push(sc);
            kinematics.push(StepperKinematics::new(Box::new(kin), cfg.step_distance));
            axes.push(cfg.axis);
            debug!("stepper_{} oid={} max_error={} ticks {:?}", cfg.axis, cfg.oid, max_error, mode);
        }
        let mut sync = SteppersSync::new(sq.clone(), compressors, mcu.move_count as usize);
        sync.set_time(0.0, mcu.clock_freq);
        Ok(Self {
            trapq: TrapQ::new(),
            axes,
            kinematics,
            sync,
            sq,
            mcu_freq: mcu.clock_freq,
            last_flush_time: 0.0,
            end_time: 0.0,
        })
    }

    /// Add a move and flush everything that can no longer change.
    pub fn queue_move(&mut self, mv: &MoveLine) -> Result<(), BatchError> {
        self.trapq.append(
            mv.print_time,
            mv.accel_t,
            mv.cruise_t,
            mv.decel_t,
            mv.start_pos,
            mv.axes_r,
            mv.start_v,
            mv.cruise_v,
            mv.accel,
        );
        self.end_time = self.end_time.max(mv.end_time());
        let flush_time = mv.print_time - FLUSH_LOOKAHEAD;
        if flush_time > self.last_flush_time {
            self.flush(flush_time)?;
        }
        Ok(())
    }

    /// Generate and send all steps up to `flush_time`.
    pub fn flush(&mut self, flush_time: f64) -> Result<(), BatchError> {
        for (sk, sc) in self.kinematics.iter_mut().zip(self.sync.steppers_mut().iter_mut()) {
            sk.generate_steps(&self.trapq, sc, flush_time)?;
        }
        let move_clock = (flush_time * self.mcu_freq) as u64;
        let clear_history_clock = ((flush_time - HISTORY_EXPIRE).max(0.0) * self.mcu_freq) as u64;
        self.sync.flush(move_clock, clear_history_clock)?;
        self.trapq.finalize_moves(flush_time, flush_time - HISTORY_EXPIRE);
        self.last_flush_time = flush_time;
        Ok(())
    }

    /// Flush the remaining moves and wait for the transport to drain.
    pub fn finish(mut self, drain_timeout: Duration) -> Result<BatchSummary, BatchError> {
        let end_time = self.end_time.max(self.last_flush_time);
        self.flush(end_time)?;
        // Release the final pending step of every stepper
        self.sync.flush(u64::MAX, 0)?;

        let deadline = Instant::now() + drain_timeout;
        loop {
            let stats = self.sq.stats();
            let pending = stats.ready_bytes + stats.upcoming_bytes;
            if pending == 0 {
                break;
            }
            if self.sq.is_exited() {
                return Err(BatchError::Disconnected(pending));
            }
            if Instant::now() >= deadline {
                warn!("batch: transport did not drain ({} bytes pending)", pending);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let positions = self.axes.iter().zip(self.sync.steppers()).map(|(&a, sc)| (a, sc.last_position())).collect();
        let stats = self.sq.get_stats();
        info!("batch: done at print time {:.3}: {}", end_time, stats);
        Ok(BatchSummary { positions, stats })
    }
}
