// src/itersolve.rs
// Iterative solver for kinematic moves

use log::trace;

use crate::kinematics::{ActiveFlags, Kinematics};
use crate::stepcompress::StepCompressError;
use crate::trapq::{Coord, Move, TrapQ};

const SEEK_TIME_RESET: f64 = 0.000100;

/// Receiver of the step times found by the solver.
pub trait StepSink {
    /// Direction of the most recently queued step (true is positive).
    fn get_step_dir(&self) -> bool;
    fn append(&mut self, sdir: bool, print_time: f64, step_time: f64) -> Result<(), StepCompressError>;
    /// Mark queued steps as final so they can no longer be rolled back.
    fn commit(&mut self) -> Result<(), StepCompressError>;
}

#[derive(Debug, Clone, Copy)]
struct TimePos {
    time: f64,
    position: f64,
}

/// Step generation state for one stepper.
pub struct StepperKinematics {
    kin: Box<dyn Kinematics>,
    step_dist: f64,
    commanded_pos: f64,
    last_flush_time: f64,
    last_move_time: f64,
    gen_steps_pre_active: f64,
    gen_steps_post_active: f64,
}

impl StepperKinematics {
    pub fn new(kin: Box<dyn Kinematics>, step_dist: f64) -> Self {
        Self {
            kin,
            step_dist,
            commanded_pos: 0.0,
            last_flush_time: 0.0,
            last_move_time: 0.0,
            gen_steps_pre_active: 0.0,
            gen_steps_post_active: 0.0,
        }
    }

    pub fn set_step_dist(&mut self, step_dist: f64) {
        self.step_dist = step_dist;
    }

    pub fn step_dist(&self) -> f64 {
        self.step_dist
    }

    /// Time windows around active moves in which steps are still generated.
    pub fn set_gen_steps_window(&mut self, pre_active: f64, post_active: f64) {
        self.gen_steps_pre_active = pre_active;
        self.gen_steps_post_active = post_active;
    }

    pub fn kinematics_mut(&mut self) -> &mut dyn Kinematics {
        self.kin.as_mut()
    }

    // Generate step times for a portion of a move
    fn gen_steps_range<S: StepSink + ?Sized>(
        &mut self,
        sc: &mut S,
        m: &Move,
        abs_start: f64,
        abs_end: f64,
    ) -> Result<(), StepCompressError> {
        let half_step = 0.5 * self.step_dist;
        let start = (abs_start - m.print_time).max(0.0);
        let end = (abs_end - m.print_time).min(m.move_t);
        let mut old_guess = TimePos { time: start, position: self.commanded_pos };
        let mut guess = old_guess;
        let mut sdir = sc.get_step_dir();
        let mut is_dir_change = false;
        let mut have_bracket = false;
        let mut check_oscillate = false;
        let mut target = self.commanded_pos + if sdir { half_step } else { -half_step };
        let mut last_time = start;
        let mut low_time = start;
        let mut high_time = (start + SEEK_TIME_RESET).min(end);
        loop {
            // Use the "secant method" to guess a new time from previous guesses
            let guess_dist = guess.position - target;
            let og_dist = old_guess.position - target;
            let mut next_time =
                (old_guess.time * guess_dist - guess.time * og_dist) / (guess_dist - og_dist);
            if !(next_time > low_time && next_time < high_time) {
                // Next guess is outside bounds checks (or NaN) - validate it
                if have_bracket {
                    // A poor guess - fall back to bisection
                    next_time = (low_time + high_time) * 0.5;
                    check_oscillate = false;
                } else if guess.time >= end {
                    // No more steps present in requested time range
                    break;
                } else {
                    // Might be a poor guess - limit to exponential search
                    next_time = high_time;
                    high_time = (2.0 * high_time - last_time).min(end);
                }
            }
            // Calculate position at next_time guess
            old_guess = guess;
            guess = TimePos { time: next_time, position: self.kin.calc_position(m, next_time) };
            let guess_dist = guess.position - target;
            if guess_dist.abs() > 0.000_000_001 {
                // Guess does not look close enough - update bounds
                let rel_dist = if sdir { guess_dist } else { -guess_dist };
                if rel_dist > 0.0 {
                    // Found position past target, so step is definitely present
                    if have_bracket && old_guess.time <= low_time {
                        if check_oscillate {
                            // Force bisect next to avoid persistent oscillations
                            old_guess = guess;
                        }
                        check_oscillate = true;
                    }
                    high_time = guess.time;
                    have_bracket = true;
                } else if rel_dist < -(half_step + half_step + 0.000_000_010) {
                    // Found direction change
                    sdir = !sdir;
                    target += if sdir { 2.0 * half_step } else { -2.0 * half_step };
                    low_time = last_time;
                    high_time = guess.time;
                    is_dir_change = true;
                    have_bracket = true;
                    check_oscillate = false;
                } else {
                    low_time = guess.time;
                }
                if !have_bracket || high_time - low_time > 0.000_000_001 {
                    if !is_dir_change && rel_dist >= -half_step {
                        // Avoid rollback if stepper fully reaches step position
                        sc.commit()?;
                    }
                    // Guess is not close enough - guess again with new time
                    continue;
                }
            }
            // Found next step - submit it
            sc.append(sdir, m.print_time, guess.time)?;
            target += if sdir { 2.0 * half_step } else { -2.0 * half_step };
            // Reset bounds checking
            let mut seek_time_delta = (1.5 * (guess.time - last_time)).max(0.000_000_001);
            if is_dir_change && seek_time_delta > SEEK_TIME_RESET {
                seek_time_delta = SEEK_TIME_RESET;
            }
            last_time = guess.time;
            low_time = guess.time;
            high_time = (guess.time + seek_time_delta).min(end);
            is_dir_change = false;
            have_bracket = false;
            check_oscillate = false;
        }
        self.commanded_pos = target - if sdir { half_step } else { -half_step };
        self.kin.post_position(self.commanded_pos);
        Ok(())
    }

    // Check if a move is likely to cause movement on a stepper
    fn check_active(&self, m: &Move) -> bool {
        let af = self.kin.active_flags();
        (af.contains(ActiveFlags::X) && m.axes_r.x != 0.0)
            || (af.contains(ActiveFlags::Y) && m.axes_r.y != 0.0)
            || (af.contains(ActiveFlags::Z) && m.axes_r.z != 0.0)
    }

    /// Generate step times for a range of moves on the trapq
    pub fn generate_steps<S: StepSink + ?Sized>(
        &mut self,
        tq: &TrapQ,
        sc: &mut S,
        flush_time: f64,
    ) -> Result<(), StepCompressError> {
        let last_flush_time = self.last_flush_time;
        self.last_flush_time = flush_time;
        // Find first move in queue that is not yet fully flushed
        let mut idx = 0;
        while last_flush_time >= tq.move_at(idx).end_time() {
            idx += 1;
        }
        let mut force_steps_time = self.last_move_time + self.gen_steps_post_active;
        let mut skip_count = 0usize;
        loop {
            let m = tq.move_at(idx);
            let move_start = m.print_time;
            let move_end = m.end_time();
            if self.check_active(&m) {
                if skip_count > 0 && self.gen_steps_pre_active > 0.0 {
                    // Must generate steps leading up to stepper activity
                    let abs_start = (move_start - self.gen_steps_pre_active)
                        .max(last_flush_time)
                        .max(force_steps_time);
                    let mut pidx = idx - 1;
                    loop {
                        skip_count -= 1;
                        if skip_count == 0 || tq.move_at(pidx).print_time <= abs_start {
                            break;
                        }
                        pidx -= 1;
                    }
                    // Generate steps leading up to stepper activity
                    while pidx < idx {
                        let pm = tq.move_at(pidx);
                        self.gen_steps_range(sc, &pm, abs_start, flush_time)?;
                        pidx += 1;
                    }
                }
                // Generate steps for this move
                self.gen_steps_range(sc, &m, last_flush_time, flush_time)?;
                if move_end >= flush_time {
                    self.last_move_time = flush_time;
                    return Ok(());
                }
                skip_count = 0;
                self.last_move_time = move_end;
                force_steps_time = self.last_move_time + self.gen_steps_post_active;
            } else {
                if move_start < force_steps_time {
                    // Must generates steps just past stepper activity
                    let abs_end = force_steps_time.min(flush_time);
                    self.gen_steps_range(sc, &m, last_flush_time, abs_end)?;
                    skip_count = 1;
                } else {
                    // This move doesn't impact this stepper - skip it
                    skip_count += 1;
                }
                if flush_time + self.gen_steps_pre_active <= move_end {
                    trace!("itersolve: stop at inactive move ending {:.6}", move_end);
                    return Ok(());
                }
            }
            idx += 1;
        }
    }

    /// Check if the given stepper is likely to be active in the given time range
    pub fn check_active_until(&self, tq: &TrapQ, flush_time: f64) -> f64 {
        let mut idx = 0;
        while self.last_flush_time >= tq.move_at(idx).end_time() {
            idx += 1;
        }
        loop {
            let m = tq.move_at(idx);
            if self.check_active(&m) {
                return m.print_time;
            }
            if flush_time <= m.end_time() {
                return 0.0;
            }
            idx += 1;
        }
    }

    /// Report if the given stepper is registered for the given axis
    pub fn is_active_axis(&self, axis: char) -> bool {
        ActiveFlags::from_axis(axis).is_some_and(|flag| self.kin.active_flags().contains(flag))
    }

    pub fn calc_position_from_coord(&mut self, x: f64, y: f64, z: f64) -> f64 {
        let m = Move {
            move_t: 1000.0,
            start_pos: Coord::new(x, y, z),
            ..Move::default()
        };
        self.kin.calc_position(&m, 500.0)
    }

    pub fn set_position(&mut self, x: f64, y: f64, z: f64) {
        self.commanded_pos = self.calc_position_from_coord(x, y, z);
    }

    pub fn get_commanded_pos(&self) -> f64 {
        self.commanded_pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{CartesianStepper, FnKinematics};
    use float_cmp::assert_approx_eq;

    #[derive(Default)]
    struct StepRecorder {
        steps: Vec<(bool, f64)>,
        dir: Option<bool>,
        commits: usize,
    }

    impl StepSink for StepRecorder {
        fn get_step_dir(&self) -> bool {
            self.dir.unwrap_or(true)
        }

        fn append(&mut self, sdir: bool, print_time: f64, step_time: f64) -> Result<(), StepCompressError> {
            self.dir = Some(sdir);
            self.steps.push((sdir, print_time + step_time));
            Ok(())
        }

        fn commit(&mut self) -> Result<(), StepCompressError> {
            self.commits += 1;
            Ok(())
        }
    }

    fn x_stepper(step_dist: f64) -> StepperKinematics {
        StepperKinematics::new(Box::new(CartesianStepper::new('x').unwrap()), step_dist)
    }

    #[test]
    fn constant_velocity_steps() {
        let mut sk = x_stepper(0.1);
        let mut tq = TrapQ::new();
        tq.append(0.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(1., 0., 0.), 0.0, 10.0, 0.0);
        let mut rec = StepRecorder::default();
        sk.generate_steps(&tq, &mut rec, 2.0).unwrap();
        assert_eq!(rec.steps.len(), 100);
        for (i, &(sdir, time)) in rec.steps.iter().enumerate() {
            assert!(sdir);
            assert_approx_eq!(f64, time, (i as f64 + 0.5) * 0.01, epsilon = 1e-8);
        }
        assert_approx_eq!(f64, sk.get_commanded_pos(), 10.0, epsilon = 1e-9);
        assert!(rec.commits > 0);
    }

    #[test]
    fn steps_split_across_flushes() {
        let mut sk = x_stepper(0.1);
        let mut tq = TrapQ::new();
        tq.append(0.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(1., 0., 0.), 0.0, 10.0, 0.0);
        let mut rec = StepRecorder::default();
        sk.generate_steps(&tq, &mut rec, 0.5).unwrap();
        assert_eq!(rec.steps.len(), 50);
        sk.generate_steps(&tq, &mut rec, 1.0).unwrap();
        assert_eq!(rec.steps.len(), 100);
        for pair in rec.steps.windows(2) {
            assert!(pair[1].1 > pair[0].1);
        }
    }

    #[test]
    fn direction_change_alternates_half_steps() {
        // x(t) = 10t - 5t^2 rises to 5 at t=1 and returns to 0 at t=2
        let mut sk = x_stepper(1.0);
        let mut tq = TrapQ::new();
        tq.add_move(Move::new(0.0, 2.0, 10.0, -5.0, Coord::default(), Coord::new(1., 0., 0.)));
        let mut rec = StepRecorder::default();
        sk.generate_steps(&tq, &mut rec, 3.0).unwrap();
        let fwd = rec.steps.iter().filter(|s| s.0).count();
        let back = rec.steps.iter().filter(|s| !s.0).count();
        assert_eq!(fwd, 5);
        assert_eq!(back, 5);
        assert!(rec.steps[..5].iter().all(|s| s.0));
        assert_approx_eq!(f64, sk.get_commanded_pos(), 0.0, epsilon = 1e-9);
        // each step lands on a half-step boundary of the true position
        for &(_, time) in rec.steps.iter() {
            let pos = 10.0 * time - 5.0 * time * time;
            assert_approx_eq!(f64, pos - pos.floor(), 0.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn inactive_axis_generates_nothing() {
        let mut sk = x_stepper(0.1);
        let mut tq = TrapQ::new();
        tq.append(0.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(0., 1., 0.), 0.0, 10.0, 0.0);
        let mut rec = StepRecorder::default();
        sk.generate_steps(&tq, &mut rec, 2.0).unwrap();
        assert!(rec.steps.is_empty());
        assert_eq!(sk.check_active_until(&tq, 2.0), 0.0);
    }

    #[test]
    fn check_active_reports_move_start() {
        let sk = x_stepper(0.1);
        let mut tq = TrapQ::new();
        tq.append(0.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(0., 1., 0.), 0.0, 10.0, 0.0);
        tq.append(1.0, 0.0, 1.0, 0.0, Coord::new(0., 10., 0.), Coord::new(1., 0., 0.), 0.0, 10.0, 0.0);
        assert_approx_eq!(f64, sk.check_active_until(&tq, 5.0), 1.0);
        assert_eq!(sk.check_active_until(&tq, 0.5), 0.0);
    }

    #[test]
    fn position_from_coord() {
        let mut sk = StepperKinematics::new(
            Box::new(FnKinematics::new(ActiveFlags::X | ActiveFlags::Y, |m: &Move, t: f64| {
                let c = m.get_coord(t);
                c.x + c.y
            })),
            0.01,
        );
        assert_approx_eq!(f64, sk.calc_position_from_coord(1.0, 2.0, 3.0), 3.0);
        sk.set_position(4.0, 5.0, 0.0);
        assert_approx_eq!(f64, sk.get_commanded_pos(), 9.0);
        assert!(sk.is_active_axis('y'));
        assert!(!sk.is_active_axis('z'));
        assert!(!sk.is_active_axis('e'));
    }
}
