// src/trapq.rs
// Trapezoidal velocity movement queue

use std::collections::VecDeque;

pub const NEVER_TIME: f64 = 9_999_999_999_999_999.9;
const MAX_NULL_MOVE: f64 = 1.0;

#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Coord { x, y, z }
    }

    fn offset(&self, axes_r: &Coord, dist: f64) -> Coord {
        Coord {
            x: self.x + axes_r.x * dist,
            y: self.y + axes_r.y * dist,
            z: self.z + axes_r.z * dist,
        }
    }
}

/// One constant-acceleration segment of a toolhead move.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Move {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
}

impl Move {
    pub fn new(
        print_time: f64,
        move_t: f64,
        start_v: f64,
        half_accel: f64,
        start_pos: Coord,
        axes_r: Coord,
    ) -> Self {
        Move {
            print_time,
            move_t,
            start_v,
            half_accel,
            start_pos,
            axes_r,
        }
    }

    /// Return the distance moved given a time in a move
    pub fn get_distance(&self, move_time: f64) -> f64 {
        (self.start_v + self.half_accel * move_time) * move_time
    }

    /// Return the XYZ coordinates given a time in a move
    pub fn get_coord(&self, move_time: f64) -> Coord {
        self.start_pos.offset(&self.axes_r, self.get_distance(move_time))
    }

    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }

    pub fn is_null(&self) -> bool {
        self.start_v == 0.0 && self.half_accel == 0.0
    }
}

/// Snapshot of a move handed out by `extract_old`.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct PullMove {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub accel: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
}

impl From<&Move> for PullMove {
    fn from(m: &Move) -> Self {
        PullMove {
            print_time: m.print_time,
            move_t: m.move_t,
            start_v: m.start_v,
            accel: 2.0 * m.half_accel,
            start_pos: m.start_pos,
            axes_r: m.axes_r,
        }
    }
}

/// Time ordered queue of moves bracketed by a head and tail sentinel.
///
/// The live list always starts with a head sentinel ending at time -1 and
/// ends with a tail sentinel that holds the final position of the last
/// real move and lasts forever, so readers can walk the list with indexes
/// without bounds checks. Finalized moves are kept newest-first in
/// `history` until their time is cleared.
#[derive(Debug, Clone)]
pub struct TrapQ {
    moves: VecDeque<Move>,
    history: VecDeque<Move>,
    tail_dirty: bool,
}

impl Default for TrapQ {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapQ {
    pub fn new() -> Self {
        let head = Move {
            print_time: -1.0,
            ..Move::default()
        };
        let tail = Move {
            print_time: NEVER_TIME,
            move_t: NEVER_TIME,
            ..Move::default()
        };
        TrapQ {
            moves: VecDeque::from(vec![head, tail]),
            history: VecDeque::new(),
            tail_dirty: false,
        }
    }

    /// Number of entries in the live list, sentinels included.
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// True when only the two sentinels remain.
    pub fn is_empty(&self) -> bool {
        self.moves.len() == 2
    }

    fn tail_index(&self) -> usize {
        self.moves.len() - 1
    }

    fn computed_tail(&self) -> Move {
        let mut tail = self.moves[self.tail_index()];
        if self.is_empty() {
            tail.print_time = NEVER_TIME;
            return tail;
        }
        let last = &self.moves[self.tail_index() - 1];
        tail.print_time = last.end_time();
        tail.start_pos = last.get_coord(last.move_t);
        tail
    }

    /// Live-list entry by index; index 0 is the head sentinel and
    /// `len() - 1` the tail sentinel.
    pub fn move_at(&self, idx: usize) -> Move {
        if self.tail_dirty && idx == self.tail_index() {
            return self.computed_tail();
        }
        self.moves[idx]
    }

    /// Update the tail sentinel after new moves were queued.
    pub fn check_sentinels(&mut self) {
        if !self.tail_dirty {
            return;
        }
        self.tail_dirty = false;
        let tail = self.computed_tail();
        let idx = self.tail_index();
        self.moves[idx] = tail;
    }

    /// Add a move to the trapezoid velocity queue
    pub fn add_move(&mut self, m: Move) {
        let tail_idx = self.tail_index();
        let prev = self.moves[tail_idx - 1];
        if prev.end_time() < m.print_time {
            // Add a null move to fill time gap
            let mut null_move = Move {
                print_time: prev.end_time(),
                start_pos: m.start_pos,
                ..Move::default()
            };
            if prev.print_time <= 0.0 && m.print_time > MAX_NULL_MOVE {
                null_move.print_time = m.print_time - MAX_NULL_MOVE;
            }
            null_move.move_t = m.print_time - null_move.print_time;
            self.moves.insert(tail_idx, null_move);
        }
        let tail_idx = self.tail_index();
        self.moves.insert(tail_idx, m);
        self.tail_dirty = true;
    }

    /// Fill and add a move to the trapezoid velocity queue
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        mut print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        mut start_pos: Coord,
        axes_r: Coord,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) {
        if accel_t > 0.0 {
            let m = Move::new(print_time, accel_t, start_v, 0.5 * accel, start_pos, axes_r);
            self.add_move(m);
            print_time += accel_t;
            start_pos = m.get_coord(accel_t);
        }
        if cruise_t > 0.0 {
            let m = Move::new(print_time, cruise_t, cruise_v, 0.0, start_pos, axes_r);
            self.add_move(m);
            print_time += cruise_t;
            start_pos = m.get_coord(cruise_t);
        }
        if decel_t > 0.0 {
            let m = Move::new(print_time, decel_t, cruise_v, -0.5 * accel, start_pos, axes_r);
            self.add_move(m);
        }
    }

    /// Expire any moves older than `print_time` from the trapezoid velocity queue
    pub fn finalize_moves(&mut self, print_time: f64, clear_history_time: f64) {
        self.check_sentinels();
        while !self.is_empty() {
            let m = self.moves[1];
            if m.end_time() > print_time {
                break;
            }
            self.moves.remove(1);
            if !m.is_null() {
                self.history.push_front(m);
            }
        }
        if self.is_empty() {
            let idx = self.tail_index();
            self.moves[idx].print_time = NEVER_TIME;
        }
        // Free old moves from history list; the latest entry is always kept
        while self.history.len() > 1 {
            match self.history.back() {
                Some(m) if m.end_time() <= clear_history_time => {
                    self.history.pop_back();
                }
                _ => break,
            }
        }
    }

    /// Note a position change in the trapq history
    pub fn set_position(&mut self, print_time: f64, pos: Coord) {
        // Flush all moves from trapq
        self.finalize_moves(NEVER_TIME, 0.0);

        // Prune any moves in the trapq history that were interrupted
        while let Some(m) = self.history.front_mut() {
            if m.print_time < print_time {
                if m.end_time() > print_time {
                    m.move_t = print_time - m.print_time;
                }
                break;
            }
            self.history.pop_front();
        }

        // Add a marker to the trapq history
        self.history.push_front(Move {
            print_time,
            start_pos: pos,
            ..Move::default()
        });
    }

    /// Return history of movement queue, newest first
    pub fn extract_old(&self, max: usize, start_time: f64, end_time: f64) -> Vec<PullMove> {
        let mut res = Vec::new();
        for idx in (0..self.len()).rev() {
            let m = self.move_at(idx);
            if start_time >= m.end_time() || res.len() >= max {
                break;
            }
            if end_time <= m.print_time || m.is_null() {
                continue;
            }
            res.push(PullMove::from(&m));
        }
        for m in self.history.iter() {
            if start_time >= m.end_time() || res.len() >= max {
                break;
            }
            if end_time <= m.print_time {
                continue;
            }
            res.push(PullMove::from(m));
        }
        res
    }

    /// Walk the live list from `hint` to the entry covering `time`.
    pub fn seek(&self, mut hint: usize, time: f64) -> usize {
        hint = hint.clamp(0, self.tail_index());
        while hint > 0 && time < self.move_at(hint).print_time {
            hint -= 1;
        }
        while hint < self.tail_index() && time >= self.move_at(hint).end_time() {
            hint += 1;
        }
        hint
    }

    /// Position of the toolhead at `time`, if that time is still tracked.
    pub fn position_at(&self, time: f64) -> Option<Coord> {
        if !self.is_empty() || self.tail_dirty {
            let idx = self.seek(self.tail_index(), time);
            let m = self.move_at(idx);
            if idx > 0 && time >= m.print_time {
                let move_time = (time - m.print_time).min(m.move_t).max(0.0);
                return Some(m.get_coord(move_time));
            }
        }
        for m in self.history.iter() {
            if time >= m.print_time {
                let move_time = (time - m.print_time).min(m.move_t);
                return Some(m.get_coord(move_time));
            }
        }
        None
    }

    pub fn history(&self) -> impl Iterator<Item = &Move> {
        self.history.iter()
    }
}
