// src/kinematics/mod.rs
// Per-stepper kinematic models used by the iterative step solver.

use std::ops::BitOr;

use crate::trapq::Move;

pub mod cartesian;

pub use cartesian::CartesianStepper;

/// Cartesian axes whose motion can move a stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveFlags(u8);

impl BitOr for ActiveFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ActiveFlags {
    pub const X: Self = Self(1 << 0);
    pub const Y: Self = Self(1 << 1);
    pub const Z: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flag for an axis letter, if it names one.
    pub fn from_axis(axis: char) -> Option<Self> {
        match axis {
            'x' => Some(Self::X),
            'y' => Some(Self::Y),
            'z' => Some(Self::Z),
            _ => None,
        }
    }
}

/// Maps toolhead motion to the position of a single stepper.
pub trait Kinematics: Send {
    /// Stepper position (in stepper distance units) at `move_time` into `m`.
    fn calc_position(&mut self, m: &Move, move_time: f64) -> f64;

    /// Axes whose motion influences this stepper.
    fn active_flags(&self) -> ActiveFlags;

    /// Hook run after the commanded position is updated.
    fn post_position(&mut self, _commanded_pos: f64) {}
}

/// Kinematics backed by a plain position closure.
pub struct FnKinematics<F> {
    calc: F,
    flags: ActiveFlags,
}

impl<F> FnKinematics<F>
where
    F: FnMut(&Move, f64) -> f64 + Send,
{
    pub fn new(flags: ActiveFlags, calc: F) -> Self {
        Self { calc, flags }
    }
}

impl<F> Kinematics for FnKinematics<F>
where
    F: FnMut(&Move, f64) -> f64 + Send,
{
    fn calc_position(&mut self, m: &Move, move_time: f64) -> f64 {
        (self.calc)(m, move_time)
    }

    fn active_flags(&self) -> ActiveFlags {
        self.flags
    }
}
