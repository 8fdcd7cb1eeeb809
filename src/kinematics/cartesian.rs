// src/kinematics/cartesian.rs

use super::{ActiveFlags, Kinematics};
use crate::trapq::Move;

/// A stepper driving one cartesian axis directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CartesianStepper {
    axis: ActiveFlags,
}

impl CartesianStepper {
    /// Creates the model for axis 'x', 'y' or 'z'.
    pub fn new(axis: char) -> Option<Self> {
        ActiveFlags::from_axis(axis).map(|axis| Self { axis })
    }
}

impl Kinematics for CartesianStepper {
    fn calc_position(&mut self, m: &Move, move_time: f64) -> f64 {
        let c = m.get_coord(move_time);
        if self.axis == ActiveFlags::X {
            c.x
        } else if self.axis == ActiveFlags::Y {
            c.y
        } else {
            c.z
        }
    }

    fn active_flags(&self) -> ActiveFlags {
        self.axis
    }
}
