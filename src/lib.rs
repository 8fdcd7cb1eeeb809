// src/lib.rs
// Host side motion helpers: step generation and compression, and the
// reliable serial transport that carries the resulting commands to the mcu.

pub mod batch;
pub mod configfile;
pub mod itersolve;
pub mod kinematics;
pub mod msgblock;
pub mod pollreactor;
pub mod serialqueue;
pub mod stepcompress;
pub mod stepcompress_hp;
pub mod steppersync;
pub mod transport;
pub mod trapq;
pub mod trdispatch;

pub use itersolve::{StepSink, StepperKinematics};
pub use msgblock::{ClockEstimate, PullQueueMessage, QueueMessage};
pub use serialqueue::{CommandQueue, SerialQueue, SerialQueueError, TransportKind};
pub use stepcompress::{CompressMode, StepCompress, StepCompressError};
pub use steppersync::{SteppersSync, SteppersSyncError};
pub use trapq::{Coord, Move, TrapQ};
pub use trdispatch::{Trdispatch, TrsyncLink};
