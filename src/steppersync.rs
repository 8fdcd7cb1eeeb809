// src/steppersync.rs
// Merge the command streams of several steppers sharing one mcu.
//
// The mcu has a fixed number of move queue slots shared by all of its
// steppers. A min-heap of slot release clocks tracks when the next slot
// frees up, so a step command is never sent before the mcu has room.

use std::sync::Arc;

use log::{error, trace};
use thiserror::Error;

use crate::msgblock::QueueMessage;
use crate::serialqueue::{CommandQueue, SerialQueue, SerialQueueError};
use crate::stepcompress::{StepCompress, StepCompressError};

#[derive(Debug, Error)]
pub enum SteppersSyncError {
    #[error(transparent)]
    Step(#[from] StepCompressError),
    #[error("steppersync: {0}")]
    Transport(#[from] SerialQueueError),
}

/// The step compressors of one mcu and the move queue slots they share.
pub struct SteppersSync {
    sq: Arc<SerialQueue>,
    cq: CommandQueue,
    steppers: Vec<StepCompress>,
    move_clocks: Vec<u64>,
}

impl SteppersSync {
    pub fn new(sq: Arc<SerialQueue>, steppers: Vec<StepCompress>, move_num: usize) -> Self {
        let cq = sq.alloc_commandqueue();
        Self {
            sq,
            cq,
            steppers,
            move_clocks: vec![0; move_num.max(1)],
        }
    }

    pub fn steppers(&self) -> &[StepCompress] {
        &self.steppers
    }

    pub fn steppers_mut(&mut self) -> &mut [StepCompress] {
        &mut self.steppers
    }

    pub fn stepper_mut(&mut self, oid: u32) -> Option<&mut StepCompress> {
        self.steppers.iter_mut().find(|sc| sc.oid() == oid)
    }

    /// Set the conversion rate of 'print_time' to mcu clock
    pub fn set_time(&mut self, time_offset: f64, mcu_freq: f64) {
        for sc in self.steppers.iter_mut() {
            sc.set_time(time_offset, mcu_freq);
        }
    }

    // Replace the earliest slot with `req_clock` and sift it down
    fn heap_replace(&mut self, req_clock: u64) {
        let mc = &mut self.move_clocks;
        let mut pos = 0;
        loop {
            let child1_pos = 2 * pos + 1;
            let child2_pos = 2 * pos + 2;
            let child1_clock = mc.get(child1_pos).copied().unwrap_or(u64::MAX);
            let child2_clock = mc.get(child2_pos).copied().unwrap_or(u64::MAX);
            if req_clock <= child1_clock && req_clock <= child2_clock {
                mc[pos] = req_clock;
                break;
            }
            if child1_clock < child2_clock {
                mc[pos] = child1_clock;
                pos = child1_pos;
            } else {
                mc[pos] = child2_clock;
                pos = child2_pos;
            }
        }
    }

    // Flush every stepper and pull out, in req_clock order, all commands
    // that may go to the mcu before `move_clock`
    pub(crate) fn collect_batch(&mut self, move_clock: u64) -> Result<Vec<QueueMessage>, StepCompressError> {
        for sc in self.steppers.iter_mut() {
            sc.flush(move_clock)?;
        }

        let mut batch = Vec::new();
        loop {
            // Find message with lowest req_clock
            let mut best: Option<(usize, u64)> = None;
            for (i, sc) in self.steppers.iter_mut().enumerate() {
                if let Some(m) = sc.msg_queue_mut().front() {
                    if best.map_or(true, |(_, req_clock)| m.req_clock < req_clock) {
                        best = Some((i, m.req_clock));
                    }
                }
            }
            let Some((idx, req_clock)) = best else {
                break;
            };
            let min_clock = match self.steppers[idx].msg_queue_mut().front() {
                Some(m) => m.min_clock,
                None => break,
            };
            if min_clock != 0 && req_clock > move_clock {
                break;
            }

            let next_avail = self.move_clocks[0];
            if min_clock != 0 {
                // A nonzero min_clock marks a command that uses a move
                // queue slot until that clock
                self.heap_replace(min_clock);
            }
            let Some(mut qm) = self.steppers[idx].msg_queue_mut().pop_front() else {
                break;
            };
            // Back to its transmit meaning: not before the slot frees up
            qm.min_clock = next_avail;
            batch.push(qm);
        }
        Ok(batch)
    }

    /// Find and transmit any scheduled steps prior to the given 'move_clock'
    pub fn flush(&mut self, move_clock: u64, clear_history_clock: u64) -> Result<(), SteppersSyncError> {
        let batch = self.collect_batch(move_clock)?;
        if !batch.is_empty() {
            trace!("steppersync: sending {} commands up to {}", batch.len(), move_clock);
            if let Err(e) = self.sq.send_batch(&self.cq, batch) {
                error!("steppersync: step commands up to clock {} not sent: {}", move_clock, e);
                return Err(e.into());
            }
        }
        for sc in self.steppers.iter_mut() {
            sc.history_expire(clear_history_clock);
        }
        Ok(())
    }
}

impl Drop for SteppersSync {
    fn drop(&mut self) {
        self.sq.free_commandqueue(&self.cq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialqueue::TransportKind;
    use crate::stepcompress::CompressMode;
    use std::os::fd::OwnedFd;

    fn debug_queue() -> Arc<SerialQueue> {
        let file = tempfile::tempfile().unwrap();
        Arc::new(SerialQueue::new(OwnedFd::from(file), TransportKind::DebugFile).unwrap())
    }

    fn new_sc(oid: u32) -> StepCompress {
        let mut sc = StepCompress::new(oid, CompressMode::Standard);
        sc.fill(10, 20, 21);
        sc.set_time(0.0, 1_000_000.0);
        sc
    }

    #[test]
    fn slots_gate_transmit_time() {
        let mut ss = SteppersSync::new(debug_queue(), vec![new_sc(0), new_sc(1)], 1);
        ss.steppers_mut()[0].queue_mq_msg(500, &[1]).unwrap();
        ss.steppers_mut()[0].queue_msg(&[3]).unwrap();
        ss.steppers_mut()[1].queue_mq_msg(300, &[2]).unwrap();
        let batch = ss.collect_batch(1000).unwrap();
        let order: Vec<u8> = batch.iter().map(|qm| qm.data()[0]).collect();
        assert_eq!(order, vec![2, 1, 3]);
        let min_clocks: Vec<u64> = batch.iter().map(|qm| qm.min_clock).collect();
        assert_eq!(min_clocks, vec![0, 300, 500]);
    }

    #[test]
    fn move_clock_holds_back_future_commands() {
        let mut ss = SteppersSync::new(debug_queue(), vec![new_sc(0), new_sc(1)], 4);
        ss.steppers_mut()[0].queue_mq_msg(2000, &[1]).unwrap();
        ss.steppers_mut()[1].reset(5000).unwrap();
        ss.steppers_mut()[1].queue_msg(&[2]).unwrap();
        assert!(ss.collect_batch(1000).unwrap().is_empty());
        let batch = ss.collect_batch(3000).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].req_clock, 2000);
        assert_eq!(batch[1].req_clock, 5000);
    }

    #[test]
    fn heap_keeps_earliest_slot_first() {
        let mut ss = SteppersSync::new(debug_queue(), vec![new_sc(0)], 5);
        let mut rng = fastrand::Rng::with_seed(7);
        let mut released = Vec::new();
        for _ in 0..200 {
            let clock = rng.u64(1..1_000_000);
            let before = ss.move_clocks[0];
            ss.heap_replace(clock);
            released.push(before);
            let min = *ss.move_clocks.iter().min().unwrap();
            assert_eq!(ss.move_clocks[0], min);
            for pos in 1..ss.move_clocks.len() {
                assert!(ss.move_clocks[(pos - 1) / 2] <= ss.move_clocks[pos]);
            }
        }
        assert_eq!(released.iter().filter(|&&c| c == 0).count(), 5);
    }

    #[test]
    fn step_commands_in_req_clock_order() {
        let mut ss = SteppersSync::new(debug_queue(), vec![new_sc(0), new_sc(1)], 16);
        for (i, sc) in ss.steppers_mut().iter_mut().enumerate() {
            sc.reset(1000).unwrap();
            let start = 1000 + 37 * i as u64;
            for k in 1..=200u64 {
                let clock = start + k * (150 + 5 * i as u64) + k * k / 40;
                sc.append(true, 0.0, clock as f64 / 1_000_000.0).unwrap();
            }
        }
        let batch = ss.collect_batch(u64::MAX).unwrap();
        assert!(batch.len() >= 4);
        assert!(batch.windows(2).all(|w| w[0].req_clock <= w[1].req_clock));
        assert!(ss.steppers().iter().all(|sc| sc.last_position() == 200));
    }

    #[test]
    fn flush_after_disconnect_fails() {
        let sq = debug_queue();
        let mut ss = SteppersSync::new(sq.clone(), vec![new_sc(0)], 4);
        ss.steppers_mut()[0].queue_msg(&[1]).unwrap();
        ss.flush(1000, 0).unwrap();
        sq.exit();
        ss.steppers_mut()[0].queue_msg(&[2]).unwrap();
        assert!(matches!(
            ss.flush(2000, 0),
            Err(SteppersSyncError::Transport(SerialQueueError::Disconnected))
        ));
        // Nothing to send is not an error
        ss.flush(3000, 0).unwrap();
    }

    #[test]
    fn set_time_reaches_every_stepper() {
        let mut ss = SteppersSync::new(debug_queue(), vec![new_sc(0), new_sc(1)], 1);
        ss.set_time(2.0, 16_000_000.0);
        assert!(ss.steppers().iter().all(|sc| sc.mcu_freq() == 16_000_000.0));
        assert!(ss.stepper_mut(1).is_some());
        assert!(ss.stepper_mut(9).is_none());
    }
}
