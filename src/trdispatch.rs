// src/trdispatch.rs
// Trigger sync "trsync" message dispatch
//
// During a homing or probing move every participating mcu reports its
// trsync state. As soon as one of them reports a trigger (or a timeout)
// a trigger command is sent to all of them. While nothing has fired, the
// watchdog expire time of each mcu is extended based on the slowest
// reporter.

use std::sync::{Arc, Weak};

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::msgblock::{decode, ClockEstimate, MsgBlockError, QueueMessage, BACKGROUND_PRIORITY_CLOCK};
use crate::pollreactor::PR_NEVER;
use crate::serialqueue::{CommandQueue, FastReaderFn, FastReaderId, SerialQueue, SerialQueueError};

/// The transport operations trsync dispatch needs from an mcu link.
pub trait TrsyncLink: Send + Sync {
    fn get_clock_est(&self) -> ClockEstimate;
    fn send_one(&self, cq: &CommandQueue, msg: QueueMessage) -> Result<(), SerialQueueError>;
    fn add_fastreader(&self, prefix: &[u8], func: FastReaderFn) -> Result<FastReaderId, SerialQueueError>;
    fn rm_fastreader(&self, id: FastReaderId);
    fn free_commandqueue(&self, cq: &CommandQueue);
}

impl TrsyncLink for SerialQueue {
    fn get_clock_est(&self) -> ClockEstimate {
        SerialQueue::get_clock_est(self)
    }

    fn send_one(&self, cq: &CommandQueue, msg: QueueMessage) -> Result<(), SerialQueueError> {
        SerialQueue::send_one(self, cq, msg)
    }

    fn add_fastreader(&self, prefix: &[u8], func: FastReaderFn) -> Result<FastReaderId, SerialQueueError> {
        SerialQueue::add_fastreader(self, prefix, func)
    }

    fn rm_fastreader(&self, id: FastReaderId) {
        SerialQueue::rm_fastreader(self, id)
    }

    fn free_commandqueue(&self, cq: &CommandQueue) {
        SerialQueue::free_commandqueue(self, cq)
    }
}

/// Handle to a participant registered with `Trdispatch::add_mcu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrdispatchMcu(usize);

struct TdMcu {
    link: Arc<dyn TrsyncLink>,
    cq: CommandQueue,
    trsync_oid: u32,
    set_timeout_msgtag: u32,
    trigger_msgtag: u32,
    prefix: QueueMessage,
    last_status_clock: u64,
    expire_clock: u64,
    expire_ticks: u64,
    min_extend_ticks: u64,
    ce: ClockEstimate,
}

impl TdMcu {
    // Send: trsync_trigger oid=%c reason=%c
    fn send_trsync_trigger(&self, dispatch_reason: u32) {
        match QueueMessage::encode(&[self.trigger_msgtag, self.trsync_oid, dispatch_reason]) {
            Ok(mut qm) => {
                qm.req_clock = BACKGROUND_PRIORITY_CLOCK;
                if let Err(e) = self.link.send_one(&self.cq, qm) {
                    error!("trdispatch: trigger send: {}", e);
                }
            }
            Err(e) => error!("trdispatch: trigger encode: {}", e),
        }
    }

    // Send: trsync_set_timeout oid=%c clock=%u
    fn send_trsync_set_timeout(&self) {
        match QueueMessage::encode(&[self.set_timeout_msgtag, self.trsync_oid, self.expire_clock as u32]) {
            Ok(mut qm) => {
                qm.req_clock = self.expire_clock;
                if let Err(e) = self.link.send_one(&self.cq, qm) {
                    error!("trdispatch: set_timeout send: {}", e);
                }
            }
            Err(e) => error!("trdispatch: set_timeout encode: {}", e),
        }
    }
}

#[derive(Default)]
struct TdState {
    mcus: Vec<TdMcu>,
    is_active: bool,
    can_trigger: bool,
    dispatch_reason: u32,
}

impl TdState {
    // Handle a trsync_state message from the mcu at `idx`
    fn handle_trsync_state(&mut self, idx: usize, data: &[u8]) {
        // Parse: trsync_state oid=%c can_trigger=%c trigger_reason=%c clock=%u
        let Ok(fields) = decode(data, 5) else {
            return;
        };
        let Some(tdm) = self.mcus.get_mut(idx) else {
            return;
        };
        if fields[1] != tdm.trsync_oid || !self.can_trigger {
            return;
        }
        let (can_trigger, clock) = (fields[2], fields[4]);

        if can_trigger == 0 {
            // mcu reports trigger or timeout - propagate to all mcus
            self.can_trigger = false;
            info!("trdispatch: mcu {} reports trigger, reason {}", idx, fields[3]);
            for m in self.mcus.iter() {
                m.send_trsync_trigger(self.dispatch_reason);
            }
            return;
        }

        // mcu is still working okay - update last_status_clock
        tdm.ce = tdm.link.get_clock_est();
        tdm.last_status_clock = tdm.ce.clock_from_clock32(clock);

        // Determine minimum acknowledged time among all mcus
        let mut min_time = PR_NEVER;
        let mut next_min_time = PR_NEVER;
        let mut min_idx = None;
        for (i, m) in self.mcus.iter().enumerate() {
            let status_time = m.ce.clock_to_time(m.last_status_clock);
            if status_time < next_min_time {
                next_min_time = status_time;
                if status_time < min_time {
                    next_min_time = min_time;
                    min_time = status_time;
                    min_idx = Some(i);
                }
            }
        }
        if next_min_time == PR_NEVER {
            next_min_time = min_time;
        }

        // Send trsync_set_timeout messages to other mcus (if needed)
        for (i, m) in self.mcus.iter_mut().enumerate() {
            let status_time = if Some(i) == min_idx { next_min_time } else { min_time };
            let expire = m.ce.clock_from_time(status_time).wrapping_add(m.expire_ticks);
            if expire.wrapping_sub(m.expire_clock) as i64 >= m.min_extend_ticks as i64 {
                m.expire_clock = expire;
                m.send_trsync_set_timeout();
            }
        }
    }
}

struct TdShared {
    state: Mutex<TdState>,
}

/// Coordinates trsync triggering across several mcus.
pub struct Trdispatch {
    shared: Arc<TdShared>,
    readers: Mutex<Vec<(Arc<dyn TrsyncLink>, FastReaderId)>>,
}

impl Default for Trdispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Trdispatch {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TdShared { state: Mutex::new(TdState::default()) }),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Register an mcu taking part in trigger dispatch
    pub fn add_mcu(
        &self,
        link: Arc<dyn TrsyncLink>,
        cq: CommandQueue,
        trsync_oid: u32,
        set_timeout_msgtag: u32,
        trigger_msgtag: u32,
        state_msgtag: u32,
    ) -> Result<TrdispatchMcu, MsgBlockError> {
        // Match trsync_state messages by their encoded msgtag and oid
        let prefix = QueueMessage::encode(&[state_msgtag, trsync_oid])?;
        let mut state = self.shared.state.lock();
        state.mcus.push(TdMcu {
            link,
            cq,
            trsync_oid,
            set_timeout_msgtag,
            trigger_msgtag,
            prefix,
            last_status_clock: 0,
            expire_clock: 0,
            expire_ticks: 0,
            min_extend_ticks: 0,
            ce: ClockEstimate::default(),
        });
        Ok(TrdispatchMcu(state.mcus.len() - 1))
    }

    /// Setup for a trigger monitoring session
    pub fn mcu_setup(
        &self,
        mcu: TrdispatchMcu,
        last_status_clock: u64,
        expire_clock: u64,
        expire_ticks: u64,
        min_extend_ticks: u64,
    ) {
        let mut state = self.shared.state.lock();
        if let Some(m) = state.mcus.get_mut(mcu.0) {
            m.last_status_clock = last_status_clock;
            m.expire_clock = expire_clock;
            m.expire_ticks = expire_ticks;
            m.min_extend_ticks = min_extend_ticks;
            m.ce = m.link.get_clock_est();
        }
    }

    /// Begin synchronization
    pub fn start(&self, dispatch_reason: u32) -> Result<(), SerialQueueError> {
        let targets: Vec<(usize, Arc<dyn TrsyncLink>, QueueMessage)> = {
            let mut state = self.shared.state.lock();
            if state.is_active || state.mcus.is_empty() {
                return Ok(());
            }
            state.dispatch_reason = dispatch_reason;
            state.is_active = true;
            state.can_trigger = true;
            state.mcus.iter().enumerate().map(|(i, m)| (i, m.link.clone(), m.prefix.clone())).collect()
        };
        debug!("trdispatch: start with {} mcus, reason {}", targets.len(), dispatch_reason);

        // Register handle_trsync_state message parser for each mcu
        let mut readers = self.readers.lock();
        for (idx, link, prefix) in targets {
            let weak: Weak<TdShared> = Arc::downgrade(&self.shared);
            let func: FastReaderFn = Arc::new(move |data: &[u8]| {
                if let Some(shared) = weak.upgrade() {
                    shared.state.lock().handle_trsync_state(idx, data);
                }
            });
            let id = link.add_fastreader(prefix.data(), func)?;
            readers.push((link, id));
        }
        Ok(())
    }

    /// Cleanup after a test completes
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.is_active {
                return;
            }
            state.is_active = false;
        }
        // Unregister handle_trsync_state message parsers
        for (link, id) in self.readers.lock().drain(..) {
            link.rm_fastreader(id);
        }
        debug!("trdispatch: stop");
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().is_active
    }

    /// True once any mcu has reported a trigger during the active session.
    pub fn is_triggered(&self) -> bool {
        let state = self.shared.state.lock();
        state.is_active && !state.can_trigger
    }

    /// Current watchdog expire clock of an mcu.
    pub fn expire_clock(&self, mcu: TrdispatchMcu) -> Option<u64> {
        self.shared.state.lock().mcus.get(mcu.0).map(|m| m.expire_clock)
    }
}

impl Drop for Trdispatch {
    fn drop(&mut self) {
        self.stop();
        for m in self.shared.state.lock().mcus.iter() {
            m.link.free_commandqueue(&m.cq);
        }
    }
}
