// src/serialqueue.rs
// Serial port command queuing
//
// Commands are framed into message blocks, each carrying a 4bit sequence
// number, and written by a background thread. The mcu acknowledges
// blocks by sequence; unacknowledged blocks are retransmitted after a
// timeout derived from the measured round trip time, or immediately when a
// duplicate ack (a nak) arrives. Commands wait in per-queue "upcoming"
// lists until the estimated mcu clock reaches their min_clock, then in
// "ready" lists from which the lowest req_clock is always sent first.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::Waker;
use parking_lot::Mutex;
use thiserror::Error;

use crate::msgblock::{
    crc16_ccitt, BlockCheck, BlockParser, ClockEstimate, MessageBuf, MsgBlockError, PullQueueMessage, QueueMessage,
    BACKGROUND_PRIORITY_CLOCK, MAX_CLOCK, MESSAGE_DEST, MESSAGE_HEADER_SIZE, MESSAGE_MAX, MESSAGE_MIN,
    MESSAGE_PAYLOAD_MAX, MESSAGE_POS_LEN, MESSAGE_POS_SEQ, MESSAGE_SEQ_MASK, MESSAGE_SYNC,
    MESSAGE_TRAILER_SIZE,
};
use crate::pollreactor::{get_monotonic, set_non_blocking, PollReactor, ReactorTimers, PR_NEVER, PR_NOW};

const SQPF_SERIAL: usize = 0;
const SQPF_PIPE: usize = 1;
const SQPF_NUM: usize = 2;

pub(crate) const SQPT_RETRANSMIT: usize = 0;
pub(crate) const SQPT_COMMAND: usize = 1;
pub(crate) const SQPT_NUM: usize = 2;

pub const MAX_PENDING_BLOCKS: u64 = 12;
pub const MIN_RTO: f64 = 0.025;
pub const MAX_RTO: f64 = 5.000;
const MIN_REQTIME_DELTA: f64 = 0.250;
const MIN_BACKGROUND_DELTA: f64 = 0.005;

const DEBUG_QUEUE_SENT: usize = 100;
const DEBUG_QUEUE_RECEIVE: usize = 100;

const CAN_FRAME_SIZE: usize = 16;
const CAN_DATA_MAX: usize = 8;
// Bits on the wire for a full 8 byte standard can frame, stuffing included
const CAN_FRAME_BITS: f64 = 133.2;

#[derive(Debug, Error)]
pub enum SerialQueueError {
    #[error("serialqueue io: {0}")]
    Io(#[from] io::Error),
    #[error("serialqueue: {0}")]
    Message(#[from] MsgBlockError),
    #[error("serialqueue: unknown transport type '{0}'")]
    Transport(char),
    #[error("serialqueue: background thread has exited")]
    Disconnected,
}

/// Link type of the file descriptor handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Uart,
    Can { client_id: u32 },
    DebugFile,
}

impl TransportKind {
    /// Parse the single letter transport codes 'u', 'c' and 'f'.
    pub fn from_code(code: char, client_id: u32) -> Result<Self, SerialQueueError> {
        match code {
            'u' => Ok(Self::Uart),
            'c' => Ok(Self::Can { client_id }),
            'f' => Ok(Self::DebugFile),
            other => Err(SerialQueueError::Transport(other)),
        }
    }
}

/// Handle to a command queue owned by a `SerialQueue`.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandQueue {
    id: usize,
}

#[cfg(test)]
impl CommandQueue {
    pub(crate) fn with_id(id: usize) -> Self {
        Self { id }
    }
}

/// Registration handle returned by `add_fastreader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FastReaderId(pub(crate) u64);

/// Callback invoked on the background thread with a matching block.
pub type FastReaderFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct FastReader {
    id: FastReaderId,
    prefix: MessageBuf,
    func: FastReaderFn,
}

#[derive(Debug, Default)]
struct CommandQueueState {
    upcoming: VecDeque<QueueMessage>,
    ready: VecDeque<QueueMessage>,
}

impl CommandQueueState {
    fn is_idle(&self) -> bool {
        self.upcoming.is_empty() && self.ready.is_empty()
    }
}

#[derive(Debug, Clone)]
struct SentBlock {
    data: MessageBuf,
    sent_time: f64,
    receive_time: f64,
}

#[derive(Debug, Clone, Copy)]
struct NotifyEntry {
    send_seq: u64,
    notify_id: u64,
}

/// Transfer counters and link state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SerialQueueStats {
    pub bytes_write: u32,
    pub bytes_read: u32,
    pub bytes_retransmit: u32,
    pub bytes_invalid: u32,
    pub send_seq: u64,
    pub receive_seq: u64,
    pub retransmit_seq: u64,
    pub srtt: f64,
    pub rttvar: f64,
    pub rto: f64,
    pub ready_bytes: usize,
    pub upcoming_bytes: usize,
}

impl std::fmt::Display for SerialQueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bytes_write={} bytes_read={} bytes_retransmit={} bytes_invalid={} \
             send_seq={} receive_seq={} retransmit_seq={} \
             srtt={:.3} rttvar={:.3} rto={:.3} \
             ready_bytes={} upcoming_bytes={}",
            self.bytes_write,
            self.bytes_read,
            self.bytes_retransmit,
            self.bytes_invalid,
            self.send_seq as u32,
            self.receive_seq as u32,
            self.retransmit_seq as u32,
            self.srtt,
            self.rttvar,
            self.rto,
            self.ready_bytes,
            self.upcoming_bytes
        )
    }
}

/// Everything guarded by the main serialqueue lock.
pub(crate) struct SqState {
    kind: TransportKind,
    receive_window: usize,
    bittime_adj: f64,
    idle_time: f64,
    ce: ClockEstimate,
    last_receive_sent_time: f64,
    send_seq: u64,
    receive_seq: u64,
    ignore_nak_seq: u64,
    last_ack_seq: u64,
    retransmit_seq: u64,
    rtt_sample_seq: u64,
    sent_queue: VecDeque<SentBlock>,
    srtt: f64,
    rttvar: f64,
    rto: f64,
    queues: Vec<Option<CommandQueueState>>,
    pending_queues: Vec<usize>,
    ready_bytes: usize,
    upcoming_bytes: usize,
    need_ack_bytes: usize,
    last_ack_bytes: usize,
    need_kick_clock: u64,
    notify_queue: VecDeque<NotifyEntry>,
    receive_tx: Option<Sender<PullQueueMessage>>,
    fast_readers: Vec<FastReader>,
    next_fast_reader_id: u64,
    old_sent: VecDeque<PullQueueMessage>,
    old_receive: VecDeque<PullQueueMessage>,
    bytes_write: u32,
    bytes_read: u32,
    bytes_retransmit: u32,
    bytes_invalid: u32,
}

fn debug_queue_add(queue: &mut VecDeque<PullQueueMessage>, limit: usize, msg: PullQueueMessage) {
    if queue.len() >= limit {
        queue.pop_front();
    }
    queue.push_back(msg);
}

impl SqState {
    pub(crate) fn new(kind: TransportKind, receive_tx: Sender<PullQueueMessage>) -> Self {
        let debug_output = kind == TransportKind::DebugFile;
        Self {
            kind,
            receive_window: 0,
            bittime_adj: 0.0,
            idle_time: 0.0,
            ce: ClockEstimate::default(),
            last_receive_sent_time: 0.0,
            send_seq: 1,
            receive_seq: if debug_output { u64::MAX } else { 1 },
            ignore_nak_seq: 0,
            last_ack_seq: 0,
            retransmit_seq: 0,
            rtt_sample_seq: 0,
            sent_queue: VecDeque::new(),
            srtt: 0.0,
            rttvar: 0.0,
            rto: if debug_output { PR_NEVER } else { MIN_RTO },
            queues: Vec::new(),
            pending_queues: Vec::new(),
            ready_bytes: 0,
            upcoming_bytes: 0,
            need_ack_bytes: 0,
            last_ack_bytes: 0,
            need_kick_clock: MAX_CLOCK,
            notify_queue: VecDeque::new(),
            receive_tx: Some(receive_tx),
            fast_readers: Vec::new(),
            next_fast_reader_id: 1,
            old_sent: VecDeque::new(),
            old_receive: VecDeque::new(),
            bytes_write: 0,
            bytes_read: 0,
            bytes_retransmit: 0,
            bytes_invalid: 0,
        }
    }

    fn is_debug_output(&self) -> bool {
        self.kind == TransportKind::DebugFile
    }

    fn calculate_bittime(&self, bytes: usize) -> f64 {
        self.bittime_adj * bytes as f64
    }

    fn post_receive(&mut self, msg: PullQueueMessage) {
        if let Some(tx) = &self.receive_tx {
            // A dropped receiver only means nobody is pulling anymore
            let _ = tx.send(msg);
        }
    }

    pub(crate) fn alloc_commandqueue(&mut self) -> CommandQueue {
        if let Some(id) = self.queues.iter().position(|q| q.is_none()) {
            self.queues[id] = Some(CommandQueueState::default());
            return CommandQueue { id };
        }
        self.queues.push(Some(CommandQueueState::default()));
        CommandQueue { id: self.queues.len() - 1 }
    }

    pub(crate) fn free_commandqueue(&mut self, cq: &CommandQueue) {
        match self.queues.get(cq.id) {
            Some(Some(q)) if !q.is_idle() => {
                error!("Memory leak! Can't free non-empty commandqueue");
            }
            Some(Some(_)) => self.queues[cq.id] = None,
            _ => {}
        }
    }

    // Add a batch of messages to a command queue. Returns true when the
    // background thread must be woken to reconsider its schedule.
    pub(crate) fn enqueue(&mut self, cq: &CommandQueue, msgs: Vec<QueueMessage>) -> bool {
        let Some(Some(queue)) = self.queues.get_mut(cq.id) else {
            error!("serialqueue: send on freed command queue {}", cq.id);
            return false;
        };
        let was_idle = queue.is_idle();
        let mut len = 0;
        let mut min_clock = MAX_CLOCK;
        for mut qm in msgs {
            if qm.min_clock + (1u64 << 31) < qm.req_clock && qm.req_clock != BACKGROUND_PRIORITY_CLOCK {
                qm.min_clock = qm.req_clock - (1u64 << 31);
            }
            min_clock = min_clock.min(qm.min_clock);
            len += qm.len();
            queue.upcoming.push_back(qm);
        }
        if len == 0 {
            return false;
        }
        if was_idle {
            self.pending_queues.push(cq.id);
        }
        self.upcoming_bytes += len;
        if min_clock < self.need_kick_clock {
            self.need_kick_clock = 0;
            return true;
        }
        false
    }

    pub(crate) fn add_fastreader(&mut self, prefix: &[u8], func: FastReaderFn) -> Result<FastReaderId, MsgBlockError> {
        let mut buf = MessageBuf::new();
        buf.extend_from_slice(prefix).map_err(|_| MsgBlockError::PayloadTooLarge)?;
        let id = FastReaderId(self.next_fast_reader_id);
        self.next_fast_reader_id += 1;
        self.fast_readers.push(FastReader { id, prefix: buf, func });
        Ok(id)
    }

    pub(crate) fn rm_fastreader(&mut self, id: FastReaderId) {
        self.fast_readers.retain(|fr| fr.id != id);
    }

    fn has_fastreader(&self, id: FastReaderId) -> bool {
        self.fast_readers.iter().any(|fr| fr.id == id)
    }

    pub(crate) fn set_wire_frequency(&mut self, frequency: f64) {
        self.bittime_adj = match self.kind {
            TransportKind::Can { .. } => CAN_FRAME_BITS / (CAN_DATA_MAX as f64 * frequency),
            // An 8N1 serial line is 10 bits per byte
            _ => 10.0 / frequency,
        };
    }

    pub(crate) fn stats(&self) -> SerialQueueStats {
        SerialQueueStats {
            bytes_write: self.bytes_write,
            bytes_read: self.bytes_read,
            bytes_retransmit: self.bytes_retransmit,
            bytes_invalid: self.bytes_invalid,
            send_seq: self.send_seq,
            receive_seq: self.receive_seq,
            retransmit_seq: self.retransmit_seq,
            srtt: self.srtt,
            rttvar: self.rttvar,
            rto: self.rto,
            ready_bytes: self.ready_bytes,
            upcoming_bytes: self.upcoming_bytes,
        }
    }

    // Update internal state when the receive sequence increases
    fn update_receive_seq(&mut self, timers: &mut ReactorTimers, eventtime: f64, rseq: u64) {
        // Remove from sent queue
        let mut sent_seq = self.receive_seq;
        self.last_ack_bytes = 0;
        loop {
            let Some(sent) = self.sent_queue.pop_front() else {
                // Got an ack for a message not sent; must be connection init
                self.send_seq = rseq;
                self.last_receive_sent_time = 0.0;
                break;
            };
            self.need_ack_bytes -= sent.data.len();
            self.last_ack_bytes += sent.data.len();
            sent_seq += 1;
            if rseq == sent_seq {
                self.last_receive_sent_time = sent.receive_time;
                break;
            }
        }
        self.receive_seq = rseq;
        timers.update_timer(SQPT_COMMAND, PR_NOW);

        // Update retransmit info
        if self.rtt_sample_seq != 0 && rseq > self.rtt_sample_seq && self.last_receive_sent_time != 0.0 {
            // RFC6298 rtt calculations
            let delta = eventtime - self.last_receive_sent_time;
            if self.srtt == 0.0 {
                self.rttvar = delta / 2.0;
                // use a higher start default
                self.srtt = delta * 10.0;
            } else {
                self.rttvar = (3.0 * self.rttvar + (self.srtt - delta).abs()) / 4.0;
                self.srtt = (7.0 * self.srtt + delta) / 8.0;
            }
            let rttvar4 = (self.rttvar * 4.0).max(0.001);
            self.rto = (self.srtt + rttvar4).clamp(MIN_RTO, MAX_RTO);
            self.rtt_sample_seq = 0;
        }
        match self.sent_queue.front() {
            None => timers.update_timer(SQPT_RETRANSMIT, PR_NEVER),
            Some(sent) => {
                let nr = eventtime + self.rto + self.calculate_bittime(sent.data.len());
                timers.update_timer(SQPT_RETRANSMIT, nr);
            }
        }
    }

    // Process a well formed input message. Returns the fast reader (if any)
    // that takes the block; it is invoked once the lock is released.
    pub(crate) fn handle_message(
        &mut self,
        timers: &mut ReactorTimers,
        eventtime: f64,
        block: &[u8],
    ) -> Option<(FastReaderId, FastReaderFn)> {
        let len = block.len();
        // Calculate receive sequence number
        let mut rseq = (self.receive_seq & !(MESSAGE_SEQ_MASK as u64)) | (block[MESSAGE_POS_SEQ] & MESSAGE_SEQ_MASK) as u64;
        if rseq != self.receive_seq {
            // New sequence number
            if rseq < self.receive_seq {
                rseq += MESSAGE_SEQ_MASK as u64 + 1;
            }
            if rseq > self.send_seq && self.receive_seq != 1 {
                // An ack for a message not sent?  Out of order message?
                self.bytes_invalid = self.bytes_invalid.wrapping_add(len as u32);
                debug!("serialqueue: dropping block with unexpected seq {}", rseq);
                return None;
            }
            self.update_receive_seq(timers, eventtime, rseq);
        }
        self.bytes_read = self.bytes_read.wrapping_add(len as u32);

        // Check for pending notifications
        let wake_seq = rseq.saturating_sub(1 + (len > MESSAGE_MIN) as u64);
        while let Some(entry) = self.notify_queue.front().copied() {
            if entry.send_seq > wake_seq {
                break;
            }
            self.notify_queue.pop_front();
            self.post_receive(PullQueueMessage {
                msg: MessageBuf::new(),
                sent_time: self.last_receive_sent_time,
                receive_time: eventtime,
                notify_id: entry.notify_id,
            });
        }

        // Process message
        if len == MESSAGE_MIN {
            // Ack/nak message
            if self.last_ack_seq < rseq {
                self.last_ack_seq = rseq;
            } else if rseq > self.ignore_nak_seq && !self.sent_queue.is_empty() {
                // Duplicate Ack is a Nak - do fast retransmit
                timers.update_timer(SQPT_RETRANSMIT, PR_NOW);
            }
            return None;
        }

        // Data message - add to receive queue
        let mut msg = MessageBuf::new();
        let _ = msg.extend_from_slice(block);
        let pqm = PullQueueMessage {
            msg,
            sent_time: if rseq > self.retransmit_seq { self.last_receive_sent_time } else { 0.0 },
            // must be time post read()
            receive_time: get_monotonic() - self.calculate_bittime(len),
            notify_id: 0,
        };
        debug_queue_add(&mut self.old_receive, DEBUG_QUEUE_RECEIVE, pqm.clone());

        // Fast readers take the block instead of the receive queue
        let payload = &block[MESSAGE_HEADER_SIZE..len - MESSAGE_TRAILER_SIZE];
        let reader = self
            .fast_readers
            .iter()
            .find(|fr| payload.starts_with(&fr.prefix))
            .map(|fr| (fr.id, fr.func.clone()));
        if reader.is_none() {
            self.post_receive(pqm);
        }
        reader
    }

    // Determine the time the next serial data should be sent
    fn check_send_command(&mut self, pending: usize, eventtime: f64) -> f64 {
        if !self.is_debug_output() {
            if self.send_seq.saturating_sub(self.receive_seq) >= MAX_PENDING_BLOCKS {
                // Need an ack before more messages can be sent
                return PR_NEVER;
            }
            if self.send_seq > self.receive_seq && self.receive_window != 0 {
                let mut need_ack_bytes = self.need_ack_bytes + MESSAGE_MAX;
                if self.last_ack_seq < self.receive_seq {
                    need_ack_bytes += self.last_ack_bytes;
                }
                if need_ack_bytes > self.receive_window {
                    // Wait for ack from past messages before sending next message
                    return PR_NEVER;
                }
            }
        }

        // Check for stalled messages now ready
        let idletime = eventtime.max(self.idle_time) + self.calculate_bittime(pending + MESSAGE_MIN);
        let ack_clock = self.ce.clock_from_time(idletime);
        let background_clock = ack_clock + (MIN_BACKGROUND_DELTA * self.ce.est_freq) as u64;
        let mut min_stalled_clock = MAX_CLOCK;
        let mut min_ready_clock = MAX_CLOCK;
        for &id in self.pending_queues.iter() {
            let Some(Some(cq)) = self.queues.get_mut(id) else {
                continue;
            };
            // Move messages from upcoming queue to ready queue
            while let Some(qm) = cq.upcoming.front() {
                if ack_clock < qm.min_clock {
                    min_stalled_clock = min_stalled_clock.min(qm.min_clock);
                    break;
                }
                let len = qm.len();
                if let Some(qm) = cq.upcoming.pop_front() {
                    cq.ready.push_back(qm);
                }
                self.upcoming_bytes -= len;
                self.ready_bytes += len;
            }
            // Update min_ready_clock
            if let Some(qm) = cq.ready.front() {
                let req_clock = if qm.req_clock == BACKGROUND_PRIORITY_CLOCK {
                    background_clock
                } else {
                    qm.req_clock
                };
                min_ready_clock = min_ready_clock.min(req_clock);
            }
        }

        // Check for messages to send
        if self.ready_bytes >= MESSAGE_PAYLOAD_MAX {
            return PR_NOW;
        }
        if self.ce.est_freq == 0.0 {
            if self.ready_bytes != 0 {
                return PR_NOW;
            }
            self.need_kick_clock = MAX_CLOCK;
            return PR_NEVER;
        }
        let reqclock_delta = (MIN_REQTIME_DELTA * self.ce.est_freq) as u64;
        if min_ready_clock <= ack_clock.saturating_add(reqclock_delta) {
            return PR_NOW;
        }
        let wantclock = (min_ready_clock - reqclock_delta).min(min_stalled_clock);
        self.need_kick_clock = wantclock;
        idletime + wantclock.saturating_sub(ack_clock) as f64 / self.ce.est_freq
    }

    // Build a message block from the ready queues and record it as sent
    fn build_and_send_command(&mut self, timers: &mut ReactorTimers, out: &mut Vec<u8>, eventtime: f64) {
        let pending = out.len();
        let mut buf = MessageBuf::new();
        let _ = buf.extend_from_slice(&[0, 0]);
        while self.ready_bytes > 0 {
            // Find highest priority message (message with lowest req_clock)
            let mut best: Option<(usize, u64)> = None;
            for (pos, &id) in self.pending_queues.iter().enumerate() {
                if let Some(Some(cq)) = self.queues.get(id) {
                    if let Some(qm) = cq.ready.front() {
                        if best.map_or(true, |(_, clock)| qm.req_clock < clock) {
                            best = Some((pos, qm.req_clock));
                        }
                    }
                }
            }
            let Some((pos, _)) = best else {
                break;
            };
            let id = self.pending_queues[pos];
            let Some(Some(cq)) = self.queues.get_mut(id) else {
                break;
            };
            let Some(qm) = cq.ready.front() else {
                break;
            };
            // Append message to outgoing command
            if buf.len() + qm.len() > MESSAGE_MAX - MESSAGE_TRAILER_SIZE {
                break;
            }
            let Some(qm) = cq.ready.pop_front() else {
                break;
            };
            if cq.is_idle() {
                self.pending_queues.remove(pos);
            }
            let _ = buf.extend_from_slice(qm.data());
            self.ready_bytes -= qm.len();
            if qm.notify_id != 0 {
                // Message requires notification - add to notify list
                self.notify_queue.push_back(NotifyEntry { send_seq: self.send_seq, notify_id: qm.notify_id });
            }
        }

        // Fill header / trailer
        let len = buf.len() + MESSAGE_TRAILER_SIZE;
        buf[MESSAGE_POS_LEN] = len as u8;
        buf[MESSAGE_POS_SEQ] = MESSAGE_DEST | (self.send_seq as u8 & MESSAGE_SEQ_MASK);
        let crc = crc16_ccitt(&buf);
        let _ = buf.extend_from_slice(&crc.to_be_bytes());
        let _ = buf.push(MESSAGE_SYNC);

        // Store message block
        let idletime = eventtime.max(self.idle_time) + self.calculate_bittime(pending + len);
        let block = SentBlock { data: buf, sent_time: eventtime, receive_time: idletime };
        out.extend_from_slice(&block.data);
        debug_queue_add(
            &mut self.old_sent,
            DEBUG_QUEUE_SENT,
            PullQueueMessage {
                msg: block.data.clone(),
                sent_time: block.sent_time,
                receive_time: block.receive_time,
                notify_id: 0,
            },
        );
        self.send_seq += 1;
        if self.is_debug_output() {
            // Nothing will ever acknowledge a debug file
            return;
        }
        if self.sent_queue.is_empty() {
            timers.update_timer(SQPT_RETRANSMIT, idletime + self.rto);
        }
        if self.rtt_sample_seq == 0 {
            self.rtt_sample_seq = self.send_seq - 1;
        }
        self.need_ack_bytes += len;
        self.sent_queue.push_back(block);
    }

    // Build all blocks that can be sent now; returns the bytes to write
    // and the next wake time of the command timer
    pub(crate) fn command_event(&mut self, timers: &mut ReactorTimers, eventtime: f64) -> (Vec<u8>, f64) {
        let mut out = Vec::new();
        let waketime = loop {
            let waketime = self.check_send_command(out.len(), eventtime);
            if waketime != PR_NOW {
                break waketime;
            }
            self.build_and_send_command(timers, &mut out, eventtime);
        };
        if !out.is_empty() {
            self.bytes_write = self.bytes_write.wrapping_add(out.len() as u32);
            self.idle_time = eventtime.max(self.idle_time) + self.calculate_bittime(out.len());
        }
        (out, waketime)
    }

    // Resend all unacknowledged blocks; returns the bytes to write and
    // the next wake time of the retransmit timer
    pub(crate) fn retransmit(&mut self, timers: &ReactorTimers, eventtime: f64) -> (Vec<u8>, f64) {
        let mut out = vec![MESSAGE_SYNC];
        let first_len = self.sent_queue.front().map_or(0, |b| b.data.len() + 1);
        for block in self.sent_queue.iter() {
            out.extend_from_slice(&block.data);
        }
        self.bytes_retransmit = self.bytes_retransmit.wrapping_add(out.len() as u32);

        // Update rto
        if timers.get_timer(SQPT_RETRANSMIT) == PR_NOW {
            // Retransmit due to nak
            self.ignore_nak_seq = self.receive_seq;
            if self.receive_seq < self.retransmit_seq {
                // Second nak for this retransmit - don't allow third
                self.ignore_nak_seq = self.retransmit_seq;
            }
        } else {
            // Retransmit due to timeout
            self.rto = (self.rto * 2.0).min(MAX_RTO);
            self.ignore_nak_seq = self.send_seq;
        }
        self.retransmit_seq = self.send_seq;
        self.rtt_sample_seq = 0;
        self.idle_time = eventtime + self.calculate_bittime(out.len());
        let waketime = self.idle_time + self.calculate_bittime(first_len) + self.rto;
        debug!("serialqueue: retransmit {} bytes, rto={:.3}", out.len(), self.rto);
        (out, waketime)
    }
}

struct SqShared {
    state: Mutex<SqState>,
    fast_reader_dispatch_lock: Mutex<()>,
}

// State owned by the background thread
struct SerialIo {
    shared: Arc<SqShared>,
    port: File,
    kind: TransportKind,
    parser: BlockParser,
    input_buf: Vec<u8>,
}

impl SerialIo {
    fn raw_fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    // Write to the port, splitting into can frames when needed
    fn do_write(&mut self, timers: &mut ReactorTimers, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let res = match self.kind {
            TransportKind::Can { client_id } => self.write_can(client_id, buf),
            _ => self.port.write_all(buf),
        };
        match res {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("serialqueue: write would block, {} bytes dropped", buf.len());
            }
            Err(e) => {
                error!("serialqueue write: {}", e);
                timers.do_exit();
            }
        }
    }

    fn write_can(&mut self, client_id: u32, buf: &[u8]) -> io::Result<()> {
        for chunk in buf.chunks(CAN_DATA_MAX) {
            let mut frame = [0u8; CAN_FRAME_SIZE];
            frame[..4].copy_from_slice(&client_id.to_ne_bytes());
            frame[4] = chunk.len() as u8;
            frame[8..8 + chunk.len()].copy_from_slice(chunk);
            self.port.write_all(&frame)?;
        }
        Ok(())
    }

    // Read one chunk of input; Ok(false) when no more data is available
    fn read_input(&mut self) -> io::Result<bool> {
        match self.kind {
            TransportKind::Can { client_id } => {
                let mut frame = [0u8; CAN_FRAME_SIZE];
                let n = self.port.read(&mut frame)?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "can socket closed"));
                }
                let can_id = u32::from_ne_bytes([frame[0], frame[1], frame[2], frame[3]]);
                if can_id == client_id + 1 {
                    let dlc = (frame[4] as usize).min(CAN_DATA_MAX);
                    self.input_buf.extend_from_slice(&frame[8..8 + dlc]);
                }
                Ok(true)
            }
            _ => {
                let mut chunk = [0u8; 4096];
                let n = self.port.read(&mut chunk)?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed"));
                }
                self.input_buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
        }
    }

    // Callback for input activity on the serial fd
    fn input_event(io: &mut SerialIo, timers: &mut ReactorTimers, eventtime: f64) {
        loop {
            match io.read_input() {
                Ok(_) => io.process_input(timers, eventtime),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("serialqueue read: {}", e);
                    timers.do_exit();
                    break;
                }
            }
        }
    }

    fn process_input(&mut self, timers: &mut ReactorTimers, eventtime: f64) {
        loop {
            match self.parser.check(&self.input_buf) {
                BlockCheck::NeedMore => break,
                BlockCheck::Valid(len) => {
                    let block: Vec<u8> = self.input_buf.drain(..len).collect();
                    self.dispatch(timers, eventtime, &block);
                }
                BlockCheck::Skip(len) => {
                    let mut state = self.shared.state.lock();
                    state.bytes_invalid = state.bytes_invalid.wrapping_add(len as u32);
                    drop(state);
                    self.input_buf.drain(..len);
                }
            }
        }
    }

    fn dispatch(&mut self, timers: &mut ReactorTimers, eventtime: f64, block: &[u8]) {
        let reader = self.shared.state.lock().handle_message(timers, eventtime, block);
        if let Some((id, func)) = reader {
            // Invoke callback with the main lock released
            let _dispatch = self.shared.fast_reader_dispatch_lock.lock();
            if self.shared.state.lock().has_fastreader(id) {
                func(block);
            }
        }
    }

    // Callback for the kick waker
    fn kick_event(_io: &mut SerialIo, timers: &mut ReactorTimers, _eventtime: f64) {
        timers.update_timer(SQPT_COMMAND, PR_NOW);
    }

    // Callback timer for when a retransmit should be done
    fn retransmit_event(io: &mut SerialIo, timers: &mut ReactorTimers, eventtime: f64) -> f64 {
        if io.kind == TransportKind::Uart {
            let fd = io.raw_fd();
            // SAFETY: fd is owned by io.port for the life of this call.
            if unsafe { libc::isatty(fd) } == 1 && unsafe { libc::tcflush(fd, libc::TCOFLUSH) } < 0 {
                error!("serialqueue tcflush: {}", io::Error::last_os_error());
            }
        }
        let (buf, waketime) = io.shared.state.lock().retransmit(timers, eventtime);
        io.do_write(timers, &buf);
        waketime
    }

    // Callback timer to send data to the serial port
    fn command_event(io: &mut SerialIo, timers: &mut ReactorTimers, eventtime: f64) -> f64 {
        let (buf, waketime) = io.shared.state.lock().command_event(timers, eventtime);
        io.do_write(timers, &buf);
        waketime
    }

    fn run(mut self, mut reactor: PollReactor<SerialIo>) {
        reactor.run(&mut self);
        // Wake any reader blocked in pull()
        self.shared.state.lock().receive_tx = None;
        info!("serialqueue: background thread exit");
    }
}

/// Queue of commands for one mcu link, serviced by a background thread.
pub struct SerialQueue {
    shared: Arc<SqShared>,
    waker: Arc<Waker>,
    exit_flag: Arc<AtomicBool>,
    receive_rx: Receiver<PullQueueMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    /// Create a serialqueue object and start its background thread
    pub fn new(port: OwnedFd, kind: TransportKind) -> Result<Self, SerialQueueError> {
        let (receive_tx, receive_rx) = channel::unbounded();
        let shared = Arc::new(SqShared {
            state: Mutex::new(SqState::new(kind, receive_tx)),
            fast_reader_dispatch_lock: Mutex::new(()),
        });

        let mut reactor = PollReactor::new(SQPF_NUM, SQPT_NUM)?;
        if kind != TransportKind::DebugFile {
            set_non_blocking(port.as_raw_fd())?;
        }
        reactor.add_fd(SQPF_SERIAL, port.as_raw_fd(), SerialIo::input_event, kind == TransportKind::DebugFile)?;
        let waker = reactor.add_waker(SQPF_PIPE, SerialIo::kick_event)?;
        reactor.add_timer(SQPT_RETRANSMIT, SerialIo::retransmit_event);
        reactor.add_timer(SQPT_COMMAND, SerialIo::command_event);
        let exit_flag = reactor.exit_flag();

        let io = SerialIo {
            shared: shared.clone(),
            port: File::from(port),
            kind,
            parser: BlockParser::new(),
            input_buf: Vec::with_capacity(4096),
        };
        let thread = thread::Builder::new()
            .name("serialqueue".into())
            .spawn(move || io.run(reactor))?;
        debug!("serialqueue: started {:?} transport", kind);
        Ok(Self {
            shared,
            waker,
            exit_flag,
            receive_rx,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn kick(&self) {
        if let Err(e) = self.waker.wake() {
            error!("serialqueue kick: {}", e);
        }
    }

    /// Request that the flush of pending messages and the background thread stop
    pub fn exit(&self) {
        self.exit_flag.store(true, Ordering::Release);
        self.kick();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("serialqueue: background thread panicked");
            }
        }
    }

    /// True once the background thread has stopped.
    pub fn is_exited(&self) -> bool {
        self.thread.lock().as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn alloc_commandqueue(&self) -> CommandQueue {
        self.shared.state.lock().alloc_commandqueue()
    }

    pub fn free_commandqueue(&self, cq: &CommandQueue) {
        self.shared.state.lock().free_commandqueue(cq);
    }

    /// Add a batch of messages to the given command_queue. Fails with
    /// `Disconnected` once the background thread has stopped.
    pub fn send_batch(&self, cq: &CommandQueue, msgs: Vec<QueueMessage>) -> Result<(), SerialQueueError> {
        if self.is_exited() {
            return Err(SerialQueueError::Disconnected);
        }
        let must_wake = self.shared.state.lock().enqueue(cq, msgs);
        if must_wake {
            self.kick();
        }
        Ok(())
    }

    /// Schedule a single message on the given command queue
    pub fn send_one(&self, cq: &CommandQueue, msg: QueueMessage) -> Result<(), SerialQueueError> {
        self.send_batch(cq, vec![msg])
    }

    /// Schedule the transmission of raw command bytes
    pub fn send(
        &self,
        cq: &CommandQueue,
        data: &[u8],
        min_clock: u64,
        req_clock: u64,
        notify_id: u64,
    ) -> Result<(), SerialQueueError> {
        let mut qm = QueueMessage::fill(data)?;
        qm.min_clock = min_clock;
        qm.req_clock = req_clock;
        qm.notify_id = notify_id;
        self.send_one(cq, qm)
    }

    /// Return a message read from the serial port (or None once the
    /// background thread has exited)
    pub fn pull(&self) -> Option<PullQueueMessage> {
        self.receive_rx.recv().ok()
    }

    /// Register a callback run on the background thread for every
    /// received block whose payload starts with `prefix`.
    pub fn add_fastreader(&self, prefix: &[u8], func: FastReaderFn) -> Result<FastReaderId, SerialQueueError> {
        Ok(self.shared.state.lock().add_fastreader(prefix, func)?)
    }

    /// Remove a fast reader; waits for an in-flight callback to finish
    pub fn rm_fastreader(&self, id: FastReaderId) {
        let _dispatch = self.shared.fast_reader_dispatch_lock.lock();
        self.shared.state.lock().rm_fastreader(id);
    }

    /// Set the baud rate (or can bit rate) used for transmit time estimates
    pub fn set_wire_frequency(&self, frequency: f64) {
        self.shared.state.lock().set_wire_frequency(frequency);
    }

    /// Set the number of bytes the mcu can buffer before acking
    pub fn set_receive_window(&self, receive_window: usize) {
        self.shared.state.lock().receive_window = receive_window;
    }

    /// Set the estimated clock rate of the mcu on the other end of the
    /// serial port
    pub fn set_clock_est(&self, est_freq: f64, conv_time: f64, conv_clock: u64, last_clock: u64) {
        self.shared.state.lock().ce = ClockEstimate::new(est_freq, conv_time, conv_clock, last_clock);
    }

    pub fn get_clock_est(&self) -> ClockEstimate {
        self.shared.state.lock().ce
    }

    pub fn stats(&self) -> SerialQueueStats {
        self.shared.state.lock().stats()
    }

    /// Return a string buffer containing statistics for the serial port
    pub fn get_stats(&self) -> String {
        self.stats().to_string()
    }

    /// Extract old sent or received blocks, oldest first
    pub fn extract_old(&self, sentq: bool, max: usize) -> Vec<PullQueueMessage> {
        let state = self.shared.state.lock();
        let queue = if sentq { &state.old_sent } else { &state.old_receive };
        let skip = queue.len().saturating_sub(max);
        queue.iter().skip(skip).cloned().collect()
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.exit();
    }
}
