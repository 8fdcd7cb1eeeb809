// src/msgblock.rs
// Message block framing: crc, vlq integers, sync recovery and clock conversion.

use heapless::Vec as FixedVec;
use thiserror::Error;

pub const MESSAGE_MIN: usize = 5;
pub const MESSAGE_MAX: usize = 64;
pub const MESSAGE_HEADER_SIZE: usize = 2;
pub const MESSAGE_TRAILER_SIZE: usize = 3;
pub const MESSAGE_POS_LEN: usize = 0;
pub const MESSAGE_POS_SEQ: usize = 1;
pub const MESSAGE_TRAILER_CRC: usize = 3;
pub const MESSAGE_TRAILER_SYNC: usize = 1;
pub const MESSAGE_PAYLOAD_MAX: usize = MESSAGE_MAX - MESSAGE_MIN;
pub const MESSAGE_SEQ_MASK: u8 = 0x0f;
pub const MESSAGE_DEST: u8 = 0x10;
pub const MESSAGE_SYNC: u8 = 0x7e;

/// Largest clock value; used as "no deadline".
pub const MAX_CLOCK: u64 = 0x7fff_ffff_ffff_ffff;
/// `req_clock` marker for messages that should go out when the link is idle.
pub const BACKGROUND_PRIORITY_CLOCK: u64 = 0x7fff_ffff_0000_0000;

/// Fixed capacity byte buffer holding one block or one command.
pub type MessageBuf = FixedVec<u8, MESSAGE_MAX>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MsgBlockError {
    #[error("encoded message exceeds {MESSAGE_PAYLOAD_MAX} bytes")]
    PayloadTooLarge,
    #[error("message block exceeds {MESSAGE_MAX} bytes")]
    BlockTooLarge,
    #[error("truncated vlq data in message block")]
    Truncated,
}

/// Implement the standard crc "ccitt" algorithm on the given buffer
pub fn crc16_ccitt(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in buf {
        let mut data = byte ^ (crc & 0xff) as u8;
        data ^= data << 4;
        crc = (((data as u16) << 8) | (crc >> 8)) ^ (data >> 4) as u16 ^ ((data as u16) << 3);
    }
    crc
}

/// Outcome of inspecting the start of an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCheck {
    /// Not enough bytes buffered yet.
    NeedMore,
    /// A valid block of the given length starts the buffer.
    Valid(usize),
    /// The given number of leading bytes are garbage and must be dropped.
    Skip(usize),
}

/// Incremental block validator; remembers whether a resync is pending.
#[derive(Debug, Default, Clone)]
pub struct BlockParser {
    need_sync: bool,
}

impl BlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn need_sync(&self) -> bool {
        self.need_sync
    }

    /// Verify a buffer starts with a valid mcu message
    pub fn check(&mut self, buf: &[u8]) -> BlockCheck {
        if buf.len() < MESSAGE_MIN {
            return BlockCheck::NeedMore;
        }
        if !self.need_sync {
            let msglen = buf[MESSAGE_POS_LEN] as usize;
            let seq_ok = buf[MESSAGE_POS_SEQ] & !MESSAGE_SEQ_MASK == MESSAGE_DEST;
            if (MESSAGE_MIN..=MESSAGE_MAX).contains(&msglen) && seq_ok {
                if buf.len() < msglen {
                    return BlockCheck::NeedMore;
                }
                if buf[msglen - MESSAGE_TRAILER_SYNC] == MESSAGE_SYNC {
                    let crc_pos = msglen - MESSAGE_TRAILER_CRC;
                    let msgcrc = u16::from_be_bytes([buf[crc_pos], buf[crc_pos + 1]]);
                    if crc16_ccitt(&buf[..msglen - MESSAGE_TRAILER_SIZE]) == msgcrc {
                        return BlockCheck::Valid(msglen);
                    }
                }
            }
        }
        // Discard bytes until next SYNC found
        match buf.iter().position(|&b| b == MESSAGE_SYNC) {
            Some(pos) => {
                self.need_sync = false;
                BlockCheck::Skip(pos + 1)
            }
            None => {
                self.need_sync = true;
                BlockCheck::Skip(buf.len())
            }
        }
    }
}

/// Encode an integer as a variable length quantity (vlq)
pub fn encode_int(out: &mut MessageBuf, v: u32) -> Result<(), MsgBlockError> {
    let sv = v as i32;
    let groups = if (-(1 << 5)..(3 << 5)).contains(&sv) {
        1
    } else if (-(1 << 12)..(3 << 12)).contains(&sv) {
        2
    } else if (-(1 << 19)..(3 << 19)).contains(&sv) {
        3
    } else if (-(1 << 26)..(3 << 26)).contains(&sv) {
        4
    } else {
        5
    };
    for i in (0..groups).rev() {
        let mut byte = ((v >> (7 * i)) & 0x7f) as u8;
        if i > 0 {
            byte |= 0x80;
        }
        out.push(byte).map_err(|_| MsgBlockError::PayloadTooLarge)?;
    }
    Ok(())
}

/// Parse an integer that was encoded as a "variable length quantity"
pub fn parse_int(data: &[u8], pos: &mut usize) -> Result<u32, MsgBlockError> {
    let mut next = || -> Result<u8, MsgBlockError> {
        let c = *data.get(*pos).ok_or(MsgBlockError::Truncated)?;
        *pos += 1;
        Ok(c)
    };
    let mut c = next()?;
    let mut v = (c & 0x7f) as u32;
    if c & 0x60 == 0x60 {
        v |= (-0x20i32) as u32;
    }
    while c & 0x80 != 0 {
        c = next()?;
        v = (v << 7) | (c & 0x7f) as u32;
    }
    Ok(v)
}

/// Parse the first `count` vlq integers of a complete message block.
pub fn decode(block: &[u8], count: usize) -> Result<Vec<u32>, MsgBlockError> {
    if block.len() < MESSAGE_MIN {
        return Err(MsgBlockError::Truncated);
    }
    let payload = &block[MESSAGE_HEADER_SIZE..block.len() - MESSAGE_TRAILER_SIZE];
    let mut pos = 0;
    (0..count).map(|_| parse_int(payload, &mut pos)).collect()
}

/// Wrap a payload into a framed block carrying the low bits of `seq`.
pub fn encode_block(seq: u64, payload: &[u8]) -> Result<MessageBuf, MsgBlockError> {
    let len = payload.len() + MESSAGE_MIN;
    if len > MESSAGE_MAX {
        return Err(MsgBlockError::BlockTooLarge);
    }
    let mut out = MessageBuf::new();
    let seq = MESSAGE_DEST | (seq as u8 & MESSAGE_SEQ_MASK);
    let _ = out.push(len as u8);
    let _ = out.push(seq);
    let _ = out.extend_from_slice(payload);
    let crc = crc16_ccitt(&out);
    let _ = out.extend_from_slice(&crc.to_be_bytes());
    let _ = out.push(MESSAGE_SYNC);
    Ok(out)
}

/// A command waiting for transmission.
///
/// `min_clock` is the earliest clock the command may be sent at and
/// `req_clock` its transmit priority (lower goes first). Between the
/// step compressor and steppersync a nonzero `min_clock` instead marks a
/// command that occupies an mcu move queue slot until that clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessage {
    msg: MessageBuf,
    pub min_clock: u64,
    pub req_clock: u64,
    pub notify_id: u64,
}

impl QueueMessage {
    /// Allocate a queue_message and fill it with the specified data
    pub fn fill(data: &[u8]) -> Result<Self, MsgBlockError> {
        if data.len() > MESSAGE_PAYLOAD_MAX {
            return Err(MsgBlockError::PayloadTooLarge);
        }
        let mut msg = MessageBuf::new();
        let _ = msg.extend_from_slice(data);
        Ok(Self { msg, ..Self::default() })
    }

    /// Allocate a queue_message and fill it with a series of encoded vlq integers
    pub fn encode(data: &[u32]) -> Result<Self, MsgBlockError> {
        let mut msg = MessageBuf::new();
        for &v in data {
            encode_int(&mut msg, v)?;
        }
        if msg.len() > MESSAGE_PAYLOAD_MAX {
            return Err(MsgBlockError::PayloadTooLarge);
        }
        Ok(Self { msg, ..Self::default() })
    }

    pub fn data(&self) -> &[u8] {
        &self.msg
    }

    pub fn len(&self) -> usize {
        self.msg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msg.is_empty()
    }
}

/// A block (or notification) handed back to the reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullQueueMessage {
    pub msg: MessageBuf,
    pub sent_time: f64,
    pub receive_time: f64,
    pub notify_id: u64,
}

/// Linear mapping between host time and the mcu clock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockEstimate {
    pub last_clock: u64,
    pub conv_clock: u64,
    pub conv_time: f64,
    pub est_freq: f64,
}

impl ClockEstimate {
    pub fn new(est_freq: f64, conv_time: f64, conv_clock: u64, last_clock: u64) -> Self {
        Self { last_clock, conv_clock, conv_time, est_freq }
    }

    /// Convert a time to the corresponding mcu clock
    pub fn clock_from_time(&self, time: f64) -> u64 {
        let rel = ((time - self.conv_time) * self.est_freq + 0.5) as i64;
        (rel as u64).wrapping_add(self.conv_clock)
    }

    /// Convert an mcu clock back to host time
    pub fn clock_to_time(&self, clock: u64) -> f64 {
        let rel = clock.wrapping_sub(self.conv_clock) as i64;
        rel as f64 / self.est_freq + self.conv_time
    }

    /// Extend a 32bit clock reported by the mcu to the full 64bit clock
    pub fn clock_from_clock32(&self, clock32: u32) -> u64 {
        let delta = clock32.wrapping_sub(self.last_clock as u32) as i32;
        self.last_clock.wrapping_add(delta as i64 as u64)
    }
}
