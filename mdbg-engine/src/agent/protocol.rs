// Agent protocol definitions and packet handling
//
// The in-target debug agent speaks a framed request/reply protocol over TCP.
// All multi-byte header and payload integers are big-endian; raw primitive
// values keep the target's little-endian layout.
//
// Header, 11 bytes:
//   length u32 (header included) | id u32 | flags u8
//   flags 0x00: command set u8 | command u8
//   flags 0x80: error code u16

use crate::error::{NativeError, NativeResult};
use bytes::{Buf, BufMut, BytesMut};

pub const HANDSHAKE: &[u8] = b"MDBG-Handshake";

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;
const COMMAND_FLAG: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command { command_set: u8, command: u8 },
    Reply { error_code: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: usize,
    pub id: u32,
    pub kind: PacketKind,
}

impl Header {
    pub fn parse(mut buf: &[u8]) -> NativeResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(NativeError::Protocol(format!("Short packet header: {} bytes", buf.len())));
        }
        let length = buf.get_u32() as usize;
        let id = buf.get_u32();
        let kind = match buf.get_u8() {
            COMMAND_FLAG => PacketKind::Command {
                command_set: buf.get_u8(),
                command: buf.get_u8(),
            },
            REPLY_FLAG => PacketKind::Reply {
                error_code: buf.get_u16(),
            },
            flags => {
                return Err(NativeError::Protocol(format!("Invalid packet flags: {:#x}", flags)))
            }
        };
        if length < HEADER_SIZE {
            return Err(NativeError::Protocol(format!("Invalid packet length: {}", length)));
        }
        Ok(Self { length, id, kind })
    }

    pub fn payload_len(&self) -> usize {
        self.length - HEADER_SIZE
    }
}

/// A request to the agent. Arguments are appended to `data` in order.
#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(COMMAND_FLAG);
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);
        buf.to_vec()
    }
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl ReplyPacket {
    /// The payload, or the agent's error.
    pub fn into_result(self) -> NativeResult<Vec<u8>> {
        match self.error_code {
            0 => Ok(self.data),
            code => Err(NativeError::AgentErrorCode(code, error_name(code).to_string())),
        }
    }
}

pub fn error_name(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        10 => "INVALID_THREAD",
        13 => "THREAD_NOT_SUSPENDED",
        20 => "INVALID_OBJECT",
        21 => "INVALID_TYPE",
        23 => "INVALID_METHOD",
        24 => "INVALID_OFFSET",
        25 => "INVALID_FIELD",
        30 => "INVALID_FRAME",
        31 => "NO_MORE_FRAMES",
        41 => "NOT_FOUND",
        60 => "INVALID_BREAKPOINT",
        61 => "STEP_IN_PROGRESS",
        70 => "EVAL_IN_PROGRESS",
        71 => "FUNC_EVAL_BAD_START_POINT",
        72 => "EVAL_ABORTED",
        99 => "NOT_IMPLEMENTED",
        100 => "NULL_REFERENCE",
        101 => "ABSENT_INFORMATION",
        103 => "ILLEGAL_ARGUMENT",
        110 => "OUT_OF_MEMORY",
        112 => "PROCESS_EXITED",
        113 => "INTERNAL",
        500 => "NOT_STOPPED",
        503 => "INVALID_TAG",
        _ => "UNKNOWN_ERROR",
    }
}
