//! Reducer wire framing.
//!
//! Every frame on a reducer connection is a fixed header followed by a
//! MessagePack payload.
//!
//! Header Format: !BBHQI (16 bytes, Network Byte Order / Big Endian)
//! ```text
//! [VER:1][OP:1][RES:2][JOB_ID:8][LEN:4]
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::codec;
use crate::error::{ProtocolError, Result};
use crate::job_config::AggregationConfig;
use crate::task::ReducerAddress;
use crate::types::JobId;

pub const PROTOCOL_VERSION: u8 = 0x01;

pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single reducer payload.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Reducer -> Scheduler: "I listen for task output at this address."
    Register = 1,

    // Scheduler -> Reducer: "Aggregate for this job with this config."
    AggregationConfig = 2,

    // Scheduler -> Reducer: "All tasks of the job succeeded."
    JobSucceeded = 3,

    // Scheduler -> Reducer: "The job failed; discard partial state."
    JobFailed = 4,

    // Reducer -> Scheduler: final status of the reduction.
    Done = 5,

    Ack = 6,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Register),
            2 => Ok(OpCode::AggregationConfig),
            3 => Ok(OpCode::JobSucceeded),
            4 => Ok(OpCode::JobFailed),
            5 => Ok(OpCode::Done),
            6 => Ok(OpCode::Ack),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub job_id: JobId,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, job_id: JobId, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            job_id,
            payload_len,
        }
    }

    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u64::<BigEndian>(self.job_id.to_u64()?)?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let job_id = JobId::from_u64(cursor.read_u64::<BigEndian>()?)?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            version,
            opcode: OpCode::from_u8(op_raw)?,
            reserved,
            job_id,
            payload_len,
        })
    }
}

/// One reducer frame.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: OpCode, job_id: JobId, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, job_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Build a frame whose payload is `body` encoded as MessagePack.
    pub fn encode<T: Serialize>(opcode: OpCode, job_id: JobId, body: &T) -> Result<Self> {
        Self::new(opcode, job_id, codec::encode(body)?)
    }

    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.payload)
    }

    pub fn from_parts(header: Header, payload: Vec<u8>) -> Result<Self> {
        if payload.len() != header.payload_len as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected: header.payload_len as usize,
                got: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }

    /// Header followed by payload, ready for a byte stream.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.pack()?);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn job_id(&self) -> JobId {
        self.header.job_id
    }
}

// ============================================================================
// Payload bodies
// ============================================================================

/// Sent by a reducer right after it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBody {
    pub address: ReducerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfigBody {
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub max_num_results: u32,
}

/// Reducer's verdict on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneBody {
    pub succeeded: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}
