use std::io;
use std::time::Duration;

use crc::{CRC_8_SMBUS, Crc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::port::Transport;
use crate::proto::message::Message;

/// Hex digits of the trailing checksum.
pub const CHECKSUM_WIDTH: usize = 2;
/// Shortest line that can hold a checksum and at least one message byte.
pub const MIN_FRAME_LEN: usize = CHECKSUM_WIDTH + 1;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Link-layer failure. Callers retry on any variant alike; the variant is
/// kept for logging.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("corrupted frame or timeout expired: {line:?}")]
    CorruptedFrame { line: String },
    #[error("invalid crc {got:?} (computed {computed}): {line:?}")]
    Integrity {
        got: String,
        computed: String,
        line: String,
    },
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("link i/o: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Empty receive: nothing arrived before the deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::CorruptedFrame { line } if line.is_empty())
    }
}

pub fn crc8_hex(bytes: &[u8]) -> String {
    format!("{:02x}", CRC8.checksum(bytes))
}

/// Serialize a message to one wire line (no terminator).
pub fn encode_frame(msg: &Message) -> Result<String, LinkError> {
    let body = serde_json::to_string(msg).map_err(LinkError::Malformed)?;
    let sum = crc8_hex(body.as_bytes());
    Ok(format!("{body}{sum}"))
}

/// Validate and decode one wire line. Never returns a partially trusted
/// message: length, checksum and structure must all pass.
pub fn decode_frame(line: &str) -> Result<Message, LinkError> {
    if line.len() < MIN_FRAME_LEN {
        return Err(LinkError::CorruptedFrame {
            line: line.to_string(),
        });
    }
    let split = line.len() - CHECKSUM_WIDTH;
    if !line.is_char_boundary(split) {
        return Err(LinkError::Integrity {
            got: String::from_utf8_lossy(&line.as_bytes()[split..]).into_owned(),
            computed: crc8_hex(&line.as_bytes()[..split]),
            line: line.to_string(),
        });
    }
    let (body, got) = line.split_at(split);
    let computed = crc8_hex(body.as_bytes());
    if got != computed {
        return Err(LinkError::Integrity {
            got: got.to_string(),
            computed,
            line: line.to_string(),
        });
    }
    serde_json::from_str(body).map_err(LinkError::Malformed)
}

/// Reliable-delivery wrapper: framed, checksummed messages over a
/// [`Transport`]. Detection only; resending is the caller's decision.
pub struct Rdt<T> {
    udt: T,
}

impl<T: Transport> Rdt<T> {
    pub fn new(udt: T) -> Self {
        Self { udt }
    }

    pub fn send(&mut self, msg: &Message) -> Result<(), LinkError> {
        let line = encode_frame(msg)?;
        self.udt.send(&line)?;
        debug!(code = %msg.code(), "sent");
        Ok(())
    }

    /// Receive one message with the channel-relative arrival time.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<(Message, Duration), LinkError> {
        let (line, at) = self.udt.receive(timeout)?;
        match decode_frame(&line) {
            Ok(msg) => {
                debug!(code = %msg.code(), at = at.as_secs_f64(), "received");
                Ok((msg, at))
            }
            Err(e) => {
                warn!("{e}");
                Err(e)
            }
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.udt
    }
}
