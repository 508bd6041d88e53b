//! Payload decoding for the light sensor topic.
//!
//! The sensor publishes a bare base-10 integer as UTF-8 text. There is no
//! envelope and no schema version, so the whole payload has to be a valid
//! integer literal or the message is rejected.

use std::fmt;

/// One decoded light level, tagged with its arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorReading {
    value: i32,
    sequence: u64,
}

impl SensorReading {
    pub fn new(value: i32, sequence: u64) -> Self {
        Self { value, sequence }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    /// Position in broker delivery order, counted from the first message the
    /// monitor ever received.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a valid integer literal")]
    InvalidFormat,
}

/// Decodes a raw payload into a [`SensorReading`].
///
/// Accepts an optional sign followed by decimal digits and nothing else.
/// Empty payloads, surrounding whitespace, non-UTF-8 bytes and values outside
/// the `i32` range all yield [`DecodeError::InvalidFormat`].
pub fn decode(payload: &[u8], sequence: u64) -> Result<SensorReading, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidFormat)?;
    let value = text
        .parse::<i32>()
        .map_err(|_| DecodeError::InvalidFormat)?;
    Ok(SensorReading::new(value, sequence))
}
