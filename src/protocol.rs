//! Payload encodings for the cooling loop frames.
//!
//! | Frame        | Bytes | Layout                                   |
//! |--------------|-------|------------------------------------------|
//! | temperature  | 2     | u16 big-endian, 0.1 °C per count          |
//! | level        | 1     | 0 = low, nonzero = ok                     |
//! | ignition     | 1     | 0 = off, nonzero = on                     |
//! | pump command | 1     | 0 = off, 1 = on                           |
//! | fan command  | 2     | [0 = off / 1 = on, speed 0..=100 percent] |
//!
//! Decoders ignore trailing bytes and return `None` for short payloads.

use serde::{Deserialize, Serialize};

pub const TEMPERATURE_LEN: usize = 2;
pub const FLAG_LEN: usize = 1;
pub const PUMP_COMMAND_LEN: usize = 1;
pub const FAN_COMMAND_LEN: usize = 2;

pub const MAX_FAN_SPEED: u8 = 100;

const TEMPERATURE_SCALE: f64 = 10.0;

/// Encode °C as 0.1 °C counts, saturating at the u16 range.
pub fn encode_temperature(celsius: f64) -> [u8; TEMPERATURE_LEN] {
    let counts = (celsius * TEMPERATURE_SCALE)
        .round()
        .clamp(0.0, f64::from(u16::MAX)) as u16;
    counts.to_be_bytes()
}

pub fn decode_temperature(payload: &[u8]) -> Option<f64> {
    match payload {
        [hi, lo, ..] => Some(f64::from(u16::from_be_bytes([*hi, *lo])) / TEMPERATURE_SCALE),
        _ => None,
    }
}

pub fn encode_flag(value: bool) -> [u8; FLAG_LEN] {
    [u8::from(value)]
}

pub fn decode_flag(payload: &[u8]) -> Option<bool> {
    payload.first().map(|b| *b != 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanCommand {
    pub on: bool,
    pub speed: u8,
}

impl FanCommand {
    pub fn encode(&self) -> [u8; FAN_COMMAND_LEN] {
        [u8::from(self.on), self.speed.min(MAX_FAN_SPEED)]
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        match payload {
            [on, speed, ..] => Some(Self {
                on: *on != 0,
                speed: (*speed).min(MAX_FAN_SPEED),
            }),
            _ => None,
        }
    }
}

pub fn encode_pump_command(on: bool) -> [u8; PUMP_COMMAND_LEN] {
    encode_flag(on)
}

pub fn decode_pump_command(payload: &[u8]) -> Option<bool> {
    decode_flag(payload)
}
