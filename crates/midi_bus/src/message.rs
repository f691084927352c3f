//! MIDI 1.0 byte-level helpers shared by the transports and the bus: status classification, message
//! lengths, and construction of the 2–3 byte messages the bus sends.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// Opens a System Exclusive run.
pub const SYSEX_START: u8 = 0xF0;
/// Closes a System Exclusive run.
pub const SYSEX_END: u8 = 0xF7;

/// The high nibble of a status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusClass {
    /// `0x8n`
    NoteOff = 0x8,
    /// `0x9n`
    NoteOn = 0x9,
    /// `0xAn`, polyphonic key pressure
    PolyPressure = 0xA,
    /// `0xBn`
    ControlChange = 0xB,
    /// `0xCn`
    ProgramChange = 0xC,
    /// `0xDn`
    ChannelPressure = 0xD,
    /// `0xEn`
    PitchBend = 0xE,
    /// `0xF0`–`0xFF`: System Exclusive, System Common and System Real-Time
    System = 0xF,
}

impl StatusClass {
    /// Classifies a status byte; returns `None` for data bytes.
    pub fn of(byte: u8) -> Option<Self> {
        if is_status(byte) {
            Self::from_u8(byte >> 4)
        } else {
            None
        }
    }

    /// Returns `true` for the channel-voice classes, i.e. everything but [`StatusClass::System`].
    pub fn is_channel_voice(&self) -> bool {
        *self != Self::System
    }
}

/// Returns `true` if the high bit is set.
pub fn is_status(byte: u8) -> bool {
    byte & 0x80 != 0
}

/// Returns `true` for the eight System Real-Time status bytes (`0xF8`–`0xFF`).
pub fn is_realtime(byte: u8) -> bool {
    byte >= 0xF8
}

/// Total length, status byte included, of the message a status byte opens; `None` for System
/// Exclusive (whose length is unbounded) and for data bytes.
pub fn message_len(status: u8) -> Option<usize> {
    match StatusClass::of(status)? {
        StatusClass::ProgramChange | StatusClass::ChannelPressure => Some(2),
        StatusClass::System => match status {
            SYSEX_START => None,
            // MTC quarter frame, song select
            0xF1 | 0xF3 => Some(2),
            // song position pointer
            0xF2 => Some(3),
            // tune request, end of exclusive, undefined, real-time
            _ => Some(1),
        },
        _ => Some(3),
    }
}

/// Returns the leading 2–3 byte channel-voice message in `bytes`, trimming any trailing padding.
/// Returns `None` if `bytes` does not start with a channel-voice status byte or is too short.
pub fn canonicalize(bytes: &[u8]) -> Option<&[u8]> {
    let status = *bytes.first()?;
    if !StatusClass::of(status)?.is_channel_voice() {
        return None;
    }
    let len = message_len(status)?;
    let message = bytes.get(..len)?;
    message[1..]
        .iter()
        .all(|&b| !is_status(b))
        .then_some(message)
}

/// A short MIDI message built by the bus for outbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    bytes: [u8; 3],
    len: u8,
}

impl Message {
    fn channel_voice(class: StatusClass, channel: u8, data: &[u8]) -> Self {
        // channel numbers are 1-based, the status nibble is not
        let nibble = channel.clamp(1, 16) - 1;
        let mut bytes = [class.to_u8().unwrap_or_default() << 4 | nibble, 0, 0];
        for (slot, &byte) in bytes[1..].iter_mut().zip(data) {
            *slot = byte & 0x7F;
        }
        Self {
            bytes,
            len: 1 + data.len().min(2) as u8,
        }
    }

    /// NoteOn on channel 1..=16.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_voice(StatusClass::NoteOn, channel, &[note, velocity])
    }

    /// NoteOff on channel 1..=16.
    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_voice(StatusClass::NoteOff, channel, &[note, velocity])
    }

    /// Control Change on channel 1..=16.
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::channel_voice(StatusClass::ControlChange, channel, &[controller, value])
    }

    /// Program Change on channel 1..=16.
    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::channel_voice(StatusClass::ProgramChange, channel, &[program])
    }

    /// Channel Pressure on channel 1..=16.
    pub fn channel_pressure(channel: u8, pressure: u8) -> Self {
        Self::channel_voice(StatusClass::ChannelPressure, channel, &[pressure])
    }

    /// Pitch Bend on channel 1..=16; `value` is 14 bits, centre 8192.
    pub fn pitch_bend(channel: u8, value: u16) -> Self {
        let value = value.min(0x3FFF);
        Self::channel_voice(
            StatusClass::PitchBend,
            channel,
            &[(value & 0x7F) as u8, (value >> 7) as u8],
        )
    }

    /// The encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

/// Combines the two data bytes of a Pitch Bend message, least significant first, into a 14-bit
/// value.
pub fn pitch_bend_value(lsb: u8, msb: u8) -> u16 {
    u16::from(lsb & 0x7F) | u16::from(msb & 0x7F) << 7
}
