//! Reassembles MIDI 1.0 messages from a raw byte stream.

use crate::message::{SYSEX_END, SYSEX_START, StatusClass, is_realtime, is_status, message_len};
use crate::ring::RawFrame;

/// Byte-at-a-time MIDI 1.0 message reassembly with running status.
///
/// - Real-time bytes are returned immediately as one-byte messages and leave any partially
///   assembled message alone.
/// - System Exclusive is swallowed up to its end byte; any other status byte inside it aborts the
///   run and starts a new message.
/// - Channel-voice status bytes are remembered, so data bytes arriving without a status byte are
///   interpreted with the last one seen. System Common messages cancel running status.
/// - A message is returned as soon as its last byte arrives.
#[derive(Debug, Clone, Default)]
pub struct MidiParser {
    running_status: Option<u8>,
    buf: [u8; 3],
    len: usize,
    expected: usize,
    in_sysex: bool,
}

impl MidiParser {
    /// Construct a new `MidiParser`.
    pub const fn new() -> Self {
        Self {
            running_status: None,
            buf: [0; 3],
            len: 0,
            expected: 0,
            in_sysex: false,
        }
    }

    /// Forgets any partial message and the running status.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feeds one byte, returning a message if this byte completed one.
    pub fn push(&mut self, byte: u8) -> Option<RawFrame> {
        if is_realtime(byte) {
            return RawFrame::new(&[byte]);
        }

        if is_status(byte) {
            return self.start(byte);
        }

        if self.in_sysex {
            return None;
        }
        if self.len == 0 {
            // no status byte yet: fall back on running status, if any
            let status = self.running_status?;
            self.begin(status);
        }
        self.buf[self.len] = byte;
        self.len += 1;
        if self.len == self.expected {
            self.len = 0;
            return RawFrame::new(&self.buf[..self.expected]);
        }
        None
    }

    fn start(&mut self, status: u8) -> Option<RawFrame> {
        if self.in_sysex {
            self.in_sysex = false;
            if status != SYSEX_END {
                trace!("System Exclusive aborted by status {}", status);
            }
        }
        self.len = 0;

        match status {
            // an end byte with no run to close
            SYSEX_END => {
                self.running_status = None;
                None
            }
            SYSEX_START => {
                self.in_sysex = true;
                self.running_status = None;
                None
            }
            _ => {
                let is_channel_voice = StatusClass::of(status)
                    .is_some_and(|class| class.is_channel_voice());
                self.running_status = is_channel_voice.then_some(status);
                match message_len(status)? {
                    1 => RawFrame::new(&[status]),
                    _ => {
                        self.begin(status);
                        None
                    }
                }
            }
        }
    }

    fn begin(&mut self, status: u8) {
        self.buf[0] = status;
        self.len = 1;
        self.expected = message_len(status).unwrap_or(1);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    fn parse(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut parser = MidiParser::new();
        bytes
            .iter()
            .filter_map(|&b| parser.push(b))
            .map(|frame| frame.as_bytes().to_vec())
            .collect()
    }

    #[test]
    fn complete_messages() {
        assert_eq!(
            std::vec![
                std::vec![0x90, 0x3C, 0x64],
                std::vec![0xC1, 0x05],
                std::vec![0xE0, 0x00, 0x40],
            ],
            parse(&[0x90, 0x3C, 0x64, 0xC1, 0x05, 0xE0, 0x00, 0x40])
        );
    }

    #[test]
    fn running_status_is_expanded() {
        let bytes = [
            0x90, 0x3C, 0x64, 0x40, 0x64, 0x43, 0x64, 0x3C, 0x00, 0xD0, 0x10, 0x20,
        ];
        assert_eq!(
            std::vec![
                std::vec![0x90, 0x3C, 0x64],
                std::vec![0x90, 0x40, 0x64],
                std::vec![0x90, 0x43, 0x64],
                std::vec![0x90, 0x3C, 0x00],
                std::vec![0xD0, 0x10],
                std::vec![0xD0, 0x20],
            ],
            parse(&bytes),
            "Expected left but got right"
        );
    }

    #[test]
    fn realtime_does_not_disturb_assembly() {
        assert_eq!(
            std::vec![
                std::vec![0xF8],
                std::vec![0xFA],
                std::vec![0x90, 0x3C, 0x64],
                std::vec![0xF8],
                std::vec![0x90, 0x3E, 0x64],
            ],
            parse(&[0xF8, 0x90, 0xFA, 0x3C, 0x64, 0x3E, 0xF8, 0x64])
        );
    }

    #[test]
    fn sysex_is_suppressed() {
        let bytes = [0xF0, 0x7E, 0x7F, 0xF8, 0x06, 0x01, 0xF7, 0x80, 0x3C, 0x00];
        assert_eq!(
            std::vec![std::vec![0xF8], std::vec![0x80, 0x3C, 0x00]],
            parse(&bytes)
        );
    }

    #[test]
    fn sysex_does_not_inherit_running_status() {
        // data bytes after the end of a SysEx run have no status to borrow
        assert_eq!(
            std::vec![std::vec![0x90, 0x3C, 0x64]],
            parse(&[0x90, 0x3C, 0x64, 0xF0, 0x01, 0xF7, 0x3E, 0x64])
        );
    }

    #[test]
    fn stray_sysex_end_cancels_running_status() {
        assert_eq!(
            std::vec![std::vec![0x90, 0x3C, 0x64]],
            parse(&[0x90, 0x3C, 0x64, 0xF7, 0x3E, 0x64]),
            "Expected left but got right"
        );
    }

    #[test]
    fn status_inside_sysex_aborts_it() {
        assert_eq!(
            std::vec![std::vec![0x90, 0x3C, 0x64], std::vec![0x90, 0x3E, 0x64]],
            parse(&[0xF0, 0x43, 0x12, 0x90, 0x3C, 0x64, 0x3E, 0x64])
        );
    }

    #[test]
    fn system_common_cancels_running_status() {
        let bytes = [
            0xB0, 0x07, 0x64, 0xF2, 0x10, 0x20, 0x07, 0x50, 0xF6, 0xF3, 0x02,
        ];
        assert_eq!(
            std::vec![
                std::vec![0xB0, 0x07, 0x64],
                std::vec![0xF2, 0x10, 0x20],
                std::vec![0xF6],
                std::vec![0xF3, 0x02],
            ],
            parse(&bytes)
        );
    }

    #[test]
    fn stray_data_is_ignored() {
        assert!(parse(&[0x3C, 0x64, 0x00]).is_empty());
    }

    #[test]
    fn new_status_discards_partial_message() {
        assert_eq!(
            std::vec![std::vec![0xB0, 0x40, 0x7F]],
            parse(&[0x90, 0x3C, 0xB0, 0x40, 0x7F])
        );
    }

    /// Compresses messages with running status, then checks the parser expands them back.
    #[test]
    fn running_status_round_trip() {
        let messages: Vec<Vec<u8>> = (0..40u8)
            .map(|i| match i % 5 {
                0 | 1 => std::vec![0x90 | (i % 2), 0x30 + i, 0x40],
                2 => std::vec![0x80 | (i % 2), 0x30 + i, 0x00],
                3 => std::vec![0xC0, i],
                _ => std::vec![0xB1, 0x01, i],
            })
            .collect();

        let mut wire = Vec::new();
        let mut last_status = None;
        for (i, message) in messages.iter().enumerate() {
            if last_status != Some(message[0]) {
                wire.push(message[0]);
                last_status = Some(message[0]);
            }
            if i % 7 == 0 {
                wire.push(0xF8);
            }
            wire.extend_from_slice(&message[1..]);
        }

        let parsed: Vec<Vec<u8>> = parse(&wire).into_iter().filter(|m| m[0] != 0xF8).collect();
        assert_eq!(messages, parsed, "Expected left but got right");
    }
}
