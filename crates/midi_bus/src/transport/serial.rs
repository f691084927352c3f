//! Transport for a 5-pin DIN MIDI port attached to a UART.
//!
//! The port is drained synchronously inside [`Transport::poll`], so unlike the other transports
//! there is no ring buffer: bytes go straight through the [`MidiParser`] and out to the bus.

mod parser;
pub use parser::*;

use super::{ConnectionWatch, Inbound, Transport, TransportKind};
use core::fmt;

/// Most bytes read from the port during one poll, so a flood of input cannot starve the other
/// transports.
pub const SERIAL_READ_BUDGET: usize = 64;

/// Errors reported by a [`SerialPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SerialError {
    /// The port rejected or failed to complete a write.
    WriteFailed,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed => f.write_str("write failed"),
        }
    }
}

/// A UART configured for MIDI (31 250 baud, 8-N-1).
pub trait SerialPort {
    /// Returns the next received byte without blocking, or `None` if nothing is waiting.
    fn read(&mut self) -> Option<u8>;

    /// Writes a complete message.
    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError>;
}

/// The DIN serial transport.
pub struct SerialMidi<'a> {
    port: &'a mut dyn SerialPort,
    parser: MidiParser,
    watch: ConnectionWatch,
}

impl<'a> SerialMidi<'a> {
    /// Constructs a [`SerialMidi`] reading from `port`.
    pub fn new(port: &'a mut dyn SerialPort) -> Self {
        Self {
            port,
            parser: MidiParser::new(),
            watch: ConnectionWatch::default(),
        }
    }
}

impl Transport for SerialMidi<'_> {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn poll(&mut self, sink: &mut dyn FnMut(Inbound<'_>)) {
        // a DIN cable cannot be detected, so the port counts as connected from the first poll
        self.watch.update(true, 0, sink);
        for _ in 0..SERIAL_READ_BUDGET {
            let Some(byte) = self.port.read() else {
                break;
            };
            if let Some(message) = self.parser.push(byte) {
                sink(Inbound::Data(message.as_bytes()));
            }
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn send(&mut self, bytes: &[u8]) -> bool {
        match self.port.write(bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("Serial MIDI send failed: {}", e);
                false
            }
        }
    }
}
