//! The contract every transport implements, and the closed set of transports the
//! [`Bus`][crate::Bus] can hold.
//!
//! Each concrete transport is split in two. A `*State` value is shared with the context the vendor
//! stack runs in (driver callback, polling task) and owns the [`FrameRing`][crate::ring::FrameRing]
//! that bytes cross; it is usually placed in a `static`. The transport proper borrows that state
//! and is polled by the bus on the cooperative thread. The serial transport is the exception: the
//! port is drained directly during [`Transport::poll`], so there is no second context to hand off
//! from.
//!
//! Rather than storing callback pointers to the bus, transports receive a sink on every
//! [`Transport::poll`] call and report [`Inbound`] data and connection transitions through it.

use core::fmt;

pub mod ble;
pub mod broadcast;
pub mod serial;
pub mod usb;

pub use ble::{BleError, BleMidi, BleMidiState, BleStack};
pub use broadcast::{
    BroadcastHandle, BroadcastLink, BroadcastMidi, BroadcastRegistry, BroadcastState, LinkError,
};
pub use serial::{SerialError, SerialMidi, SerialPort};
pub use usb::{UsbError, UsbHostDriver, UsbMidi, UsbMidiHost, UsbMidiState};

/// Identifies which kind of transport delivered a group of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportKind {
    /// USB host class driver; delivers 4-byte USB-MIDI Event Packets.
    Usb,
    /// Bluetooth LE MIDI service.
    Bluetooth,
    /// 5-pin DIN serial port.
    Serial,
    /// Connectionless wireless broadcast.
    Broadcast,
}

impl TransportKind {
    /// Number of framing bytes that precede the MIDI message in each group this kind of transport
    /// delivers.
    pub fn framing_len(&self) -> usize {
        match self {
            Self::Usb => 1,
            _ => 0,
        }
    }
}

/// What a transport reports to the bus while being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Inbound<'b> {
    /// The transport gained a peer or device.
    Connected,
    /// The transport lost its peer or device.
    Disconnected,
    /// One group of raw inbound bytes.
    Data(&'b [u8]),
}

/// The capability interface every transport implements.
pub trait Transport {
    /// Getter.
    fn kind(&self) -> TransportKind;

    /// Drains whatever arrived since the last call, reporting it through `sink`. Must not block;
    /// called once per cooperative tick.
    fn poll(&mut self, sink: &mut dyn FnMut(Inbound<'_>));

    /// Returns `true` while the transport has a peer or device.
    fn is_connected(&self) -> bool;

    /// Offers a complete MIDI message for delivery, returning `true` on success. Unsupported by
    /// default.
    fn send(&mut self, bytes: &[u8]) -> bool {
        let _ = bytes;
        false
    }
}

/// Tracks the connection state last reported to the bus, so that transitions observed from another
/// context are reported exactly once.
#[derive(Debug, Default)]
pub(crate) struct ConnectionWatch {
    reported: bool,
    session: u32,
}

impl ConnectionWatch {
    /// Reports any transition between the last observation and this one. A changed `session` while
    /// connected counts as a disconnect followed by a connect.
    pub(crate) fn update(
        &mut self,
        connected: bool,
        session: u32,
        sink: &mut dyn FnMut(Inbound<'_>),
    ) {
        if self.reported && (!connected || session != self.session) {
            self.reported = false;
            sink(Inbound::Disconnected);
        }
        if connected && !self.reported {
            self.reported = true;
            self.session = session;
            sink(Inbound::Connected);
        }
    }
}

/// Errors reported by transport initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The USB host stack failed.
    Usb(UsbError),
    /// The Bluetooth stack failed.
    Ble(BleError),
    /// The serial port failed.
    Serial(SerialError),
    /// The wireless broadcast stack failed.
    Link(LinkError),
    /// Every slot of the broadcast dispatcher is taken.
    RegistryFull,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb(e) => write!(f, "USB host: {}", e),
            Self::Ble(e) => write!(f, "Bluetooth: {}", e),
            Self::Serial(e) => write!(f, "serial: {}", e),
            Self::Link(e) => write!(f, "broadcast: {}", e),
            Self::RegistryFull => f.write_str("broadcast: no free dispatcher slot"),
        }
    }
}

impl core::error::Error for TransportError {}

impl From<UsbError> for TransportError {
    fn from(e: UsbError) -> Self {
        Self::Usb(e)
    }
}

impl From<BleError> for TransportError {
    fn from(e: BleError) -> Self {
        Self::Ble(e)
    }
}

impl From<SerialError> for TransportError {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl From<LinkError> for TransportError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

/// The closed set of transports a [`Bus`][crate::Bus] can hold.
pub enum AnyTransport<'a> {
    /// See [`UsbMidi`].
    Usb(UsbMidi<'a>),
    /// See [`BleMidi`].
    Bluetooth(BleMidi<'a>),
    /// See [`SerialMidi`].
    Serial(SerialMidi<'a>),
    /// See [`BroadcastMidi`].
    Broadcast(BroadcastMidi<'a>),
}

impl<'a> From<UsbMidi<'a>> for AnyTransport<'a> {
    fn from(t: UsbMidi<'a>) -> Self {
        Self::Usb(t)
    }
}

impl<'a> From<BleMidi<'a>> for AnyTransport<'a> {
    fn from(t: BleMidi<'a>) -> Self {
        Self::Bluetooth(t)
    }
}

impl<'a> From<SerialMidi<'a>> for AnyTransport<'a> {
    fn from(t: SerialMidi<'a>) -> Self {
        Self::Serial(t)
    }
}

impl<'a> From<BroadcastMidi<'a>> for AnyTransport<'a> {
    fn from(t: BroadcastMidi<'a>) -> Self {
        Self::Broadcast(t)
    }
}

impl Transport for AnyTransport<'_> {
    fn kind(&self) -> TransportKind {
        match self {
            Self::Usb(t) => t.kind(),
            Self::Bluetooth(t) => t.kind(),
            Self::Serial(t) => t.kind(),
            Self::Broadcast(t) => t.kind(),
        }
    }

    fn poll(&mut self, sink: &mut dyn FnMut(Inbound<'_>)) {
        match self {
            Self::Usb(t) => t.poll(sink),
            Self::Bluetooth(t) => t.poll(sink),
            Self::Serial(t) => t.poll(sink),
            Self::Broadcast(t) => t.poll(sink),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Usb(t) => t.is_connected(),
            Self::Bluetooth(t) => t.is_connected(),
            Self::Serial(t) => t.is_connected(),
            Self::Broadcast(t) => t.is_connected(),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> bool {
        match self {
            Self::Usb(t) => t.send(bytes),
            Self::Bluetooth(t) => t.send(bytes),
            Self::Serial(t) => t.send(bytes),
            Self::Broadcast(t) => t.send(bytes),
        }
    }
}
