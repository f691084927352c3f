//! Bluetooth LE MIDI transport.
//!
//! The vendor stack calls into [`BleMidiState`] from its own task: [`BleMidiState::on_write`] when
//! the central writes to the MIDI I/O characteristic, [`BleMidiState::on_connect`] and
//! [`BleMidiState::on_disconnect`] as centrals come and go. [`BleMidi`] is the side the bus polls
//! and sends through.
//!
//! Every packet starts with a header byte (bit 7 set, bits 0-5 the high bits of a 13-bit
//! millisecond timestamp) followed by a timestamp byte (bit 7 set, the low 7 bits), then the MIDI
//! message. Further messages in the same packet are preceded by their own timestamp byte, which may
//! be omitted under running status.

use super::{ConnectionWatch, Inbound, Transport, TransportError, TransportKind};
use crate::message::{SYSEX_START, StatusClass, is_realtime, is_status, message_len};
use crate::ring::FrameRing;
use core::{cell::Cell, fmt};
use embassy_sync::{
    blocking_mutex::{self, raw::CriticalSectionRawMutex},
    mutex,
};
use embassy_time::{Duration, Instant};
use heapless::Vec;

/// MIDI service UUID, 03B80E5A-EDE8-4B33-A751-6CE34EC4C700.
pub const MIDI_SERVICE_UUID: [u8; 16] = [
    0x03, 0xb8, 0x0e, 0x5a, 0xed, 0xe8, 0x4b, 0x33, 0xa7, 0x51, 0x6c, 0xe3, 0x4e, 0xc4, 0xc7, 0x00,
];

/// MIDI I/O characteristic UUID, 7772E5DB-3868-4112-A1A9-F2669D106BF3 (read, write without
/// response, notify).
pub const MIDI_CHARACTERISTIC_UUID: [u8; 16] = [
    0x77, 0x72, 0xe5, 0xdb, 0x38, 0x68, 0x41, 0x12, 0xa1, 0xa9, 0xf2, 0x66, 0x9d, 0x10, 0x6b, 0xf3,
];

/// Capacity, in messages, of the ring between the Bluetooth stack and the bus.
pub const BLE_RING_LEN: usize = 16;

/// Most MIDI bytes sent in one packet; fits the 20-byte payload of the default 23-byte ATT MTU.
pub const MAX_BLE_PAYLOAD: usize = 18;

/// Header and timestamp bytes plus [`MAX_BLE_PAYLOAD`].
pub const BLE_PACKET_LEN: usize = MAX_BLE_PAYLOAD + 2;

/// How long an outbound send waits for another context to finish its notify.
pub const SEND_LOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors reported by a [`BleStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleError {
    /// The stack could not be brought up.
    StackInit,
    /// The MIDI service could not be registered.
    ServiceRegistration,
    /// Advertising could not be started.
    Advertising,
    /// The notification could not be sent.
    NotifyFailed,
}

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StackInit => "stack initialization failed",
            Self::ServiceRegistration => "could not register MIDI service",
            Self::Advertising => "could not start advertising",
            Self::NotifyFailed => "notify failed",
        })
    }
}

/// The parts of a Bluetooth LE stack the transport needs. Implementations are expected to be
/// callable from any context, as the stack itself is.
pub trait BleStack {
    /// Registers the MIDI service ([`MIDI_SERVICE_UUID`]) and its characteristic
    /// ([`MIDI_CHARACTERISTIC_UUID`]).
    fn register_service(&self) -> Result<(), BleError>;

    /// Starts advertising the MIDI service under `name`.
    fn advertise(&self, name: &str) -> Result<(), BleError>;

    /// Notifies the connected central with a complete packet.
    fn notify(&self, packet: &[u8]) -> Result<(), BleError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Status {
    connected: bool,
    session: u32,
    error: Option<BleError>,
}

/// State shared between the Bluetooth stack's callbacks and the [`BleMidi`] transport.
pub struct BleMidiState {
    ring: FrameRing<BLE_RING_LEN>,
    status: blocking_mutex::Mutex<CriticalSectionRawMutex, Cell<Status>>,
    name: blocking_mutex::Mutex<CriticalSectionRawMutex, Cell<&'static str>>,
    /// Serializes notifies so overlapping sends cannot corrupt the characteristic value.
    send_lock: mutex::Mutex<CriticalSectionRawMutex, ()>,
}

impl Default for BleMidiState {
    fn default() -> Self {
        Self::new()
    }
}

impl BleMidiState {
    /// Construct a new `BleMidiState`; usable in a `static`.
    pub const fn new() -> Self {
        Self {
            ring: FrameRing::new(),
            status: blocking_mutex::Mutex::new(Cell::new(Status {
                connected: false,
                session: 0,
                error: None,
            })),
            name: blocking_mutex::Mutex::new(Cell::new("")),
            send_lock: mutex::Mutex::new(()),
        }
    }

    fn status(&self) -> Status {
        self.status.lock(Cell::get)
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        self.status.lock(|cell| {
            let mut status = cell.get();
            f(&mut status);
            cell.set(status);
        });
    }

    /// Registers the MIDI service and starts advertising under `name`. On failure the error is
    /// recorded and the transport stays disconnected.
    pub fn start(&self, stack: &dyn BleStack, name: &'static str) -> Result<(), TransportError> {
        self.name.lock(|cell| cell.set(name));
        let result = stack
            .register_service()
            .and_then(|()| stack.advertise(name));
        match result {
            Ok(()) => {
                info!("Advertising Bluetooth MIDI as {}", name);
                self.update(|status| status.error = None);
                Ok(())
            }
            Err(e) => {
                error!("Bluetooth MIDI unavailable: {}", e);
                self.update(|status| status.error = Some(e));
                Err(TransportError::Ble(e))
            }
        }
    }

    /// Called by the stack when a central connects.
    pub fn on_connect(&self) {
        self.update(|status| {
            status.connected = true;
            status.session = status.session.wrapping_add(1);
        });
    }

    /// Called by the stack when the central disconnects. Discards anything not yet polled and
    /// advertises again so a new central can connect.
    pub fn on_disconnect(&self, stack: &dyn BleStack) {
        self.update(|status| status.connected = false);
        self.ring.clear();
        let name = self.name.lock(Cell::get);
        if let Err(e) = stack.advertise(name) {
            error!("Could not restart Bluetooth advertising: {}", e);
            self.update(|status| status.error = Some(e));
        }
    }

    /// Called by the stack when the central writes a packet. Returns the number of messages queued.
    pub fn on_write(&self, packet: &[u8]) -> usize {
        let mut queued = 0;
        decode_packet(packet, |message| {
            if self.ring.push(message) {
                queued += 1;
            } else {
                warn!("Bluetooth MIDI ring full, dropping message");
            }
        });
        queued
    }

    /// Returns `true` while a central is connected.
    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    /// The most recent stack failure, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        self.status().error.map(TransportError::Ble)
    }

    /// Number of messages dropped because the bus fell behind.
    pub fn dropped(&self) -> u32 {
        self.ring.dropped()
    }

    /// Sends up to [`MAX_BLE_PAYLOAD`] bytes as one timestamped packet.
    ///
    /// Waits at most `timeout` for a concurrent send from another context to finish, then gives up
    /// and returns `false` rather than deadlocking.
    pub fn send(&self, stack: &dyn BleStack, payload: &[u8], timeout: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(packet) = encode_packet(payload, Instant::now()) else {
            warn!("Bluetooth MIDI payload of {} bytes not sent", payload.len());
            return false;
        };

        let deadline = Instant::now() + timeout;
        let _guard = loop {
            if let Ok(guard) = self.send_lock.try_lock() {
                break guard;
            }
            if Instant::now() >= deadline {
                warn!("Bluetooth MIDI send timed out waiting for the lock");
                return false;
            }
        };
        match stack.notify(&packet) {
            Ok(()) => true,
            Err(e) => {
                warn!("Bluetooth MIDI notify failed: {}", e);
                false
            }
        }
    }
}

/// Builds a packet for `payload`, stamped with the low 13 bits of `now` in milliseconds. Returns
/// `None` if the payload is empty or longer than [`MAX_BLE_PAYLOAD`].
pub fn encode_packet(payload: &[u8], now: Instant) -> Option<Vec<u8, BLE_PACKET_LEN>> {
    if payload.is_empty() || payload.len() > MAX_BLE_PAYLOAD {
        return None;
    }
    let millis = now.as_millis();
    let header = 0x80 | ((millis >> 7) & 0x3F) as u8;
    let timestamp = 0x80 | (millis & 0x7F) as u8;

    let mut packet = Vec::new();
    packet.extend_from_slice(&[header, timestamp]).ok()?;
    packet.extend_from_slice(payload).ok()?;
    Some(packet)
}

/// Splits an inbound packet into canonical MIDI messages, calling `emit` for each one.
///
/// System Exclusive ends decoding of the packet; it is not supported by the bus.
pub fn decode_packet(packet: &[u8], mut emit: impl FnMut(&[u8])) {
    // header and the first message's timestamp
    if packet.len() < 3 || !is_status(packet[0]) || !is_status(packet[1]) {
        return;
    }
    let mut rest = &packet[2..];
    let mut running: Option<u8> = None;
    let mut first = true;

    while !rest.is_empty() {
        if !first && is_status(rest[0]) {
            // timestamp of a following message
            rest = &rest[1..];
        }
        first = false;

        let Some(&lead) = rest.first() else {
            break;
        };
        let status = if is_status(lead) {
            rest = &rest[1..];
            lead
        } else {
            match running {
                Some(status) => status,
                None => break,
            }
        };
        if status == SYSEX_START {
            break;
        }
        let Some(len) = message_len(status) else {
            break;
        };
        let data_len = len - 1;
        let Some(data) = rest.get(..data_len) else {
            break;
        };
        if data.iter().any(|&b| is_status(b)) {
            break;
        }

        let mut message = [status, 0, 0];
        message[1..len].copy_from_slice(data);
        emit(&message[..len]);
        rest = &rest[data_len..];

        if !is_realtime(status) {
            running = StatusClass::of(status)
                .filter(StatusClass::is_channel_voice)
                .map(|_| status);
        }
    }
}

/// The bus-facing half of the Bluetooth transport.
pub struct BleMidi<'a> {
    state: &'a BleMidiState,
    stack: &'a dyn BleStack,
    watch: ConnectionWatch,
}

impl<'a> BleMidi<'a> {
    /// Constructs a [`BleMidi`] over `state`, sending through `stack`.
    pub fn new(state: &'a BleMidiState, stack: &'a dyn BleStack) -> Self {
        Self {
            state,
            stack,
            watch: ConnectionWatch::default(),
        }
    }

    /// Starts the service, advertising under
    /// [`BusConfig::device_name`][crate::BusConfig::device_name].
    pub fn start(&self, name: &'static str) -> Result<(), TransportError> {
        self.state.start(self.stack, name)
    }

    /// See [`BleMidiState::last_error`].
    pub fn last_error(&self) -> Option<TransportError> {
        self.state.last_error()
    }
}

impl Transport for BleMidi<'_> {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn poll(&mut self, sink: &mut dyn FnMut(Inbound<'_>)) {
        let status = self.state.status();
        if status.connected {
            self.watch.update(true, status.session, sink);
        }
        while let Some(frame) = self.state.ring.pop() {
            sink(Inbound::Data(frame.as_bytes()));
        }
        if !status.connected {
            self.watch.update(false, status.session, sink);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn send(&mut self, bytes: &[u8]) -> bool {
        self.state.send(self.stack, bytes, SEND_LOCK_TIMEOUT)
    }
}
