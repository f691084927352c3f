//! The aggregator: owns the registered transports and the [`MidiState`] their bytes are folded
//! into.

use crate::{
    configuration::{BusConfig, MAX_TRANSPORTS},
    event::MusicEvent,
    message::Message,
    midi_state::{ActiveNotes, DebugHook, History, MidiState},
    transport::{AnyTransport, Inbound, Transport, TransportKind},
};
use embassy_time::Instant;
use heapless::Vec;

/// Normalizes MIDI traffic from every registered transport into one ordered stream of
/// [`MusicEvent`]s, and fans application-generated messages back out.
///
/// The bus is meant to be driven from a single cooperative loop: call [`Bus::poll`] once per tick,
/// then read events with [`Bus::events`] or [`Bus::pop_event`].
pub struct Bus<'a> {
    config: BusConfig,
    transports: Vec<AnyTransport<'a>, MAX_TRANSPORTS>,
    state: MidiState,
}

impl<'a> Bus<'a> {
    /// Construct a new `Bus` with no transports.
    pub fn new(config: BusConfig) -> Self {
        Self {
            state: MidiState::new(&config),
            config,
            transports: Vec::new(),
        }
    }

    /// Getter.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Adds a transport, returning its position in registration order. Hands the transport back if
    /// [`MAX_TRANSPORTS`] are already registered.
    pub fn register(
        &mut self,
        transport: impl Into<AnyTransport<'a>>,
    ) -> Result<usize, AnyTransport<'a>> {
        let transport = transport.into();
        let kind = transport.kind();
        self.transports.push(transport)?;
        info!("Registered {:?} transport", kind);
        Ok(self.transports.len() - 1)
    }

    /// Number of registered transports.
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Returns `true` if any registered transport has a peer or device.
    pub fn is_any_connected(&self) -> bool {
        self.transports.iter().any(Transport::is_connected)
    }

    /// Polls every transport once, stamping what arrived with the current time. Returns the number
    /// of events emitted.
    pub fn poll(&mut self) -> usize {
        self.poll_at(Instant::now())
    }

    /// Polls every transport once, stamping what arrived with `at`. Returns the number of events
    /// emitted.
    pub fn poll_at(&mut self, at: Instant) -> usize {
        let Self { transports, state, .. } = self;
        let mut emitted = 0;
        for transport in transports.iter_mut() {
            let kind = transport.kind();
            transport.poll(&mut |inbound| match inbound {
                Inbound::Connected => info!("{:?} transport connected", kind),
                Inbound::Disconnected => {
                    info!("{:?} transport disconnected; releasing held notes", kind);
                    state.clear_notes();
                }
                Inbound::Data(bytes) => {
                    if state.process(kind, bytes, at).is_some() {
                        emitted += 1;
                    }
                }
            });
        }
        emitted
    }

    /// Feeds one group of bytes to the bus as if `source` had delivered it at `at`, bypassing the
    /// transports.
    pub fn ingest(
        &mut self,
        source: TransportKind,
        bytes: &[u8],
        at: Instant,
    ) -> Option<MusicEvent> {
        self.state.process(source, bytes, at)
    }

    /// Returns an [`Iterator`] over the live queue, oldest first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &MusicEvent> {
        self.state.events()
    }

    /// Removes and returns the oldest event in the live queue.
    pub fn pop_event(&mut self) -> Option<MusicEvent> {
        self.state.pop_event()
    }

    /// The most recent event still in the live queue.
    pub fn latest(&self) -> Option<&MusicEvent> {
        self.state.latest()
    }

    /// Number of events in the live queue.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Returns `true` if the live queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Every event emitted since the last reset, if [`BusConfig::history_capacity`] enabled the
    /// history.
    pub fn history(&self) -> &History {
        self.state.history()
    }

    /// Getter.
    pub fn active_notes(&self) -> &ActiveNotes {
        self.state.active_notes()
    }

    /// Index of the chord currently sounding; zero when no note is held.
    pub fn current_chord(&self) -> u32 {
        self.state.current_chord()
    }

    /// See [`MidiState::chord_events`].
    pub fn chord_events(&self, chord: u32) -> impl Iterator<Item = &MusicEvent> {
        self.state.chord_events(chord)
    }

    /// Empties the live queue and history and forgets all note and chord state. Transports stay
    /// registered.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Installs or removes a hook that sees every inbound message before it is interpreted.
    pub fn set_debug_hook(&mut self, hook: Option<DebugHook>) {
        self.state.set_debug_hook(hook);
    }

    /// Offers `bytes` to each transport in registration order, stopping at the first that accepts
    /// it. Returns `false` if none did.
    pub fn send_raw(&mut self, bytes: &[u8]) -> bool {
        for transport in self.transports.iter_mut() {
            if transport.send(bytes) {
                trace!("Sent {:?} via {:?}", bytes, transport.kind());
                return true;
            }
        }
        debug!("No transport accepted {:?}", bytes);
        false
    }

    fn send(&mut self, message: Message) -> bool {
        self.send_raw(message.as_bytes())
    }

    /// Sends a NoteOn on channel 1..=16.
    pub fn send_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> bool {
        self.send(Message::note_on(channel, note, velocity))
    }

    /// Sends a NoteOff on channel 1..=16.
    pub fn send_note_off(&mut self, channel: u8, note: u8, velocity: u8) -> bool {
        self.send(Message::note_off(channel, note, velocity))
    }

    /// Sends a Control Change on channel 1..=16.
    pub fn send_control_change(&mut self, channel: u8, controller: u8, value: u8) -> bool {
        self.send(Message::control_change(channel, controller, value))
    }

    /// Sends a Program Change on channel 1..=16.
    pub fn send_program_change(&mut self, channel: u8, program: u8) -> bool {
        self.send(Message::program_change(channel, program))
    }

    /// Sends a Channel Pressure message on channel 1..=16.
    pub fn send_channel_pressure(&mut self, channel: u8, pressure: u8) -> bool {
        self.send(Message::channel_pressure(channel, pressure))
    }

    /// Sends a Pitch Bend on channel 1..=16; `value` is 14 bits, centre 8192.
    pub fn send_pitch_bend(&mut self, channel: u8, value: u16) -> bool {
        self.send(Message::pitch_bend(channel, value))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::{
        event::EventKind,
        transport::{
            BleError, BleMidi, BleMidiState, BleStack, SerialError, SerialMidi, SerialPort, UsbMidi,
            UsbMidiState,
        },
    };
    use std::{collections::VecDeque, vec::Vec as StdVec};

    #[derive(Default)]
    struct Port {
        rx: VecDeque<u8>,
        tx: StdVec<u8>,
        rejects: bool,
    }

    impl Port {
        fn with(bytes: &[u8]) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl SerialPort for Port {
        fn read(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
            if self.rejects {
                return Err(SerialError::WriteFailed);
            }
            self.tx.extend_from_slice(bytes);
            Ok(())
        }
    }

    struct Quiet;

    impl BleStack for Quiet {
        fn register_service(&self) -> Result<(), BleError> {
            Ok(())
        }

        fn advertise(&self, _name: &str) -> Result<(), BleError> {
            Ok(())
        }

        fn notify(&self, _packet: &[u8]) -> Result<(), BleError> {
            Ok(())
        }
    }

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    #[test]
    fn serial_bytes_become_events() {
        let mut port = Port::with(&[0x90, 0x3C, 0x64, 0x80, 0x3C, 0x00]);
        let mut bus = Bus::new(BusConfig::default());
        assert_eq!(
            Ok(0),
            bus.register(SerialMidi::new(&mut port)).map_err(|_| ())
        );

        assert_eq!(2, bus.poll_at(at(0)));
        let on = bus.pop_event().expect("NoteOn should be queued");
        let off = bus.pop_event().expect("NoteOff should be queued");
        assert_eq!(
            (EventKind::NoteOn, 60, 100),
            (on.kind(), on.value(), on.velocity())
        );
        assert_eq!(
            (EventKind::NoteOff, 60, 0),
            (off.kind(), off.value(), off.velocity())
        );
        assert_eq!(on.pairing(), off.pairing());
        assert!(bus.is_empty());
    }

    #[test]
    fn usb_packets_are_unframed() {
        let state = UsbMidiState::new();
        state.deliver(&[0x09, 0x90, 0x3C, 0x64]);
        let mut bus = Bus::new(BusConfig::default());
        assert!(bus.register(UsbMidi::new(&state)).is_ok());

        assert_eq!(1, bus.poll_at(at(0)));
        let event = bus.latest().expect("event");
        assert_eq!(EventKind::NoteOn, event.kind());
        assert_eq!(
            (1, 60, 100),
            (event.channel(), event.value(), event.velocity())
        );
    }

    #[test]
    fn chord_window_is_applied_across_polls() {
        let mut bus = Bus::new(BusConfig::default());
        let first = bus
            .ingest(TransportKind::Serial, &[0x90, 60, 0x64], at(0))
            .map(|e| e.chord());
        let second = bus
            .ingest(TransportKind::Serial, &[0x90, 64, 0x64], at(5))
            .map(|e| e.chord());
        let third = bus
            .ingest(TransportKind::Serial, &[0x90, 67, 0x64], at(10))
            .map(|e| e.chord());
        assert_eq!([Some(1), Some(1), Some(1)], [first, second, third]);
        assert_eq!(3, bus.chord_events(1).count());
        assert_eq!(3, bus.active_notes().len());
        assert_eq!(1, bus.current_chord());
    }

    #[test]
    fn register_rejects_past_capacity() {
        let mut ports: [Port; MAX_TRANSPORTS + 1] = core::array::from_fn(|_| Port::default());
        let mut bus = Bus::new(BusConfig::default());
        let mut results = StdVec::new();
        for port in ports.iter_mut() {
            results.push(bus.register(SerialMidi::new(port)).is_ok());
        }
        assert_eq!(std::vec![true, true, true, true, false], results);
        assert_eq!(MAX_TRANSPORTS, bus.transport_count());
    }

    #[test]
    fn send_stops_at_first_success() {
        let mut rejecting = Port {
            rejects: true,
            ..Default::default()
        };
        let mut first = Port::default();
        let mut second = Port::default();
        {
            let mut bus = Bus::new(BusConfig::default());
            assert!(bus.register(SerialMidi::new(&mut rejecting)).is_ok());
            assert!(bus.register(SerialMidi::new(&mut first)).is_ok());
            assert!(bus.register(SerialMidi::new(&mut second)).is_ok());

            assert!(bus.send_note_on(1, 60, 100));
            assert!(bus.send_pitch_bend(2, 8192));
        }

        assert!(rejecting.tx.is_empty());
        assert_eq!(
            std::vec![0x90, 60, 100, 0xE1, 0x00, 0x40],
            first.tx,
            "Expected left but got right"
        );
        assert!(second.tx.is_empty(), "Expected fan-out to stop");
    }

    #[test]
    fn send_fails_without_willing_transport() {
        let state = UsbMidiState::new();
        let mut bus = Bus::new(BusConfig::default());
        assert!(!bus.send_control_change(1, 7, 100), "Nothing registered");

        assert!(bus.register(UsbMidi::new(&state)).is_ok());
        assert!(!bus.send_program_change(1, 5), "USB does not send");
    }

    #[test]
    fn disconnect_clears_held_notes() {
        let stack = Quiet;
        let state = BleMidiState::new();
        let mut bus = Bus::new(BusConfig::default());
        assert!(bus.register(BleMidi::new(&state, &stack)).is_ok());

        state.on_connect();
        state.on_write(&[0x80, 0x80, 0x90, 60, 0x64]);
        assert_eq!(1, bus.poll_at(at(0)));
        assert!(bus.is_any_connected());
        assert_eq!(1, bus.current_chord());

        state.on_disconnect(&stack);
        bus.poll_at(at(1));

        assert!(!bus.is_any_connected());
        assert!(bus.active_notes().is_empty());
        assert_eq!(0, bus.current_chord());
        assert_eq!(1, bus.len(), "Expected emitted events to survive");
    }

    #[test]
    fn reset_forgets_everything() {
        let mut bus = Bus::new(BusConfig {
            history_capacity: 4,
            ..Default::default()
        });
        bus.ingest(TransportKind::Serial, &[0x90, 60, 0x64], at(0));
        bus.ingest(TransportKind::Serial, &[0xB0, 0x40, 0x7F], at(1));
        assert_eq!(2, bus.history().len());

        bus.reset();
        assert!(bus.is_empty());
        assert!(bus.history().is_empty());
        assert!(bus.active_notes().is_empty());
        assert_eq!(None, bus.latest());
    }
}
