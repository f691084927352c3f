use crate::{
    configuration::{BusConfig, ChordWindow, QUEUE_CAPACITY},
    event::{EventKind, MusicEvent},
    message::{canonicalize, pitch_bend_value},
    transport::TransportKind,
};
use embassy_time::{Duration, Instant};
use heapless::Deque;
use wmidi::{Channel, MidiMessage, Note};

mod active_notes;
pub use active_notes::*;

mod history;
pub use history::*;

/// Invoked with the raw bytes a transport delivered and their canonical 2–3 byte form, before any
/// state changes.
pub type DebugHook = fn(raw: &[u8], canonical: &[u8]);

/// Everything the bus knows about the MIDI traffic it has seen: the live event queue, the history,
/// and the chord and note bookkeeping needed to classify the next message.
///
/// Only the cooperative thread touches this; transports hand bytes over through their rings first.
pub struct MidiState {
    queue: Deque<MusicEvent, QUEUE_CAPACITY>,
    queue_len: usize,
    history: History,
    active_notes: ActiveNotes,
    chord_window: ChordWindow,
    min_velocity: u8,
    /// Zero exactly when no note is held.
    chord: u32,
    next_index: u32,
    last_pairing: u32,
    last_event: Option<Instant>,
    last_note_on: Option<Instant>,
    debug_hook: Option<DebugHook>,
}

impl MidiState {
    /// Construct a new `MidiState` from the options in `config`.
    pub fn new(config: &BusConfig) -> Self {
        Self {
            queue: Deque::new(),
            queue_len: config.queue_len(),
            history: History::with_capacity(config.history_capacity),
            active_notes: ActiveNotes::new(),
            chord_window: config.chord_window,
            min_velocity: config.min_velocity,
            chord: 0,
            next_index: 0,
            last_pairing: 0,
            last_event: None,
            last_note_on: None,
            debug_hook: None,
        }
    }

    /// Installs or removes the [`DebugHook`].
    pub fn set_debug_hook(&mut self, hook: Option<DebugHook>) {
        self.debug_hook = hook;
    }

    /// Interprets one group of bytes delivered by a `source` transport at `at`, returning the event
    /// it produced.
    ///
    /// Framing bytes are stripped first. Anything that is not a recognized channel-voice message is
    /// ignored, as is a NoteOn below the minimum velocity; neither changes any state.
    pub fn process(
        &mut self,
        source: TransportKind,
        raw: &[u8],
        at: Instant,
    ) -> Option<MusicEvent> {
        let body = raw.get(source.framing_len()..)?;
        let Some(canonical) = canonicalize(body) else {
            trace!("Ignoring {} bytes from {:?}", raw.len(), source);
            return None;
        };
        if let Some(hook) = self.debug_hook {
            hook(raw, canonical);
        }
        let message = MidiMessage::from_bytes(canonical).ok()?;

        let event = match message {
            MidiMessage::NoteOn(channel, note, velocity) if u8::from(velocity) == 0 => {
                self.note_off(channel, note, 0, at)
            }
            MidiMessage::NoteOn(channel, note, velocity) => {
                let velocity = u8::from(velocity);
                if velocity < self.min_velocity {
                    debug!(
                        "Filtered NoteOn: channel {}, note {}, velocity: {}",
                        channel.number(),
                        note.to_str(),
                        velocity
                    );
                    return None;
                }
                self.note_on(channel, note, velocity, at)
            }
            MidiMessage::NoteOff(channel, note, velocity) => {
                self.note_off(channel, note, u8::from(velocity), at)
            }
            MidiMessage::ControlChange(channel, control_function, control_value) => self.event(
                channel,
                EventKind::ControlChange,
                u8::from(control_function),
                u8::from(control_value),
                at,
            ),
            MidiMessage::ProgramChange(channel, program) => {
                self.event(channel, EventKind::ProgramChange, 0, u8::from(program), at)
            }
            MidiMessage::ChannelPressure(channel, value) => {
                self.event(channel, EventKind::ChannelPressure, 0, u8::from(value), at)
            }
            MidiMessage::PitchBendChange(channel, _) => {
                let mut event = self.event(channel, EventKind::PitchBend, 0, 0, at);
                event.pitch_bend = pitch_bend_value(canonical[1], canonical[2]);
                event
            }
            _ => {
                trace!("Ignoring unsupported MIDI message: {:?}", canonical);
                return None;
            }
        };

        self.record(event);
        Some(event)
    }

    fn note_on(&mut self, channel: Channel, note: Note, velocity: u8, at: Instant) -> MusicEvent {
        let window = self.chord_window;
        let window_elapsed = window.is_enabled()
            && self
                .last_note_on
                .is_some_and(|t| at.saturating_duration_since(t) > window.duration());
        if self.active_notes.is_empty() {
            self.chord = 1;
            debug!("Chord {} started", self.chord);
        } else if window_elapsed {
            self.chord += 1;
            debug!("Chord {} started", self.chord);
        }
        self.last_note_on = Some(at);
        self.last_pairing = self.last_pairing.wrapping_add(1).max(1);

        if !self.active_notes.press(note, self.chord, self.last_pairing) {
            warn!("Active note table full; {} not paired", note.to_str());
        }
        info!(
            "Received NoteOn: channel {}, note {}, velocity: {}",
            channel.number(),
            note.to_str(),
            velocity
        );

        let mut event = self.event(channel, EventKind::NoteOn, note as u8, velocity, at);
        event.pairing = self.last_pairing;
        event.chord = self.chord;
        event
    }

    fn note_off(&mut self, channel: Channel, note: Note, velocity: u8, at: Instant) -> MusicEvent {
        let released = self.active_notes.release(note);
        if self.active_notes.is_empty() {
            self.chord = 0;
        }
        info!(
            "Received NoteOff: channel {}, note {}, velocity: {}",
            channel.number(),
            note.to_str(),
            velocity
        );

        let mut event = self.event(channel, EventKind::NoteOff, note as u8, velocity, at);
        if let Some(held) = released {
            event.pairing = held.pairing();
            event.chord = held.chord();
        }
        event
    }

    /// Stamps a new event with the next sequence index and the delay since the previous event.
    fn event(
        &mut self,
        channel: Channel,
        kind: EventKind,
        value: u8,
        secondary: u8,
        at: Instant,
    ) -> MusicEvent {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        let delay = match self.last_event {
            Some(last) => at.saturating_duration_since(last),
            None => Duration::from_ticks(0),
        };
        self.last_event = Some(at);

        MusicEvent {
            index,
            pairing: 0,
            timestamp: at,
            delay,
            channel: channel.number(),
            kind,
            value,
            secondary,
            chord: 0,
            pitch_bend: 0,
        }
    }

    fn record(&mut self, event: MusicEvent) {
        while self.queue.len() >= self.queue_len {
            self.queue.pop_front();
        }
        if self.queue.push_back(event).is_err() {
            warn!("Event queue full, dropping event {}", event.index);
        }
        if self.history.push(event).is_err() {
            error!(
                "History could not grow past {} events; event {} not recorded",
                self.history.len(),
                event.index
            );
        }
    }

    /// Forgets every held note and the chord they formed. Called when any transport disconnects,
    /// since notes cannot be held across a reconnect.
    pub fn clear_notes(&mut self) {
        self.active_notes.clear();
        self.chord = 0;
        self.last_note_on = None;
    }

    /// Returns the state to how [`MidiState::new`] left it, keeping the configuration and debug
    /// hook.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.history.clear();
        self.clear_notes();
        self.next_index = 0;
        self.last_pairing = 0;
        self.last_event = None;
    }

    /// Returns an [`Iterator`] over the live queue, oldest first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &MusicEvent> {
        self.queue.iter()
    }

    /// Removes and returns the oldest event in the live queue.
    pub fn pop_event(&mut self) -> Option<MusicEvent> {
        self.queue.pop_front()
    }

    /// The most recent event still in the live queue.
    pub fn latest(&self) -> Option<&MusicEvent> {
        self.queue.back()
    }

    /// Number of events in the live queue.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if the live queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Getter.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Getter.
    pub fn active_notes(&self) -> &ActiveNotes {
        &self.active_notes
    }

    /// Index of the chord currently sounding; zero when no note is held.
    pub fn current_chord(&self) -> u32 {
        self.chord
    }

    /// Note events in the live queue grouped into `chord`.
    ///
    /// Chord indices restart from one after every note has been released, so this may span several
    /// phrases if the queue is long.
    pub fn chord_events(&self, chord: u32) -> impl Iterator<Item = &MusicEvent> {
        self.queue
            .iter()
            .filter(move |event| event.kind.is_note() && event.chord == chord)
    }
}
