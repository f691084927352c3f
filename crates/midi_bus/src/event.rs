//! The normalized unit the bus emits for every channel-voice message it accepts.

use embassy_time::{Duration, Instant};

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// The kinds of channel-voice message the bus turns into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    /// A note started sounding.
    NoteOn,
    /// A note was released.
    NoteOff,
    /// A controller moved.
    ControlChange,
    /// A patch was selected.
    ProgramChange,
    /// Channel-wide aftertouch.
    ChannelPressure,
    /// The pitch wheel moved.
    PitchBend,
}

impl EventKind {
    /// Returns `true` for [`EventKind::NoteOn`] and [`EventKind::NoteOff`].
    pub fn is_note(&self) -> bool {
        matches!(self, Self::NoteOn | Self::NoteOff)
    }
}

/// One normalized MIDI event.
///
/// Events are created exclusively by the bus while parsing inbound bytes and are never mutated
/// afterwards, so every field is exposed through a getter rather than made public.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MusicEvent {
    pub(crate) index: u32,
    pub(crate) pairing: u32,
    pub(crate) timestamp: Instant,
    pub(crate) delay: Duration,
    pub(crate) channel: u8,
    pub(crate) kind: EventKind,
    pub(crate) value: u8,
    pub(crate) secondary: u8,
    pub(crate) chord: u32,
    pub(crate) pitch_bend: u16,
}

impl MusicEvent {
    /// Sequence number, counting every event the bus has emitted since the last reset.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Identifier linking a NoteOn to its eventual NoteOff. Zero for non-note events and for a
    /// NoteOff whose NoteOn was never seen.
    pub fn pairing(&self) -> u32 {
        self.pairing
    }

    /// When the bus parsed the message.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Time elapsed since the previous event; zero for the first.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// MIDI channel number, 1 through 16.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Getter.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Note number for note events, controller number for Control Change, otherwise zero.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Velocity, controller value, pressure or program number, depending on [`kind`][Self::kind].
    pub fn secondary(&self) -> u8 {
        self.secondary
    }

    /// Getter.
    pub fn velocity(&self) -> u8 {
        self.secondary
    }

    /// Chord grouping index. Zero for non-note events.
    pub fn chord(&self) -> u32 {
        self.chord
    }

    /// The 14-bit pitch bend value; zero for every other kind.
    pub fn pitch_bend(&self) -> u16 {
        self.pitch_bend
    }

    /// Pitch class of the note, e.g. `"C#"`; empty for non-note kinds.
    pub fn note_name(&self) -> &'static str {
        if self.kind.is_note() {
            note_name(self.value)
        } else {
            ""
        }
    }

    /// Octave of the note, where middle C (60) is in octave 4; `None` for non-note kinds.
    pub fn octave(&self) -> Option<i8> {
        self.kind.is_note().then(|| octave(self.value))
    }
}

/// Pitch class name of a MIDI note number.
pub fn note_name(note: u8) -> &'static str {
    NOTE_NAMES[usize::from(note % 12)]
}

/// Octave of a MIDI note number, such that note 60 is C4.
pub fn octave(note: u8) -> i8 {
    (note / 12) as i8 - 1
}
