//! Provides a struct [`ActiveNotes`] for tracking the notes currently held. Here "held" means a
//! NoteOn has been seen and its NoteOff has not, regardless of which transport delivered them. Each
//! entry remembers the chord and pairing indices its NoteOn was given, so the NoteOff can carry the
//! same ones.

use tinyvec::{ArrayVec, array_vec};
use wmidi::{Note, U7};

/// Per the General MIDI Level 2 specification, compliant devices "must be capable of supplying
/// polyphony of 32 or more allocated notes simultaneously." Thus, this is the number of notes the
/// table tracks.
const GM2_SIMUL_NOTE_NUM: usize = 32;

/// One held note.
///
/// Internally, the note is stored as a [`U7`] because [`tinyvec`] requires that items implement
/// [`Default`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActiveNote {
    note: U7,
    chord: u32,
    pairing: u32,
}

#[cfg(feature = "defmt")]
impl defmt::Format for ActiveNote {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "{} ({}) chord {} pairing {}",
            Note::from(self.note).to_str(),
            u8::from(self.note),
            self.chord,
            self.pairing
        );
    }
}

impl ActiveNote {
    /// Getter.
    pub fn note(&self) -> Note {
        Note::from(self.note)
    }

    /// MIDI note number.
    pub fn number(&self) -> u8 {
        u8::from(self.note)
    }

    /// Chord index the NoteOn was grouped into.
    pub fn chord(&self) -> u32 {
        self.chord
    }

    /// Pairing index the NoteOn was given.
    pub fn pairing(&self) -> u32 {
        self.pairing
    }
}

/// The table of held notes, in the order they were struck.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveNotes {
    data: ArrayVec<[ActiveNote; GM2_SIMUL_NOTE_NUM]>,
}

impl Default for ActiveNotes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ActiveNotes {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "ActiveNotes {{ ");
        defmt::write!(fmt, "data: [");
        for (i, note) in self.data.iter().enumerate() {
            if i == 0 {
                defmt::write!(fmt, " ");
            } else {
                defmt::write!(fmt, ", ");
            }
            defmt::write!(fmt, "{}", note);
        }
        defmt::write!(fmt, " ]");
        defmt::write!(fmt, " }}");
    }
}

impl ActiveNotes {
    /// Construct a new `ActiveNotes`.
    pub fn new() -> Self {
        Self { data: array_vec!() }
    }

    /// Records `note` as held. A note that is already held is moved to the end and takes the new
    /// indices, so the NoteOff that follows pairs with the most recent NoteOn.
    ///
    /// Returns `false` if the table is full and the note could not be tracked.
    pub fn press(&mut self, note: Note, chord: u32, pairing: u32) -> bool {
        let u7 = U7::from_u8_lossy(note as u8);
        self.data.retain(|held| held.note != u7);
        // ignore rather than overflow
        if self.data.len() == self.data.capacity() {
            return false;
        }
        self.data.push(ActiveNote {
            note: u7,
            chord,
            pairing,
        });
        true
    }

    /// Stops tracking `note`, returning the entry it had if it was held.
    pub fn release(&mut self, note: Note) -> Option<ActiveNote> {
        let u7 = U7::from_u8_lossy(note as u8);
        let position = self.data.iter().position(|held| held.note == u7)?;
        Some(self.data.remove(position))
    }

    /// Looks up a held note.
    pub fn get(&self, note: Note) -> Option<&ActiveNote> {
        let u7 = U7::from_u8_lossy(note as u8);
        self.data.iter().find(|held| held.note == u7)
    }

    /// Forgets every held note.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Determine if any notes are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of held notes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns an [`Iterator`] over the held notes.
    ///
    /// Order is preserved; e.g., the first struck note can be accessed via the first call to
    /// `.next()`, and the last struck note is accessible via `.last()`.
    pub fn iter(&self) -> impl Iterator<Item = &ActiveNote> {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C_NOTE: U7 = U7::from_u8_lossy(60);
    const D_NOTE: U7 = U7::from_u8_lossy(62);
    const E_NOTE: U7 = U7::from_u8_lossy(64);
    const G_NOTE: U7 = U7::from_u8_lossy(67);

    fn held(note: U7, chord: u32, pairing: u32) -> ActiveNote {
        ActiveNote {
            note,
            chord,
            pairing,
        }
    }

    fn chord() -> ActiveNotes {
        ActiveNotes {
            data: array_vec!([ActiveNote; 32] =>
                held(E_NOTE, 1, 1), held(C_NOTE, 1, 2), held(G_NOTE, 1, 3)),
        }
    }

    #[test]
    fn new() {
        let expected = ActiveNotes { data: array_vec!() };
        let actual = ActiveNotes::new();
        assert_eq!(expected, actual, "Expected left but got right");
    }

    #[test]
    fn press_appends() {
        let expected = ActiveNotes {
            data: array_vec!([ActiveNote; 32] =>
                held(E_NOTE, 1, 1), held(C_NOTE, 1, 2), held(G_NOTE, 1, 3), held(D_NOTE, 2, 4)),
        };

        let mut actual = chord();
        assert!(actual.press(D_NOTE.into(), 2, 4));

        assert_eq!(expected, actual, "Expected left but got right");
    }

    #[test]
    fn repeated_press_takes_new_indices() {
        let expected = ActiveNotes {
            data: array_vec!([ActiveNote; 32] =>
                held(E_NOTE, 1, 1), held(G_NOTE, 1, 3), held(C_NOTE, 2, 4)),
        };

        let mut actual = chord();
        assert!(actual.press(C_NOTE.into(), 2, 4));

        assert_eq!(expected, actual, "Expected left but got right");
    }

    #[test]
    fn press_ignores_rather_than_overflow() {
        let mut active_notes = ActiveNotes::new();
        for n in 0..GM2_SIMUL_NOTE_NUM as u8 {
            let note = Note::from(U7::from_u8_lossy(n));
            assert!(active_notes.press(note, 1, u32::from(n) + 1));
        }
        assert_eq!(
            GM2_SIMUL_NOTE_NUM,
            active_notes.len(),
            "Expected data to be inititalized to max capacity"
        );
        // end setup

        let extra = Note::from(U7::from_u8_lossy(100));
        assert!(!active_notes.press(extra, 1, 99));
        assert_eq!(
            GM2_SIMUL_NOTE_NUM,
            active_notes.len(),
            "Expected data length not to change"
        );
        assert!(active_notes.get(extra).is_none());
    }

    #[test]
    fn release_returns_entry() {
        let expected = ActiveNotes {
            data: array_vec!([ActiveNote; 32] => held(E_NOTE, 1, 1), held(G_NOTE, 1, 3)),
        };

        let mut actual = chord();
        assert_eq!(Some(held(C_NOTE, 1, 2)), actual.release(C_NOTE.into()));
        assert_eq!(None, actual.release(D_NOTE.into()));

        assert_eq!(expected, actual, "Expected left but got right");
    }

    #[test]
    fn should_be_empty() {
        let mut active_notes = chord();
        assert!(!active_notes.is_empty());
        active_notes.clear();
        assert!(active_notes.is_empty());
    }

    #[test]
    fn iter() {
        let chord = chord();
        let mut iter = chord.iter().map(ActiveNote::note);
        assert_eq!(Some(Note::E4), iter.next());
        assert_eq!(Some(Note::C4), iter.next());
        assert_eq!(Some(Note::G4), iter.next());
        assert_eq!(None, iter.next());
    }
}
