//! Options accepted by the [`Bus`][crate::Bus] at initialization.

use embassy_time::Duration;

/// Compile-time capacity of the live event queue; [`BusConfig::max_queue_len`] is clamped to this
/// value.
pub const QUEUE_CAPACITY: usize = 128;

/// Maximum number of transports a [`Bus`][crate::Bus] can hold.
pub const MAX_TRANSPORTS: usize = 4;

/// How close together NoteOn messages must land to be grouped into the same chord.
///
/// The intended use case is live playing through a controller: the keypresses that make up a chord
/// are never perfectly simultaneous, so any NoteOn received within this window of the previous one
/// joins the chord already sounding. When disabled, a new chord begins only when every held note
/// has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChordWindow(Duration);

impl ChordWindow {
    /// Disables time-based chord grouping.
    pub const NONE: Self = Self(Duration::from_ticks(0));

    /// Constructs a window of the given number of milliseconds; zero disables time-based grouping.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Return the length of the window in a format compatible with Embassy's timekeeping API.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Returns true for any window longer than zero.
    pub fn is_enabled(&self) -> bool {
        *self != Self::NONE
    }
}

impl Default for ChordWindow {
    fn default() -> Self {
        Self::from_millis(50)
    }
}

/// A plain options structure accepted by [`Bus::new`][crate::Bus::new].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// Maximum length of the live queue; the oldest event is evicted when an insertion would exceed
    /// it.
    pub max_queue_len: usize,
    /// Time window for chord grouping.
    pub chord_window: ChordWindow,
    /// NoteOn messages with a velocity below this value are dropped as if never received. Zero
    /// disables filtering.
    pub min_velocity: u8,
    /// Initial capacity of the growable history. Zero disables history.
    pub history_capacity: usize,
    /// Display name used by the Bluetooth transport's advertisement.
    pub device_name: &'static str,
}

impl BusConfig {
    /// The live queue length actually enforced, after clamping to [`QUEUE_CAPACITY`].
    pub fn queue_len(&self) -> usize {
        self.max_queue_len.clamp(1, QUEUE_CAPACITY)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_len: 64,
            chord_window: ChordWindow::default(),
            min_velocity: 0,
            history_capacity: 0,
            device_name: "MIDI Bus",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_enabled() {
        let window = ChordWindow::from_millis(50);
        assert!(window.is_enabled(), "Should be enabled");
        assert!(!ChordWindow::NONE.is_enabled(), "Should be disabled");
        let zero = ChordWindow::from_millis(0);
        assert!(!zero.is_enabled(), "Should be disabled");
    }

    #[test]
    fn queue_len_is_clamped() {
        let config = BusConfig {
            max_queue_len: QUEUE_CAPACITY * 2,
            ..Default::default()
        };
        assert_eq!(
            QUEUE_CAPACITY,
            config.queue_len(),
            "Expected left but got right"
        );

        let config = BusConfig {
            max_queue_len: 0,
            ..Default::default()
        };
        assert_eq!(1, config.queue_len(), "Expected left but got right");
    }
}
