//! This crate contains the architecture-agnostic core of a MIDI message bus for microcontroller
//! firmware. MIDI traffic arrives on several independent transports (a USB host class driver, a
//! Bluetooth LE MIDI service, a 5-pin DIN serial port, and a connectionless wireless broadcast
//! channel), each driven from its own context. The [`bus::Bus`] drains them on a single cooperative
//! thread and normalizes everything into one ordered stream of [`event::MusicEvent`]s, tracking
//! which notes are held and which were struck together as a chord.
//!
//! Vendor communication stacks are reached only through the small driver traits in [`transport`];
//! board bring-up lives elsewhere.

#![deny(missing_docs)]
#![no_std]

extern crate alloc;

// must come first so the macros are visible to the modules below
#[macro_use]
mod fmt;

pub mod bus;
pub mod configuration;
pub mod event;
pub mod message;
/// Data structures for tracking the notes and chords the bus has seen.
pub mod midi_state;
pub mod ring;
pub mod transport;

pub use bus::Bus;
pub use configuration::{BusConfig, ChordWindow};
pub use event::{EventKind, MusicEvent};
pub use transport::{AnyTransport, Inbound, Transport, TransportError, TransportKind};
