//! A fixed-capacity queue of raw frames for handing bytes from a vendor stack's context (a driver
//! callback or a dedicated polling task) to the cooperative thread that runs the
//! [`Bus`][crate::Bus].
//!
//! Both ends take the same short critical section, which covers only an index update and a copy of
//! one [`RawFrame`]. When the queue is full the newest frame is dropped and [`FrameRing::push`]
//! reports failure; the producer never waits and the queue never grows, which bounds the time spent
//! in interrupt context.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};

/// Largest frame any transport hands over; sized for one USB-MIDI Event Packet.
pub const FRAME_LEN: usize = 4;

/// A small fixed-size byte array plus length: one slot of a [`FrameRing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawFrame {
    bytes: [u8; FRAME_LEN],
    len: u8,
}

impl RawFrame {
    /// An empty frame.
    pub const EMPTY: Self = Self {
        bytes: [0; FRAME_LEN],
        len: 0,
    };

    /// Copies `data` into a frame, or returns `None` if it does not fit.
    pub fn new(data: &[u8]) -> Option<Self> {
        if data.len() > FRAME_LEN {
            return None;
        }
        let mut frame = Self::EMPTY;
        frame.bytes[..data.len()].copy_from_slice(data);
        frame.len = data.len() as u8;
        Some(frame)
    }

    /// The bytes held by this frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Getter.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Returns `true` if the frame holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Slots<const N: usize> {
    frames: [RawFrame; N],
    /// next slot to read
    head: usize,
    len: usize,
    dropped: u32,
}

/// A circular buffer of `N` [`RawFrame`]s shared between one producer context and the consumer
/// thread.
pub struct FrameRing<const N: usize> {
    slots: Mutex<CriticalSectionRawMutex, RefCell<Slots<N>>>,
}

impl<const N: usize> Default for FrameRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameRing<N> {
    /// Construct an empty `FrameRing`; usable in a `static`.
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new(Slots {
                frames: [RawFrame::EMPTY; N],
                head: 0,
                len: 0,
                dropped: 0,
            })),
        }
    }

    /// Copies `data` into the next free slot. Returns `false`, leaving the queue untouched, if the
    /// queue is full or `data` is longer than [`FRAME_LEN`].
    pub fn push(&self, data: &[u8]) -> bool {
        let Some(frame) = RawFrame::new(data) else {
            return false;
        };
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if slots.len == N {
                slots.dropped = slots.dropped.wrapping_add(1);
                return false;
            }
            let tail = (slots.head + slots.len) % N;
            slots.frames[tail] = frame;
            slots.len += 1;
            true
        })
    }

    /// Copies out the oldest frame, if any.
    pub fn pop(&self) -> Option<RawFrame> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if slots.len == 0 {
                return None;
            }
            let frame = slots.frames[slots.head];
            slots.head = (slots.head + 1) % N;
            slots.len -= 1;
            Some(frame)
        })
    }

    /// Discards every pending frame.
    pub fn clear(&self) {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            slots.head = 0;
            slots.len = 0;
        });
    }

    /// Number of frames waiting to be read.
    pub fn len(&self) -> usize {
        self.slots.lock(|slots| slots.borrow().len)
    }

    /// Returns `true` if no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Getter.
    pub fn capacity(&self) -> usize {
        N
    }

    /// Number of frames dropped because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.slots.lock(|slots| slots.borrow().dropped)
    }
}
