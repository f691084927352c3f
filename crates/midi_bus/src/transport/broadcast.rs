//! Connectionless wireless broadcast transport.
//!
//! Payloads are raw MIDI messages of at most three bytes with no header, one message per link-layer
//! datagram. The vendor link delivers received datagrams through a callback that carries no context
//! argument, so receivers are found through a [`BroadcastRegistry`]: each [`BroadcastMidi`]
//! registers its [`BroadcastState`] on [`BroadcastMidi::begin`] and [`on_broadcast_receive`]
//! dispatches to every registered state.

use super::{ConnectionWatch, Inbound, Transport, TransportError, TransportKind};
use crate::ring::FrameRing;
use core::{
    cell::{Cell, RefCell},
    fmt,
};
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use heapless::Vec;

/// Link-layer address of a peer.
pub type PeerAddress = [u8; 6];

/// Address every peer in range receives.
pub const BROADCAST_ADDRESS: PeerAddress = [0xFF; 6];

/// Capacity, in messages, of the ring between the link's receive callback and the bus.
pub const BROADCAST_RING_LEN: usize = 16;

/// Largest message carried; System Exclusive is not supported.
pub const MAX_BROADCAST_PAYLOAD: usize = 3;

/// Unicast peers a single transport can address.
pub const MAX_PEERS: usize = 4;

/// Transports the process-wide [`BROADCAST_DISPATCHER`] can hold.
pub const MAX_BROADCAST_LISTENERS: usize = 4;

/// Errors reported by a [`BroadcastLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// The link could not be brought up.
    InitFailed,
    /// The link refused the peer.
    PeerRejected,
    /// No room for another unicast peer.
    PeerTableFull,
    /// The datagram was not sent.
    SendFailed,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InitFailed => "link initialization failed",
            Self::PeerRejected => "peer rejected",
            Self::PeerTableFull => "peer table full",
            Self::SendFailed => "send failed",
        })
    }
}

/// The parts of a connectionless link the transport needs.
pub trait BroadcastLink {
    /// Brings the link up. Received datagrams are expected to reach [`on_broadcast_receive`] (or
    /// [`BroadcastRegistry::dispatch`]) from then on.
    fn init(&mut self) -> Result<(), LinkError>;

    /// Registers a unicast peer with the link.
    fn add_peer(&mut self, peer: PeerAddress) -> Result<(), LinkError>;

    /// Sends one datagram to `peer`.
    fn send(&mut self, peer: PeerAddress, data: &[u8]) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Status {
    ready: bool,
    error: Option<TransportError>,
}

/// State shared between the link's receive callback and the [`BroadcastMidi`] transport.
pub struct BroadcastState {
    ring: FrameRing<BROADCAST_RING_LEN>,
    status: Mutex<CriticalSectionRawMutex, Cell<Status>>,
}

impl Default for BroadcastState {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastState {
    /// Construct a new `BroadcastState`; usable in a `static`.
    pub const fn new() -> Self {
        Self {
            ring: FrameRing::new(),
            status: Mutex::new(Cell::new(Status {
                ready: false,
                error: None,
            })),
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

    /// Queues a received datagram. Returns `false` if it was not queued: the link is down, the
    /// payload is empty or too long, or the ring is full.
    pub fn deliver(&self, sender: &PeerAddress, data: &[u8]) -> bool {
        if !self.status().ready {
            return false;
        }
        if data.is_empty() || data.len() > MAX_BROADCAST_PAYLOAD {
            debug!("Ignoring {} byte datagram from {:?}", data.len(), sender);
            return false;
        }
        if !self.ring.push(data) {
            warn!("Broadcast MIDI ring full, dropping message");
            return false;
        }
        true
    }

    /// Returns `true` once the link is up.
    pub fn is_connected(&self) -> bool {
        self.status().ready
    }

    /// The most recent failure to bring up the link or register with the dispatcher, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        self.status().error
    }

    /// Number of datagrams dropped because the bus fell behind.
    pub fn dropped(&self) -> u32 {
        self.ring.dropped()
    }
}

/// Identifies a registration with a [`BroadcastRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BroadcastHandle(u8);

struct Listeners<const N: usize> {
    entries: Vec<(BroadcastHandle, &'static BroadcastState), N>,
    next: u8,
}

/// Routes received datagrams to every registered [`BroadcastState`].
pub struct BroadcastRegistry<const N: usize> {
    listeners: Mutex<CriticalSectionRawMutex, RefCell<Listeners<N>>>,
}

impl<const N: usize> Default for BroadcastRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BroadcastRegistry<N> {
    /// Construct an empty `BroadcastRegistry`; usable in a `static`.
    pub const fn new() -> Self {
        Self {
            listeners: Mutex::new(RefCell::new(Listeners {
                entries: Vec::new(),
                next: 0,
            })),
        }
    }

    /// Adds `state` to the set that receives datagrams.
    pub fn register(
        &self,
        state: &'static BroadcastState,
    ) -> Result<BroadcastHandle, TransportError> {
        self.listeners.lock(|listeners| {
            let mut listeners = listeners.borrow_mut();
            let mut candidate = listeners.next;
            while listeners.entries.iter().any(|(h, _)| h.0 == candidate) {
                candidate = candidate.wrapping_add(1);
            }
            let handle = BroadcastHandle(candidate);
            listeners
                .entries
                .push((handle, state))
                .map_err(|_| TransportError::RegistryFull)?;
            listeners.next = candidate.wrapping_add(1);
            Ok(handle)
        })
    }

    /// Removes a registration. Returns `false` if `handle` was not registered.
    pub fn unregister(&self, handle: BroadcastHandle) -> bool {
        self.listeners.lock(|listeners| {
            let mut listeners = listeners.borrow_mut();
            let before = listeners.entries.len();
            listeners.entries.retain(|(h, _)| *h != handle);
            listeners.entries.len() != before
        })
    }

    /// Number of registered states.
    pub fn len(&self) -> usize {
        self.listeners
            .lock(|listeners| listeners.borrow().entries.len())
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers a received datagram to every registered state, returning how many queued it.
    pub fn dispatch(&self, sender: &PeerAddress, data: &[u8]) -> usize {
        // copied out so each ring's own lock is taken outside this one
        let targets: Vec<&'static BroadcastState, N> = self.listeners.lock(|listeners| {
            let listeners = listeners.borrow();
            listeners.entries.iter().map(|(_, state)| *state).collect()
        });
        targets
            .iter()
            .filter(|state| state.deliver(sender, data))
            .count()
    }
}

/// The process-wide registry [`on_broadcast_receive`] dispatches through.
pub static BROADCAST_DISPATCHER: BroadcastRegistry<MAX_BROADCAST_LISTENERS> =
    BroadcastRegistry::new();

/// Receive callback for vendor links that cannot carry a context pointer.
pub fn on_broadcast_receive(sender: &PeerAddress, data: &[u8]) {
    BROADCAST_DISPATCHER.dispatch(sender, data);
}

/// The bus-facing half of the broadcast transport.
pub struct BroadcastMidi<'a> {
    state: &'static BroadcastState,
    link: &'a mut dyn BroadcastLink,
    peers: Vec<PeerAddress, MAX_PEERS>,
    handle: Option<BroadcastHandle>,
    watch: ConnectionWatch,
}

impl<'a> BroadcastMidi<'a> {
    /// Constructs a [`BroadcastMidi`] over `state`, sending through `link`.
    pub fn new(state: &'static BroadcastState, link: &'a mut dyn BroadcastLink) -> Self {
        Self {
            state,
            link,
            peers: Vec::new(),
            handle: None,
            watch: ConnectionWatch::default(),
        }
    }

    fn fail(&self, e: TransportError) -> TransportError {
        error!("Broadcast MIDI unavailable: {}", e);
        self.state.update(|status| status.error = Some(e));
        e
    }

    /// Brings up the link and registers with `registry` so received datagrams reach this transport.
    /// On failure the error is recorded and the transport stays disconnected.
    pub fn begin<const N: usize>(
        &mut self,
        registry: &BroadcastRegistry<N>,
    ) -> Result<(), TransportError> {
        if let Err(e) = self.link.init() {
            return Err(self.fail(e.into()));
        }
        let handle = match registry.register(self.state) {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(e)),
        };
        self.handle = Some(handle);
        self.state.update(|status| {
            status.ready = true;
            status.error = None;
        });
        info!("Broadcast MIDI link up");
        Ok(())
    }

    /// Stops receiving through `registry`. The link itself is left to its owner.
    pub fn end<const N: usize>(&mut self, registry: &BroadcastRegistry<N>) {
        if let Some(handle) = self.handle.take() {
            registry.unregister(handle);
        }
        self.state.update(|status| status.ready = false);
        self.state.ring.clear();
    }

    /// Adds a unicast peer. Once any peer is added, sends go to the peers instead of
    /// [`BROADCAST_ADDRESS`].
    pub fn add_peer(&mut self, peer: PeerAddress) -> Result<(), TransportError> {
        if self.peers.contains(&peer) {
            return Ok(());
        }
        if self.peers.is_full() {
            return Err(LinkError::PeerTableFull.into());
        }
        self.link.add_peer(peer)?;
        self.peers.push(peer).map_err(|_| LinkError::PeerTableFull)?;
        Ok(())
    }

    /// Registered unicast peers.
    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    /// See [`BroadcastState::last_error`].
    pub fn last_error(&self) -> Option<TransportError> {
        self.state.last_error()
    }
}

impl Transport for BroadcastMidi<'_> {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn poll(&mut self, sink: &mut dyn FnMut(Inbound<'_>)) {
        let ready = self.state.is_connected();
        if ready {
            self.watch.update(true, 0, sink);
        }
        while let Some(frame) = self.state.ring.pop() {
            sink(Inbound::Data(frame.as_bytes()));
        }
        if !ready {
            self.watch.update(false, 0, sink);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Succeeds if the broadcast, or at least one unicast send, was accepted by the link.
    fn send(&mut self, bytes: &[u8]) -> bool {
        if !self.state.is_connected() || bytes.is_empty() || bytes.len() > MAX_BROADCAST_PAYLOAD {
            return false;
        }
        if self.peers.is_empty() {
            return self.link.send(BROADCAST_ADDRESS, bytes).is_ok();
        }
        let mut sent = false;
        for peer in self.peers.iter() {
            match self.link.send(*peer, bytes) {
                Ok(()) => sent = true,
                Err(e) => warn!("Broadcast MIDI send to {:?} failed: {}", peer, e),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec as StdVec;

    const KEYS: PeerAddress = [0x24, 0x6F, 0x28, 0x01, 0x02, 0x03];
    const PADS: PeerAddress = [0x24, 0x6F, 0x28, 0x04, 0x05, 0x06];

    #[derive(Default)]
    struct FakeLink {
        init_fails: bool,
        sent: StdVec<(PeerAddress, StdVec<u8>)>,
        peers: StdVec<PeerAddress>,
    }

    impl BroadcastLink for FakeLink {
        fn init(&mut self) -> Result<(), LinkError> {
            if self.init_fails {
                Err(LinkError::InitFailed)
            } else {
                Ok(())
            }
        }

        fn add_peer(&mut self, peer: PeerAddress) -> Result<(), LinkError> {
            self.peers.push(peer);
            Ok(())
        }

        fn send(&mut self, peer: PeerAddress, data: &[u8]) -> Result<(), LinkError> {
            self.sent.push((peer, data.to_vec()));
            Ok(())
        }
    }

    fn drain(transport: &mut BroadcastMidi<'_>) -> StdVec<StdVec<u8>> {
        let mut messages = StdVec::new();
        transport.poll(&mut |inbound| {
            if let Inbound::Data(bytes) = inbound {
                messages.push(bytes.to_vec());
            }
        });
        messages
    }

    #[test]
    fn dispatch_reaches_every_registered_state() {
        static FIRST: BroadcastState = BroadcastState::new();
        static SECOND: BroadcastState = BroadcastState::new();
        let registry: BroadcastRegistry<2> = BroadcastRegistry::new();
        let mut first_link = FakeLink::default();
        let mut second_link = FakeLink::default();
        let mut a = BroadcastMidi::new(&FIRST, &mut first_link);
        let mut b = BroadcastMidi::new(&SECOND, &mut second_link);
        a.begin(&registry).expect("first should register");
        b.begin(&registry).expect("second should register");

        assert_eq!(2, registry.dispatch(&KEYS, &[0x90, 0x3C, 0x64]));
        assert_eq!(std::vec![std::vec![0x90, 0x3C, 0x64]], drain(&mut a));
        assert_eq!(std::vec![std::vec![0x90, 0x3C, 0x64]], drain(&mut b));

        a.end(&registry);
        assert_eq!(1, registry.len());
        assert_eq!(1, registry.dispatch(&KEYS, &[0x80, 0x3C, 0x00]));
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn registry_rejects_when_full() {
        static FIRST: BroadcastState = BroadcastState::new();
        static SECOND: BroadcastState = BroadcastState::new();
        let registry: BroadcastRegistry<1> = BroadcastRegistry::new();
        let mut first_link = FakeLink::default();
        let mut second_link = FakeLink::default();
        let mut a = BroadcastMidi::new(&FIRST, &mut first_link);
        let mut b = BroadcastMidi::new(&SECOND, &mut second_link);

        assert!(a.begin(&registry).is_ok());
        assert_eq!(Err(TransportError::RegistryFull), b.begin(&registry));
        assert_eq!(Some(TransportError::RegistryFull), b.last_error());
        assert!(!b.is_connected());
    }

    #[test]
    fn handles_are_not_reused_while_registered() {
        static STATE: BroadcastState = BroadcastState::new();
        let registry: BroadcastRegistry<2> = BroadcastRegistry::new();
        let first = registry.register(&STATE).expect("room for one");
        let second = registry.register(&STATE).expect("room for two");
        assert_ne!(first, second);
        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
    }

    #[test]
    fn oversized_and_empty_datagrams_are_dropped() {
        static STATE: BroadcastState = BroadcastState::new();
        let registry: BroadcastRegistry<1> = BroadcastRegistry::new();
        let mut link = FakeLink::default();
        let mut transport = BroadcastMidi::new(&STATE, &mut link);
        transport.begin(&registry).expect("should register");

        assert_eq!(0, registry.dispatch(&KEYS, &[0xF0, 0x7E, 0x7F, 0xF7]));
        assert_eq!(0, registry.dispatch(&KEYS, &[]));
        assert!(drain(&mut transport).is_empty());
    }

    #[test]
    fn init_failure_leaves_transport_disconnected() {
        static STATE: BroadcastState = BroadcastState::new();
        let registry: BroadcastRegistry<1> = BroadcastRegistry::new();
        let mut link = FakeLink {
            init_fails: true,
            ..Default::default()
        };
        let mut transport = BroadcastMidi::new(&STATE, &mut link);

        assert_eq!(
            Err(TransportError::Link(LinkError::InitFailed)),
            transport.begin(&registry)
        );
        assert!(registry.is_empty());
        assert!(!transport.send(&[0x90, 0x3C, 0x64]));
    }

    #[test]
    fn sends_to_broadcast_address_until_peers_are_added() {
        static STATE: BroadcastState = BroadcastState::new();
        let registry: BroadcastRegistry<1> = BroadcastRegistry::new();
        let mut link = FakeLink::default();
        {
            let mut transport = BroadcastMidi::new(&STATE, &mut link);
            transport.begin(&registry).expect("should register");

            assert!(transport.send(&[0x90, 0x3C, 0x64]));
            let sysex = [0xF0, 0x7E, 0x7F, 0xF7];
            assert!(!transport.send(&sysex), "Only 3 bytes fit a datagram");

            transport.add_peer(KEYS).expect("peer should be accepted");
            transport.add_peer(PADS).expect("peer should be accepted");
            transport.add_peer(KEYS).expect("duplicate peer is ignored");
            assert!(transport.send(&[0xC0, 0x05]));
            assert_eq!(2, transport.peers().len());
        }

        assert_eq!(
            std::vec![
                (BROADCAST_ADDRESS, std::vec![0x90, 0x3C, 0x64]),
                (KEYS, std::vec![0xC0, 0x05]),
                (PADS, std::vec![0xC0, 0x05]),
            ],
            link.sent,
            "Expected left but got right"
        );
        assert_eq!(std::vec![KEYS, PADS], link.peers);
    }

    #[test]
    fn context_free_callback_uses_process_wide_dispatcher() {
        static STATE: BroadcastState = BroadcastState::new();
        let handle = BROADCAST_DISPATCHER.register(&STATE).expect("room");
        STATE.update(|status| status.ready = true);

        on_broadcast_receive(&PADS, &[0xB0, 0x07, 0x50]);

        assert_eq!(1, STATE.ring.len());
        assert!(BROADCAST_DISPATCHER.unregister(handle));
    }
}
