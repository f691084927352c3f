//! USB host transport for class-compliant MIDI devices.
//!
//! [`UsbMidiHost`] runs as a dedicated task alongside the USB host stack: it waits for a device,
//! opens it, finds the MIDI Streaming interface in the configuration descriptor, claims it, and
//! then submits one long-lived inbound transfer over and over until the device goes away. Each
//! completed transfer is sliced into 4-byte USB-MIDI Event Packets and handed to the bus through
//! the [`UsbMidiState`] ring. [`UsbMidi`] is the side the bus polls.

mod descriptor;
pub use descriptor::*;

use super::{ConnectionWatch, Inbound, Transport, TransportError, TransportKind};
use crate::ring::FrameRing;
use core::{cell::Cell, fmt};
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};

/// Capacity, in Event Packets, of the ring between the host task and the bus.
pub const USB_RING_LEN: usize = 32;

/// Largest transfer the host task allocates, matching the high-speed bulk maximum packet size.
pub const MAX_TRANSFER_LEN: usize = 512;

/// Size of the buffer the configuration descriptor is read into.
pub const CONFIG_DESCRIPTOR_LEN: usize = 512;

/// Every USB-MIDI Event Packet is 32 bits long.
const EVENT_PACKET_LEN: usize = 4;

/// Errors reported by a [`UsbHostDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// The device was unplugged.
    DeviceGone,
    /// The device could not be opened.
    OpenFailed,
    /// The configuration descriptor could not be read.
    DescriptorUnreadable,
    /// The interface could not be claimed.
    ClaimFailed,
    /// No transfer could be allocated for the endpoint.
    TransferAllocFailed,
    /// A transfer completed with an error.
    TransferFailed,
    /// The endpoint stalled.
    Stall,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeviceGone => "device removed",
            Self::OpenFailed => "could not open device",
            Self::DescriptorUnreadable => "could not read configuration descriptor",
            Self::ClaimFailed => "could not claim MIDI interface",
            Self::TransferAllocFailed => "could not allocate transfer",
            Self::TransferFailed => "transfer failed",
            Self::Stall => "endpoint stalled",
        })
    }
}

/// The parts of a USB host stack the transport needs.
#[allow(async_fn_in_trait)]
pub trait UsbHostDriver {
    /// Handle to an opened device.
    type Device: Copy;

    /// Waits until a device is attached, returning its bus address.
    async fn wait_for_device(&mut self) -> u8;

    /// Opens the device at `address`.
    fn open(&mut self, address: u8) -> Result<Self::Device, UsbError>;

    /// Reads the active configuration descriptor into `buf`, returning its length.
    fn config_descriptor(
        &mut self,
        device: Self::Device,
        buf: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Claims an interface.
    fn claim_interface(
        &mut self,
        device: Self::Device,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), UsbError>;

    /// Allocates the long-lived inbound transfer for `endpoint`.
    fn alloc_transfer(
        &mut self,
        device: Self::Device,
        endpoint: u8,
        len: usize,
    ) -> Result<(), UsbError>;

    /// Submits the inbound transfer and waits for it to complete, returning the number of bytes
    /// received.
    async fn transfer_in(
        &mut self,
        device: Self::Device,
        endpoint: u8,
        buf: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Releases the device and everything allocated for it.
    fn close(&mut self, device: Self::Device);
}

#[derive(Debug, Clone, Copy, Default)]
struct Status {
    connected: bool,
    session: u32,
    error: Option<UsbError>,
}

/// State shared between the [`UsbMidiHost`] task and the [`UsbMidi`] transport.
pub struct UsbMidiState {
    ring: FrameRing<USB_RING_LEN>,
    status: Mutex<CriticalSectionRawMutex, Cell<Status>>,
}

impl Default for UsbMidiState {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbMidiState {
    /// Construct a new `UsbMidiState`; usable in a `static`.
    pub const fn new() -> Self {
        Self {
            ring: FrameRing::new(),
            status: Mutex::new(Cell::new(Status {
                connected: false,
                session: 0,
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

    /// Returns `true` while a MIDI device is attached and streaming.
    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    /// The most recent failure to bring up a device, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        self.status().error.map(TransportError::Usb)
    }

    /// Slices a completed transfer into Event Packets and queues each one. Packets whose header is
    /// zero (an unset Code Index Number) are padding and are skipped, as is any trailing partial
    /// packet. Returns the number of packets queued.
    pub fn deliver(&self, data: &[u8]) -> usize {
        let mut queued = 0;
        for packet in data.chunks_exact(EVENT_PACKET_LEN) {
            if packet[0] == 0 {
                continue;
            }
            if self.ring.push(packet) {
                queued += 1;
            } else {
                warn!("USB MIDI ring full, dropping packet");
            }
        }
        queued
    }

    /// Number of packets dropped because the bus fell behind.
    pub fn dropped(&self) -> u32 {
        self.ring.dropped()
    }
}

/// The task half of the USB transport: owns the host stack driver and feeds a [`UsbMidiState`].
pub struct UsbMidiHost<'a, D: UsbHostDriver> {
    driver: D,
    state: &'a UsbMidiState,
    transfer: [u8; MAX_TRANSFER_LEN],
}

impl<'a, D: UsbHostDriver> UsbMidiHost<'a, D> {
    /// Constructs a [`UsbMidiHost`].
    pub fn new(driver: D, state: &'a UsbMidiState) -> Self {
        Self {
            driver,
            state,
            transfer: [0; MAX_TRANSFER_LEN],
        }
    }

    /// Serves devices forever, one at a time.
    pub async fn run(&mut self) -> ! {
        loop {
            let address = self.driver.wait_for_device().await;
            info!("USB device attached at address {}", address);
            let _ = self.run_device(address).await;
        }
    }

    /// Brings up the device at `address` and streams from it until it is removed.
    ///
    /// Failures while bringing the device up are recorded (see [`UsbMidiState::last_error`]) and
    /// leave the transport disconnected.
    pub async fn run_device(&mut self, address: u8) -> Result<(), UsbError> {
        let device = match self.driver.open(address) {
            Ok(device) => device,
            Err(e) => return Err(self.fail(e)),
        };
        let result = self.stream(device).await;
        self.driver.close(device);
        self.state.update(|status| status.connected = false);
        info!("USB device detached");
        result.map_err(|e| self.fail(e))
    }

    fn fail(&self, e: UsbError) -> UsbError {
        error!("USB MIDI unavailable: {}", e);
        self.state.update(|status| {
            status.connected = false;
            status.error = Some(e);
        });
        e
    }

    /// Picks the endpoint to read from and claims its interface.
    fn configure(&mut self, device: D::Device) -> Result<MidiEndpoint, UsbError> {
        let mut config = [0_u8; CONFIG_DESCRIPTOR_LEN];
        let endpoint = match self.driver.config_descriptor(device, &mut config) {
            Ok(len) => find_midi_endpoint(&config[..len.min(CONFIG_DESCRIPTOR_LEN)]),
            Err(e) => {
                warn!("Could not read configuration descriptor: {}", e);
                None
            }
        };
        let endpoint = match endpoint {
            Some(endpoint) => {
                info!(
                    "Found MIDI Streaming interface {}, endpoint {}",
                    endpoint.interface, endpoint.address
                );
                endpoint
            }
            None => {
                warn!("No MIDI Streaming interface; using the default endpoint");
                FALLBACK_ENDPOINT
            }
        };
        self.driver
            .claim_interface(device, endpoint.interface, endpoint.alt_setting)?;
        Ok(endpoint)
    }

    async fn stream(&mut self, device: D::Device) -> Result<(), UsbError> {
        let endpoint = self.configure(device)?;
        let len = usize::from(endpoint.max_packet_size)
            .clamp(EVENT_PACKET_LEN, MAX_TRANSFER_LEN);
        self.driver.alloc_transfer(device, endpoint.address, len)?;

        self.state.update(|status| {
            status.connected = true;
            status.session = status.session.wrapping_add(1);
            status.error = None;
        });

        // submit, wait, resubmit; a failed transfer is simply submitted again
        loop {
            match self
                .driver
                .transfer_in(device, endpoint.address, &mut self.transfer[..len])
                .await
            {
                Ok(received) => {
                    self.state.deliver(&self.transfer[..received.min(len)]);
                }
                Err(UsbError::DeviceGone) => return Ok(()),
                Err(e) => {
                    debug!("USB transfer error ({}), resubmitting", e);
                }
            }
        }
    }
}

/// The bus-facing half of the USB transport.
pub struct UsbMidi<'a> {
    state: &'a UsbMidiState,
    watch: ConnectionWatch,
}

impl<'a> UsbMidi<'a> {
    /// Constructs a [`UsbMidi`] reading from `state`.
    pub fn new(state: &'a UsbMidiState) -> Self {
        Self {
            state,
            watch: ConnectionWatch::default(),
        }
    }

    /// See [`UsbMidiState::last_error`].
    pub fn last_error(&self) -> Option<TransportError> {
        self.state.last_error()
    }
}

impl Transport for UsbMidi<'_> {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
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
}
