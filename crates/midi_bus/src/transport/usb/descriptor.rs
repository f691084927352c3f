//! Walks the type-length-value records of a USB configuration descriptor looking for an Audio
//! class, MIDI Streaming subclass interface and the inbound endpoint that belongs to it.

const DESCRIPTOR_INTERFACE: u8 = 0x04;
const DESCRIPTOR_ENDPOINT: u8 = 0x05;
const CLASS_AUDIO: u8 = 0x01;
const SUBCLASS_MIDI_STREAMING: u8 = 0x03;
const ENDPOINT_DIR_IN: u8 = 0x80;
const TRANSFER_BULK: u8 = 0x02;
const TRANSFER_INTERRUPT: u8 = 0x03;

/// The interface and inbound endpoint MIDI will be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MidiEndpoint {
    /// `bInterfaceNumber` of the interface to claim.
    pub interface: u8,
    /// `bAlternateSetting` of the interface to claim.
    pub alt_setting: u8,
    /// `bEndpointAddress`, direction bit included.
    pub address: u8,
    /// `wMaxPacketSize`, which sizes the transfer.
    pub max_packet_size: u16,
}

/// Tried when a device exposes no class-compliant MIDI Streaming interface, so that devices which
/// get their descriptors wrong still have a chance of working.
pub const FALLBACK_ENDPOINT: MidiEndpoint = MidiEndpoint {
    interface: 0,
    alt_setting: 0,
    address: 0x81,
    max_packet_size: 64,
};

/// Iterates the records of a descriptor, stopping at the first malformed length.
struct Records<'d> {
    data: &'d [u8],
}

impl<'d> Iterator for Records<'d> {
    type Item = &'d [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let len = usize::from(*self.data.first()?);
        if len < 2 || len > self.data.len() {
            return None;
        }
        let (record, rest) = self.data.split_at(len);
        self.data = rest;
        Some(record)
    }
}

/// Finds the first inbound bulk or interrupt endpoint of the first MIDI Streaming interface that
/// has one.
pub fn find_midi_endpoint(config: &[u8]) -> Option<MidiEndpoint> {
    // (interface, alternate setting) of the MIDI Streaming interface being scanned, if any
    let mut midi_interface: Option<(u8, u8)> = None;

    for record in (Records { data: config }) {
        match record[1] {
            DESCRIPTOR_INTERFACE if record.len() >= 9 => {
                let is_midi = record[5] == CLASS_AUDIO && record[6] == SUBCLASS_MIDI_STREAMING;
                midi_interface = is_midi.then_some((record[2], record[3]));
            }
            DESCRIPTOR_ENDPOINT if record.len() >= 7 => {
                let Some((interface, alt_setting)) = midi_interface else {
                    continue;
                };
                let address = record[2];
                let transfer_type = record[3] & 0x03;
                if address & ENDPOINT_DIR_IN != 0
                    && (transfer_type == TRANSFER_BULK || transfer_type == TRANSFER_INTERRUPT)
                {
                    return Some(MidiEndpoint {
                        interface,
                        alt_setting,
                        address,
                        max_packet_size: u16::from_le_bytes([record[4], record[5]]) & 0x07FF,
                    });
                }
            }
            _ => {}
        }
    }
    None
}
