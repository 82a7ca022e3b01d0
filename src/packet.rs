//! The E1.31 Data Packet: ACN Root, E1.31 Framing, and DMP layers over a
//! single 638-byte buffer. See the offset table in the crate's design
//! notes — every setter that changes the DMX payload length recomputes
//! the three flags-and-length fields and the DMP property-value count.

use crate::byte::{calculate_fal, u16_be, u16_be_bytes};
use crate::cid::Cid;
use crate::error::Error;

const BUFFER_LEN: usize = 638;
const HEADER_LEN: usize = 126;
const MAX_DMX_LEN: usize = 512;

const ACN_PREAMBLE: [u8; 16] = [
    0x00, 0x10, 0x00, 0x00, b'A', b'S', b'C', b'-', b'E', b'1', b'.', b'1', b'7', 0x00, 0x00, 0x00,
];
const ROOT_VECTOR: u32 = 0x0000_0004;
const FRAMING_VECTOR: u32 = 0x0000_0002;
const DMP_VECTOR: u8 = 0x02;
const DMP_ADDRESS_TYPE: u8 = 0xA1;
const DMP_ADDRESS_INCREMENT: u16 = 1;
const DEFAULT_PRIORITY: u8 = 100;
const MAX_PRIORITY: u8 = 200;

const OPT_PREVIEW: u8 = 1 << 7;
const OPT_STREAM_TERMINATED: u8 = 1 << 6;
const OPT_FORCE_SYNC: u8 = 1 << 5;

/// A single E1.31 Data Packet, backed by a fixed 638-byte buffer. The
/// buffer is always the full 638 bytes regardless of how much of it is
/// meaningful; `length` tracks the logical total.
#[derive(Clone)]
pub struct DataPacket {
    data: [u8; BUFFER_LEN],
    length: u16,
}

impl DataPacket {
    /// Build an empty packet: all constants filled in, default priority
    /// 100, zero-length DMX payload (total length 126).
    pub fn empty() -> Self {
        let mut p = DataPacket {
            data: [0u8; BUFFER_LEN],
            length: HEADER_LEN as u16,
        };
        p.data[0..16].copy_from_slice(&ACN_PREAMBLE);
        p.data[18..22].copy_from_slice(&ROOT_VECTOR.to_be_bytes());
        p.data[40..44].copy_from_slice(&FRAMING_VECTOR.to_be_bytes());
        p.data[117] = DMP_VECTOR;
        p.data[118] = DMP_ADDRESS_TYPE;
        p.data[121..123].copy_from_slice(&DMP_ADDRESS_INCREMENT.to_be_bytes());
        p.set_fal(HEADER_LEN as u16);
        p.data[108] = DEFAULT_PRIORITY;
        p
    }

    /// Decode a packet from raw wire bytes. Fails if shorter than the
    /// 126-byte header. Longer input is copied in full (the buffer is
    /// always 638 bytes); shorter input is right-padded with zeros. The
    /// logical length is derived from the DMP property-value count, not
    /// from the input slice's length, and is rejected if that puts the
    /// total outside the valid 126..=638 range.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < HEADER_LEN {
            return Err(Error::MalformedPacket);
        }
        let mut data = [0u8; BUFFER_LEN];
        let copy_len = raw.len().min(BUFFER_LEN);
        data[..copy_len].copy_from_slice(&raw[..copy_len]);

        let property_count = u16_be(data[123], data[124]);
        let length = property_count + (HEADER_LEN as u16 - 1);
        if !(HEADER_LEN as u16..=BUFFER_LEN as u16).contains(&length) {
            return Err(Error::MalformedPacket);
        }
        Ok(DataPacket { data, length })
    }

    /// Recompute the three FALs and the DMP property-value count for a
    /// new total packet `length`, and store that length.
    fn set_fal(&mut self, length: u16) {
        let (hi, lo) = calculate_fal(length - 16);
        self.data[16] = hi;
        self.data[17] = lo;
        let (hi, lo) = calculate_fal(length - 38);
        self.data[38] = hi;
        self.data[39] = lo;
        let (hi, lo) = calculate_fal(length - 115);
        self.data[115] = hi;
        self.data[116] = lo;
        let count = u16_be_bytes(length - 125);
        self.data[123..125].copy_from_slice(&count);
        self.length = length;
    }

    pub fn cid(&self) -> Cid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.data[22..38]);
        Cid::new(bytes)
    }

    pub fn set_cid(&mut self, cid: Cid) {
        self.data[22..38].copy_from_slice(cid.as_bytes());
    }

    /// The source name, up to the first NUL byte (or all 64 bytes if
    /// none is present).
    pub fn source_name(&self) -> String {
        let field = &self.data[44..108];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    /// Set the source name. Only the first 64 bytes of `name` are kept;
    /// the field is NUL-padded (and NUL-terminated if shorter than 64).
    pub fn set_source_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let copy_len = bytes.len().min(64);
        self.data[44..44 + copy_len].copy_from_slice(&bytes[..copy_len]);
        for b in &mut self.data[44 + copy_len..108] {
            *b = 0;
        }
    }

    pub fn priority(&self) -> u8 {
        self.data[108]
    }

    /// Set the priority. Rejects values above 200, leaving the prior
    /// value in place.
    pub fn set_priority(&mut self, priority: u8) -> Result<(), Error> {
        if priority > MAX_PRIORITY {
            return Err(Error::InvalidPriority);
        }
        self.data[108] = priority;
        Ok(())
    }

    pub fn sync_address(&self) -> u16 {
        u16_be(self.data[109], self.data[110])
    }

    pub fn set_sync_address(&mut self, sync: u16) {
        self.data[109..111].copy_from_slice(&u16_be_bytes(sync));
    }

    pub fn sequence(&self) -> u8 {
        self.data[111]
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.data[111] = sequence;
    }

    /// Increment the sequence number, wrapping mod 256.
    pub fn increment_sequence(&mut self) {
        self.data[111] = self.data[111].wrapping_add(1);
    }

    pub fn preview_data(&self) -> bool {
        self.options_bit(OPT_PREVIEW)
    }

    pub fn set_preview_data(&mut self, value: bool) {
        self.set_options_bit(OPT_PREVIEW, value);
    }

    pub fn stream_terminated(&self) -> bool {
        self.options_bit(OPT_STREAM_TERMINATED)
    }

    pub fn set_stream_terminated(&mut self, value: bool) {
        self.set_options_bit(OPT_STREAM_TERMINATED, value);
    }

    pub fn force_sync(&self) -> bool {
        self.options_bit(OPT_FORCE_SYNC)
    }

    pub fn set_force_sync(&mut self, value: bool) {
        self.set_options_bit(OPT_FORCE_SYNC, value);
    }

    fn options_bit(&self, mask: u8) -> bool {
        self.data[112] & mask != 0
    }

    fn set_options_bit(&mut self, mask: u8, value: bool) {
        if value {
            self.data[112] |= mask;
        } else {
            self.data[112] &= !mask;
        }
    }

    pub fn universe(&self) -> u16 {
        u16_be(self.data[113], self.data[114])
    }

    pub fn set_universe(&mut self, universe: u16) {
        self.data[113..115].copy_from_slice(&u16_be_bytes(universe));
    }

    pub fn dmx_start_code(&self) -> u8 {
        self.data[125]
    }

    pub fn set_dmx_start_code(&mut self, start_code: u8) {
        self.data[125] = start_code;
    }

    /// The DMX payload currently carried by this packet.
    pub fn data(&self) -> &[u8] {
        &self.data[HEADER_LEN..self.length as usize]
    }

    /// Set the DMX payload. Truncated at 512 bytes; padded with a
    /// trailing zero if the resulting length is odd. Recomputes the
    /// FALs and property-value count for the new total length.
    pub fn set_data(&mut self, payload: &[u8]) {
        let len = payload.len().min(MAX_DMX_LEN);
        let odd = len % 2 != 0;
        let total = HEADER_LEN + len + if odd { 1 } else { 0 };

        self.data[HEADER_LEN..HEADER_LEN + len].copy_from_slice(&payload[..len]);
        if odd {
            self.data[HEADER_LEN + len] = 0;
        }
        self.set_fal(total as u16);
    }

    /// The full serialized packet, ready to send on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }

    /// Total length in bytes of the serialized packet (126..=638).
    pub fn len(&self) -> u16 {
        self.length
    }
}

impl PartialEq for DataPacket {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for DataPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPacket")
            .field("cid", &self.cid())
            .field("source_name", &self.source_name())
            .field("universe", &self.universe())
            .field("priority", &self.priority())
            .field("sequence", &self.sequence())
            .field("sync_address", &self.sync_address())
            .field("stream_terminated", &self.stream_terminated())
            .field("len", &self.length)
            .field("data_len", &self.data().len())
            .finish()
    }
}
