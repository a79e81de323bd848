use std::{io::Cursor, ops::Range};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::utils::buf::ChainedBuf;

use super::{DecodingError, EncodingError};

pub const PACKET_HDR_LEN: usize = 1;

/// Width of a variable-length header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum WidthClass {
    None = 0,
    U8 = 1,
    U16 = 2,
    U32 = 3,
    U64 = 4,
}

impl WidthClass {
    /// The smallest class that holds `value`; `0` is not written at all.
    #[must_use]
    pub fn fit(value: u64) -> Self {
        if value == 0 {
            WidthClass::None
        } else if value <= u8::MAX as u64 {
            WidthClass::U8
        } else if value <= u16::MAX as u64 {
            WidthClass::U16
        } else if value <= u32::MAX as u64 {
            WidthClass::U32
        } else {
            WidthClass::U64
        }
    }

    #[must_use]
    #[inline]
    pub fn byte_len(&self) -> usize {
        match self {
            WidthClass::None => 0,
            WidthClass::U8 => 1,
            WidthClass::U16 => 2,
            WidthClass::U32 => 4,
            WidthClass::U64 => 8,
        }
    }

    fn write(&self, wtr: &mut &mut [u8], value: u64) -> Result<(), EncodingError> {
        let res = match self {
            WidthClass::None => Ok(()),
            WidthClass::U8 => wtr.write_u8(value as u8),
            WidthClass::U16 => wtr.write_u16::<NativeEndian>(value as u16),
            WidthClass::U32 => wtr.write_u32::<NativeEndian>(value as u32),
            WidthClass::U64 => wtr.write_u64::<NativeEndian>(value),
        };
        res.map_err(|_e| EncodingError::NotEnoughSpace)
    }

    fn read(&self, rdr: &mut Cursor<&[u8]>) -> Option<u64> {
        let res = match self {
            WidthClass::None => Ok(0),
            WidthClass::U8 => rdr.read_u8().map(u64::from),
            WidthClass::U16 => rdr.read_u16::<NativeEndian>().map(u64::from),
            WidthClass::U32 => rdr.read_u32::<NativeEndian>().map(u64::from),
            WidthClass::U64 => rdr.read_u64::<NativeEndian>(),
        };
        res.ok()
    }
}

/// Header of one packet: an ack sub-record and a data sub-record, each optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    ack: u64,
    data_len: u64,
}

pub struct PacketHeaderBuilder {
    pub ack: u64,
    pub data_len: u64,
}

impl PacketHeaderBuilder {
    pub fn build(self) -> PacketHeader {
        let this = PacketHeader {
            ack: self.ack,
            data_len: self.data_len,
        };
        this.check_rep();
        this
    }
}

/// A packet found at the start of a byte window.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedPacket {
    pub hdr: PacketHeader,
    /// Whether the header carried an ack field.
    pub has_ack: bool,
    /// Position of the payload within the window.
    pub data: Range<usize>,
    /// Header, fields and payload; the amount to drain once handled.
    pub len: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Packet(DecodedPacket),
    /// The window ends inside the packet.
    Insufficient,
}

impl PacketHeader {
    #[inline]
    fn check_rep(&self) {}

    #[must_use]
    #[inline]
    pub fn ack(&self) -> u64 {
        self.ack
    }

    #[must_use]
    #[inline]
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    #[must_use]
    #[inline]
    pub fn ack_class(&self) -> WidthClass {
        WidthClass::fit(self.ack)
    }

    #[must_use]
    #[inline]
    pub fn data_class(&self) -> WidthClass {
        WidthClass::fit(self.data_len)
    }

    /// Bits 7..4 select the ack width, bits 3..0 the data-length width.
    #[must_use]
    pub fn hdr_byte(&self) -> u8 {
        let ack: u8 = self.ack_class().into();
        let data: u8 = self.data_class().into();
        (ack << 4) | data
    }

    /// Bytes taken by the header byte and both fields, payload excluded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PACKET_HDR_LEN + self.ack_class().byte_len() + self.data_class().byte_len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.encoded_len()];
        let written = self.write_to(&mut bytes);
        assert_eq!(written, Ok(bytes.len()));
        bytes
    }

    /// Writes the header byte and fields into `buf`, returning the number of bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, EncodingError> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(EncodingError::NotEnoughSpace);
        }
        let mut wtr = &mut buf[..len];
        wtr.write_u8(self.hdr_byte())
            .map_err(|_e| EncodingError::NotEnoughSpace)?;
        self.ack_class().write(&mut wtr, self.ack)?;
        self.data_class().write(&mut wtr, self.data_len)?;
        assert!(wtr.is_empty());
        Ok(len)
    }

    /// Encodes the header in place at the back of `buf`.
    pub fn append_to(&self, buf: &mut ChainedBuf) {
        let region = buf.allocate(self.encoded_len());
        let written = self.write_to(region);
        assert_eq!(written, Ok(self.encoded_len()));
    }

    /// Decodes the header byte and both fields at `window[0]`, leaving the payload alone.
    ///
    /// Returns the header and its encoded length, or `None` while the fields are incomplete.
    pub fn decode_hdr(window: &[u8]) -> Result<Option<(PacketHeader, usize)>, DecodingError> {
        let mut rdr = Cursor::new(window);
        let hdr_byte = match rdr.read_u8() {
            Ok(x) => x,
            Err(_) => return Ok(None),
        };
        let ack_class = WidthClass::try_from(hdr_byte >> 4).map_err(|_e| {
            DecodingError::Malformed {
                field: "ack",
                class: hdr_byte >> 4,
            }
        })?;
        let data_class = WidthClass::try_from(hdr_byte & 0x0f).map_err(|_e| {
            DecodingError::Malformed {
                field: "data_len",
                class: hdr_byte & 0x0f,
            }
        })?;

        let ack = match ack_class.read(&mut rdr) {
            Some(x) => x,
            None => return Ok(None),
        };
        let data_len = match data_class.read(&mut rdr) {
            Some(x) => x,
            None => return Ok(None),
        };

        let hdr = PacketHeader { ack, data_len };
        hdr.check_rep();
        Ok(Some((hdr, rdr.position() as usize)))
    }

    /// Decodes the packet starting at `window[0]`.
    pub fn decode(window: &[u8]) -> Result<Decoded, DecodingError> {
        let (hdr, data_start) = match Self::decode_hdr(window)? {
            Some(x) => x,
            None => return Ok(Decoded::Insufficient),
        };

        let rest = (window.len() - data_start) as u64;
        if rest < hdr.data_len {
            return Ok(Decoded::Insufficient);
        }
        let data_end = data_start + hdr.data_len as usize;

        Ok(Decoded::Packet(DecodedPacket {
            hdr,
            has_ack: window[0] >> 4 != 0,
            data: data_start..data_end,
            len: data_end,
        }))
    }
}
