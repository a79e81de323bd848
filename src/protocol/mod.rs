//! # Packet
//!
//! ```text
//! 0       4       8 (BIT)
//! +-------+-------+
//! |  ack  | data  |   header byte: width class of each field
//! +-------+-------+
//! |  ack offset   |   0, 1, 2, 4 or 8 bytes
//! +---------------+
//! |  data len     |   0, 1, 2, 4 or 8 bytes
//! +---------------+
//! |               |
//! |     data      |   `data len` bytes
//! |               |
//! +---------------+
//! ```
//!
//! Width classes: `0` none, `1` u8, `2` u16, `3` u32, `4` u64. Fields are written in native byte
//! order, so both endpoints must share it.
//!
//! Packets are concatenated back to back. A transport delivery may end in the middle of a packet.
//!
//! # Invariants
//!
//! - a field is omitted exactly when its value is `0`
//! - class values `5..=15` are malformed

pub mod message;
pub mod packet_hdr;

#[derive(Debug, PartialEq, Eq)]
pub enum DecodingError {
    Malformed { field: &'static str, class: u8 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum EncodingError {
    NotEnoughSpace,
}
