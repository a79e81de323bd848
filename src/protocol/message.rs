//! Application message framing carried inside the RDT byte stream.
//!
//! ```text
//! 0               4 (BYTE)
//! +---------------+
//! |   len (u32)   |   native byte order
//! +---------------+
//! |     body      |
//! +---------------+
//! ```

use std::{io::Cursor, ops::Range};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use super::EncodingError;

pub const MESSAGE_HDR_LEN: usize = 4;

pub fn encode(msg: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let len = u32::try_from(msg.len()).map_err(|_e| EncodingError::NotEnoughSpace)?;
    let mut bytes = Vec::with_capacity(MESSAGE_HDR_LEN + msg.len());
    bytes
        .write_u32::<NativeEndian>(len)
        .map_err(|_e| EncodingError::NotEnoughSpace)?;
    bytes.extend_from_slice(msg);
    Ok(bytes)
}

/// Finds the first whole message in `window`.
///
/// Returns the body's position and the number of bytes the message occupies, or `None` while
/// the message is still incomplete.
#[must_use]
pub fn decode(window: &[u8]) -> Option<(Range<usize>, usize)> {
    let mut rdr = Cursor::new(window);
    let len = rdr.read_u32::<NativeEndian>().ok()? as usize;
    let end = MESSAGE_HDR_LEN.checked_add(len)?;
    if window.len() < end {
        return None;
    }
    Some((MESSAGE_HDR_LEN..end, end))
}
