//! Wire framing
//!
//! Every payload on the orders topic is `[0x00][schema id: i32 BE][datum]`.

use bytes::{Buf, BufMut, BytesMut};

use super::{Result, SchemaError};

/// First byte of every framed payload
pub const MAGIC_BYTE: u8 = 0x00;

const HEADER_LEN: usize = 5;

/// Prefix an encoded datum with the magic byte and writer schema id
pub fn frame(schema_id: i32, datum: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + datum.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_i32(schema_id);
    buf.put_slice(datum);
    buf.to_vec()
}

/// Split a framed payload into its writer schema id and datum
pub fn unframe(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < HEADER_LEN {
        return Err(SchemaError::Framing(format!(
            "payload of {} bytes is shorter than the {} byte header",
            payload.len(),
            HEADER_LEN
        )));
    }

    if payload[0] != MAGIC_BYTE {
        return Err(SchemaError::Framing(format!(
            "invalid magic byte: expected 0x00, got 0x{:02x}",
            payload[0]
        )));
    }

    let mut id_bytes = &payload[1..HEADER_LEN];
    Ok((id_bytes.get_i32(), &payload[HEADER_LEN..]))
}
