//! Fixed 248-byte little-endian layout of one splat record.

use zerocopy::byteorder::little_endian::F32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::common::{RECORD_FIELDS, RECORD_SIZE};
use crate::error::ConversionError;
use crate::structures::PointRecord;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WireRecord {
    fields: [F32; RECORD_FIELDS],
}

const _: () = assert!(core::mem::size_of::<WireRecord>() == RECORD_SIZE);

#[inline]
fn to_wire(record: &PointRecord) -> WireRecord {
    WireRecord {
        fields: record.fields().map(F32::new),
    }
}

pub fn encode(record: &PointRecord) -> [u8; RECORD_SIZE] {
    let mut out = [0u8; RECORD_SIZE];
    out.copy_from_slice(to_wire(record).as_bytes());
    out
}

/// Appends the encoded record to `out`.
#[inline]
pub fn encode_into(record: &PointRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(to_wire(record).as_bytes());
}

pub fn decode(bytes: &[u8]) -> Result<PointRecord, ConversionError> {
    let wire = WireRecord::ref_from_bytes(bytes).map_err(|_| ConversionError::MalformedRecord {
        expected: RECORD_SIZE,
        actual: bytes.len(),
    })?;
    let fields = wire.fields.map(|f| f.get());
    Ok(PointRecord::from_fields(&fields))
}
