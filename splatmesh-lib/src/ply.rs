use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use foldhash::HashMap;
use foldhash::HashMapExt;
use tracing::{debug, info};

use crate::codec;
use crate::common::{
    PLY_END_HEADER, PLY_FORMAT, PLY_MAGIC, PROPERTY_NAMES, RECORD_FIELDS, RECORD_SIZE,
};
use crate::error::ConversionError;
use crate::filter;
use crate::structures::{PointRecord, PointSet};

/// Header for `alive_count` vertices. Always `\n`-terminated lines, whatever the host platform.
pub fn header(alive_count: usize) -> String {
    let mut out = String::with_capacity(32 + RECORD_FIELDS * 24);
    out.push_str(PLY_MAGIC);
    out.push('\n');
    out.push_str(PLY_FORMAT);
    out.push('\n');
    // Writing into a String cannot fail.
    let _ = writeln!(out, "element vertex {}", alive_count);
    for name in PROPERTY_NAMES {
        let _ = writeln!(out, "property float {}", name);
    }
    out.push_str(PLY_END_HEADER);
    out.push('\n');
    out
}

/// Writes header and surviving records to `out`, returning the number of records written.
pub fn write_ply<W: Write>(set: &PointSet, out: &mut W) -> io::Result<usize> {
    let survivors = filter::select(set);
    out.write_all(header(survivors.len()).as_bytes())?;

    let mut body = Vec::with_capacity(survivors.len() * RECORD_SIZE);
    for &i in &survivors {
        codec::encode_into(&set.records[i], &mut body);
    }
    out.write_all(&body)?;
    Ok(survivors.len())
}

/// Creates or overwrites `destination` with the binary PLY of the set's live points.
pub fn export(set: &PointSet, destination: &Path) -> Result<usize, ConversionError> {
    let file =
        File::create(destination).map_err(|e| ConversionError::io_at(destination, e))?;
    let mut writer = BufWriter::new(file);
    let alive = write_ply(set, &mut writer).map_err(|e| ConversionError::io_at(destination, e))?;
    writer
        .flush()
        .map_err(|e| ConversionError::io_at(destination, e))?;

    debug!(
        total = set.len(),
        deleted = set.deleted.count_deleted(),
        "filtered point set"
    );
    info!("Exported PLY {} with {} splats", destination.display(), alive);
    Ok(alive)
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            Some(&buffer[start..start + pos])
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

#[inline(always)]
fn bytes_to_f32(data: &[u8], field_name: &str) -> Result<f32, ConversionError> {
    Ok(f32::from_le_bytes(data.try_into().map_err(|e| {
        ConversionError::MalformedPly(format!("Byte conversion error for {}: {}", field_name, e))
    })?))
}

#[inline]
fn is_optional(name: &str) -> bool {
    matches!(name, "nx" | "ny" | "nz") || name.starts_with("f_rest_")
}

/// Parses a binary little-endian splat PLY. Properties may come in any order; normals and
/// higher-order color terms default to zero when absent. Every record comes back not deleted.
pub fn read_point_set(raw_data: &[u8]) -> Result<PointSet, ConversionError> {
    let mut offset = 0;

    let line1 = next_line(raw_data, &mut offset)
        .ok_or_else(|| ConversionError::MalformedPly("No 'ply' line".to_string()))?;
    if line1 != PLY_MAGIC.as_bytes() {
        return Err(ConversionError::MalformedPly(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let line2 = next_line(raw_data, &mut offset)
        .ok_or_else(|| ConversionError::MalformedPly("Missing format line".to_string()))?;
    if line2 != PLY_FORMAT.as_bytes() {
        return Err(ConversionError::MalformedPly(
            "Unsupported .ply format (only binary_little_endian 1.0 is supported)".to_string(),
        ));
    }

    let mut num_points: Option<usize> = None;
    let mut field_names = Vec::new();
    loop {
        let line = next_line(raw_data, &mut offset).ok_or_else(|| {
            ConversionError::MalformedPly("No 'end_header' found before EOF".to_string())
        })?;

        if line == PLY_END_HEADER.as_bytes() {
            break;
        }
        if line.starts_with(b"comment") || line.starts_with(b"obj_info") {
            continue;
        }
        if let Some(num_str) = line.strip_prefix(b"element vertex ") {
            let s = std::str::from_utf8(num_str)
                .map_err(|e| ConversionError::MalformedPly(format!("UTF-8 error: {}", e)))?
                .trim();
            num_points = Some(
                s.parse()
                    .map_err(|e| ConversionError::MalformedPly(format!("Parse error: {}", e)))?,
            );
            continue;
        }
        if num_points.is_none() {
            return Err(ConversionError::MalformedPly(
                "Missing 'element vertex' definition".to_string(),
            ));
        }
        let raw_name = line.strip_prefix(b"property float ").ok_or_else(|| {
            ConversionError::MalformedPly(format!(
                "Unsupported property line: {}",
                String::from_utf8_lossy(line)
            ))
        })?;
        let name = std::str::from_utf8(raw_name).map_err(|e| {
            ConversionError::MalformedPly(format!("UTF-8 error in field name: {}", e))
        })?;
        field_names.push(name);
    }
    let num_points = num_points.ok_or_else(|| {
        ConversionError::MalformedPly("Missing 'element vertex' definition".to_string())
    })?;

    let mut field_map: HashMap<&str, usize> = HashMap::with_capacity(field_names.len());
    for (i, &name) in field_names.iter().enumerate() {
        field_map.insert(name, i);
    }

    // Source column for every wire field, `None` for optional fields that are absent.
    let mut columns = [None; RECORD_FIELDS];
    for (column, name) in columns.iter_mut().zip(PROPERTY_NAMES) {
        *column = field_map.get(name).copied();
        if column.is_none() && !is_optional(name) {
            return Err(ConversionError::MalformedPly(format!(
                "Missing required field: {}",
                name
            )));
        }
    }

    let stride = field_names.len() * 4;
    let expected_bytes = num_points
        .checked_mul(stride)
        .ok_or_else(|| ConversionError::MalformedPly("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < offset + expected_bytes {
        return Err(ConversionError::MalformedPly(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes,
            raw_data.len() - offset
        )));
    }

    let data = &raw_data[offset..offset + expected_bytes];
    let mut records = Vec::with_capacity(num_points);
    if stride > 0 {
        for vertex in data.chunks_exact(stride) {
            let mut fields = [0.0f32; RECORD_FIELDS];
            for (j, column) in columns.iter().enumerate() {
                if let Some(c) = *column {
                    fields[j] = bytes_to_f32(&vertex[c * 4..(c + 1) * 4], PROPERTY_NAMES[j])?;
                }
            }
            records.push(PointRecord::from_fields(&fields));
        }
    }

    debug!(points = records.len(), properties = field_names.len(), "parsed PLY");
    Ok(PointSet::new(records))
}
