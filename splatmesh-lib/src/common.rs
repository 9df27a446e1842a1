pub const SH_REST_COUNT: usize = 45;
pub const RECORD_FIELDS: usize = 3 + 3 + 3 + SH_REST_COUNT + 1 + 3 + 4;
pub const RECORD_SIZE: usize = RECORD_FIELDS * 4;

pub const POINT_CLOUD_EXTENSION: &str = "ply";
pub const MESH_EXTENSION: &str = "fbx";

pub const PLY_MAGIC: &str = "ply";
pub const PLY_FORMAT: &str = "format binary_little_endian 1.0";
pub const PLY_END_HEADER: &str = "end_header";

/// Vertex property names in wire order.
#[rustfmt::skip]
pub const PROPERTY_NAMES: [&str; RECORD_FIELDS] = [
    "x", "y", "z",
    "nx", "ny", "nz",
    "f_dc_0", "f_dc_1", "f_dc_2",
    "f_rest_0", "f_rest_1", "f_rest_2", "f_rest_3", "f_rest_4",
    "f_rest_5", "f_rest_6", "f_rest_7", "f_rest_8", "f_rest_9",
    "f_rest_10", "f_rest_11", "f_rest_12", "f_rest_13", "f_rest_14",
    "f_rest_15", "f_rest_16", "f_rest_17", "f_rest_18", "f_rest_19",
    "f_rest_20", "f_rest_21", "f_rest_22", "f_rest_23", "f_rest_24",
    "f_rest_25", "f_rest_26", "f_rest_27", "f_rest_28", "f_rest_29",
    "f_rest_30", "f_rest_31", "f_rest_32", "f_rest_33", "f_rest_34",
    "f_rest_35", "f_rest_36", "f_rest_37", "f_rest_38", "f_rest_39",
    "f_rest_40", "f_rest_41", "f_rest_42", "f_rest_43", "f_rest_44",
    "opacity",
    "scale_0", "scale_1", "scale_2",
    "rot_0", "rot_1", "rot_2", "rot_3",
];

#[inline]
pub(crate) fn sqr_magnitude(v: [f32; 3]) -> f32 {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}

#[inline]
pub fn deg_to_rad(degrees: f32) -> f32 {
    degrees.to_radians()
}

/// Shortest round-trip decimal with a period separator, e.g. `0.01`, `0`, `1.0471976`.
#[inline]
pub(crate) fn format_invariant(x: f32) -> String {
    format!("{}", x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_constants() {
        assert_eq!(RECORD_FIELDS, 62);
        assert_eq!(RECORD_SIZE, 248);
        assert_eq!(PROPERTY_NAMES[RECORD_FIELDS - 1], "rot_3");
        assert_eq!(PROPERTY_NAMES[9], "f_rest_0");
        assert_eq!(PROPERTY_NAMES[53], "f_rest_44");
    }

    #[test]
    fn invariant_formatting() {
        assert_eq!(format_invariant(0.01), "0.01");
        assert_eq!(format_invariant(0.0), "0");
        assert_eq!(format_invariant(deg_to_rad(60.0)), "1.0471976");
        assert_eq!(format_invariant(-2.5), "-2.5");
    }
}
