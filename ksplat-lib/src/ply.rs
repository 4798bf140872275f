use foldhash::HashMap;
use foldhash::HashMapExt;

use crate::common::{clamp_u8, normalize_quat, sigmoid, SH_C0};
use crate::error::SplatError;
use crate::structures::UncompressedSplatList;

/// The header must end within this many bytes.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyType {
    Float,
    UChar,
}

impl PropertyType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "float" | "float32" => Some(Self::Float),
            "uchar" | "uint8" => Some(Self::UChar),
            _ => None,
        }
    }

    const fn size(self) -> usize {
        match self {
            Self::Float => 4,
            Self::UChar => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Property {
    ty: PropertyType,
    offset: usize,
}

impl Property {
    /// Floats are returned as stored; `uchar` is normalized to `[0, 1]`.
    #[inline]
    fn read(&self, record: &[u8]) -> f32 {
        match self.ty {
            PropertyType::Float => {
                let b = &record[self.offset..self.offset + 4];
                f32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }
            PropertyType::UChar => record[self.offset] as f32 / 255.0,
        }
    }
}

#[derive(Debug)]
struct PlyHeader {
    num_points: usize,
    record_size: usize,
    properties: HashMap<String, Property>,
    data_offset: usize,
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    let line = match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            &buffer[start..start + pos]
        }
        None => {
            *offset = buffer.len();
            &buffer[start..]
        }
    };
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

fn parse_header(raw_data: &[u8]) -> Result<PlyHeader, SplatError> {
    let mut offset = 0;
    let window = &raw_data[..raw_data.len().min(MAX_HEADER_BYTES)];

    let magic = next_line(window, &mut offset)
        .ok_or_else(|| SplatError::ParsePly("No 'ply' line".to_string()))?;
    if magic != b"ply" {
        return Err(SplatError::ParsePly(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let mut format_seen = false;
    let mut current_element: Option<String> = None;
    let mut vertex_seen = false;
    let mut num_points = 0usize;
    let mut record_size = 0usize;
    let mut properties = HashMap::new();

    let missing_end = || {
        SplatError::ParsePly(format!(
            "No 'end_header' found within the first {} bytes",
            MAX_HEADER_BYTES
        ))
    };

    loop {
        let line = next_line(window, &mut offset).ok_or_else(missing_end)?;
        // A line cut off by the scan window can only be a valid final `end_header`.
        let unterminated = window[offset - 1] != b'\n';
        if unterminated && line.trim_ascii() != b"end_header" {
            return Err(missing_end());
        }
        let line = std::str::from_utf8(line)
            .map_err(|e| SplatError::ParsePly(format!("UTF-8 error in header: {}", e)))?
            .trim();
        let mut words = line.split_ascii_whitespace();

        match words.next() {
            Some("end_header") => break,
            Some("comment") | Some("obj_info") | None => {}
            Some("format") => {
                if line != "format binary_little_endian 1.0" {
                    return Err(SplatError::ParsePly(format!(
                        "Unsupported .ply format '{}' (only binary_little_endian 1.0 is supported)",
                        line
                    )));
                }
                format_seen = true;
            }
            Some("element") => {
                let name = words
                    .next()
                    .ok_or_else(|| SplatError::ParsePly("Element without a name".to_string()))?;
                let count: usize = words
                    .next()
                    .ok_or_else(|| SplatError::ParsePly(format!("Element '{}' has no count", name)))?
                    .parse()
                    .map_err(|e| SplatError::ParsePly(format!("Parse error: {}", e)))?;
                if name == "vertex" {
                    vertex_seen = true;
                    num_points = count;
                } else if !vertex_seen && count > 0 {
                    return Err(SplatError::ParsePly(format!(
                        "Element '{}' precedes the vertex element",
                        name
                    )));
                }
                current_element = Some(name.to_string());
            }
            Some("property") => {
                let in_vertex = current_element.as_deref() == Some("vertex");
                let ty_name = words
                    .next()
                    .ok_or_else(|| SplatError::ParsePly("Property without a type".to_string()))?;
                if !in_vertex {
                    continue;
                }
                let ty = PropertyType::parse(ty_name).ok_or_else(|| {
                    SplatError::ParsePly(format!("Unsupported property line: {}", line))
                })?;
                let name = words
                    .next()
                    .ok_or_else(|| SplatError::ParsePly("Property without a name".to_string()))?;
                properties.insert(
                    name.to_string(),
                    Property {
                        ty,
                        offset: record_size,
                    },
                );
                record_size += ty.size();
            }
            Some(other) => {
                return Err(SplatError::ParsePly(format!(
                    "Unexpected header keyword '{}'",
                    other
                )));
            }
        }
    }

    if !format_seen {
        return Err(SplatError::ParsePly("Missing format line".to_string()));
    }
    if !vertex_seen {
        return Err(SplatError::ParsePly(
            "Missing 'element vertex' definition".to_string(),
        ));
    }

    Ok(PlyHeader {
        num_points,
        record_size,
        properties,
        data_offset: offset,
    })
}

#[inline(always)]
fn idx_of(hm: &HashMap<String, Property>, name: &str) -> Result<Property, SplatError> {
    hm.get(name)
        .copied()
        .ok_or_else(|| SplatError::ParsePly(format!("Missing required field: {}", name)))
}

/// Parses a binary little-endian Gaussian splat PLY into raw splats.
#[inline(never)]
pub fn parse_ply(raw_data: &[u8]) -> Result<UncompressedSplatList, SplatError> {
    let header = parse_header(raw_data)?;
    if header.num_points == 0 {
        return Ok(UncompressedSplatList::default());
    }
    let fields = &header.properties;

    let xyz = [idx_of(fields, "x")?, idx_of(fields, "y")?, idx_of(fields, "z")?];
    let scale = [
        idx_of(fields, "scale_0")?,
        idx_of(fields, "scale_1")?,
        idx_of(fields, "scale_2")?,
    ];
    let rot = [
        idx_of(fields, "rot_0")?,
        idx_of(fields, "rot_1")?,
        idx_of(fields, "rot_2")?,
        idx_of(fields, "rot_3")?,
    ];
    let opacity = fields.get("opacity").copied();
    let f_dc = match (fields.get("f_dc_0"), fields.get("f_dc_1"), fields.get("f_dc_2")) {
        (Some(&r), Some(&g), Some(&b)) => Some([r, g, b]),
        _ => None,
    };
    let rgb = match (fields.get("red"), fields.get("green"), fields.get("blue")) {
        (Some(&r), Some(&g), Some(&b)) => Some([r, g, b]),
        _ => None,
    };

    let expected_bytes = header
        .num_points
        .checked_mul(header.record_size)
        .ok_or_else(|| SplatError::ParsePly("Overflow in byte calculation".to_string()))?;
    let available = raw_data.len() - header.data_offset;
    if available < expected_bytes {
        return Err(SplatError::ParsePly(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes, available
        )));
    }
    let data = &raw_data[header.data_offset..header.data_offset + expected_bytes];

    let mut list = UncompressedSplatList::with_capacity(header.num_points);
    for record in data.chunks_exact(header.record_size) {
        list.x.push(xyz[0].read(record));
        list.y.push(xyz[1].read(record));
        list.z.push(xyz[2].read(record));

        // Scales are stored as logarithms.
        list.scale_0.push(scale[0].read(record).exp());
        list.scale_1.push(scale[1].read(record).exp());
        list.scale_2.push(scale[2].read(record).exp());

        let q = normalize_quat([
            rot[0].read(record),
            rot[1].read(record),
            rot[2].read(record),
            rot[3].read(record),
        ]);
        list.rot_0.push(q[0]);
        list.rot_1.push(q[1]);
        list.rot_2.push(q[2]);
        list.rot_3.push(q[3]);

        let color = if let Some(dc) = f_dc {
            dc.map(|p| clamp_u8((0.5 + SH_C0 * p.read(record)) * 255.0))
        } else if let Some(rgb) = rgb {
            rgb.map(|p| clamp_u8(p.read(record) * 255.0))
        } else {
            [255; 3]
        };
        list.r.push(color[0]);
        list.g.push(color[1]);
        list.b.push(color[2]);

        // Opacity is stored as a logit.
        let alpha = opacity.map_or(255, |p| clamp_u8(sigmoid(p.read(record)) * 255.0));
        list.opacity.push(alpha);
    }

    Ok(list)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_ply(points: &[[f32; 14]]) -> Vec<u8> {
        let mut raw_ply = format!(
            "ply
format binary_little_endian 1.0
comment generated for tests
element vertex {}
property float x
property float y
property float z
property float scale_0
property float scale_1
property float scale_2
property float rot_0
property float rot_1
property float rot_2
property float rot_3
property float opacity
property float f_dc_0
property float f_dc_1
property float f_dc_2
end_header
",
            points.len()
        )
        .into_bytes();
        for point in points {
            for &f in point {
                raw_ply.extend_from_slice(&f.to_le_bytes());
            }
        }
        raw_ply
    }

    #[test]
    fn test_parse_empty_ply() {
        let data =
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header";
        let list = parse_ply(data).expect("It should parse an empty .ply OK (0 vertices).");
        assert!(list.is_empty());
    }

    #[test]
    fn test_parse_single_vertex() {
        #[rustfmt::skip]
        let point = [
            // x, y, z
            1.0f32, 2.0, 3.0,
            // log scales
            0.0, (2.0f32).ln(), (0.5f32).ln(),
            // rot_0 (w), rot_1, rot_2, rot_3
            2.0, 0.0, 0.0, 0.0,
            // opacity logit
            0.0,
            // f_dc
            0.0, 1.0, -10.0,
        ];
        let list = parse_ply(&create_test_ply(&[point])).unwrap();
        assert_eq!(list.len(), 1);
        let splat = list.get(0);
        assert_eq!(splat.center.to_array(), [1.0, 2.0, 3.0]);
        assert!((splat.scale.y - 2.0).abs() < 1e-5);
        assert!((splat.scale.z - 0.5).abs() < 1e-5);
        assert_eq!(list.rot_0[0], 1.0);
        assert_eq!(splat.color[3], 128);
        assert_eq!(splat.color[0], 128);
        assert_eq!(splat.color[1], clamp_u8((0.5 + SH_C0) * 255.0));
        assert_eq!(splat.color[2], 0);
    }

    #[test]
    fn test_uchar_colors_and_crlf() {
        let mut data = b"ply\r\nformat binary_little_endian 1.0\r\nelement vertex 1\r\n\
property float x\r\nproperty float y\r\nproperty float z\r\n\
property float scale_0\r\nproperty float scale_1\r\nproperty float scale_2\r\n\
property float rot_0\r\nproperty float rot_1\r\nproperty float rot_2\r\nproperty float rot_3\r\n\
property uchar red\r\nproperty uchar green\r\nproperty uchar blue\r\nend_header\r\n"
            .to_vec();
        for f in [0.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0] {
            data.extend_from_slice(&f.to_le_bytes());
        }
        data.extend_from_slice(&[10, 20, 30]);
        let list = parse_ply(&data).unwrap();
        assert_eq!(list.get(0).color, [10, 20, 30, 255]);
    }

    #[test]
    fn test_missing_end_header_fails_fast() {
        let mut data = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\n".to_vec();
        data.extend(std::iter::repeat(b"comment padding\n".as_slice()).take(10_000).flatten());
        match parse_ply(&data) {
            Err(SplatError::ParsePly(msg)) => assert!(msg.contains("end_header")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unsupported_inputs() {
        assert!(parse_ply(b"not a ply\n").is_err());
        assert!(parse_ply(b"ply\nformat ascii 1.0\nelement vertex 1\nend_header\n").is_err());
        assert!(parse_ply(
            b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty double x\nend_header\n"
        )
        .is_err());

        let truncated = create_test_ply(&[[0.0; 14]]);
        assert!(matches!(
            parse_ply(&truncated[..truncated.len() - 3]),
            Err(SplatError::ParsePly(_))
        ));
    }
}
