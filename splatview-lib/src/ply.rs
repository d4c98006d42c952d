//! One-shot conversion of binary PLY point clouds into native splat records.

use foldhash::HashMap;
use foldhash::HashMapExt;
use tracing::{debug, info};
use zerocopy::IntoBytes;

use crate::common::{clamp_u8, sigmoid, SH_C0};
use crate::error::{Result, ViewerError};
use crate::structures::{SplatRecord, RECORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl PropertyType {
    fn parse(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"char" | b"int8" => PropertyType::Char,
            b"uchar" | b"uint8" => PropertyType::UChar,
            b"short" | b"int16" => PropertyType::Short,
            b"ushort" | b"uint16" => PropertyType::UShort,
            b"int" | b"int32" => PropertyType::Int,
            b"uint" | b"uint32" => PropertyType::UInt,
            b"float" | b"float32" => PropertyType::Float,
            b"double" | b"float64" => PropertyType::Double,
            _ => return None,
        })
    }

    const fn size(self) -> usize {
        match self {
            PropertyType::Char | PropertyType::UChar => 1,
            PropertyType::Short | PropertyType::UShort => 2,
            PropertyType::Int | PropertyType::UInt | PropertyType::Float => 4,
            PropertyType::Double => 8,
        }
    }

    /// `bytes` is exactly `self.size()` long.
    #[inline]
    fn read(self, bytes: &[u8]) -> f32 {
        match self {
            PropertyType::Char => bytes[0] as i8 as f32,
            PropertyType::UChar => bytes[0] as f32,
            PropertyType::Short => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            PropertyType::UShort => u16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            PropertyType::Int => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            PropertyType::UInt => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            PropertyType::Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            PropertyType::Double => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as f32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Field {
    offset: usize,
    ty: PropertyType,
}

impl Field {
    #[inline]
    fn get(&self, row: &[u8]) -> f32 {
        self.ty.read(&row[self.offset..self.offset + self.ty.size()])
    }
}

struct PlyHeader<'a> {
    vertex_count: usize,
    row_size: usize,
    fields: HashMap<&'a str, Field>,
    data_offset: usize,
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

fn parse_header(raw_data: &[u8]) -> Result<PlyHeader<'_>> {
    let mut offset = 0;

    let line = next_line(raw_data, &mut offset)
        .ok_or_else(|| ViewerError::ParsePly("No 'ply' line".to_string()))?;
    if line != b"ply" {
        return Err(ViewerError::ParsePly(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let mut vertex_count = None;
    let mut in_vertex_element = false;
    let mut row_size = 0;
    let mut fields: HashMap<&str, Field> = HashMap::with_capacity(64);

    loop {
        let line = next_line(raw_data, &mut offset).ok_or_else(|| {
            ViewerError::ParsePly("No 'end_header' found before EOF".to_string())
        })?;
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.starts_with(b"end_header") {
            break;
        }
        if line.starts_with(b"comment") || line.starts_with(b"obj_info") {
            continue;
        }
        if let Some(format) = line.strip_prefix(b"format ") {
            if format != b"binary_little_endian 1.0" {
                return Err(ViewerError::ParsePly(
                    "Unsupported .ply format (only binary_little_endian 1.0 is supported)"
                        .to_string(),
                ));
            }
            continue;
        }
        if let Some(element) = line.strip_prefix(b"element ") {
            in_vertex_element = false;
            if let Some(count) = element.strip_prefix(b"vertex ") {
                let count = std::str::from_utf8(count)
                    .map_err(|e| ViewerError::ParsePly(format!("UTF-8 error: {}", e)))?
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| ViewerError::ParsePly(format!("Parse error: {}", e)))?;
                vertex_count = Some(count);
                in_vertex_element = true;
            }
            continue;
        }
        if let Some(property) = line.strip_prefix(b"property ") {
            if !in_vertex_element {
                continue;
            }
            let mut parts = property.split(|&b| b == b' ').filter(|p| !p.is_empty());
            let (ty, name) = match (parts.next(), parts.next()) {
                (Some(ty), Some(name)) => (ty, name),
                _ => {
                    return Err(ViewerError::ParsePly(format!(
                        "Malformed property line: {}",
                        String::from_utf8_lossy(line)
                    )))
                }
            };
            let ty = PropertyType::parse(ty).ok_or_else(|| {
                ViewerError::ParsePly(format!(
                    "Unsupported property line: {}",
                    String::from_utf8_lossy(line)
                ))
            })?;
            let name = std::str::from_utf8(name).map_err(|e| {
                ViewerError::ParsePly(format!("UTF-8 error in field name: {}", e))
            })?;
            fields.insert(
                name,
                Field {
                    offset: row_size,
                    ty,
                },
            );
            row_size += ty.size();
            continue;
        }
        return Err(ViewerError::ParsePly(format!(
            "Unexpected header line: {}",
            String::from_utf8_lossy(line)
        )));
    }

    let vertex_count = vertex_count
        .ok_or_else(|| ViewerError::ParsePly("Missing 'element vertex' definition".to_string()))?;

    Ok(PlyHeader {
        vertex_count,
        row_size,
        fields,
        data_offset: offset,
    })
}

#[inline(always)]
fn idx_of(fields: &HashMap<&str, Field>, name: &str) -> Result<Field> {
    fields
        .get(name)
        .copied()
        .ok_or_else(|| ViewerError::ParsePly(format!("Missing required field: {}", name)))
}

/// Optional groups of fields; a group is used only when all its members are present.
struct Layout {
    position: [Field; 3],
    scale: Option<[Field; 3]>,
    rotation: Option<[Field; 4]>,
    dc: Option<[Field; 3]>,
    rgb: Option<[Field; 3]>,
    opacity: Option<Field>,
}

impl Layout {
    fn resolve(fields: &HashMap<&str, Field>) -> Result<Self> {
        let group = |names: &[&str]| -> Option<Vec<Field>> {
            names.iter().map(|n| fields.get(n).copied()).collect()
        };
        let three = |names: [&str; 3]| group(&names).map(|v| [v[0], v[1], v[2]]);

        Ok(Layout {
            position: [
                idx_of(fields, "x")?,
                idx_of(fields, "y")?,
                idx_of(fields, "z")?,
            ],
            scale: three(["scale_0", "scale_1", "scale_2"]),
            rotation: group(&["rot_0", "rot_1", "rot_2", "rot_3"]).map(|v| [v[0], v[1], v[2], v[3]]),
            dc: three(["f_dc_0", "f_dc_1", "f_dc_2"]),
            rgb: three(["red", "green", "blue"]),
            opacity: fields.get("opacity").copied(),
        })
    }

    /// Projected footprint weighted by opacity; larger splats are emitted first.
    fn importance(&self, row: &[u8]) -> f32 {
        let Some(scale) = self.scale else {
            return 0.0;
        };
        let size = scale.iter().map(|f| f.get(row)).sum::<f32>().exp();
        let opacity = self.opacity.map_or(1.0, |f| sigmoid(f.get(row)));
        size * opacity
    }

    fn record(&self, row: &[u8]) -> SplatRecord {
        let position = self.position.map(|f| f.get(row));

        let (scale, quat) = match (self.scale, self.rotation) {
            (Some(s), Some(r)) => (
                s.map(|f| f.get(row).exp()),
                r.map(|f| f.get(row)),
            ),
            _ => ([0.01; 3], [1.0, 0.0, 0.0, 0.0]),
        };

        let color = if let Some(dc) = self.dc {
            dc.map(|f| clamp_u8((0.5 + SH_C0 * f.get(row)) * 255.0))
        } else if let Some(rgb) = self.rgb {
            rgb.map(|f| clamp_u8(f.get(row)))
        } else {
            [255; 3]
        };
        let alpha = self
            .opacity
            .map_or(255, |f| clamp_u8(sigmoid(f.get(row)) * 255.0));

        SplatRecord::new(
            position,
            scale,
            [color[0], color[1], color[2], alpha],
            quat,
        )
    }
}

/// Converts a binary little-endian PLY file into packed native records, ordered by
/// descending importance (`volume × opacity`) so that progressive consumers see the most
/// visible splats first.
#[inline(never)]
pub fn convert_ply(raw_data: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(raw_data)?;
    if header.vertex_count == 0 {
        return Err(ViewerError::EmptyPly);
    }
    if header.row_size == 0 {
        return Err(ViewerError::ParsePly("Vertex element has no properties".to_string()));
    }
    let layout = Layout::resolve(&header.fields)?;

    let expected_bytes = header
        .vertex_count
        .checked_mul(header.row_size)
        .ok_or_else(|| ViewerError::ParsePly("Overflow in byte calculation".to_string()))?;
    let available = raw_data.len() - header.data_offset;
    if available < expected_bytes {
        return Err(ViewerError::ParsePly(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes, available
        )));
    }
    let data = &raw_data[header.data_offset..header.data_offset + expected_bytes];
    debug!(
        "ply header: {} vertices, {} bytes per row, {} properties",
        header.vertex_count,
        header.row_size,
        header.fields.len()
    );

    let rows: Vec<&[u8]> = data.chunks_exact(header.row_size).collect();
    let importance: Vec<f32> = rows.iter().map(|row| layout.importance(row)).collect();
    let mut order: Vec<u32> = (0..rows.len() as u32).collect();
    order.sort_unstable_by(|&a, &b| importance[b as usize].total_cmp(&importance[a as usize]));

    let mut out = Vec::with_capacity(rows.len() * RECORD_SIZE);
    for &i in &order {
        out.extend_from_slice(layout.record(rows[i as usize]).as_bytes());
    }
    info!("converted {} ply vertices into native records", rows.len());
    Ok(out)
}
