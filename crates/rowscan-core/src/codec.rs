//! `.drc` capture codec: bounded-error point cloud compression.
//!
//! Layout (little-endian):
//!
//! ```text
//! header   magic "RSPC" | version u8 | quant bits u8 | level u8 | flags u8
//!          point count u32 | bbox min f64×3 | bbox max f64×3
//! section  tag u8 ('P' | 'C') | encoding u8 | raw len u32 | payload len u32 | payload
//! ```
//!
//! Positions are quantized per axis inside the bounding box; colors are
//! stored as 8-bit channels. Both survive a round trip with point order
//! and count unchanged.

use crate::types::PointCloud;
use byteorder::{ByteOrder, LittleEndian};
use nalgebra::{Point3, Vector3};
use thiserror::Error;

pub const DEFAULT_QUANTIZATION_BITS: u8 = 14;
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 5;
pub const MAX_QUANTIZATION_BITS: u8 = 30;
pub const MAX_COMPRESSION_LEVEL: u8 = 10;

const MAGIC: &[u8; 4] = b"RSPC";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 60;
const SECTION_HEADER_LEN: usize = 10;
const TAG_POSITIONS: u8 = b'P';
const TAG_COLORS: u8 = b'C';
/// Header flag: positions are stored axis-planar (all x, all y, all z).
const FLAG_PLANAR: u8 = 0b0000_0001;

/// Minimum level that adds LZ4 on top of delta coding.
const LZ4_MIN_LEVEL: u8 = 4;
/// Minimum level that switches positions to the planar layout.
const PLANAR_MIN_LEVEL: u8 = 7;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("quantization bits must be 1..={MAX_QUANTIZATION_BITS}, got {0}")]
    InvalidQuantizationBits(u8),
    #[error("compression level must be 0..={MAX_COMPRESSION_LEVEL}, got {0}")]
    InvalidCompressionLevel(u8),
    #[error("{points} positions but {colors} colors")]
    LengthMismatch { points: usize, colors: usize },
    #[error("position {0} is not finite")]
    NonFinite(usize),
    #[error("too many points for one frame: {0}")]
    TooManyPoints(usize),
}

/// Decode failure. A malformed blob never yields a partial cloud.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("blob too short for header: {0} bytes")]
    TooShort(usize),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid quantization bits {0}")]
    InvalidQuantizationBits(u8),
    #[error("truncated section at offset {0}")]
    Truncated(usize),
    #[error("unknown section encoding {0}")]
    UnknownEncoding(u8),
    #[error("duplicate {0} section")]
    DuplicateSection(&'static str),
    #[error("missing {0} section")]
    MissingSection(&'static str),
    #[error("{section} section holds {actual} values, expected {expected}")]
    CountMismatch {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("corrupt {0} payload")]
    Corrupt(&'static str),
    #[error("quantized value {value} exceeds {bits}-bit range")]
    OutOfRange { value: u64, bits: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub quantization_bits: u8,
    /// 0 (fastest, largest) to 10 (slowest, smallest).
    pub compression_level: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quantization_bits: DEFAULT_QUANTIZATION_BITS,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Encoding {
    Raw = 0,
    DeltaVarint = 1,
    DeltaVarintLz4 = 2,
}

impl Encoding {
    fn for_level(level: u8) -> Self {
        match level {
            0 => Encoding::Raw,
            l if l < LZ4_MIN_LEVEL => Encoding::DeltaVarint,
            _ => Encoding::DeltaVarintLz4,
        }
    }

    fn from_byte(b: u8) -> Result<Self, FormatError> {
        match b {
            0 => Ok(Encoding::Raw),
            1 => Ok(Encoding::DeltaVarint),
            2 => Ok(Encoding::DeltaVarintLz4),
            other => Err(FormatError::UnknownEncoding(other)),
        }
    }
}

/// Compress a cloud with the given options.
pub fn encode(cloud: &PointCloud, options: EncodeOptions) -> Result<Vec<u8>, EncodeError> {
    encode_parts(
        cloud.points(),
        cloud.colors(),
        options.quantization_bits,
        options.compression_level,
    )
}

/// Compress index-aligned positions and unit-interval colors.
pub fn encode_parts(
    points: &[Point3<f64>],
    colors: &[Vector3<f64>],
    quantization_bits: u8,
    compression_level: u8,
) -> Result<Vec<u8>, EncodeError> {
    if quantization_bits == 0 || quantization_bits > MAX_QUANTIZATION_BITS {
        return Err(EncodeError::InvalidQuantizationBits(quantization_bits));
    }
    if compression_level > MAX_COMPRESSION_LEVEL {
        return Err(EncodeError::InvalidCompressionLevel(compression_level));
    }
    if points.len() != colors.len() {
        return Err(EncodeError::LengthMismatch {
            points: points.len(),
            colors: colors.len(),
        });
    }
    let count = u32::try_from(points.len()).map_err(|_| EncodeError::TooManyPoints(points.len()))?;
    if let Some(i) = points.iter().position(|p| !p.coords.iter().all(|v| v.is_finite())) {
        return Err(EncodeError::NonFinite(i));
    }

    let (min, max) = bounds(points);
    let max_q = max_quantized(quantization_bits);
    let planar = compression_level >= PLANAR_MIN_LEVEL;

    let mut quantized: Vec<[u32; 3]> = Vec::with_capacity(points.len());
    for p in points {
        let mut q = [0u32; 3];
        for axis in 0..3 {
            let range = max[axis] - min[axis];
            if range > 0.0 {
                let t = ((p[axis] - min[axis]) / range * max_q as f64).round();
                q[axis] = t.clamp(0.0, max_q as f64) as u32;
            }
        }
        quantized.push(q);
    }
    let position_stream = position_values(&quantized, planar);
    let color_stream: Vec<u32> = colors
        .iter()
        .flat_map(|c| [to_u8(c.x), to_u8(c.y), to_u8(c.z)])
        .map(u32::from)
        .collect();

    let encoding = Encoding::for_level(compression_level);
    let mut blob = vec![0u8; HEADER_LEN];
    blob[0..4].copy_from_slice(MAGIC);
    blob[4] = VERSION;
    blob[5] = quantization_bits;
    blob[6] = compression_level;
    blob[7] = if planar { FLAG_PLANAR } else { 0 };
    LittleEndian::write_u32(&mut blob[8..12], count);
    for axis in 0..3 {
        LittleEndian::write_f64(&mut blob[12 + axis * 8..20 + axis * 8], min[axis]);
        LittleEndian::write_f64(&mut blob[36 + axis * 8..44 + axis * 8], max[axis]);
    }

    write_section(&mut blob, TAG_POSITIONS, encoding, &position_stream, ValueWidth::U32, planar.then_some(points.len()));
    write_section(&mut blob, TAG_COLORS, encoding, &color_stream, ValueWidth::U8, None);

    tracing::trace!(
        points = points.len(),
        bytes = blob.len(),
        quantization_bits,
        compression_level,
        "encoded point cloud"
    );
    Ok(blob)
}

/// Decompress a blob produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<PointCloud, FormatError> {
    if blob.len() < HEADER_LEN {
        return Err(FormatError::TooShort(blob.len()));
    }
    if &blob[0..4] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    if blob[4] != VERSION {
        return Err(FormatError::UnsupportedVersion(blob[4]));
    }
    let bits = blob[5];
    if bits == 0 || bits > MAX_QUANTIZATION_BITS {
        return Err(FormatError::InvalidQuantizationBits(bits));
    }
    let planar = blob[7] & FLAG_PLANAR != 0;
    let count = LittleEndian::read_u32(&blob[8..12]) as usize;
    let mut min = [0f64; 3];
    let mut max = [0f64; 3];
    for axis in 0..3 {
        min[axis] = LittleEndian::read_f64(&blob[12 + axis * 8..20 + axis * 8]);
        max[axis] = LittleEndian::read_f64(&blob[36 + axis * 8..44 + axis * 8]);
    }

    let mut positions: Option<Vec<u64>> = None;
    let mut colors: Option<Vec<u64>> = None;
    let mut offset = HEADER_LEN;
    while offset < blob.len() {
        if blob.len() - offset < SECTION_HEADER_LEN {
            return Err(FormatError::Truncated(offset));
        }
        let tag = blob[offset];
        let encoding = blob[offset + 1];
        let raw_len = LittleEndian::read_u32(&blob[offset + 2..offset + 6]) as usize;
        let payload_len = LittleEndian::read_u32(&blob[offset + 6..offset + 10]) as usize;
        let start = offset + SECTION_HEADER_LEN;
        let end = start
            .checked_add(payload_len)
            .filter(|&end| end <= blob.len())
            .ok_or(FormatError::Truncated(offset))?;
        let payload = &blob[start..end];
        offset = end;

        match tag {
            TAG_POSITIONS => {
                if positions.is_some() {
                    return Err(FormatError::DuplicateSection("positions"));
                }
                let values = read_section(
                    "positions",
                    Encoding::from_byte(encoding)?,
                    payload,
                    raw_len,
                    ValueWidth::U32,
                    planar.then_some(count),
                )?;
                positions = Some(values);
            }
            TAG_COLORS => {
                if colors.is_some() {
                    return Err(FormatError::DuplicateSection("colors"));
                }
                let values = read_section(
                    "colors",
                    Encoding::from_byte(encoding)?,
                    payload,
                    raw_len,
                    ValueWidth::U8,
                    None,
                )?;
                colors = Some(values);
            }
            other => {
                tracing::debug!(tag = other, "skipping unknown section");
            }
        }
    }

    let positions = positions.ok_or(FormatError::MissingSection("positions"))?;
    let colors = colors.ok_or(FormatError::MissingSection("colors"))?;
    check_count("positions", count * 3, positions.len())?;
    check_count("colors", count * 3, colors.len())?;

    let max_q = max_quantized(bits);
    let mut points = Vec::with_capacity(count);
    for i in 0..count {
        let mut p = Point3::origin();
        for axis in 0..3 {
            let q = if planar {
                positions[axis * count + i]
            } else {
                positions[i * 3 + axis]
            };
            if q > max_q {
                return Err(FormatError::OutOfRange { value: q, bits });
            }
            let range = max[axis] - min[axis];
            p[axis] = min[axis] + q as f64 / max_q as f64 * range;
        }
        points.push(p);
    }

    let mut rgb = Vec::with_capacity(count);
    for c in colors.chunks_exact(3) {
        if c.iter().any(|&v| v > u8::MAX as u64) {
            return Err(FormatError::Corrupt("colors"));
        }
        rgb.push(Vector3::new(c[0] as f64, c[1] as f64, c[2] as f64) / 255.0);
    }

    PointCloud::new(points, rgb).map_err(|_| FormatError::Corrupt("cloud"))
}

/// Largest per-axis reconstruction error for a cloud with these bounds.
pub fn quantization_error_bound(min: &Point3<f64>, max: &Point3<f64>, bits: u8) -> Vector3<f64> {
    let max_q = max_quantized(bits) as f64;
    (max - min) / max_q / 2.0
}

fn max_quantized(bits: u8) -> u64 {
    (1u64 << bits) - 1
}

fn bounds(points: &[Point3<f64>]) -> ([f64; 3], [f64; 3]) {
    let Some(first) = points.first() else {
        return ([0.0; 3], [0.0; 3]);
    };
    let mut min = [first.x, first.y, first.z];
    let mut max = min;
    for p in points {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    (min, max)
}

fn to_u8(v: f64) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn position_values(quantized: &[[u32; 3]], planar: bool) -> Vec<u32> {
    if planar {
        (0..3)
            .flat_map(|axis| quantized.iter().map(move |q| q[axis]))
            .collect()
    } else {
        quantized.iter().flat_map(|q| q.iter().copied()).collect()
    }
}

fn check_count(section: &'static str, expected: usize, actual: usize) -> Result<(), FormatError> {
    if expected != actual {
        return Err(FormatError::CountMismatch {
            section,
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ValueWidth {
    U8,
    U32,
}

/// Distance between values predicted from each other.
///
/// Interleaved streams predict from the same channel one point back; planar
/// streams predict from the previous value of the same plane.
fn stride(width: ValueWidth, planar_count: Option<usize>) -> usize {
    match (width, planar_count) {
        (_, Some(_)) => 1,
        _ => 3,
    }
}

fn write_section(
    blob: &mut Vec<u8>,
    tag: u8,
    encoding: Encoding,
    values: &[u32],
    width: ValueWidth,
    planar_count: Option<usize>,
) {
    let raw: Vec<u8> = match encoding {
        Encoding::Raw => match width {
            ValueWidth::U8 => values.iter().map(|&v| v as u8).collect(),
            ValueWidth::U32 => {
                let mut out = vec![0u8; values.len() * 4];
                LittleEndian::write_u32_into(values, &mut out);
                out
            }
        },
        Encoding::DeltaVarint | Encoding::DeltaVarintLz4 => {
            let step = stride(width, planar_count);
            let mut out = Vec::with_capacity(values.len());
            for (i, &v) in values.iter().enumerate() {
                let prev = if i >= step { values[i - step] } else { 0 };
                write_varint(&mut out, zigzag(v as i64 - prev as i64));
            }
            out
        }
    };
    let payload = match encoding {
        Encoding::DeltaVarintLz4 => lz4_flex::compress(&raw),
        _ => raw.clone(),
    };

    let mut header = [0u8; SECTION_HEADER_LEN];
    header[0] = tag;
    header[1] = encoding as u8;
    LittleEndian::write_u32(&mut header[2..6], raw.len() as u32);
    LittleEndian::write_u32(&mut header[6..10], payload.len() as u32);
    blob.extend_from_slice(&header);
    blob.extend_from_slice(&payload);
}

fn read_section(
    section: &'static str,
    encoding: Encoding,
    payload: &[u8],
    raw_len: usize,
    width: ValueWidth,
    planar_count: Option<usize>,
) -> Result<Vec<u64>, FormatError> {
    match encoding {
        Encoding::Raw => {
            if payload.len() != raw_len {
                return Err(FormatError::Corrupt(section));
            }
            match width {
                ValueWidth::U8 => Ok(payload.iter().map(|&b| b as u64).collect()),
                ValueWidth::U32 => {
                    if payload.len() % 4 != 0 {
                        return Err(FormatError::Corrupt(section));
                    }
                    Ok(payload
                        .chunks_exact(4)
                        .map(|c| LittleEndian::read_u32(c) as u64)
                        .collect())
                }
            }
        }
        Encoding::DeltaVarint | Encoding::DeltaVarintLz4 => {
            let decompressed;
            let raw = if encoding == Encoding::DeltaVarintLz4 {
                decompressed = lz4_flex::decompress(payload, raw_len)
                    .map_err(|_| FormatError::Corrupt(section))?;
                decompressed.as_slice()
            } else {
                payload
            };
            if raw.len() != raw_len {
                return Err(FormatError::Corrupt(section));
            }

            let step = stride(width, planar_count);
            let mut values: Vec<u64> = Vec::new();
            let mut cursor = 0usize;
            while cursor < raw.len() {
                let (delta, used) = read_varint(&raw[cursor..]).ok_or(FormatError::Corrupt(section))?;
                cursor += used;
                let i = values.len();
                let prev = if i >= step { values[i - step] as i64 } else { 0 };
                let v = prev
                    .checked_add(unzigzag(delta))
                    .filter(|v| *v >= 0)
                    .ok_or(FormatError::Corrupt(section))?;
                values.push(v as u64);
            }
            Ok(values)
        }
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    for (i, &b) in buf.iter().enumerate().take(10) {
        v |= ((b & 0x7f) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}
