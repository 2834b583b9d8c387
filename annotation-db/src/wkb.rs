//! Minimal WKB/EWKB codec for the point geometries stored with annotations.
//!
//! Annotation rows persist their anchor points as PostGIS geometries. The
//! pipeline and the query layer only ever need the plain coordinates, so this
//! module decodes exactly one shape: a (possibly Z-carrying, possibly
//! SRID-tagged) point, in either byte order.

/// EWKB flag marking a geometry with a Z coordinate.
const EWKB_Z_FLAG: u32 = 0x8000_0000;
/// EWKB flag marking a geometry with an embedded SRID.
const EWKB_SRID_FLAG: u32 = 0x2000_0000;
/// WKB geometry type for a point.
const WKB_POINT: u32 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WkbError {
    #[error("geometry blob truncated at byte {0}")]
    Truncated(usize),

    #[error("unsupported byte-order marker {0:#04x}")]
    BadByteOrder(u8),

    #[error("unsupported geometry type {0:#010x}, only points are stored")]
    NotAPoint(u32),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], WkbError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(WkbError::Truncated(self.pos))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32, WkbError> {
        let bytes = self.take::<4>()?;
        Ok(if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn read_f64(&mut self) -> Result<f64, WkbError> {
        let bytes = self.take::<8>()?;
        Ok(if self.little_endian {
            f64::from_le_bytes(bytes)
        } else {
            f64::from_be_bytes(bytes)
        })
    }
}

/// Decodes a WKB or EWKB point into `[x, y, z]` coordinates.
///
/// Two-dimensional points decode with `z = 0`. Both the ISO WKB Z type
/// (`1001`) and the PostGIS EWKB Z flag are accepted.
pub fn decode_point(buf: &[u8]) -> Result<[f64; 3], WkbError> {
    let byte_order = *buf.first().ok_or(WkbError::Truncated(0))?;
    let little_endian = match byte_order {
        0 => false,
        1 => true,
        other => return Err(WkbError::BadByteOrder(other)),
    };
    let mut reader = Reader {
        buf,
        pos: 1,
        little_endian,
    };

    let raw_type = reader.read_u32()?;
    let has_srid = raw_type & EWKB_SRID_FLAG != 0;
    let has_ewkb_z = raw_type & EWKB_Z_FLAG != 0;
    let base_type = raw_type & !(EWKB_SRID_FLAG | EWKB_Z_FLAG);
    // ISO WKB encodes Z as type + 1000.
    let (base_type, has_iso_z) = if base_type >= 1000 {
        (base_type - 1000, true)
    } else {
        (base_type, false)
    };
    if base_type != WKB_POINT {
        return Err(WkbError::NotAPoint(raw_type));
    }
    if has_srid {
        reader.read_u32()?;
    }

    let x = reader.read_f64()?;
    let y = reader.read_f64()?;
    let z = if has_ewkb_z || has_iso_z {
        reader.read_f64()?
    } else {
        0.0
    };
    Ok([x, y, z])
}

/// Encodes `[x, y, z]` as a little-endian EWKB point with a Z coordinate.
pub fn encode_point_z(point: [f64; 3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 24);
    out.push(1u8);
    out.extend_from_slice(&(WKB_POINT | EWKB_Z_FLAG).to_le_bytes());
    for coord in point {
        out.extend_from_slice(&coord.to_le_bytes());
    }
    out
}
