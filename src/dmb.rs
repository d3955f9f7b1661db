// dmb.rs — DMB binary map codec and result-directory naming.
//
// A DMB file is a fixed 16-byte header followed by raw floats:
//
//   i32 type      must be 1 (float)
//   i32 height
//   i32 width
//   i32 channels  1 for depth/cost, 3 for normals
//   f32 payload[height * width * channels]   row-major, channel-interleaved
//
// Everything is little-endian. No footer, no checksum.
//
// Normal maps are held in memory as three scalar planes (`NormalMap`) so
// each component can back its own single-channel texture; the codec
// interleaves and splits them at the file boundary.
//
// `result_path` is the one place the on-disk naming scheme is spelled out:
//
//   <dense>/<marker>/<prefix>_<8-digit id>/<depths|normals|costs>[_geom].dmb

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::ResultLayout;
use crate::error::{DataError, Result};
use crate::image::Image;

/// Format tag for float payloads; the only one supported.
pub const DMB_TYPE_FLOAT: i32 = 1;

const HEADER_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Generic map
// ---------------------------------------------------------------------------

/// A decoded DMB file: `height × width × channels` floats, interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct DmbMap {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl DmbMap {
    /// Wrap a single-channel image.
    pub fn from_image(img: &Image<f32>) -> Self {
        DmbMap {
            height: img.height(),
            width: img.width(),
            channels: 1,
            data: img.as_slice().to_vec(),
        }
    }

    /// Extract channel `c` as its own image.
    ///
    /// # Panics
    /// Panics if `c >= channels`.
    pub fn plane(&self, c: usize) -> Image<f32> {
        assert!(c < self.channels, "channel {c} out of range ({})", self.channels);
        let data = self
            .data
            .chunks_exact(self.channels)
            .map(|px| px[c])
            .collect();
        Image::from_vec(self.width, self.height, data)
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if buf.len() < n {
        return None;
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Some(head)
}

#[inline(always)]
fn le_i32(buf: &mut &[u8]) -> Option<i32> {
    let b = take(buf, 4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cold]
fn truncated(path: &Path, reason: impl Into<String>) -> DataError {
    DataError::Truncated {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Decode a DMB byte buffer. `path` is only used in error messages.
pub fn parse_dmb_bytes(path: &Path, mut p: &[u8]) -> Result<DmbMap> {
    let short_header = || truncated(path, format!("header shorter than {HEADER_BYTES} bytes"));

    let tag = le_i32(&mut p).ok_or_else(short_header)?;
    if tag != DMB_TYPE_FLOAT {
        return Err(DataError::BadFormatTag {
            path: path.to_path_buf(),
            found: tag,
        }
        .into());
    }
    let height = le_i32(&mut p).ok_or_else(short_header)?;
    let width = le_i32(&mut p).ok_or_else(short_header)?;
    let channels = le_i32(&mut p).ok_or_else(short_header)?;
    if height < 0 || width < 0 || channels <= 0 {
        return Err(truncated(
            path,
            format!("invalid header dims {height}x{width}x{channels}"),
        )
        .into());
    }

    let (height, width, channels) = (height as usize, width as usize, channels as usize);
    let bytes = height
        .checked_mul(width)
        .and_then(|n| n.checked_mul(channels))
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| truncated(path, format!("header dims {height}x{width}x{channels} overflow")))?;
    let payload = take(&mut p, bytes).ok_or_else(|| {
        truncated(path, format!("payload has {} bytes, header needs {bytes}", p.len()))
    })?;

    let data = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(DmbMap {
        height,
        width,
        channels,
        data,
    })
}

/// Read a DMB file of any channel count.
pub fn read_dmb(path: &Path) -> Result<DmbMap> {
    let bytes = std::fs::read(path).map_err(|e| DataError::io(path, e))?;
    parse_dmb_bytes(path, &bytes)
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write a DMB file. The parent directory must already exist.
pub fn write_dmb(path: &Path, map: &DmbMap) -> Result<()> {
    debug_assert_eq!(map.data.len(), map.height * map.width * map.channels);
    let io = |e| DataError::io(path, e);

    let file = File::create(path).map_err(io)?;
    let mut w = BufWriter::new(file);
    write_i32(&mut w, DMB_TYPE_FLOAT).map_err(io)?;
    write_i32(&mut w, map.height as i32).map_err(io)?;
    write_i32(&mut w, map.width as i32).map_err(io)?;
    write_i32(&mut w, map.channels as i32).map_err(io)?;
    for v in &map.data {
        w.write_all(&v.to_le_bytes()).map_err(io)?;
    }
    w.flush().map_err(io)?;
    Ok(())
}

fn expect_channels(path: &Path, map: &DmbMap, expected: usize) -> Result<()> {
    if map.channels != expected {
        return Err(DataError::ChannelMismatch {
            path: path.to_path_buf(),
            expected: expected as i32,
            found: map.channels as i32,
        }
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed maps
// ---------------------------------------------------------------------------

/// Read a single-channel map (depth or cost).
pub fn read_depth(path: &Path) -> Result<Image<f32>> {
    let map = read_dmb(path)?;
    expect_channels(path, &map, 1)?;
    Ok(Image::from_vec(map.width, map.height, map.data))
}

/// Cost maps share the depth layout.
pub fn read_cost(path: &Path) -> Result<Image<f32>> {
    read_depth(path)
}

pub fn write_depth(path: &Path, depth: &Image<f32>) -> Result<()> {
    write_dmb(path, &DmbMap::from_image(depth))
}

pub fn write_cost(path: &Path, cost: &Image<f32>) -> Result<()> {
    write_depth(path, cost)
}

/// Per-pixel unit normals stored as three scalar planes.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalMap {
    pub x: Image<f32>,
    pub y: Image<f32>,
    pub z: Image<f32>,
}

impl NormalMap {
    pub fn new(width: usize, height: usize) -> Self {
        NormalMap {
            x: Image::new(width, height),
            y: Image::new(width, height),
            z: Image::new(width, height),
        }
    }

    /// Build from three planes of identical size.
    pub fn from_planes(x: Image<f32>, y: Image<f32>, z: Image<f32>) -> Result<Self> {
        for (name, plane) in [("normal y plane", &y), ("normal z plane", &z)] {
            if plane.dims() != x.dims() {
                return Err(DataError::DimensionMismatch {
                    what: name.to_string(),
                    expected: x.dims(),
                    found: plane.dims(),
                }
                .into());
            }
        }
        Ok(NormalMap { x, y, z })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.x.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.x.height()
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        self.x.dims()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> [f32; 3] {
        [self.x.get(x, y), self.y.get(x, y), self.z.get(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, n: [f32; 3]) {
        self.x.set(x, y, n[0]);
        self.y.set(x, y, n[1]);
        self.z.set(x, y, n[2]);
    }
}

/// Read a three-channel normal map and split it into planes.
pub fn read_normal(path: &Path) -> Result<NormalMap> {
    let map = read_dmb(path)?;
    expect_channels(path, &map, 3)?;
    Ok(NormalMap {
        x: map.plane(0),
        y: map.plane(1),
        z: map.plane(2),
    })
}

pub fn write_normal(path: &Path, normals: &NormalMap) -> Result<()> {
    let (w, h) = normals.dims();
    let mut data = Vec::with_capacity(w * h * 3);
    for ((&nx, &ny), &nz) in normals
        .x
        .as_slice()
        .iter()
        .zip(normals.y.as_slice())
        .zip(normals.z.as_slice())
    {
        data.extend_from_slice(&[nx, ny, nz]);
    }
    write_dmb(
        path,
        &DmbMap {
            height: h,
            width: w,
            channels: 3,
            data,
        },
    )
}

// ---------------------------------------------------------------------------
// Result paths
// ---------------------------------------------------------------------------

/// Which persisted map a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Depth,
    DepthGeom,
    Normal,
    NormalGeom,
    Cost,
}

impl MapKind {
    pub fn file_name(self) -> &'static str {
        match self {
            MapKind::Depth => "depths.dmb",
            MapKind::DepthGeom => "depths_geom.dmb",
            MapKind::Normal => "normals.dmb",
            MapKind::NormalGeom => "normals_geom.dmb",
            MapKind::Cost => "costs.dmb",
        }
    }
}

/// Suffix family used by the consistency maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyVariant {
    /// `depths.dmb` / `normals.dmb`
    Plain,
    /// `depths_geom.dmb` / `normals_geom.dmb`
    MultiGeometry,
}

impl ConsistencyVariant {
    pub fn depth(self) -> MapKind {
        match self {
            ConsistencyVariant::Plain => MapKind::Depth,
            ConsistencyVariant::MultiGeometry => MapKind::DepthGeom,
        }
    }

    pub fn normal(self) -> MapKind {
        match self {
            ConsistencyVariant::Plain => MapKind::Normal,
            ConsistencyVariant::MultiGeometry => MapKind::NormalGeom,
        }
    }
}

/// Per-image result directory: `<dense>/<marker>/<prefix>_<%08d id>`.
pub fn result_dir(dense_folder: &Path, image_id: u32, layout: &ResultLayout) -> PathBuf {
    dense_folder
        .join(&layout.marker)
        .join(format!("{}_{:08}", layout.prefix, image_id))
}

/// Full path of one persisted map.
pub fn result_path(dense_folder: &Path, image_id: u32, kind: MapKind, layout: &ResultLayout) -> PathBuf {
    result_dir(dense_folder, image_id, layout).join(kind.file_name())
}
