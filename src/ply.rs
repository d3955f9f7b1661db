// ply.rs — Binary little-endian PLY point writer.
//
// Output layout:
//
//   ply
//   format binary_little_endian 1.0
//   element vertex N
//   property float x / y / z
//   property uchar red / green / blue
//   end_header
//   N × { f32 x, f32 y, f32 z, u8 r, u8 g, u8 b }
//
// Points with any non-finite coordinate are written at the origin so the
// vertex count always equals the input length.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{DataError, Result};

/// One coloured point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub position: [f32; 3],
    /// Red, green, blue.
    pub color: [u8; 3],
}

/// Serialise `points` to any writer.
pub fn write_ply_to<W: Write>(w: &mut W, points: &[PointRecord]) -> std::io::Result<()> {
    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "element vertex {}", points.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    writeln!(w, "property uchar red")?;
    writeln!(w, "property uchar green")?;
    writeln!(w, "property uchar blue")?;
    writeln!(w, "end_header")?;

    for p in points {
        let pos = if p.position.iter().all(|v| v.is_finite()) {
            p.position
        } else {
            [0.0; 3]
        };
        for v in pos {
            w.write_all(&v.to_le_bytes())?;
        }
        w.write_all(&p.color)?;
    }
    Ok(())
}

/// Write `points` to a PLY file at `path`.
pub fn write_ply(path: &Path, points: &[PointRecord]) -> Result<()> {
    let io = |e| DataError::io(path, e);
    let file = File::create(path).map_err(io)?;
    let mut w = BufWriter::new(file);
    write_ply_to(&mut w, points).map_err(io)?;
    w.flush().map_err(io)?;
    log::info!("wrote {} points to {}", points.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_len(bytes: &[u8]) -> usize {
        let marker = b"end_header\n";
        bytes
            .windows(marker.len())
            .position(|w| w == marker)
            .map(|i| i + marker.len())
            .unwrap()
    }

    #[test]
    fn test_record_layout() {
        let mut out = Vec::new();
        let pts = [PointRecord {
            position: [1.0, 2.0, 3.0],
            color: [10, 20, 30],
        }];
        write_ply_to(&mut out, &pts).unwrap();
        let body = &out[header_len(&out)..];
        assert_eq!(body.len(), 15);
        assert_eq!(f32::from_le_bytes(body[4..8].try_into().unwrap()), 2.0);
        assert_eq!(&body[12..15], &[10, 20, 30]);
    }

    #[test]
    fn test_non_finite_goes_to_origin() {
        let mut out = Vec::new();
        let pts = [PointRecord {
            position: [f32::NAN, 1.0, f32::INFINITY],
            color: [1, 2, 3],
        }];
        write_ply_to(&mut out, &pts).unwrap();
        let body = &out[header_len(&out)..];
        assert!(body[..12].iter().all(|&b| b == 0));
        assert_eq!(&body[12..], &[1, 2, 3]);
    }

    #[test]
    fn test_header_count() {
        let mut out = Vec::new();
        let pts = vec![
            PointRecord {
                position: [0.0; 3],
                color: [0; 3]
            };
            4
        ];
        write_ply_to(&mut out, &pts).unwrap();
        let text = String::from_utf8_lossy(&out[..header_len(&out)]);
        assert!(text.contains("element vertex 4\n"));
        assert_eq!(out.len() - header_len(&out), 4 * 15);
    }
}
