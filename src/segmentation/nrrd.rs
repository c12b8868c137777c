//! Attached-header NRRD label maps.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

use super::{ReadVolumeError, to_label};
use crate::volume::{Geometry, Volume};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ScalarType {
    fn parse(name: &str) -> Option<Self> {
        let scalar = match name {
            "signed char" | "int8" | "int8_t" => Self::I8,
            "uchar" | "unsigned char" | "uint8" | "uint8_t" => Self::U8,
            "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
                Self::I16
            }
            "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => Self::U16,
            "int" | "signed int" | "int32" | "int32_t" => Self::I32,
            "uint" | "unsigned int" | "uint32" | "uint32_t" => Self::U32,
            "longlong" | "long long" | "long long int" | "signed long long"
            | "signed long long int" | "int64" | "int64_t" => Self::I64,
            "ulonglong" | "unsigned long long" | "unsigned long long int" | "uint64"
            | "uint64_t" => Self::U64,
            "float" => Self::F32,
            "double" => Self::F64,
            _ => return None,
        };
        Some(scalar)
    }

    fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    fn decode(self, bytes: &[u8], big_endian: bool) -> f64 {
        macro_rules! read {
            ($ty:ty, $n:literal) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&bytes[..$n]);
                if big_endian {
                    <$ty>::from_be_bytes(raw) as f64
                } else {
                    <$ty>::from_le_bytes(raw) as f64
                }
            }};
        }
        match self {
            Self::I8 => bytes[0] as i8 as f64,
            Self::U8 => bytes[0] as f64,
            Self::I16 => read!(i16, 2),
            Self::U16 => read!(u16, 2),
            Self::I32 => read!(i32, 4),
            Self::U32 => read!(u32, 4),
            Self::I64 => read!(i64, 8),
            Self::U64 => read!(u64, 8),
            Self::F32 => read!(f32, 4),
            Self::F64 => read!(f64, 8),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Raw,
    Gzip,
    Ascii,
}

struct NrrdHeader {
    scalar: ScalarType,
    sizes: [usize; 3],
    encoding: Encoding,
    big_endian: bool,
    geometry: Geometry,
}

pub(crate) fn read_nrrd(path: &Path) -> Result<Volume<u16>, ReadVolumeError> {
    let bytes = fs::read(path)?;
    let (header_text, data_start) = split_header(path, &bytes)?;
    let header = parse_header(path, header_text)?;

    let count = header
        .sizes
        .iter()
        .try_fold(1usize, |count, &size| count.checked_mul(size))
        .ok_or_else(|| ReadVolumeError::InvalidHeader {
            path: path.to_path_buf(),
            message: format!("sizes {:?} overflow the voxel count", header.sizes),
        })?;
    let values = decode_values(path, &header, &bytes[data_start..], count)?;
    let labels = values
        .into_iter()
        .map(|value| to_label(path, value))
        .collect::<Result<Vec<_>, _>>()?;

    let [width, height, depth] = header.sizes;
    let data = Array3::from_shape_vec((depth, height, width), labels).map_err(|err| {
        ReadVolumeError::InvalidHeader {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })?;
    Ok(Volume::new(data, header.geometry)?)
}

/// Header text and the offset of the first data byte.
fn split_header<'a>(path: &Path, bytes: &'a [u8]) -> Result<(&'a str, usize), ReadVolumeError> {
    let invalid = |message: &str| ReadVolumeError::InvalidHeader {
        path: path.to_path_buf(),
        message: message.to_string(),
    };

    if !bytes.starts_with(b"NRRD") {
        return Err(invalid("missing NRRD magic"));
    }
    let (end, separator) = find_blank_line(bytes).ok_or_else(|| invalid("no end of header"))?;
    let text = std::str::from_utf8(&bytes[..end]).map_err(|_| invalid("header is not text"))?;
    Ok((text, end + separator))
}

fn find_blank_line(bytes: &[u8]) -> Option<(usize, usize)> {
    bytes.windows(2).enumerate().find_map(|(i, window)| {
        if window == b"\n\n" {
            Some((i + 1, 1))
        } else if window == b"\n\r" && bytes.get(i + 2) == Some(&b'\n') {
            Some((i + 1, 2))
        } else {
            None
        }
    })
}

fn parse_header(path: &Path, text: &str) -> Result<NrrdHeader, ReadVolumeError> {
    let invalid = |message: String| ReadVolumeError::InvalidHeader {
        path: path.to_path_buf(),
        message,
    };

    let mut fields = HashMap::new();
    for line in text.lines().skip(1) {
        let line = line.trim_end_matches('\r');
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        // `key:=value` lines carry free-form metadata.
        if line.contains(":=") {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    if fields.contains_key("data file") || fields.contains_key("datafile") {
        return Err(invalid("detached data files are not supported".into()));
    }

    let dimension: usize = fields
        .get("dimension")
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| invalid("missing dimension".into()))?;
    if dimension != 3 {
        return Err(invalid(format!("expected a 3D volume, found dimension {dimension}")));
    }

    let scalar = fields
        .get("type")
        .and_then(|value| ScalarType::parse(value))
        .ok_or_else(|| invalid("missing or unknown type".into()))?;

    let sizes: Vec<usize> = fields
        .get("sizes")
        .ok_or_else(|| invalid("missing sizes".into()))?
        .split_whitespace()
        .map(|value| value.parse())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid("malformed sizes".into()))?;
    let sizes: [usize; 3] = sizes
        .try_into()
        .map_err(|_| invalid("sizes must have three entries".into()))?;

    let encoding = match fields.get("encoding").map(String::as_str) {
        Some("raw") => Encoding::Raw,
        Some("gzip") | Some("gz") => Encoding::Gzip,
        Some("ascii") | Some("text") | Some("txt") => Encoding::Ascii,
        other => return Err(invalid(format!("unsupported encoding {other:?}"))),
    };

    let big_endian = match fields.get("endian").map(String::as_str) {
        Some("big") => true,
        Some("little") | None => false,
        Some(other) => return Err(invalid(format!("unknown endian {other}"))),
    };

    let (mut columns, mut origin) = match fields.get("space directions") {
        Some(directions) => {
            let vectors = parse_vectors(directions).ok_or_else(|| {
                invalid(format!("malformed space directions {directions}"))
            })?;
            let vectors: [Vector3<f64>; 3] = vectors
                .try_into()
                .map_err(|_| invalid("space directions must have three vectors".into()))?;
            let origin = match fields.get("space origin") {
                Some(origin) => parse_vectors(origin)
                    .and_then(|mut vectors| vectors.pop())
                    .ok_or_else(|| invalid(format!("malformed space origin {origin}")))?,
                None => Vector3::zeros(),
            };
            (vectors, origin)
        }
        None => {
            let spacings: Vec<f64> = fields
                .get("spacings")
                .map(|value| {
                    value
                        .split_whitespace()
                        .map(|spacing| spacing.parse().unwrap_or(1.0))
                        .collect()
                })
                .unwrap_or_else(|| vec![1.0; 3]);
            let spacing = |axis: usize| spacings.get(axis).copied().filter(|s| s.is_finite());
            (
                [
                    Vector3::x() * spacing(0).unwrap_or(1.0),
                    Vector3::y() * spacing(1).unwrap_or(1.0),
                    Vector3::z() * spacing(2).unwrap_or(1.0),
                ],
                Vector3::zeros(),
            )
        }
    };

    // Bring other anatomical spaces into LPS.
    let flip = match fields.get("space").map(|space| space.to_ascii_lowercase()) {
        Some(space) if space == "right-anterior-superior" || space == "ras" => {
            Vector3::new(-1.0, -1.0, 1.0)
        }
        Some(space) if space == "left-anterior-superior" || space == "las" => {
            Vector3::new(1.0, -1.0, 1.0)
        }
        _ => Vector3::new(1.0, 1.0, 1.0),
    };
    for column in columns.iter_mut() {
        *column = column.component_mul(&flip);
    }
    origin = origin.component_mul(&flip);

    let spacing = Vector3::new(columns[0].norm(), columns[1].norm(), columns[2].norm());
    if spacing.iter().any(|s| *s == 0.0) {
        return Err(invalid("zero-length space direction".into()));
    }
    let direction = Matrix3::from_columns(&[
        columns[0] / spacing.x,
        columns[1] / spacing.y,
        columns[2] / spacing.z,
    ]);

    Ok(NrrdHeader {
        scalar,
        sizes,
        encoding,
        big_endian,
        geometry: Geometry::new(origin, spacing, direction, sizes),
    })
}

/// Parses `(a,b,c) (d,e,f) ...`.
fn parse_vectors(text: &str) -> Option<Vec<Vector3<f64>>> {
    text.split(')')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            let values: Vec<f64> = chunk
                .trim_start_matches('(')
                .split(',')
                .map(|value| value.trim().parse().ok())
                .collect::<Option<_>>()?;
            (values.len() == 3).then(|| Vector3::new(values[0], values[1], values[2]))
        })
        .collect()
}

fn decode_values(
    path: &Path,
    header: &NrrdHeader,
    data: &[u8],
    count: usize,
) -> Result<Vec<f64>, ReadVolumeError> {
    let raw = match header.encoding {
        Encoding::Ascii => {
            let text = String::from_utf8_lossy(data);
            let values: Vec<f64> = text
                .split_whitespace()
                .take(count)
                .map(|value| value.parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|err| ReadVolumeError::InvalidHeader {
                    path: path.to_path_buf(),
                    message: format!("malformed ascii data: {err}"),
                })?;
            if values.len() != count {
                return Err(ReadVolumeError::Truncated {
                    path: path.to_path_buf(),
                    expected: count,
                    found: values.len(),
                });
            }
            return Ok(values);
        }
        Encoding::Raw => data.to_vec(),
        Encoding::Gzip => {
            let mut decompressed = Vec::new();
            GzDecoder::new(data).read_to_end(&mut decompressed)?;
            decompressed
        }
    };

    let size = header.scalar.size();
    let expected = count
        .checked_mul(size)
        .ok_or_else(|| ReadVolumeError::InvalidHeader {
            path: path.to_path_buf(),
            message: format!("{count} voxels of {size} bytes overflow the data length"),
        })?;
    if raw.len() < expected {
        return Err(ReadVolumeError::Truncated {
            path: path.to_path_buf(),
            expected,
            found: raw.len(),
        });
    }
    Ok(raw[..expected]
        .chunks_exact(size)
        .map(|chunk| header.scalar.decode(chunk, header.big_endian))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;
    use tempfile::{TempDir, tempdir};

    fn scratch_file(name: &str, contents: &[u8]) -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_raw_lps_volume() {
        let mut contents = b"NRRD0004\n\
# Complete NRRD file format specification at:\n\
type: unsigned short\n\
dimension: 3\n\
space: left-posterior-superior\n\
sizes: 2 2 1\n\
space directions: (0.5,0,0) (0,0.5,0) (0,0,2)\n\
kinds: domain domain domain\n\
endian: little\n\
encoding: raw\n\
space origin: (-10,5,3.5)\n\
Segment0_Name:=liver\n\n"
            .to_vec();
        for value in [0u16, 1, 2, 1] {
            contents.extend_from_slice(&value.to_le_bytes());
        }
        let (_dir, path) = scratch_file("mask.seg.nrrd", &contents);

        let volume = read_nrrd(&path).unwrap();
        assert_eq!(volume.dim(), (1, 2, 2));
        assert_eq!(volume.data()[[0, 1, 0]], 2);
        let geometry = volume.geometry();
        assert_relative_eq!(geometry.spacing, Vector3::new(0.5, 0.5, 2.0));
        assert_relative_eq!(geometry.origin, Vector3::new(-10.0, 5.0, 3.5));
        assert_relative_eq!(geometry.direction, Matrix3::identity());
    }

    #[test]
    fn reads_gzip_ras_volume() {
        let header = b"NRRD0004\n\
type: uint8\n\
dimension: 3\n\
space: right-anterior-superior\n\
sizes: 3 1 1\n\
space directions: (1,0,0) (0,1,0) (0,0,1)\n\
encoding: gzip\n\
space origin: (4,6,8)\n\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[5, 0, 7]).unwrap();
        let mut contents = header.to_vec();
        contents.extend(encoder.finish().unwrap());
        let (_dir, path) = scratch_file("mask.nrrd", &contents);

        let volume = read_nrrd(&path).unwrap();
        let row: Vec<u16> = volume.data().iter().copied().collect();
        assert_eq!(row, vec![5, 0, 7]);
        assert_relative_eq!(volume.geometry().origin, Vector3::new(-4.0, -6.0, 8.0));
        assert_relative_eq!(
            volume.geometry().direction,
            Matrix3::from_diagonal(&Vector3::new(-1.0, -1.0, 1.0))
        );
    }

    #[test]
    fn rejects_truncated_data() {
        let mut contents =
            b"NRRD0004\ntype: short\ndimension: 3\nsizes: 2 2 2\nencoding: raw\n\n".to_vec();
        contents.extend_from_slice(&[0u8; 6]);
        let (_dir, path) = scratch_file("short.nrrd", &contents);
        assert!(matches!(
            read_nrrd(&path),
            Err(ReadVolumeError::Truncated { expected: 16, found: 6, .. })
        ));
    }

    #[test]
    fn rejects_negative_labels() {
        let mut contents =
            b"NRRD0004\ntype: int8\ndimension: 3\nsizes: 1 1 2\nencoding: raw\n\n".to_vec();
        contents.extend_from_slice(&[1u8, 0xFF]);
        let (_dir, path) = scratch_file("negative.nrrd", &contents);
        assert!(matches!(
            read_nrrd(&path),
            Err(ReadVolumeError::InvalidLabel { value, .. }) if value == -1.0
        ));
    }

    #[test]
    fn rejects_detached_header() {
        let (_dir, path) = scratch_file(
            "detached.nrrd",
            b"NRRD0004\ntype: uint8\ndimension: 3\nsizes: 1 1 1\nencoding: raw\ndata file: mask.raw\n\n",
        );
        assert!(matches!(
            read_nrrd(&path),
            Err(ReadVolumeError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn rejects_sizes_overflowing_the_voxel_count() {
        let path_for = |sizes: &str| {
            scratch_file(
                "huge.nrrd",
                format!("NRRD0004\ntype: ushort\ndimension: 3\nsizes: {sizes}\nencoding: raw\n\n")
                    .as_bytes(),
            )
        };

        let (_dir, path) = path_for("4294967296 4294967296 2");
        assert!(matches!(
            read_nrrd(&path),
            Err(ReadVolumeError::InvalidHeader { message, .. }) if message.contains("voxel count")
        ));

        // fits in usize as a voxel count, not as a byte count
        let (_dir, path) = path_for("3074457345618258603 3 1");
        assert!(matches!(
            read_nrrd(&path),
            Err(ReadVolumeError::InvalidHeader { message, .. }) if message.contains("data length")
        ));
    }
}
