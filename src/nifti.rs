//! Minimal NIfTI header reading.
//!
//! The `same_dimensions` validation only needs the dimension tuple of each
//! volume, so this reads just the fixed-size header (NIfTI-1 and NIfTI-2,
//! plain or gzip-compressed) instead of pulling in a full neuroimaging
//! stack. Both byte orders are handled; the header's own `sizeof_hdr` field
//! doubles as the endianness witness.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// NIfTI-1 headers are 348 bytes; `dim[8]` (i16 each) starts at byte 40.
const NIFTI1_HEADER_LEN: usize = 348;
const NIFTI1_DIM_OFFSET: usize = 40;

/// NIfTI-2 headers are 540 bytes; `dim[8]` (i64 each) starts at byte 16.
const NIFTI2_HEADER_LEN: usize = 540;
const NIFTI2_DIM_OFFSET: usize = 16;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: not a NIfTI file (header size field is {found})")]
    UnrecognizedHeader { path: String, found: i32 },
    #[error("{path}: file truncated ({len} bytes)")]
    Truncated { path: String, len: usize },
    #[error("{path}: invalid dimension count {ndim}")]
    BadDimCount { path: String, ndim: i64 },
}

#[derive(Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

/// Read the dimension tuple of a NIfTI volume (`.nii` or `.nii.gz`).
pub fn read_shape(path: &Path) -> Result<Vec<u64>, ShapeError> {
    let display = path.display().to_string();
    let io_err = |source| ShapeError::Io {
        path: display.clone(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut header = vec![0u8; NIFTI2_HEADER_LEN];
    let is_gz = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    let len = if is_gz {
        read_up_to(&mut GzDecoder::new(file), &mut header).map_err(io_err)?
    } else {
        read_up_to(&mut file, &mut header).map_err(io_err)?
    };

    if len < 4 {
        return Err(ShapeError::Truncated { path: display, len });
    }
    let sizeof_hdr_le = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let sizeof_hdr_be = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);

    let (version_len, order) = match (sizeof_hdr_le, sizeof_hdr_be) {
        (348, _) => (NIFTI1_HEADER_LEN, ByteOrder::Little),
        (_, 348) => (NIFTI1_HEADER_LEN, ByteOrder::Big),
        (540, _) => (NIFTI2_HEADER_LEN, ByteOrder::Little),
        (_, 540) => (NIFTI2_HEADER_LEN, ByteOrder::Big),
        _ => {
            return Err(ShapeError::UnrecognizedHeader {
                path: display,
                found: sizeof_hdr_le,
            });
        }
    };
    if len < version_len {
        return Err(ShapeError::Truncated { path: display, len });
    }

    let dim: Vec<i64> = if version_len == NIFTI1_HEADER_LEN {
        (0..8)
            .map(|i| {
                let off = NIFTI1_DIM_OFFSET + 2 * i;
                let bytes = [header[off], header[off + 1]];
                i64::from(match order {
                    ByteOrder::Little => i16::from_le_bytes(bytes),
                    ByteOrder::Big => i16::from_be_bytes(bytes),
                })
            })
            .collect()
    } else {
        (0..8)
            .map(|i| {
                let off = NIFTI2_DIM_OFFSET + 8 * i;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&header[off..off + 8]);
                match order {
                    ByteOrder::Little => i64::from_le_bytes(bytes),
                    ByteOrder::Big => i64::from_be_bytes(bytes),
                }
            })
            .collect()
    };

    let ndim = dim[0];
    if !(1..=7).contains(&ndim) {
        return Err(ShapeError::BadDimCount {
            path: display,
            ndim,
        });
    }

    Ok(dim[1..=ndim as usize]
        .iter()
        .map(|&d| d.max(0) as u64)
        .collect())
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}


#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn reads_nifti1_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "vol.nii", &testdata::nifti1_bytes(&[91, 109, 91]));
        assert_eq!(read_shape(&path).unwrap(), vec![91, 109, 91]);
    }

    #[test]
    fn reads_big_endian_nifti1_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "vol.nii", &testdata::nifti1_bytes_be(&[64, 64]));
        assert_eq!(read_shape(&path).unwrap(), vec![64, 64]);
    }

    #[test]
    fn reads_nifti2_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "vol.nii", &testdata::nifti2_bytes(&[10, 20, 30, 5]));
        assert_eq!(read_shape(&path).unwrap(), vec![10, 20, 30, 5]);
    }

    #[test]
    fn reads_gzipped_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&testdata::nifti1_bytes(&[16, 16, 16]))
            .unwrap();
        let path = write_temp(&dir, "vol.nii.gz", &encoder.finish().unwrap());
        assert_eq!(read_shape(&path).unwrap(), vec![16, 16, 16]);
    }

    #[test]
    fn rejects_non_nifti_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "not.nii", &[0u8; 400]);
        assert!(matches!(
            read_shape(&path),
            Err(ShapeError::UnrecognizedHeader { .. })
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = testdata::nifti1_bytes(&[8, 8]);
        bytes.truncate(100);
        let path = write_temp(&dir, "short.nii", &bytes);
        assert!(matches!(read_shape(&path), Err(ShapeError::Truncated { .. })));
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.nii");
        assert!(matches!(read_shape(&path), Err(ShapeError::Io { .. })));
    }

    #[test]
    fn rejects_bad_dim_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = testdata::nifti1_bytes(&[8, 8]);
        bytes[40..42].copy_from_slice(&0i16.to_le_bytes());
        let path = write_temp(&dir, "baddim.nii", &bytes);
        assert!(matches!(
            read_shape(&path),
            Err(ShapeError::BadDimCount { .. })
        ));
    }
}
