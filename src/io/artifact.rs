//! Sequence bundles as NumPy `.npz` archives.
//!
//! Each bundle is an uncompressed zip holding six `.npy` members:
//! `in_flow` and `out_flow` (`<f8`, shape `(K, F + 1)`), `label`, `n_in`,
//! `n_out` (`<i8` scalars) and `entity_id` (`<u8` scalar). Member order,
//! timestamps and permissions are fixed so identical bundles produce identical
//! bytes.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::constants::SEQUENCE_SHARD_WIDTH;
use crate::error::{PipelineError, Result};
use crate::types::{EntityId, Label, SequenceBundle, SequenceMatrix};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
// magic + version + u16 header length
const NPY_PREAMBLE: usize = 10;
const NPY_ALIGNMENT: usize = 64;

const IN_FLOW: &str = "in_flow.npy";
const OUT_FLOW: &str = "out_flow.npy";
const LABEL: &str = "label.npy";
const ENTITY_ID: &str = "entity_id.npy";
const N_IN: &str = "n_in.npy";
const N_OUT: &str = "n_out.npy";

/// `sequences/{dense / 10000:03}/entity_{dense:06}.npz`
#[must_use]
pub fn bundle_path(sequence_root: &Path, dense: u32) -> PathBuf {
    sequence_root
        .join(format!("{:03}", dense / SEQUENCE_SHARD_WIDTH))
        .join(format!("entity_{dense:06}.npz"))
}

fn npy_header(descr: &str, shape: &[usize]) -> Vec<u8> {
    let shape = match shape {
        [] => "()".to_string(),
        [only] => format!("({only},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
    let unpadded = NPY_PREAMBLE + dict.len() + 1;
    dict.extend(std::iter::repeat_n(' ', unpadded.next_multiple_of(NPY_ALIGNMENT) - unpadded));
    dict.push('\n');

    let mut bytes = Vec::with_capacity(NPY_PREAMBLE + dict.len());
    bytes.extend_from_slice(NPY_MAGIC);
    bytes.extend_from_slice(&[1, 0]);
    // dict is at most a few hundred bytes
    bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());
    bytes
}

fn npy_matrix(matrix: &SequenceMatrix) -> Vec<u8> {
    let mut bytes = npy_header("<f8", &[matrix.rows(), matrix.cols()]);
    bytes.reserve(matrix.as_slice().len() * 8);
    for value in matrix.as_slice() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn npy_i64(value: i64) -> Vec<u8> {
    let mut bytes = npy_header("<i8", &[]);
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

fn npy_u64(value: u64) -> Vec<u8> {
    let mut bytes = npy_header("<u8", &[]);
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

/// A parsed `.npy` member: dtype, shape and raw little-endian data.
struct NpyArray<'a> {
    descr: String,
    shape: Vec<usize>,
    data: &'a [u8],
}

fn parse_npy(bytes: &[u8]) -> std::result::Result<NpyArray<'_>, String> {
    if bytes.len() < NPY_PREAMBLE || &bytes[..6] != NPY_MAGIC {
        return Err("missing npy magic".into());
    }
    if bytes[6] != 1 {
        return Err(format!("unsupported npy version {}.{}", bytes[6], bytes[7]));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = NPY_PREAMBLE + header_len;
    let header = bytes
        .get(NPY_PREAMBLE..data_start)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .ok_or("npy header truncated or not UTF-8")?;

    let descr = dict_value(header, "'descr':")
        .and_then(|raw| raw.split('\'').nth(1))
        .ok_or("npy header lacks descr")?
        .to_string();
    if !dict_value(header, "'fortran_order':").is_some_and(|raw| raw.starts_with("False")) {
        return Err("fortran-ordered arrays are not supported".into());
    }
    let shape_text = dict_value(header, "'shape':")
        .and_then(|raw| raw.strip_prefix('('))
        .and_then(|raw| raw.split(')').next())
        .ok_or("npy header lacks shape")?;
    let shape = shape_text
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.parse::<usize>().map_err(|_| format!("bad dimension {dim:?}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(NpyArray {
        descr,
        shape,
        data: &bytes[data_start..],
    })
}

fn dict_value<'h>(header: &'h str, key: &str) -> Option<&'h str> {
    header
        .find(key)
        .map(|at| header[at + key.len()..].trim_start())
}

impl SequenceBundle {
    /// Serialize to `.npz` bytes.
    pub fn to_npz_bytes(&self) -> Result<Vec<u8>> {
        let members = [
            (IN_FLOW, npy_matrix(&self.in_flow)),
            (OUT_FLOW, npy_matrix(&self.out_flow)),
            (LABEL, npy_i64(self.label.as_i64())),
            (ENTITY_ID, npy_u64(self.entity_id.0)),
            (N_IN, npy_i64(self.n_in as i64)),
            (N_OUT, npy_i64(self.n_out as i64)),
        ];
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in members {
            zip.start_file(name, options)?;
            zip.write_all(&bytes)?;
        }
        Ok(zip.finish()?.into_inner())
    }

    /// Write the bundle so that readers see either nothing or the whole archive.
    pub fn write_npz(&self, path: &Path) -> Result<()> {
        let bytes = self.to_npz_bytes()?;
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = AtomicWriteFile::options().open(path)?;
        file.write_all(&bytes)?;
        file.commit()?;
        Ok(())
    }

    pub fn read_npz(path: &Path) -> Result<Self> {
        let bytes = fs_err::read(path)?;
        let invalid = |reason: String| PipelineError::InvalidArtifact {
            path: path.to_path_buf(),
            reason,
        };
        let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice()))?;
        let mut member = |name: &str| -> Result<Vec<u8>> {
            let mut file = archive.by_name(name)?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(buf)
        };
        let in_flow = member(IN_FLOW)?;
        let out_flow = member(OUT_FLOW)?;
        let label = member(LABEL)?;
        let entity_id = member(ENTITY_ID)?;
        let n_in = member(N_IN)?;
        let n_out = member(N_OUT)?;

        let matrix = |name: &str, raw: &[u8]| -> Result<SequenceMatrix> {
            let array = parse_npy(raw).map_err(|reason| invalid(format!("{name}: {reason}")))?;
            let [rows, cols] = array.shape[..] else {
                return Err(invalid(format!("{name}: expected a 2-d array")));
            };
            if array.descr != "<f8" || array.data.len() != rows * cols * 8 {
                return Err(invalid(format!("{name}: expected {rows}x{cols} <f8 data")));
            }
            let data = array
                .data
                .chunks_exact(8)
                .map(|b| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(b);
                    f64::from_le_bytes(word)
                })
                .collect();
            SequenceMatrix::from_vec(rows, cols, data)
                .ok_or_else(|| invalid(format!("{name}: shape mismatch")))
        };
        let scalar = |name: &str, raw: &[u8], descr: &str| -> Result<[u8; 8]> {
            let array = parse_npy(raw).map_err(|reason| invalid(format!("{name}: {reason}")))?;
            if array.descr != descr || !array.shape.is_empty() || array.data.len() != 8 {
                return Err(invalid(format!("{name}: expected a {descr} scalar")));
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(array.data);
            Ok(word)
        };

        let label_raw = i64::from_le_bytes(scalar(LABEL, &label, "<i8")?);
        let label = Label::from_i64(label_raw)
            .ok_or_else(|| invalid(format!("label {label_raw} is not 0 or 1")))?;
        let count = |name: &str, raw: &[u8]| -> Result<u64> {
            let value = i64::from_le_bytes(scalar(name, raw, "<i8")?);
            u64::try_from(value).map_err(|_| invalid(format!("{name}: negative count {value}")))
        };

        Ok(Self {
            entity_id: EntityId(u64::from_le_bytes(scalar(ENTITY_ID, &entity_id, "<u8")?)),
            label,
            in_flow: matrix(IN_FLOW, &in_flow)?,
            out_flow: matrix(OUT_FLOW, &out_flow)?,
            n_in: count(N_IN, &n_in)?,
            n_out: count(N_OUT, &n_out)?,
        })
    }
}
