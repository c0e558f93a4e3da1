//! Tensor archive reader.
//!
//! An archive is an 8-byte little-endian header length `N`, followed by `N`
//! bytes of JSON describing every tensor, followed by the raw data region.
//! Each JSON entry is `{"dtype", "shape", "data_offsets": [start, end]}` with
//! offsets relative to the start of the data region. An optional
//! `__metadata__` entry holds free-form string pairs.
//!
//! The file is memory-mapped; [`TensorArchive::read_bytes`] hands out slices
//! of the mapping and never copies the data region.

use memmap2::Mmap;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::dtype::DType;
use crate::error::{WeightsError, WeightsResult};
use crate::numeric::{integral, integral_list};

/// Size of the length prefix.
const LENGTH_PREFIX: usize = 8;

/// Upper bound on the JSON header; anything larger is treated as corruption.
pub const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// Key of the free-form metadata entry.
pub const METADATA_KEY: &str = "__metadata__";

/// The only `format_version` this reader understands.
pub const SUPPORTED_FORMAT_VERSION: &str = "1";

/// A tensor described by the archive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Offset from the start of the data region.
    pub byte_offset: usize,
    pub byte_length: usize,
}

impl TensorRecord {
    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// An open, memory-mapped tensor archive.
#[derive(Debug)]
pub struct TensorArchive {
    path: PathBuf,
    mmap: Mmap,
    data_start: usize,
    records: HashMap<String, TensorRecord>,
    metadata: BTreeMap<String, String>,
}

impl TensorArchive {
    /// Open and parse an archive.
    ///
    /// Only the header is parsed; tensor data stays on disk until read.
    pub fn open(path: impl AsRef<Path>) -> WeightsResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < LENGTH_PREFIX as u64 {
            return Err(corrupt(path, format!("file is {file_len} bytes, shorter than the length prefix")));
        }

        let mmap = map_file(&file)?;
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&mmap[..LENGTH_PREFIX]);
        let header_len = u64::from_le_bytes(prefix);

        if header_len > MAX_HEADER_BYTES {
            return Err(corrupt(path, format!("header length {header_len} exceeds {MAX_HEADER_BYTES}")));
        }
        if header_len > file_len - LENGTH_PREFIX as u64 {
            return Err(corrupt(
                path,
                format!("header length {header_len} exceeds file size {file_len}"),
            ));
        }

        let data_start = LENGTH_PREFIX + header_len as usize;
        let header: Value = serde_json::from_slice(&mmap[LENGTH_PREFIX..data_start])
            .map_err(|e| corrupt(path, format!("header is not valid JSON: {e}")))?;
        let Value::Object(entries) = header else {
            return Err(corrupt(path, "header is not a JSON object".to_string()));
        };

        let data_len = mmap.len() - data_start;
        let (records, metadata) = parse_entries(entries, data_len)?;

        debug!(
            path = %path.display(),
            tensors = records.len(),
            data_bytes = data_len,
            "Opened tensor archive"
        );

        Ok(Self { path: path.to_path_buf(), mmap, data_start, records, metadata })
    }

    /// Path the archive was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a tensor by its flat name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&TensorRecord> {
        self.records.get(name)
    }

    /// All tensors, ordered by name.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorRecord> {
        let mut records: Vec<&TensorRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records.into_iter()
    }

    /// Number of tensors in the archive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The `__metadata__` string pairs.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Size of the data region in bytes.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.mmap.len() - self.data_start
    }

    /// Zero-copy view of a tensor's bytes.
    pub fn read_bytes(&self, record: &TensorRecord) -> WeightsResult<&[u8]> {
        let start = self.data_start + record.byte_offset;
        self.mmap
            .get(start..start + record.byte_length)
            .ok_or_else(|| WeightsError::MalformedMetadata {
                tensor: record.name.clone(),
                reason: format!("byte range is outside {}", self.path.display()),
            })
    }

    /// Zero-copy view of a tensor's bytes, by name.
    pub fn tensor_bytes(&self, name: &str) -> WeightsResult<&[u8]> {
        let record = self
            .lookup(name)
            .ok_or_else(|| WeightsError::TensorNotFound(name.to_string()))?;
        self.read_bytes(record)
    }
}

#[allow(unsafe_code)]
fn map_file(file: &File) -> WeightsResult<Mmap> {
    // SAFETY: the file is opened read-only and archives are treated as
    // immutable while a reader is alive. Truncating a mapped archive from
    // another process is outside the supported usage.
    let mmap = unsafe { Mmap::map(file)? };
    Ok(mmap)
}

fn corrupt(path: &Path, reason: String) -> WeightsError {
    WeightsError::CorruptHeader { path: path.display().to_string(), reason }
}

fn malformed(tensor: &str, reason: impl Into<String>) -> WeightsError {
    WeightsError::MalformedMetadata { tensor: tensor.to_string(), reason: reason.into() }
}

fn parse_entries(
    entries: Map<String, Value>,
    data_len: usize,
) -> WeightsResult<(HashMap<String, TensorRecord>, BTreeMap<String, String>)> {
    let mut records = HashMap::with_capacity(entries.len());
    let mut metadata = BTreeMap::new();

    for (name, entry) in entries {
        if name == METADATA_KEY {
            metadata = parse_metadata(&entry)?;
            continue;
        }
        let record = parse_record(&name, &entry, data_len)?;
        records.insert(name, record);
    }

    Ok((records, metadata))
}

fn parse_metadata(entry: &Value) -> WeightsResult<BTreeMap<String, String>> {
    let Value::Object(pairs) = entry else {
        return Err(malformed(METADATA_KEY, "expected an object of strings"));
    };

    let mut metadata = BTreeMap::new();
    for (key, value) in pairs {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => integral(value).map_or_else(|| n.to_string(), |i| i.to_string()),
            Value::Bool(b) => b.to_string(),
            other => return Err(malformed(METADATA_KEY, format!("value of '{key}' is {other}"))),
        };
        metadata.insert(key.clone(), value);
    }

    if let Some(version) = metadata.get("format_version") {
        if version != SUPPORTED_FORMAT_VERSION {
            return Err(WeightsError::UnsupportedVersion(version.clone()));
        }
    }
    Ok(metadata)
}

fn parse_record(name: &str, entry: &Value, data_len: usize) -> WeightsResult<TensorRecord> {
    let dtype = entry
        .get("dtype")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(name, "missing dtype"))?;
    let dtype: DType = dtype
        .parse()
        .map_err(|()| malformed(name, format!("unsupported dtype '{dtype}'")))?;

    let shape = entry
        .get("shape")
        .ok_or_else(|| malformed(name, "missing shape"))
        .and_then(|v| integral_list(v).ok_or_else(|| malformed(name, format!("shape {v} is not a list of integers"))))?;

    let offsets = entry
        .get("data_offsets")
        .ok_or_else(|| malformed(name, "missing data_offsets"))?;
    let (start, end) = match offsets.as_array().map(Vec::as_slice) {
        Some([start, end]) => (
            integral(start).ok_or_else(|| malformed(name, format!("start offset {start} is not an integer")))?,
            integral(end).ok_or_else(|| malformed(name, format!("end offset {end} is not an integer")))?,
        ),
        _ => return Err(malformed(name, format!("data_offsets {offsets} is not a [start, end] pair"))),
    };

    if start > end {
        return Err(malformed(name, format!("start offset {start} is past end offset {end}")));
    }
    if end > data_len as u64 {
        return Err(malformed(name, format!("end offset {end} exceeds data region of {data_len} bytes")));
    }

    let shape: Vec<usize> = shape.into_iter().map(|d| d as usize).collect();
    let byte_length = (end - start) as usize;
    let expected = shape
        .iter()
        .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| malformed(name, "shape overflows"))?;
    if expected != byte_length {
        return Err(malformed(
            name,
            format!("shape {shape:?} of {dtype} needs {expected} bytes, range holds {byte_length}"),
        ));
    }

    Ok(TensorRecord {
        name: name.to_string(),
        dtype,
        shape,
        byte_offset: start as usize,
        byte_length,
    })
}

/// A tensor to be written by [`write_archive`].
#[derive(Debug, Clone, Copy)]
pub struct ArchiveTensor<'a> {
    pub name: &'a str,
    pub dtype: DType,
    pub shape: &'a [usize],
    pub data: &'a [u8],
}

/// Write an archive. Tensors are laid out in name order and the header is
/// padded with spaces so the data region starts on an 8-byte boundary.
pub fn write_archive(
    path: impl AsRef<Path>,
    metadata: &BTreeMap<String, String>,
    tensors: &[ArchiveTensor<'_>],
) -> WeightsResult<()> {
    let mut ordered: Vec<&ArchiveTensor<'_>> = tensors.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(b.name));

    let mut header = Map::new();
    if !metadata.is_empty() {
        let pairs = metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        header.insert(METADATA_KEY.to_string(), Value::Object(pairs));
    }

    let mut offset = 0usize;
    for tensor in &ordered {
        let expected = tensor.shape.iter().product::<usize>() * tensor.dtype.size();
        if expected != tensor.data.len() {
            return Err(malformed(
                tensor.name,
                format!("shape {:?} needs {expected} bytes, got {}", tensor.shape, tensor.data.len()),
            ));
        }
        header.insert(
            tensor.name.to_string(),
            serde_json::json!({
                "dtype": tensor.dtype.as_str(),
                "shape": tensor.shape,
                "data_offsets": [offset, offset + tensor.data.len()],
            }),
        );
        offset += tensor.data.len();
    }

    let mut header_bytes = serde_json::to_vec(&Value::Object(header))?;
    let padding = (LENGTH_PREFIX - header_bytes.len() % LENGTH_PREFIX) % LENGTH_PREFIX;
    header_bytes.resize(header_bytes.len() + padding, b' ');

    let mut file = File::create(path.as_ref())?;
    file.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    file.write_all(&header_bytes)?;
    for tensor in ordered {
        file.write_all(tensor.data)?;
    }
    file.flush()?;
    Ok(())
}
