//! ONNX model utilities: loading (with external data), graph lifting and
//! lowering, atomic save with the large-model fallback, connectivity
//! validation and model introspection.

pub mod graph_builder;

pub use graph_builder::{
    ensure_opset_version, repack_int4_initializers, validate_graph_connectivity, ConnectivityReport,
    INT4_MIN_OPSET,
};

use crate::errors::{FoldError, Result};
use crate::folding::find_fold_sites;
use crate::graph::Graph;
use crate::onnx_proto::{tensor_proto, ModelProto, StringStringEntryProto, TensorProto};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const MAX_MODEL_SIZE: u64 = 10 * 1024 * 1024 * 1024; // 10 GB

/// Protobuf messages cannot exceed 2 GiB.
pub const PROTOBUF_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

// ===========================================================================
// Core types
// ===========================================================================

pub struct OnnxModel {
    proto: ModelProto,
}

impl std::fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.proto.graph.as_ref();
        f.debug_struct("OnnxModel")
            .field("name", &graph.map_or("", |g| g.name.as_str()))
            .field("num_nodes", &graph.map_or(0, |g| g.node.len()))
            .finish()
    }
}

#[derive(Debug)]
pub struct ModelInfo {
    pub name: String,
    pub producer: String,
    pub ir_version: i64,
    /// Default-domain opset, 0 when undeclared.
    pub opset: i64,
    pub num_nodes: usize,
    pub num_initializers: usize,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Constant-weight QDQ chains that a fold would remove.
    pub foldable_sites: usize,
}

/// How large models are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    /// Sibling file receiving large initializer payloads.
    pub external_data_file: String,
    /// Payloads of at least this many bytes move to the data file.
    pub external_threshold: usize,
    /// Encoded size above which the external-data layout is used.
    pub max_single_file_bytes: u64,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            external_data_file: "model.data".to_string(),
            external_threshold: 1024,
            max_single_file_bytes: PROTOBUF_LIMIT,
        }
    }
}

impl SaveOptions {
    pub fn validate(&self) -> Result<()> {
        let file = Path::new(&self.external_data_file);
        if self.external_data_file.is_empty() || file.file_name() != Some(file.as_os_str()) {
            return Err(FoldError::Config {
                reason: format!(
                    "external_data_file must be a plain file name, got '{}'",
                    self.external_data_file
                ),
            });
        }
        if self.max_single_file_bytes == 0 || self.max_single_file_bytes > PROTOBUF_LIMIT {
            return Err(FoldError::Config {
                reason: format!(
                    "max_single_file_bytes must be in 1..={PROTOBUF_LIMIT}, got {}",
                    self.max_single_file_bytes
                ),
            });
        }
        Ok(())
    }
}

/// What [`OnnxModel::save`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveLayout {
    SingleFile,
    ExternalData {
        data_path: PathBuf,
        /// Number of initializers moved to the data file.
        tensors: usize,
    },
}

// ===========================================================================
// OnnxModel: load / inspect
// ===========================================================================

impl OnnxModel {
    pub fn from_proto(proto: ModelProto) -> Self {
        Self { proto }
    }

    pub fn proto(&self) -> &ModelProto {
        &self.proto
    }

    pub fn into_proto(self) -> ModelProto {
        self.proto
    }

    /// Read and decode a model, pulling external initializer data (if any)
    /// back into `raw_data`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let load_err = |reason: String| FoldError::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };

        let file_size = fs::metadata(path)
            .map_err(|e| load_err(format!("failed to read metadata: {e}")))?
            .len();
        if file_size > MAX_MODEL_SIZE {
            return Err(load_err(format!(
                "model file too large: {:.2} GB (max: 10 GB)",
                file_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )));
        }

        let buffer = fs::read(path).map_err(|e| load_err(format!("failed to read file: {e}")))?;
        let mut proto = ModelProto::decode(buffer.as_slice())
            .map_err(|e| load_err(format!("failed to parse ONNX protobuf: {e}")))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Some(graph) = proto.graph.as_mut() {
            let mut cache = HashMap::new();
            for tensor in graph.initializer.iter_mut() {
                load_external_data(tensor, base_dir, &mut cache).map_err(|e| match e {
                    FoldError::InvalidTensor { name, reason } => {
                        load_err(format!("tensor '{name}': {reason}"))
                    }
                    other => other,
                })?;
            }
        }

        tracing::debug!("loaded {} ({} bytes)", path.display(), file_size);
        Ok(Self { proto })
    }

    pub fn info(&self) -> ModelInfo {
        let graph = self.proto.graph.clone().unwrap_or_default();
        let opset = self
            .proto
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map_or(0, |o| o.version);
        let foldable_sites = Graph::from_proto(graph.clone())
            .map(|g| find_fold_sites(&g).len())
            .unwrap_or(0);

        ModelInfo {
            name: graph.name.clone(),
            producer: self.proto.producer_name.clone(),
            ir_version: self.proto.ir_version,
            opset,
            num_nodes: graph.node.len(),
            num_initializers: graph.initializer.len(),
            inputs: graph.input.iter().map(|i| i.name.clone()).collect(),
            outputs: graph.output.iter().map(|o| o.name.clone()).collect(),
            foldable_sites,
        }
    }

    /// Lift the main graph into its editable form.
    pub fn graph(&self) -> Result<Graph> {
        let proto = self
            .proto
            .graph
            .clone()
            .ok_or_else(|| FoldError::graph("model has no graph"))?;
        Graph::from_proto(proto)
    }

    /// Lower `graph` back into the model. INT4 initializers are packed here
    /// and the opset is raised to one that accepts them.
    pub fn set_graph(&mut self, graph: &Graph) -> Result<()> {
        let mut proto = graph.to_proto();
        let packed = repack_int4_initializers(&mut proto, &graph.int4_initializers)?;
        if packed > 0 {
            tracing::debug!("packed {} INT4 initializers", packed);
            ensure_opset_version(&mut self.proto, INT4_MIN_OPSET);
        }
        self.proto.graph = Some(proto);
        Ok(())
    }

    /// Check that every node input in the graph resolves to a known tensor.
    pub fn validate_connectivity(&self) -> ConnectivityReport {
        match &self.proto.graph {
            Some(graph) => validate_graph_connectivity(graph),
            None => ConnectivityReport {
                valid: false,
                broken_refs: vec!["model has no graph".to_string()],
            },
        }
    }
}

// ===========================================================================
// OnnxModel: save
// ===========================================================================

impl OnnxModel {
    /// Write the model to `path` through a temporary file and an atomic
    /// rename, so an existing file is either fully replaced or untouched.
    ///
    /// Models whose encoding exceeds `options.max_single_file_bytes` get
    /// the external-data layout: initializer payloads of at least
    /// `options.external_threshold` bytes go to a sibling data file. The
    /// in-memory model is unchanged afterwards.
    pub fn save(&mut self, path: impl AsRef<Path>, options: &SaveOptions) -> Result<SaveLayout> {
        let path = path.as_ref();
        options.validate()?;

        let encoded_len = self.proto.encoded_len() as u64;
        if encoded_len <= options.max_single_file_bytes {
            tracing::debug!("writing {} as a single file ({} bytes)", path.display(), encoded_len);
            let bytes = self.proto.encode_to_vec();
            stage_file(path, &[bytes.as_slice()])?.commit(path)?;
            return Ok(SaveLayout::SingleFile);
        }

        tracing::debug!(
            "encoded size {} exceeds {} bytes, writing external data to {}",
            encoded_len,
            options.max_single_file_bytes,
            options.external_data_file
        );

        let moved = self.externalize(options);
        let result = self.write_external(path, options, &moved);
        self.restore_external(moved);
        result
    }

    /// Move large payloads out of `raw_data`, returning them in file order.
    fn externalize(&mut self, options: &SaveOptions) -> Vec<(usize, Vec<u8>)> {
        let Some(graph) = self.proto.graph.as_mut() else {
            return Vec::new();
        };

        let mut moved = Vec::new();
        let mut offset = 0usize;
        for (idx, tensor) in graph.initializer.iter_mut().enumerate() {
            if tensor.raw_data.len() < options.external_threshold {
                continue;
            }
            let data = std::mem::take(&mut tensor.raw_data);
            tensor.external_data = vec![
                entry("location", &options.external_data_file),
                entry("offset", &offset.to_string()),
                entry("length", &data.len().to_string()),
            ];
            tensor.set_data_location(tensor_proto::DataLocation::External);
            offset += data.len();
            moved.push((idx, data));
        }
        moved
    }

    fn write_external(
        &self,
        path: &Path,
        options: &SaveOptions,
        moved: &[(usize, Vec<u8>)],
    ) -> Result<SaveLayout> {
        let encoded_len = self.proto.encoded_len() as u64;
        if encoded_len > PROTOBUF_LIMIT {
            return Err(FoldError::ModelSave {
                path: path.to_path_buf(),
                reason: format!(
                    "model structure is {encoded_len} bytes even with external data; \
                     lower external_threshold"
                ),
            });
        }

        let data_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&options.external_data_file);
        let chunks: Vec<&[u8]> = moved.iter().map(|(_, d)| d.as_slice()).collect();
        let data_file = stage_file(&data_path, &chunks)?;
        let model_bytes = self.proto.encode_to_vec();
        let model_file = stage_file(path, &[model_bytes.as_slice()])?;

        // The pair is not replaced atomically: an earlier data file (possibly
        // the one this model was loaded from) is set aside and put back if
        // either commit fails.
        let previous = set_aside(&data_path)?;
        if let Err(e) = data_file.commit(&data_path) {
            put_back(previous, &data_path);
            return Err(e);
        }
        if let Err(e) = model_file.commit(path) {
            put_back(previous, &data_path);
            return Err(e);
        }

        Ok(SaveLayout::ExternalData {
            data_path,
            tensors: moved.len(),
        })
    }

    fn restore_external(&mut self, moved: Vec<(usize, Vec<u8>)>) {
        let Some(graph) = self.proto.graph.as_mut() else {
            return;
        };
        for (idx, data) in moved {
            let tensor = &mut graph.initializer[idx];
            tensor.raw_data = data;
            tensor.external_data.clear();
            tensor.set_data_location(tensor_proto::DataLocation::Default);
        }
    }
}

fn entry(key: &str, value: &str) -> StringStringEntryProto {
    StringStringEntryProto {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// A fully written temporary file waiting to be renamed over its target.
struct StagedFile(tempfile::NamedTempFile);

impl StagedFile {
    fn commit(self, path: &Path) -> Result<()> {
        self.0.persist(path).map_err(|e| FoldError::ModelSave {
            path: path.to_path_buf(),
            reason: format!("failed to replace file: {}", e.error),
        })?;
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Rename an existing `path` to a temporary name in the same directory. The
/// returned path is deleted on drop unless [`put_back`] restores it.
fn set_aside(path: &Path) -> Result<Option<tempfile::TempPath>> {
    if !path.exists() {
        return Ok(None);
    }
    let save_err = |reason: String| FoldError::ModelSave {
        path: path.to_path_buf(),
        reason,
    };
    let saved = tempfile::Builder::new()
        .prefix(".qdq-fold-previous")
        .tempfile_in(parent_dir(path))
        .map_err(|e| save_err(format!("failed to create temporary file: {e}")))?
        .into_temp_path();
    fs::rename(path, &saved).map_err(|e| save_err(format!("failed to move aside: {e}")))?;
    Ok(Some(saved))
}

/// Undo a partial commit at `path`: restore the set-aside file, or remove
/// the new one when nothing was there before.
fn put_back(previous: Option<tempfile::TempPath>, path: &Path) {
    let restored = match previous {
        Some(saved) => saved.persist(path).map_err(|e| e.error),
        None => match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    };
    if let Err(e) = restored {
        tracing::warn!("failed to restore {}: {}", path.display(), e);
    }
}

/// Write `chunks` to a temporary file next to `path`.
fn stage_file(path: &Path, chunks: &[&[u8]]) -> Result<StagedFile> {
    let save_err = |reason: String| FoldError::ModelSave {
        path: path.to_path_buf(),
        reason,
    };

    let tmp = tempfile::NamedTempFile::new_in(parent_dir(path))
        .map_err(|e| save_err(format!("failed to create temporary file: {e}")))?;

    {
        let mut writer = BufWriter::new(tmp.as_file());
        for chunk in chunks {
            writer
                .write_all(chunk)
                .map_err(|e| save_err(format!("failed to write: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| save_err(format!("failed to flush: {e}")))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| save_err(format!("failed to sync: {e}")))?;

    Ok(StagedFile(tmp))
}

// ===========================================================================
// External data
// ===========================================================================

/// Load a tensor's external payload into `raw_data`.
///
/// The location is resolved relative to `base_dir`. Data files are read
/// once and shared through `cache`.
fn load_external_data(
    tensor: &mut TensorProto,
    base_dir: &Path,
    cache: &mut HashMap<PathBuf, Vec<u8>>,
) -> Result<()> {
    if tensor.data_location() != tensor_proto::DataLocation::External
        || tensor.external_data.is_empty()
    {
        return Ok(());
    }

    let invalid = |reason: String| FoldError::InvalidTensor {
        name: tensor.name.clone(),
        reason,
    };

    let mut location = None;
    let mut offset: u64 = 0;
    let mut length: Option<u64> = None;
    for kv in &tensor.external_data {
        match kv.key.as_str() {
            "location" => location = Some(kv.value.clone()),
            "offset" => {
                offset = kv
                    .value
                    .parse()
                    .map_err(|_| invalid(format!("bad external offset '{}'", kv.value)))?
            }
            "length" => {
                length = Some(
                    kv.value
                        .parse()
                        .map_err(|_| invalid(format!("bad external length '{}'", kv.value)))?,
                )
            }
            _ => {} // checksum and unknown keys are ignored
        }
    }

    let location = location.ok_or_else(|| invalid("external data has no 'location' key".into()))?;
    let external_path = base_dir.join(&location);

    if !cache.contains_key(&external_path) {
        let bytes = fs::read(&external_path)
            .map_err(|e| invalid(format!("failed to read {}: {e}", external_path.display())))?;
        cache.insert(external_path.clone(), bytes);
    }
    let file_data = &cache[&external_path];

    let start = usize::try_from(offset).map_err(|_| invalid("external offset overflows".into()))?;
    let end = match length {
        Some(len) => usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .ok_or_else(|| invalid("external length overflows".into()))?,
        None => file_data.len(),
    };
    let slice = file_data.get(start..end).ok_or_else(|| {
        invalid(format!(
            "external range {start}..{end} exceeds {} ({} bytes)",
            external_path.display(),
            file_data.len()
        ))
    })?;

    tensor.raw_data = slice.to_vec();
    tensor.external_data.clear();
    tensor.set_data_location(tensor_proto::DataLocation::Default);
    Ok(())
}
