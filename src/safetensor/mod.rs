// src/safetensor/mod.rs
// ============================================================================
// SAFETENSOR READER - Lee checkpoints HuggingFace / AutoGPTQ
// ============================================================================
//
// Los tensores se sirven prestados directamente del mmap: el encoder nunca
// copia un tensor salvo que haga downcast.
//
// ============================================================================

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use memmap2::Mmap;
use serde::Deserialize;

use crate::store::ParameterStore;
use crate::tensor::{ElementType, Tensor};

/// Tamaño máximo del header JSON (100 MB)
const MAX_HEADER_SIZE: usize = 100 * 1024 * 1024;

/// Información de un tensor en el archivo safetensor
#[derive(Debug, Clone, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [usize; 2],
}

/// Header del archivo safetensor
#[derive(Debug, Deserialize)]
pub struct SafetensorHeader {
    #[serde(flatten)]
    pub tensors: HashMap<String, TensorInfo>,
    #[serde(rename = "__metadata__")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Archivo safetensor abierto
pub struct SafetensorFile {
    pub path: PathBuf,
    pub header: SafetensorHeader,
    pub header_size: usize,
    dtypes: HashMap<String, ElementType>,
    mmap: Mmap,
}

impl SafetensorFile {
    /// Abre un archivo safetensor y valida offsets y tamaños de todos los tensores.
    ///
    /// Un dtype desconocido no invalida el archivo: el tensor queda listado
    /// pero `tensor()` no lo sirve, y solo falla si alguien lo pide.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Cannot open {}", path.display()))?;

        // Leer tamaño del header (primeros 8 bytes, little-endian u64)
        let mut reader = BufReader::new(&file);
        let mut header_size_bytes = [0u8; 8];
        reader.read_exact(&mut header_size_bytes)
            .with_context(|| format!("{} is too short for a safetensors file", path.display()))?;
        let header_size = u64::from_le_bytes(header_size_bytes) as usize;

        if header_size > MAX_HEADER_SIZE {
            bail!("Header of {} too large ({} bytes)", path.display(), header_size);
        }

        // Leer header JSON
        let mut header_bytes = vec![0u8; header_size];
        reader.read_exact(&mut header_bytes)?;

        let header: SafetensorHeader = serde_json::from_slice(&header_bytes)
            .with_context(|| format!("Invalid safetensor header JSON in {}", path.display()))?;

        // Memory map el archivo
        // SAFETY: el archivo se abre en solo lectura y no se modifica mientras vive el mmap
        let mmap = unsafe { Mmap::map(&file)? };

        let data_len = mmap.len().saturating_sub(8 + header_size);
        let mut dtypes = HashMap::with_capacity(header.tensors.len());

        for (name, info) in &header.tensors {
            let [start, end] = info.data_offsets;
            if start > end || end > data_len {
                bail!(
                    "Tensor '{}' has offsets {}..{} outside the data section ({} bytes)",
                    name, start, end, data_len
                );
            }

            let Some(dtype) = ElementType::from_safetensors(&info.dtype) else {
                warn!("Tensor '{}' in {} has unknown dtype {}", name, path.display(), info.dtype);
                continue;
            };

            let Some(expected) = dtype.bytes_for(&info.shape) else {
                bail!(
                    "Tensor '{}' ({} {:?}) overflows the addressable size",
                    name, dtype, info.shape
                );
            };
            if expected != end - start {
                bail!(
                    "Tensor '{}' ({} {:?}) does not match its byte range ({} bytes)",
                    name, dtype, info.shape, end - start
                );
            }

            dtypes.insert(name.clone(), dtype);
        }

        debug!("Opened {} ({} tensors)", path.display(), header.tensors.len());

        Ok(Self {
            path,
            header,
            header_size: 8 + header_size,
            dtypes,
            mmap,
        })
    }

    /// Lista nombres de tensores
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.header.tensors.keys().map(|s| s.as_str())
    }

    /// Obtiene información de un tensor
    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.header.tensors.get(name)
    }

    /// Bytes del tensor dentro del mmap (offsets ya validados en open())
    fn data(&self, info: &TensorInfo) -> &[u8] {
        let start = self.header_size + info.data_offsets[0];
        let end = self.header_size + info.data_offsets[1];
        &self.mmap[start..end]
    }

    /// Tensor prestado del mmap. None si no existe o su dtype es desconocido.
    pub fn tensor(&self, name: &str) -> Option<Tensor<'_>> {
        let info = self.header.tensors.get(name)?;
        let dtype = *self.dtypes.get(name)?;
        Tensor::new(dtype, info.shape.clone(), self.data(info)).ok()
    }

    /// Dtype del header si el tensor existe pero no es legible
    pub fn unsupported_dtype(&self, name: &str) -> Option<&str> {
        let info = self.header.tensors.get(name)?;
        if self.dtypes.contains_key(name) {
            None
        } else {
            Some(info.dtype.as_str())
        }
    }
}

/// Reader para uno o varios archivos safetensor (modelos sharded)
pub struct SafetensorReader {
    files: Vec<SafetensorFile>,
    tensor_to_file: HashMap<String, usize>,
}

impl SafetensorReader {
    /// Abre un archivo `.safetensors` o todos los de un directorio
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::from_folder(path)
        } else {
            Self::from_files(&[path.to_path_buf()])
        }
    }

    /// Abre todos los safetensors de un directorio
    pub fn from_folder(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        // Buscar archivos .safetensors
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Cannot read directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |e| e == "safetensors"))
            .collect();

        if paths.is_empty() {
            return Err(anyhow!("No .safetensors files in {}", dir.display()));
        }

        // Ordenar para consistencia
        paths.sort();

        Self::from_files(&paths)
    }

    fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        let mut tensor_to_file = HashMap::new();

        for (idx, path) in paths.iter().enumerate() {
            let file = SafetensorFile::open(path)?;

            for name in file.tensor_names() {
                if let Some(prev) = tensor_to_file.insert(name.to_string(), idx) {
                    bail!(
                        "Tensor '{}' appears in both {} and {}",
                        name,
                        paths[prev].display(),
                        path.display()
                    );
                }
            }

            files.push(file);
        }

        Ok(Self { files, tensor_to_file })
    }

    /// Número total de tensores
    pub fn len(&self) -> usize {
        self.tensor_to_file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensor_to_file.is_empty()
    }

    /// Número de shards abiertos
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Iterador sobre todos los tensores
    pub fn iter_tensors(&self) -> impl Iterator<Item = (&str, &TensorInfo)> {
        self.tensor_to_file.iter().filter_map(move |(name, &file_idx)| {
            self.files[file_idx]
                .tensor_info(name)
                .map(|info| (name.as_str(), info))
        })
    }

    /// Obtiene información de un tensor
    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        let file_idx = self.tensor_to_file.get(name)?;
        self.files[*file_idx].tensor_info(name)
    }

    /// Dtype de un tensor
    pub fn dtype(&self, name: &str) -> Option<&str> {
        self.tensor_info(name).map(|info| info.dtype.as_str())
    }
}

impl ParameterStore for SafetensorReader {
    fn tensor(&self, key: &str) -> Option<Tensor<'_>> {
        let file_idx = self.tensor_to_file.get(key)?;
        self.files[*file_idx].tensor(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.tensor_to_file.keys().map(|k| k.as_str()).collect()
    }

    fn contains(&self, key: &str) -> bool {
        self.tensor_to_file.contains_key(key)
    }

    fn unsupported_dtype(&self, key: &str) -> Option<&str> {
        let file_idx = self.tensor_to_file.get(key)?;
        self.files[*file_idx].unsupported_dtype(key)
    }
}
