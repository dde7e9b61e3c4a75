// src/encoder.rs
// ============================================================================
// ENCODER - Resuelve el name map contra el checkpoint y escribe el archivo
// ============================================================================
//
// Por cada entrada, en orden:
//   1. Buscar la clave fuente (falta + opcional → saltar; falta → abortar)
//   2. Downcast a FP16 si se pidió y la entrada lo admite
//   3. Clasificar el dtype → prefijo float32/ float16/ int32/ (otro → abortar)
//   4. Escribir los bytes raw en "<prefijo>/<ruta destino>"
//
// Todo o nada: cualquier aborto descarta el archivo; solo un recorrido
// completo lo finaliza. No hay reintentos: un fallo es un desajuste entre
// checkpoint y name map, no algo transitorio.
//
// ============================================================================

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use indicatif::ProgressBar;
use log::{debug, info, warn};
use thiserror::Error;

use crate::archive::{ArchiveSink, ZipArchiveWriter};
use crate::mapping::{self, MappingEntry, NameMap};
use crate::store::ParameterStore;
use crate::tensor::ElementType;

/// Espacio de nombres de tipo en el archivo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypePrefix {
    Float32,
    Float16,
    Int32,
}

impl TypePrefix {
    pub const ALL: [TypePrefix; 3] = [Self::Float32, Self::Float16, Self::Int32];

    /// Tipos archivables. Cualquier otro dtype no tiene prefijo.
    pub fn classify(dtype: ElementType) -> Option<Self> {
        match dtype {
            ElementType::F32 => Some(Self::Float32),
            ElementType::F16 => Some(Self::Float16),
            ElementType::I32 => Some(Self::Int32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::Int32 => "int32",
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Float32 => ElementType::F32,
            Self::Float16 => ElementType::F16,
            Self::Int32 => ElementType::I32,
        }
    }

    /// "<prefijo>/<ruta>"
    pub fn entry_path(&self, dest_path: &str) -> String {
        format!("{}/{}", self.as_str(), dest_path)
    }
}

impl fmt::Display for TypePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown type prefix '{0}'")]
pub struct UnknownTypePrefix(pub String);

impl FromStr for TypePrefix {
    type Err = UnknownTypePrefix;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownTypePrefix(s.to_string()))
    }
}

/// Errores fatales de una conversión
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("mandatory parameter '{0}' not found in checkpoint")]
    MissingMandatoryParameter(String),

    #[error("unrecognized element type {dtype} for '{path}'")]
    UnrecognizedElementType { path: String, dtype: String },

    #[error("archive I/O failed: {0}")]
    Archive(#[from] io::Error),
}

/// Estadísticas de conversión
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EncodeStats {
    pub float32_count: usize,
    pub float16_count: usize,
    pub int32_count: usize,
    /// Entradas opcionales ausentes en el checkpoint
    pub skipped_optional: usize,
    /// Tensores convertidos a FP16
    pub downcast_count: usize,
    /// Bytes de payload (sin cabeceras ZIP)
    pub total_bytes: u64,
    /// Claves del checkpoint que ninguna entrada usa (ordenadas)
    pub unused_keys: Vec<String>,
}

impl EncodeStats {
    pub fn total_entries(&self) -> usize {
        self.float32_count + self.float16_count + self.int32_count
    }

    pub fn record(&mut self, prefix: TypePrefix, size: usize) {
        match prefix {
            TypePrefix::Float32 => self.float32_count += 1,
            TypePrefix::Float16 => self.float16_count += 1,
            TypePrefix::Int32 => self.int32_count += 1,
        }
        self.total_bytes += size as u64;
    }
}

/// Encoder checkpoint → archivo
#[derive(Clone, Default)]
pub struct ArchiveEncoder {
    downcast: bool,
    progress: Option<ProgressBar>,
}

impl ArchiveEncoder {
    pub fn new(downcast: bool) -> Self {
        Self { downcast, progress: None }
    }

    /// Avanza `progress` una unidad por entrada del name map
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Escribe todas las entradas de `map` en `sink`.
    ///
    /// Finaliza el sink solo si todas las entradas obligatorias se resuelven
    /// y clasifican; en cualquier otro caso lo descarta y devuelve el error.
    pub fn encode<P, A>(&self, store: &P, map: &NameMap, mut sink: A) -> Result<EncodeStats, EncodeError>
    where
        P: ParameterStore + ?Sized,
        A: ArchiveSink,
    {
        match self.write_entries(store, map, &mut sink) {
            Ok(mut stats) => {
                sink.finalize()?;
                stats.unused_keys = unused_keys(store, map);
                Ok(stats)
            }
            Err(e) => {
                if let Err(discard_err) = sink.discard() {
                    warn!("Could not discard incomplete archive: {}", discard_err);
                }
                Err(e)
            }
        }
    }

    /// Genera el name map, crea el ZIP en `output` y codifica
    pub fn convert<P>(&self, store: &P, layer_count: usize, output: &Path) -> Result<EncodeStats, EncodeError>
    where
        P: ParameterStore + ?Sized,
    {
        let map = mapping::generate(layer_count);
        info!(
            "Name map: {} layers, {} entries ({} mandatory)",
            layer_count,
            map.len(),
            map.mandatory().count()
        );

        let sink = ZipArchiveWriter::create(output)?;
        self.encode(store, &map, sink)
    }

    fn write_entries<P, A>(&self, store: &P, map: &NameMap, sink: &mut A) -> Result<EncodeStats, EncodeError>
    where
        P: ParameterStore + ?Sized,
        A: ArchiveSink,
    {
        let mut stats = EncodeStats::default();

        for entry in map {
            if let Some(pb) = &self.progress {
                pb.set_message(entry.dest_path.clone());
            }

            self.write_entry(store, entry, sink, &mut stats)?;

            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }

        Ok(stats)
    }

    fn write_entry<P, A>(
        &self,
        store: &P,
        entry: &MappingEntry,
        sink: &mut A,
        stats: &mut EncodeStats,
    ) -> Result<(), EncodeError>
    where
        P: ParameterStore + ?Sized,
        A: ArchiveSink,
    {
        let mut tensor = match store.tensor(&entry.source_key) {
            Some(t) => t,
            None => {
                // Presente pero con un dtype que el store no sabe leer
                if let Some(dtype) = store.unsupported_dtype(&entry.source_key) {
                    return Err(EncodeError::UnrecognizedElementType {
                        path: entry.dest_path.clone(),
                        dtype: dtype.to_string(),
                    });
                }
                if entry.optional {
                    debug!("Optional parameter {} not present, skipping", entry.source_key);
                    stats.skipped_optional += 1;
                    return Ok(());
                }
                return Err(EncodeError::MissingMandatoryParameter(entry.source_key.clone()));
            }
        };

        if self.downcast && entry.downcast_eligible && tensor.dtype() != ElementType::F16 {
            debug!("Downcasting {} ({} → F16)", entry.source_key, tensor.dtype());
            tensor = tensor.into_f16();
            stats.downcast_count += 1;
        }

        let prefix = TypePrefix::classify(tensor.dtype()).ok_or_else(|| {
            EncodeError::UnrecognizedElementType {
                path: entry.dest_path.clone(),
                dtype: tensor.dtype().to_string(),
            }
        })?;

        let path = prefix.entry_path(&entry.dest_path);
        sink.write_entry(&path, tensor.as_bytes())?;
        stats.record(prefix, tensor.byte_len());

        debug!("{} → {} ({} bytes)", entry.source_key, path, tensor.byte_len());
        Ok(())
    }
}

/// Claves del store que no aparecen en el name map
fn unused_keys<P: ParameterStore + ?Sized>(store: &P, map: &NameMap) -> Vec<String> {
    let used: HashSet<&str> = map.source_keys().collect();
    let mut unused: Vec<String> = store
        .keys()
        .into_iter()
        .filter(|k| !used.contains(k))
        .map(str::to_string)
        .collect();
    unused.sort();
    unused
}

/// `encode` con un encoder sin barra de progreso
pub fn encode<P, A>(store: &P, map: &NameMap, sink: A, downcast: bool) -> Result<EncodeStats, EncodeError>
where
    P: ParameterStore + ?Sized,
    A: ArchiveSink,
{
    ArchiveEncoder::new(downcast).encode(store, map, sink)
}

/// Conversión completa checkpoint → ZIP en `output`
pub fn convert<P>(store: &P, layer_count: usize, output: &Path, downcast: bool) -> Result<EncodeStats, EncodeError>
where
    P: ParameterStore + ?Sized,
{
    ArchiveEncoder::new(downcast).convert(store, layer_count, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    use crate::archive::{ArchiveState, MemoryArchive, ZipArchiveReader};
    use crate::mapping::generate;
    use crate::store::TensorMap;
    use crate::tensor::Tensor;

    /// Tensor 2x2 del dtype pedido con valores distintos por semilla
    fn tensor_of(dtype: ElementType, seed: usize) -> Tensor<'static> {
        let values: Vec<f32> = (0..4).map(|i| (seed * 4 + i) as f32 * 0.25).collect();
        match dtype {
            ElementType::F32 => Tensor::from_f32(vec![2, 2], &values).unwrap(),
            ElementType::I32 => {
                let ints: Vec<i32> = values.iter().map(|v| (*v * 4.0) as i32).collect();
                Tensor::from_i32(vec![2, 2], &ints).unwrap()
            }
            ElementType::F16 => {
                let bytes: Vec<u8> = values.iter().flat_map(|v| f16::from_f32(*v).to_le_bytes()).collect();
                Tensor::new(ElementType::F16, vec![2, 2], bytes).unwrap()
            }
            ElementType::F64 => {
                let wide: Vec<f64> = values.iter().map(|v| *v as f64).collect();
                Tensor::from_f64(vec![2, 2], &wide).unwrap()
            }
            other => panic!("no test tensor for {}", other),
        }
    }

    /// Checkpoint GPTQ típico: qweight/qzeros I32, scales/bias F16, resto F32
    fn gptq_store(layers: usize, with_bias: bool) -> TensorMap {
        let mut store = TensorMap::new();
        for (i, e) in generate(layers).iter().enumerate() {
            let key = e.source_key.as_str();
            if key.ends_with(".bias") && !with_bias {
                continue;
            }
            let dtype = if key.ends_with(".qweight") || key.ends_with(".qzeros") {
                ElementType::I32
            } else if key.ends_with(".scales") || key.ends_with(".bias") {
                ElementType::F16
            } else {
                ElementType::F32
            };
            store.insert(key, tensor_of(dtype, i));
        }
        store
    }

    /// Todos los tensores F32
    fn f32_store(layers: usize) -> TensorMap {
        let mut store = TensorMap::new();
        for (i, e) in generate(layers).iter().enumerate() {
            store.insert(e.source_key.as_str(), tensor_of(ElementType::F32, i));
        }
        store
    }

    #[test]
    fn test_classify_is_total() {
        assert_eq!(TypePrefix::classify(ElementType::F32), Some(TypePrefix::Float32));
        assert_eq!(TypePrefix::classify(ElementType::F16), Some(TypePrefix::Float16));
        assert_eq!(TypePrefix::classify(ElementType::I32), Some(TypePrefix::Int32));
        for dtype in [ElementType::F64, ElementType::BF16, ElementType::I64, ElementType::U8, ElementType::U32] {
            assert_eq!(TypePrefix::classify(dtype), None, "{}", dtype);
        }
        for p in TypePrefix::ALL {
            assert_eq!(p.as_str().parse::<TypePrefix>(), Ok(p));
            assert_eq!(TypePrefix::classify(p.element_type()), Some(p));
        }
        assert_eq!(
            "float64".parse::<TypePrefix>(),
            Err(UnknownTypePrefix("float64".to_string()))
        );
        assert_eq!(TypePrefix::Int32.entry_path("dec3up.zeros"), "int32/dec3up.zeros");
    }

    #[test]
    fn test_end_to_end_zero_layers() {
        let (v, h) = (5usize, 3usize);
        let embed: Vec<f32> = (0..v * h).map(|i| i as f32).collect();
        let norm: Vec<f32> = vec![1.0; h];
        let head: Vec<f32> = (0..v * h).map(|i| -(i as f32)).collect();

        let store = TensorMap::new()
            .with("model.embed_tokens.weight", Tensor::from_f32(vec![v, h], &embed).unwrap())
            .with("model.norm.weight", Tensor::from_f32(vec![h], &norm).unwrap())
            .with("lm_head.weight", Tensor::from_f32(vec![v, h], &head).unwrap());

        let mut archive = MemoryArchive::new();
        let stats = encode(&store, &generate(0), &mut archive, false).unwrap();

        assert!(archive.is_finalized());
        assert_eq!(archive.paths(), vec![
            "float32/embedding.embed",
            "float32/modelnorm.weights",
            "float32/tokenscoring.embed",
        ]);
        assert_eq!(archive.get("float32/embedding.embed").unwrap().len(), 4 * v * h);
        assert_eq!(archive.get("float32/modelnorm.weights").unwrap().len(), 4 * h);
        assert_eq!(archive.get("float32/tokenscoring.embed").unwrap().len(), 4 * v * h);
        assert_eq!(
            archive.get("float32/tokenscoring.embed").unwrap(),
            store.tensor("lm_head.weight").unwrap().as_bytes()
        );

        assert_eq!(stats.float32_count, 3);
        assert_eq!(stats.total_entries(), 3);
        assert_eq!(stats.total_bytes, (4 * (2 * v * h + h)) as u64);
        assert_eq!(stats.downcast_count, 0);
        assert!(stats.unused_keys.is_empty());
    }

    #[test]
    fn test_gptq_store_without_downcast() {
        let store = gptq_store(2, true);
        let map = generate(2);
        let mut archive = MemoryArchive::new();

        let stats = encode(&store, &map, &mut archive, false).unwrap();

        assert!(archive.is_finalized());
        assert_eq!(archive.len(), map.len());
        assert_eq!(stats.skipped_optional, 0);
        // Por capa: 8 qweight/qzeros I32 de atención + 6 de MLP
        assert_eq!(stats.int32_count, 2 * 14);
        // Por capa: 4 + 3 scales + 3 bias
        assert_eq!(stats.float16_count, 2 * 10);
        // embed + 2 ln por capa + norm + head
        assert_eq!(stats.float32_count, 1 + 2 * 2 + 2);

        // Orden de escritura = orden del name map
        let expected: Vec<String> = map
            .iter()
            .map(|e| {
                let dtype = store.tensor(&e.source_key).unwrap().dtype();
                TypePrefix::classify(dtype).unwrap().entry_path(&e.dest_path)
            })
            .collect();
        assert_eq!(archive.paths(), expected);
    }

    #[test]
    fn test_missing_mandatory_aborts() {
        let mut store = gptq_store(2, true);
        let missing = "model.layers.1.mlp.up_proj.scales";
        store.remove(missing);

        let map = generate(2);
        let mut archive = MemoryArchive::new();
        let err = encode(&store, &map, &mut archive, true).unwrap_err();

        match err {
            EncodeError::MissingMandatoryParameter(key) => assert_eq!(key, missing),
            other => panic!("unexpected error: {}", other),
        }

        // Nunca se finaliza, y nada después de la entrada que falta
        assert_eq!(archive.state(), ArchiveState::Discarded);
        let failed_at = map.iter().position(|e| e.source_key == missing).unwrap();
        assert_eq!(archive.len(), failed_at);
    }

    #[test]
    fn test_missing_bias_is_skipped() {
        let store = gptq_store(3, false);
        let map = generate(3);
        let mut archive = MemoryArchive::new();

        let stats = encode(&store, &map, &mut archive, true).unwrap();

        assert!(archive.is_finalized());
        assert_eq!(stats.skipped_optional, 9);
        assert_eq!(archive.len(), map.len() - 9);
        assert!(archive.paths().iter().all(|p| !p.ends_with(".bias")));
        assert!(archive.get("float16/dec0gate.bias").is_none());
    }

    #[test]
    fn test_partial_bias_set() {
        // Solo falta un bias: el resto se escribe
        let mut store = gptq_store(1, true);
        store.remove("model.layers.0.mlp.down_proj.bias");

        let mut archive = MemoryArchive::new();
        let stats = encode(&store, &generate(1), &mut archive, false).unwrap();

        assert_eq!(stats.skipped_optional, 1);
        assert!(archive.get("float16/dec0gate.bias").is_some());
        assert!(archive.get("float16/dec0up.bias").is_some());
        assert!(archive.get("float16/dec0down.bias").is_none());
    }

    #[test]
    fn test_downcast_only_eligible_entries() {
        let store = f32_store(2);
        let map = generate(2);
        let mut archive = MemoryArchive::new();

        let stats = encode(&store, &map, &mut archive, true).unwrap();
        assert!(archive.is_finalized());

        for e in map.iter() {
            let original = store.tensor(&e.source_key).unwrap();
            if e.downcast_eligible {
                let bytes = archive.get(&format!("float16/{}", e.dest_path)).unwrap();
                assert_eq!(bytes.len() * 2, original.byte_len());
                assert!(archive.get(&format!("float32/{}", e.dest_path)).is_none());
            } else {
                let bytes = archive.get(&format!("float32/{}", e.dest_path)).unwrap();
                assert_eq!(bytes, original.as_bytes());
            }
        }

        assert_eq!(stats.downcast_count, 7);
        assert_eq!(stats.float16_count, 7);
        assert_eq!(stats.float32_count, map.len() - 7);
    }

    #[test]
    fn test_downcast_values() {
        let store = f32_store(0);
        let mut archive = MemoryArchive::new();
        encode(&store, &generate(0), &mut archive, true).unwrap();

        let bytes = archive.get("float16/modelnorm.weights").unwrap();
        let values: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect();
        // model.norm.weight es la entrada 1 del map de 0 capas → semilla 1
        assert_eq!(values, vec![1.0, 1.25, 1.5, 1.75]);
    }

    #[test]
    fn test_no_downcast_keeps_float32() {
        let store = f32_store(1);
        let mut archive = MemoryArchive::new();
        let stats = encode(&store, &generate(1), &mut archive, false).unwrap();

        assert_eq!(stats.downcast_count, 0);
        assert_eq!(stats.float16_count, 0);
        assert!(archive.get("float32/dec0ln0.weights").is_some());
    }

    #[test]
    fn test_unrecognized_type_aborts() {
        let mut store = gptq_store(2, true);
        let bad_key = "model.layers.0.self_attn.k_proj.scales";
        store.insert(bad_key, tensor_of(ElementType::F64, 0));

        let map = generate(2);
        let mut archive = MemoryArchive::new();
        let err = encode(&store, &map, &mut archive, true).unwrap_err();

        match &err {
            EncodeError::UnrecognizedElementType { path, dtype } => {
                assert_eq!(path, "dec0att.key.scales");
                assert_eq!(dtype, "F64");
            }
            other => panic!("unexpected error: {}", other),
        }
        let msg = err.to_string();
        assert!(msg.contains("F64") && msg.contains("dec0att.key.scales"));

        assert_eq!(archive.state(), ArchiveState::Discarded);
        let failed_at = map.iter().position(|e| e.source_key == bad_key).unwrap();
        assert_eq!(archive.len(), failed_at);
    }

    #[test]
    fn test_wide_float_is_downcast_when_eligible() {
        // F64 en una entrada convertible no es error si hay downcast
        let mut store = f32_store(0);
        store.insert("model.norm.weight", tensor_of(ElementType::F64, 0));

        let mut archive = MemoryArchive::new();
        encode(&store, &generate(0), &mut archive, true).unwrap();
        assert_eq!(archive.get("float16/modelnorm.weights").unwrap().len(), 8);

        let mut archive = MemoryArchive::new();
        let err = encode(&store, &generate(0), &mut archive, false).unwrap_err();
        assert!(matches!(err, EncodeError::UnrecognizedElementType { .. }));
    }

    #[test]
    fn test_unused_keys_reported() {
        let mut store = gptq_store(1, true);
        store.insert("model.layers.0.self_attn.q_proj.bias", tensor_of(ElementType::F16, 0));
        store.insert("model.layers.0.self_attn.rotary_emb.inv_freq", tensor_of(ElementType::F32, 0));

        let mut archive = MemoryArchive::new();
        let stats = encode(&store, &generate(1), &mut archive, false).unwrap();

        assert_eq!(stats.unused_keys, vec![
            "model.layers.0.self_attn.q_proj.bias".to_string(),
            "model.layers.0.self_attn.rotary_emb.inv_freq".to_string(),
        ]);
        assert!(archive.paths().iter().all(|p| !p.contains("att.query.bias")));
    }

    #[test]
    fn test_layer_count_too_large_fails() {
        let store = gptq_store(2, true);
        let mut archive = MemoryArchive::new();
        let err = encode(&store, &generate(3), &mut archive, false).unwrap_err();

        match err {
            EncodeError::MissingMandatoryParameter(key) => {
                assert_eq!(key, "model.layers.2.self_attn.q_proj.qweight")
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!archive.is_finalized());
    }

    #[test]
    fn test_progress_counts_entries() {
        let store = gptq_store(1, false);
        let map = generate(1);
        let pb = ProgressBar::hidden();
        pb.set_length(map.len() as u64);

        let mut archive = MemoryArchive::new();
        ArchiveEncoder::new(true)
            .with_progress(pb.clone())
            .encode(&store, &map, &mut archive)
            .unwrap();

        assert_eq!(pb.position(), map.len() as u64);
    }

    #[test]
    fn test_convert_writes_zip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("llama.zip");
        let store = gptq_store(2, false);

        let stats = convert(&store, 2, &out, true).unwrap();
        assert_eq!(stats.total_entries(), generate(2).len() - 6);

        let reader = ZipArchiveReader::open(&out).unwrap();
        assert_eq!(reader.len(), stats.total_entries());
        for entry in reader.entries() {
            assert!(reader.verify(entry).unwrap(), "{}", entry.name);
        }

        let zeros = reader.find_by_path("int32/dec1down.zeros").unwrap();
        assert_eq!(
            reader.read(zeros).unwrap(),
            store.tensor("model.layers.1.mlp.down_proj.qzeros").unwrap().as_bytes()
        );

        let embed = reader.find_by_name("embedding.embed").unwrap();
        assert_eq!(embed.name, "float16/embedding.embed");
        assert_eq!(embed.size, 8);
    }

    #[test]
    fn test_convert_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("broken.zip");
        let mut store = gptq_store(1, true);
        store.remove("lm_head.weight");

        let err = convert(&store, 1, &out, true).unwrap_err();
        assert!(matches!(err, EncodeError::MissingMandatoryParameter(ref k) if k == "lm_head.weight"));

        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
