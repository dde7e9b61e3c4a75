// src/store/mod.rs
// ============================================================================
// PARAMETER STORE - Diccionario clave → tensor (solo lectura)
// ============================================================================

use std::collections::BTreeMap;

use crate::tensor::Tensor;

/// Fuente de parámetros del checkpoint.
///
/// El encoder solo necesita buscar por clave; el orden de las claves no
/// tiene significado.
pub trait ParameterStore {
    /// Tensor para `key`, prestado del store. None si no existe.
    fn tensor(&self, key: &str) -> Option<Tensor<'_>>;

    /// Todas las claves del store
    fn keys(&self) -> Vec<&str>;

    fn contains(&self, key: &str) -> bool {
        self.tensor(key).is_some()
    }

    /// Dtype declarado de `key` cuando la clave existe pero su tipo de
    /// elemento no se puede leer. `tensor(key)` devuelve None en ese caso.
    fn unsupported_dtype(&self, _key: &str) -> Option<&str> {
        None
    }
}

/// Store en memoria (tests, herramientas, loaders propios)
#[derive(Debug, Default, Clone)]
pub struct TensorMap {
    tensors: BTreeMap<String, Tensor<'static>>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserta (o reemplaza) un tensor
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor<'_>) {
        self.tensors.insert(key.into(), tensor.into_owned());
    }

    pub fn with(mut self, key: impl Into<String>, tensor: Tensor<'_>) -> Self {
        self.insert(key, tensor);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor<'static>> {
        self.tensors.remove(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl ParameterStore for TensorMap {
    fn tensor(&self, key: &str) -> Option<Tensor<'_>> {
        self.tensors.get(key).map(|t| t.view())
    }

    fn keys(&self) -> Vec<&str> {
        self.tensors.keys().map(|k| k.as_str()).collect()
    }

    fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }
}
