// src/mapping/types.rs
// ============================================================================
// MAPPING TYPES - Entradas del name map
// ============================================================================

/// Placeholder del índice de capa en las plantillas
pub const LAYER_PLACEHOLDER: &str = "{}";

/// Plantilla de un rol: nombre fuente → ruta destino.
///
/// `{}` se sustituye por el índice de capa en las plantillas por capa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleTemplate {
    pub source: &'static str,
    pub dest: &'static str,
    /// Puede pasar a FP16 si se pide downcast
    pub downcast: bool,
    /// Si falta en el checkpoint se ignora en silencio
    pub optional: bool,
}

impl RoleTemplate {
    pub const fn required(source: &'static str, dest: &'static str) -> Self {
        Self { source, dest, downcast: false, optional: false }
    }

    pub const fn castable(source: &'static str, dest: &'static str) -> Self {
        Self { source, dest, downcast: true, optional: false }
    }

    pub const fn optional(source: &'static str, dest: &'static str) -> Self {
        Self { source, dest, downcast: false, optional: true }
    }

    /// Expande la plantilla para una capa concreta
    pub fn for_layer(&self, layer: usize) -> MappingEntry {
        let idx = layer.to_string();
        MappingEntry {
            source_key: self.source.replace(LAYER_PLACEHOLDER, &idx),
            dest_path: self.dest.replace(LAYER_PLACEHOLDER, &idx),
            downcast_eligible: self.downcast,
            optional: self.optional,
        }
    }

    /// Entrada global (sin índice de capa)
    pub fn global(&self) -> MappingEntry {
        MappingEntry {
            source_key: self.source.to_string(),
            dest_path: self.dest.to_string(),
            downcast_eligible: self.downcast,
            optional: self.optional,
        }
    }
}

/// Una entrada del name map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingEntry {
    /// Clave en el checkpoint (ej: "model.layers.0.self_attn.q_proj.qweight")
    pub source_key: String,
    /// Ruta en el archivo, sin prefijo de tipo (ej: "dec0att.query.weights")
    pub dest_path: String,
    pub downcast_eligible: bool,
    pub optional: bool,
}

/// Lista ordenada e inmutable de entradas.
///
/// El orden solo fija el orden de escritura en el archivo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMap {
    layer_count: usize,
    entries: Vec<MappingEntry>,
}

impl NameMap {
    pub(crate) fn new(layer_count: usize, entries: Vec<MappingEntry>) -> Self {
        Self { layer_count, entries }
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MappingEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Busca por ruta destino
    pub fn get(&self, dest_path: &str) -> Option<&MappingEntry> {
        self.entries.iter().find(|e| e.dest_path == dest_path)
    }

    /// Busca por clave fuente
    pub fn by_source(&self, source_key: &str) -> Option<&MappingEntry> {
        self.entries.iter().find(|e| e.source_key == source_key)
    }

    pub fn source_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.source_key.as_str())
    }

    pub fn mandatory(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter().filter(|e| !e.optional)
    }
}

impl<'a> IntoIterator for &'a NameMap {
    type Item = &'a MappingEntry;
    type IntoIter = std::slice::Iter<'a, MappingEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
