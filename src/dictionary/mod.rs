// src/dictionary/mod.rs
// ============================================================================
// DICTIONARY - Nombres de entrada válidos en el archivo
// ============================================================================
//
// "<prefijo>/<ruta>": prefijo ∈ {float32, float16, int32}, ruta ∈ patrones.
// El runtime busca exactamente estos nombres; cualquier otro es INVÁLIDO.
//
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::encoder::TypePrefix;

// {N} = índice de capa (0, 1, 2, ...)

pub const GLOBAL_PATTERNS: &[&str] = &[
    "embedding.embed",
    "modelnorm.weights",
    "tokenscoring.embed",
];

pub const LAYER_PATTERNS: &[&str] = &[
    // Atención (sin bias)
    "dec{N}att.query.weights",
    "dec{N}att.query.scales",
    "dec{N}att.query.zeros",
    "dec{N}att.key.weights",
    "dec{N}att.key.scales",
    "dec{N}att.key.zeros",
    "dec{N}att.value.weights",
    "dec{N}att.value.scales",
    "dec{N}att.value.zeros",
    "dec{N}att.out.weights",
    "dec{N}att.out.scales",
    "dec{N}att.out.zeros",
    // MLP
    "dec{N}gate.weights",
    "dec{N}gate.bias",
    "dec{N}gate.scales",
    "dec{N}gate.zeros",
    "dec{N}up.weights",
    "dec{N}up.bias",
    "dec{N}up.scales",
    "dec{N}up.zeros",
    "dec{N}down.weights",
    "dec{N}down.bias",
    "dec{N}down.scales",
    "dec{N}down.zeros",
    // Norms
    "dec{N}ln0.weights",
    "dec{N}ln1.weights",
];

fn pattern_to_regex(pattern: &str) -> String {
    let regex = pattern.replace('.', r"\.").replace("{N}", r"\d+");
    format!("^{}$", regex)
}

static ROLE_PATH_REGEX: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    GLOBAL_PATTERNS
        .iter()
        .chain(LAYER_PATTERNS)
        .map(|p| Regex::new(&pattern_to_regex(p)).expect("dictionary pattern"))
        .collect()
});

static LAYER_INDEX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^dec(\d+)").expect("layer index pattern"));

/// "float16/dec3up.bias" → (Float16, "dec3up.bias")
pub fn split_entry_name(name: &str) -> Option<(TypePrefix, &str)> {
    let (prefix, path) = name.split_once('/')?;
    Some((prefix.parse().ok()?, path))
}

/// Ruta sin prefijo reconocida por el runtime
pub fn validate_role_path(path: &str) -> bool {
    ROLE_PATH_REGEX.iter().any(|re| re.is_match(path))
}

/// Nombre completo de entrada ("<prefijo>/<ruta>")
pub fn validate_entry_name(name: &str) -> bool {
    split_entry_name(name).is_some_and(|(_, path)| validate_role_path(path))
}

/// Índice de capa de una ruta "dec{N}..."
pub fn layer_index(path: &str) -> Option<usize> {
    LAYER_INDEX_REGEX
        .captures(path)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Resultado de validar todos los nombres de un archivo
#[derive(Debug, Default, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: usize,
    pub invalid: Vec<String>,
    /// Entradas por prefijo de tipo
    pub per_prefix: BTreeMap<String, usize>,
    /// Índices de capa presentes
    pub layers: BTreeSet<usize>,
    /// Misma ruta bajo más de un prefijo
    pub conflicting: Vec<String>,
}

impl ValidationReport {
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut report = Self::default();
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();

        for name in names {
            match split_entry_name(name) {
                Some((prefix, path)) if validate_role_path(path) => {
                    report.valid += 1;
                    *report.per_prefix.entry(prefix.to_string()).or_default() += 1;
                    if let Some(layer) = layer_index(path) {
                        report.layers.insert(layer);
                    }
                    *seen.entry(path).or_default() += 1;
                }
                _ => report.invalid.push(name.to_string()),
            }
        }

        report.conflicting = seen
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(p, _)| p.to_string())
            .collect();
        report
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty() && self.conflicting.is_empty()
    }

    /// Capas: máximo índice + 1 (0 sin capas)
    pub fn layer_count(&self) -> usize {
        self.layers.iter().next_back().map_or(0, |l| l + 1)
    }

    /// Índices que faltan por debajo del máximo
    pub fn missing_layers(&self) -> Vec<usize> {
        (0..self.layer_count()).filter(|l| !self.layers.contains(l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::generate;

    #[test]
    fn test_every_generated_name_is_valid() {
        for e in generate(3).iter() {
            for prefix in TypePrefix::ALL {
                let name = prefix.entry_path(&e.dest_path);
                assert!(validate_entry_name(&name), "{}", name);
            }
        }
    }

    #[test]
    fn test_patterns_cover_layer_roles() {
        let map = generate(1);
        let layer_paths: Vec<String> = LAYER_PATTERNS.iter().map(|p| p.replace("{N}", "0")).collect();
        for e in map.iter().filter(|e| e.dest_path.starts_with("dec")) {
            assert!(layer_paths.contains(&e.dest_path), "{}", e.dest_path);
        }
        assert_eq!(layer_paths.len(), map.len() - GLOBAL_PATTERNS.len());
    }

    #[test]
    fn test_invalid_names() {
        assert!(!validate_entry_name("embedding.embed"));
        assert!(!validate_entry_name("float64/embedding.embed"));
        assert!(!validate_entry_name("float32/dec0att.query.bias"));
        assert!(!validate_entry_name("float32/decXup.weights"));
        assert!(!validate_entry_name("int32/dec0up.zeros.extra"));
        assert!(!validate_entry_name("float16/dec0ln2.weights"));
        assert!(validate_entry_name("int32/dec117down.zeros"));
    }

    #[test]
    fn test_split_and_layer_index() {
        assert_eq!(
            split_entry_name("float16/dec12gate.bias"),
            Some((TypePrefix::Float16, "dec12gate.bias"))
        );
        assert_eq!(split_entry_name("bf16/x"), None);
        assert_eq!(layer_index("dec12gate.bias"), Some(12));
        assert_eq!(layer_index("modelnorm.weights"), None);
    }

    #[test]
    fn test_report() {
        let names = [
            "float16/embedding.embed",
            "int32/dec0up.weights",
            "int32/dec2up.weights",
            "float32/dec2up.weights",
            "float32/unknown",
        ];
        let report = ValidationReport::from_names(names);

        assert_eq!(report.valid, 4);
        assert_eq!(report.invalid, vec!["float32/unknown".to_string()]);
        assert_eq!(report.per_prefix["int32"], 2);
        assert_eq!(report.layer_count(), 3);
        assert_eq!(report.missing_layers(), vec![1]);
        assert_eq!(report.conflicting, vec!["dec2up.weights".to_string()]);
        assert!(!report.is_valid());
    }
}
