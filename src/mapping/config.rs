// src/mapping/config.rs
// ============================================================================
// MODEL CONFIG - Lee config.json para deducir la profundidad del decoder
// ============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

/// Claves donde distintos exportadores guardan el número de capas
const LAYER_COUNT_KEYS: &[&str] = &["num_hidden_layers", "n_layers", "num_layers", "n_layer"];

/// Lee config.json de un modelo.
///
/// `model_path` puede ser el directorio o un archivo dentro de él
/// (se busca config.json junto al archivo).
pub fn load_config(model_path: &Path) -> Result<Value> {
    let dir = if model_path.is_dir() {
        model_path
    } else {
        model_path.parent().unwrap_or_else(|| Path::new("."))
    };
    let config_path = dir.join("config.json");

    if !config_path.exists() {
        anyhow::bail!("No config.json found in {}", dir.display());
    }

    let data = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;

    let config: Value = serde_json::from_str(&data)
        .with_context(|| format!("Invalid JSON in {}", config_path.display()))?;

    Ok(config)
}

/// Número de capas decoder declarado en el config
pub fn layer_count(config: &Value) -> Option<usize> {
    LAYER_COUNT_KEYS
        .iter()
        .find_map(|key| config.get(*key).and_then(|v| v.as_u64()))
        .map(|n| n as usize)
}

/// Arquitectura declarada (solo informativo)
pub fn architecture(config: &Value) -> Option<String> {
    if let Some(model_type) = config.get("model_type").and_then(|v| v.as_str()) {
        return Some(model_type.to_lowercase());
    }

    config
        .get("architectures")
        .and_then(|v| v.as_array())
        .and_then(|archs| archs.first())
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layer_count_keys() {
        assert_eq!(layer_count(&json!({ "num_hidden_layers": 32 })), Some(32));
        assert_eq!(layer_count(&json!({ "n_layers": 26 })), Some(26));
        assert_eq!(layer_count(&json!({ "hidden_size": 4096 })), None);
        assert_eq!(layer_count(&json!({ "num_hidden_layers": "32" })), None);
    }

    #[test]
    fn test_architecture() {
        assert_eq!(architecture(&json!({ "model_type": "LLaMA" })).as_deref(), Some("llama"));
        assert_eq!(
            architecture(&json!({ "architectures": ["LlamaForCausalLM"] })).as_deref(),
            Some("llamaforcausallm")
        );
        assert_eq!(architecture(&json!({})), None);
    }

    #[test]
    fn test_load_config_from_file_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "llama", "num_hidden_layers": 2}"#,
        )
        .unwrap();
        let weights = dir.path().join("model.safetensors");
        std::fs::write(&weights, b"").unwrap();

        let from_dir = load_config(dir.path()).unwrap();
        let from_file = load_config(&weights).unwrap();
        assert_eq!(from_dir, from_file);
        assert_eq!(layer_count(&from_file), Some(2));
    }

    #[test]
    fn test_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(dir.path()).is_err());
    }
}
