// src/mapping/mod.rs
// ============================================================================
// MAPPING - Name map checkpoint → archivo
// ============================================================================

pub mod types;
pub mod table;
pub mod config;

// Re-exports
pub use types::{MappingEntry, NameMap, RoleTemplate};
pub use table::{entry_count, generate, HEAD_ROLES, LAYER_ROLES, TAIL_ROLES};
pub use config::{layer_count, load_config};
