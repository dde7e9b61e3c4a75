// src/mapping/table.rs
// ============================================================================
// ROLE TABLE - Política de nombres para checkpoints LLaMA cuantizados GPTQ
// ============================================================================
//
// La política de nombres es DATO (tablas de abajo); la iteración por capas
// vive en generate(). Estos nombres son el contrato del formato: el runtime
// los busca literalmente, incluido el "dec<N>" de cada capa.
//
// Las proyecciones de atención no llevan bias: en los checkpoints GPTQ son
// todo ceros y el runtime no los lee.
//
// ============================================================================

use super::types::{MappingEntry, NameMap, RoleTemplate};

/// Entradas globales antes de las capas
pub const HEAD_ROLES: &[RoleTemplate] = &[
    RoleTemplate::castable("model.embed_tokens.weight", "embedding.embed"),
];

/// Entradas por capa decoder, en orden de escritura
pub const LAYER_ROLES: &[RoleTemplate] = &[
    // ATTENTION (qweight / scales / qzeros ya cuantizados: nunca downcast)
    RoleTemplate::required("model.layers.{}.self_attn.q_proj.qweight", "dec{}att.query.weights"),
    RoleTemplate::required("model.layers.{}.self_attn.q_proj.scales", "dec{}att.query.scales"),
    RoleTemplate::required("model.layers.{}.self_attn.q_proj.qzeros", "dec{}att.query.zeros"),
    RoleTemplate::required("model.layers.{}.self_attn.k_proj.qweight", "dec{}att.key.weights"),
    RoleTemplate::required("model.layers.{}.self_attn.k_proj.scales", "dec{}att.key.scales"),
    RoleTemplate::required("model.layers.{}.self_attn.k_proj.qzeros", "dec{}att.key.zeros"),
    RoleTemplate::required("model.layers.{}.self_attn.v_proj.qweight", "dec{}att.value.weights"),
    RoleTemplate::required("model.layers.{}.self_attn.v_proj.scales", "dec{}att.value.scales"),
    RoleTemplate::required("model.layers.{}.self_attn.v_proj.qzeros", "dec{}att.value.zeros"),
    RoleTemplate::required("model.layers.{}.self_attn.o_proj.qweight", "dec{}att.out.weights"),
    RoleTemplate::required("model.layers.{}.self_attn.o_proj.scales", "dec{}att.out.scales"),
    RoleTemplate::required("model.layers.{}.self_attn.o_proj.qzeros", "dec{}att.out.zeros"),

    // MLP (bias opcional: muchos checkpoints no lo guardan)
    RoleTemplate::required("model.layers.{}.mlp.gate_proj.qweight", "dec{}gate.weights"),
    RoleTemplate::optional("model.layers.{}.mlp.gate_proj.bias", "dec{}gate.bias"),
    RoleTemplate::required("model.layers.{}.mlp.gate_proj.scales", "dec{}gate.scales"),
    RoleTemplate::required("model.layers.{}.mlp.gate_proj.qzeros", "dec{}gate.zeros"),
    RoleTemplate::required("model.layers.{}.mlp.up_proj.qweight", "dec{}up.weights"),
    RoleTemplate::optional("model.layers.{}.mlp.up_proj.bias", "dec{}up.bias"),
    RoleTemplate::required("model.layers.{}.mlp.up_proj.scales", "dec{}up.scales"),
    RoleTemplate::required("model.layers.{}.mlp.up_proj.qzeros", "dec{}up.zeros"),
    RoleTemplate::required("model.layers.{}.mlp.down_proj.qweight", "dec{}down.weights"),
    RoleTemplate::optional("model.layers.{}.mlp.down_proj.bias", "dec{}down.bias"),
    RoleTemplate::required("model.layers.{}.mlp.down_proj.scales", "dec{}down.scales"),
    RoleTemplate::required("model.layers.{}.mlp.down_proj.qzeros", "dec{}down.zeros"),

    // NORMS
    RoleTemplate::castable("model.layers.{}.input_layernorm.weight", "dec{}ln0.weights"),
    RoleTemplate::castable("model.layers.{}.post_attention_layernorm.weight", "dec{}ln1.weights"),
];

/// Entradas globales después de las capas
pub const TAIL_ROLES: &[RoleTemplate] = &[
    RoleTemplate::castable("model.norm.weight", "modelnorm.weights"),
    RoleTemplate::castable("lm_head.weight", "tokenscoring.embed"),
];

/// Número de entradas que genera `generate(layer_count)`
pub fn entry_count(layer_count: usize) -> usize {
    HEAD_ROLES.len() + LAYER_ROLES.len() * layer_count + TAIL_ROLES.len()
}

/// Genera el name map para un modelo de `layer_count` capas decoder.
///
/// Puro y determinista: misma entrada, misma salida en el mismo orden.
pub fn generate(layer_count: usize) -> NameMap {
    let mut entries: Vec<MappingEntry> = Vec::with_capacity(entry_count(layer_count));

    entries.extend(HEAD_ROLES.iter().map(RoleTemplate::global));

    for layer in 0..layer_count {
        entries.extend(LAYER_ROLES.iter().map(|role| role.for_layer(layer)));
    }

    entries.extend(TAIL_ROLES.iter().map(RoleTemplate::global));

    NameMap::new(layer_count, entries)
}
