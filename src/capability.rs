//! Capability registry: which provider/model pairs accept image input.
//!
//! Static family lists, matched by prefix on the model component so
//! versioned (`gpt-4o-2024-08-06`) and namespaced (`x/llava:13b`) names
//! resolve the same as their family root. Consulted before attaching
//! images to a request and by the input-surface policy.

use crate::models::ChatMode;
use crate::providers::ProviderKind;

/// Hosted model families known to accept multimodal input.
pub const REMOTE_VISION_FAMILIES: &[&str] = &[
    "gpt-4o",
    "gpt-4-turbo",
    "gpt-4.1",
    "chatgpt-4o",
    "o1",
    "o3",
];

/// Locally-hostable multimodal model families.
pub const LOCAL_VISION_FAMILIES: &[&str] = &[
    "llava",
    "bakllava",
    "moondream",
    "llama3.2-vision",
    "minicpm-v",
    "gemma3",
    "qwen2.5vl",
];

/// Does this provider/model pair accept image input?
pub fn supports_vision(kind: ProviderKind, model: &str) -> bool {
    let component = model_component(model);
    let families = match kind {
        ProviderKind::Remote => REMOTE_VISION_FAMILIES,
        ProviderKind::Local => LOCAL_VISION_FAMILIES,
    };
    families.iter().any(|family| component.starts_with(family))
}

/// Whether the input surface should offer image attachments at all.
///
/// Local mode never offers image input (a deliberate policy
/// simplification: the local path still degrades gracefully if images
/// arrive anyway); remote mode is gated on the active model.
pub fn image_input_allowed(mode: ChatMode, remote_model: &str) -> bool {
    match mode {
        ChatMode::Offline => false,
        ChatMode::Online => supports_vision(ProviderKind::Remote, remote_model),
    }
}

/// Strip namespace prefix (before `/`) and tag suffix (after `:`),
/// lowercased, so family matching sees just the model identity.
fn model_component(full_name: &str) -> String {
    let without_tag = full_name.split(':').next().unwrap_or(full_name);
    let model_part = without_tag.rsplit('/').next().unwrap_or(without_tag);
    model_part.to_lowercase()
}
