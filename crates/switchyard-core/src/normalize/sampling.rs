//! Sampling defaults per model. The values are tuned by hand and matched
//! on substrings of the lowercased model id.

use crate::model::ModelDescriptor;

pub fn temperature(model: &ModelDescriptor) -> Option<f64> {
    let id = model.api_id();
    if id.contains("qwen") {
        return Some(0.55);
    }
    if id.contains("claude") {
        return None;
    }
    if id.contains("gemini") {
        return Some(1.0);
    }
    if id.contains("glm-4.6") {
        return Some(1.0);
    }
    if id.contains("glm-4.7") {
        return Some(1.0);
    }
    if id.contains("minimax-m2") {
        return Some(1.0);
    }
    if id.contains("kimi-k2") {
        if id.contains("thinking") {
            return Some(1.0);
        }
        return Some(0.6);
    }
    None
}

pub fn top_p(model: &ModelDescriptor) -> Option<f64> {
    let id = model.api_id();
    if id.contains("qwen") {
        return Some(1.0);
    }
    if id.contains("minimax-m2") {
        return Some(0.95);
    }
    if id.contains("gemini") {
        return Some(0.95);
    }
    None
}

pub fn top_k(model: &ModelDescriptor) -> Option<u32> {
    let id = model.api_id();
    if id.contains("minimax-m2") {
        if id.contains("m2.1") {
            return Some(40);
        }
        return Some(20);
    }
    if id.contains("gemini") {
        return Some(64);
    }
    None
}
