use serde::{Deserialize, Serialize};

/// One detector result on the wire. `bbox` is `[x, y, width, height]` in
/// image pixel coordinates; `label` is the raw class string from the model
/// head. Mapping to the pipeline's class set (and rejecting unknown labels)
/// happens at the consumer's boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub label: String,
}
