use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const FACE_MODEL_KEY: &str = "gfpgan-v1.4";
pub const SUPER_RES_MODEL_KEY: &str = "esrgan-v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelRole {
    FaceRestoration,
    SuperResolution,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FaceRestoration => write!(f, "FaceRestoration"),
            Self::SuperResolution => write!(f, "SuperResolution"),
        }
    }
}

/// Static description of one downloadable model.
///
/// The `key` doubles as the cache key, so a change in model format ships
/// under a new key rather than overwriting the old blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub key: String,
    pub source_url: String,
    pub display_name: String,
    pub role: ModelRole,
    /// Output/input spatial ratio. 1 for face restoration.
    pub scale: u32,
    /// Fixed square resolution the model runs at, if any.
    pub working_size: Option<u32>,
    /// Affine map from `[0, 1]` into the model's value range:
    /// `model = pixel * input_scale + input_offset`.
    pub input_scale: f32,
    pub input_offset: f32,
    /// Spatial dimensions must be multiples of this.
    pub pad_align: u32,
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    /// Reject descriptors the pipeline cannot run: a zero scale, alignment
    /// or working size, or a degenerate value mapping.
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            bail!("model descriptor has an empty key");
        }
        if self.scale == 0 {
            bail!("model {} has scale 0", self.key);
        }
        if self.pad_align == 0 {
            bail!("model {} has pad_align 0", self.key);
        }
        if self.working_size == Some(0) {
            bail!("model {} has working size 0", self.key);
        }
        if !self.input_scale.is_finite()
            || self.input_scale == 0.0
            || !self.input_offset.is_finite()
        {
            bail!(
                "model {} has an unusable input mapping (scale {}, offset {})",
                self.key,
                self.input_scale,
                self.input_offset
            );
        }
        Ok(())
    }

    /// Inverse of the input mapping, back into `[0, 1]`.
    pub fn denormalize(&self, value: f32) -> f32 {
        (value - self.input_offset) / self.input_scale
    }

    pub fn normalize(&self, value: f32) -> f32 {
        value * self.input_scale + self.input_offset
    }
}

pub fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            key: FACE_MODEL_KEY.into(),
            source_url: "https://github.com/facefusion/facefusion-assets/releases/download/models/gfpgan_1.4.onnx".into(),
            display_name: "GFPGAN v1.4 face restoration (512x512)".into(),
            role: ModelRole::FaceRestoration,
            scale: 1,
            working_size: Some(512),
            input_scale: 2.0,
            input_offset: -1.0,
            pad_align: 1,
            sha256: None,
        },
        ModelDescriptor {
            key: SUPER_RES_MODEL_KEY.into(),
            source_url: "https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into(),
            display_name: "RealESRGAN x4 (6-block)".into(),
            role: ModelRole::SuperResolution,
            scale: 4,
            working_size: None,
            input_scale: 255.0,
            input_offset: 0.0,
            pad_align: 4,
            sha256: None,
        },
    ]
}

/// Immutable set of model descriptors known to the process.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelDescriptor>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::with_builtin_models()
    }
}

impl ModelCatalog {
    pub fn with_builtin_models() -> Self {
        Self {
            entries: builtin_catalog(),
        }
    }

    /// Replace source URLs for the given keys. Unknown keys are ignored.
    pub fn with_url_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for entry in &mut self.entries {
            if let Some(url) = overrides.get(&entry.key) {
                entry.source_url = url.clone();
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn list(&self) -> &[ModelDescriptor] {
        &self.entries
    }
}
