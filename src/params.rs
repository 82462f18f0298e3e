// Request parameters, wire-side and resolved.
//
// `Request` is exactly what arrives on the socket. `resolve()` turns it into
// a `Job`: model name resolved against the models directory, defaults filled
// in, ranges checked. `Parameters` inside the job doubles as the structural
// cache key for the base stage, so everything that changes the sampling
// trajectory must live in it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Resolution tier. Each level scales the requested size before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Normal,
    High,
    Ultra,
    Insane,
}

impl Quality {
    pub fn multiplier(self) -> f32 {
        match self {
            Quality::Low => 1.0,
            Quality::Normal => 1.25,
            Quality::High => 1.5,
            Quality::Ultra => 1.75,
            Quality::Insane => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sampler {
    #[default]
    #[serde(rename = "euler_a")]
    EulerAncestral,
    #[serde(rename = "dpm++_sde_karras")]
    DpmSdeKarras,
    #[serde(rename = "dpm++_2m_karras")]
    Dpm2mKarras,
    #[serde(rename = "dpm++_2m_sde_karras")]
    Dpm2mSdeKarras,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// An adapter fused into the pipeline at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lora {
    pub path: String,
    /// Percentage; fused at `strength / 100`.
    pub strength: u32,
}

impl Lora {
    /// Adapter name, derived from the file stem with dots removed.
    pub fn name(&self) -> String {
        Path::new(&self.path)
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .replace('.', "")
    }

    pub fn weight(&self) -> f32 {
        self.strength as f32 / 100.0
    }
}

/// Governs one detail-refinement stage. Doubles as the face-stage cache key,
/// compared structurally after quality scaling.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Detail {
    /// Refinement strength, percentage.
    pub strength: u32,
    /// Mask-crop padding in pixels, pre-scaling.
    pub padding: f32,
    /// Regions larger than this (width × height, pre-scaling) are skipped.
    #[serde(default)]
    pub max_area: Option<f32>,
}

impl Detail {
    /// Scales the pixel-space thresholds to the resolved resolution.
    /// Strength is resolution-independent and stays put.
    pub fn scaled(self, factor: f32) -> Self {
        Self {
            strength: self.strength,
            padding: self.padding * factor,
            max_area: self.max_area.map(|area| area * factor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Upscaling {
    #[serde(rename = "2x-real_esrgan")]
    RealEsrganX2,
    #[serde(rename = "4x-ultrasharp")]
    UltrasharpX4,
}

impl Upscaling {
    pub fn scale(self) -> u32 {
        match self {
            Upscaling::RealEsrganX2 => 2,
            Upscaling::UltrasharpX4 => 4,
        }
    }

    pub fn weight(self) -> &'static str {
        match self {
            Upscaling::RealEsrganX2 => "RealESRGAN_x2plus",
            Upscaling::UltrasharpX4 => "4x-UltraSharp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upscaler {
    pub model: Upscaling,
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    #[serde(default = "default_tile_padding")]
    pub tile_padding: u32,
}

fn default_tile_size() -> u32 {
    192
}

fn default_tile_padding() -> u32 {
    24
}

/// One generation request as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub size: Size,
    pub quality: Quality,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub guidance: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub loras: Option<Vec<Lora>>,
    #[serde(default)]
    pub sampler: Option<Sampler>,
    #[serde(default)]
    pub preview_after: Option<f32>,
    #[serde(default)]
    pub face_detail: Option<Detail>,
    #[serde(default)]
    pub hand_detail: Option<Detail>,
    #[serde(default)]
    pub upscaler: Option<Upscaler>,
    #[serde(default)]
    pub cpu_offload: Option<bool>,
}

pub const DEFAULT_STEPS: u32 = 30;
pub const DEFAULT_GUIDANCE: f32 = 5.0;

impl Request {
    /// Resolves the wire request into a runnable job.
    pub fn resolve(self, config: &ServerConfig) -> Result<Job> {
        let model = resolve_model(&self.model, config)?;

        let steps = self.steps.unwrap_or(DEFAULT_STEPS);
        if steps < 1 {
            return Err(Error::Malformed("steps must be at least 1".to_owned()));
        }

        let guidance = self.guidance.unwrap_or(DEFAULT_GUIDANCE);
        if !(1.0..=30.0).contains(&guidance) {
            return Err(Error::Malformed(
                "guidance must be between 1 and 30".to_owned(),
            ));
        }

        let loras = self.loras.unwrap_or_default();
        for lora in &loras {
            if lora.strength > 500 {
                return Err(Error::Malformed(format!(
                    "lora strength must be at most 500%: {}",
                    lora.path
                )));
            }
        }

        for detail in [&self.face_detail, &self.hand_detail].into_iter().flatten() {
            if detail.strength > 100 {
                return Err(Error::Malformed(
                    "detail strength must be at most 100%".to_owned(),
                ));
            }
            if !(0.0..=100.0).contains(&detail.padding) {
                return Err(Error::Malformed(
                    "detail padding must be between 0 and 100 pixels".to_owned(),
                ));
            }
        }

        if let Some(upscaler) = &self.upscaler {
            if !(100..=300).contains(&upscaler.tile_size) {
                return Err(Error::Malformed(
                    "upscaler tile size must be between 100 and 300 pixels".to_owned(),
                ));
            }
        }

        Ok(Job {
            parameters: Parameters {
                model,
                prompt: self.prompt,
                negative_prompt: self.negative_prompt,
                width: self.size.width,
                height: self.size.height,
                quality: self.quality,
                steps,
                guidance,
                seed: self.seed,
                loras,
                sampler: self.sampler.unwrap_or_default(),
            },
            face_detail: self.face_detail,
            hand_detail: self.hand_detail,
            upscaler: self.upscaler,
            preview_after: self.preview_after.unwrap_or(1.0),
            cpu_offload: self.cpu_offload.unwrap_or(false),
        })
    }
}

/// Everything the orchestrator needs for one generation.
#[derive(Debug, Clone)]
pub struct Job {
    pub parameters: Parameters,
    pub face_detail: Option<Detail>,
    pub hand_detail: Option<Detail>,
    pub upscaler: Option<Upscaler>,
    /// Fraction of total steps after which previews are emitted.
    /// 1.0 means "final only".
    pub preview_after: f32,
    pub cpu_offload: bool,
}

/// The resolved sampling parameters. Structural equality is the base-stage
/// cache key: two requests with equal `Parameters` and a fixed seed follow
/// the same trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub model: PathBuf,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub quality: Quality,
    pub steps: u32,
    pub guidance: f32,
    pub seed: Option<u64>,
    pub loras: Vec<Lora>,
    pub sampler: Sampler,
}

impl Parameters {
    /// Target size scaled by the quality multiplier.
    pub fn resolution(&self) -> (u32, u32) {
        let factor = self.quality.multiplier();

        (
            (self.width as f32 * factor) as u32,
            (self.height as f32 * factor) as u32,
        )
    }
}

fn resolve_model(name: &str, config: &ServerConfig) -> Result<PathBuf> {
    if let Some(path) = lookup_model(name, config)? {
        return Ok(path);
    }

    // No such model. Do a Levenshtein distance check against everything we
    // know about, and auto-correct obvious typos.
    let mut best_distance = usize::MAX;
    let mut best_model = None;
    for candidate in config.aliases.keys().cloned().chain(installed_models(config)) {
        let distance = strsim::levenshtein(name, &candidate);
        if distance < best_distance {
            best_distance = distance;
            best_model = Some(candidate);
        }
    }

    if let Some(best) = &best_model {
        if best_distance <= 2 {
            log::info!("Correcting model {name} to {best}");
            if let Some(path) = lookup_model(best, config)? {
                return Ok(path);
            }
        }
    }

    Err(Error::UnknownModel {
        name: name.to_owned(),
        suggestion: best_model,
    })
}

/// Chases aliases and checks the models directory. `Ok(None)` means the name
/// is simply not installed.
fn lookup_model(name: &str, config: &ServerConfig) -> Result<Option<PathBuf>> {
    let mut name = name.to_owned();
    let mut hops = 0;
    while let Some(alias) = config.aliases.get(&name) {
        name = alias.clone();
        hops += 1;
        if hops > config.aliases.len() {
            return Err(Error::Malformed(format!("alias loop at {name}")));
        }
    }

    let path = config.models_dir.join(format!("{name}.safetensors"));
    Ok(path.is_file().then_some(path))
}

fn installed_models(config: &ServerConfig) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(&config.models_dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension()? != "safetensors" {
                return None;
            }

            Some(path.file_stem()?.to_string_lossy().into_owned())
        })
        .collect()
}
