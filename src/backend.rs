// The accelerator boundary.
//
// Everything expensive (diffusion sampling, text encoding, region detection,
// super-resolution) sits behind these traits. The orchestrator only sequences
// them; swapping in a real accelerator stack is a matter of providing another
// `Loader`. All calls are synchronous: stages run on a dedicated blocking
// worker, never on the event loop.

use std::path::Path;

use anyhow::Result;
use image::{GrayImage, RgbaImage};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::params::{Lora, Sampler, Upscaling};
use crate::pixels::Rectangle;

/// Prompt embeddings produced by the resident text encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(pub Vec<f32>);

/// The replayable random source driving a generation.
///
/// Snapshots taken with [`Generator::state`] can be fed back through
/// [`Generator::restore`] to reproduce a prior stochastic trajectory
/// bit-for-bit, which is what makes stage caching sound.
#[derive(Debug)]
pub struct Generator {
    rng: StdRng,
}

#[derive(Debug, Clone)]
pub struct GeneratorState(StdRng);

impl Generator {
    pub fn from_seed(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self { rng }
    }

    pub fn state(&self) -> GeneratorState {
        GeneratorState(self.rng.clone())
    }

    pub fn restore(&mut self, state: &GeneratorState) {
        self.rng = state.0.clone();
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// The derived runtime configuration for one request: resolved steps and
/// resolution, encoded prompts, and the generator every stage draws from.
#[derive(Debug)]
pub struct Configuration {
    pub steps: u32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub prompt: Embedding,
    pub negative_prompt: Embedding,
    pub generator: Generator,
}

/// Per-step progress callback. Receives the zero-based step index and a
/// preview of the work in progress. An `Err` is a cooperative abort:
/// implementations must stop sampling and return it unchanged.
pub type StepFn<'a> = &'a mut (dyn FnMut(u32, &RgbaImage) -> Result<()> + Send);

/// A synthesis pipeline resident on the accelerator, with its adapters
/// already fused.
pub trait Pipeline: Send {
    /// Swaps the scheduling strategy in place. Cheap; no weight reload.
    fn set_sampler(&mut self, sampler: Sampler) -> Result<()>;

    /// Runs base synthesis, invoking `on_step` after every step.
    fn sample(&mut self, configuration: &mut Configuration, on_step: StepFn) -> Result<RgbaImage>;

    /// Re-synthesizes the mask-covered area of `image` in place, returning
    /// the full image. `strength` is in [0, 1]; `padding` is the mask-crop
    /// margin in pixels.
    fn inpaint(
        &mut self,
        image: &RgbaImage,
        mask: &GrayImage,
        strength: f32,
        padding: f32,
        configuration: &mut Configuration,
        on_step: StepFn,
    ) -> Result<RgbaImage>;
}

/// The text-embedding front-end, rebuilt whenever the pipeline reloads.
pub trait TextEncoder: Send {
    fn encode(&mut self, text: &str) -> Result<Embedding>;
}

/// Region detection. Runs in the detection worker, never on the
/// generation worker.
pub trait Detector: Send {
    fn detect(&mut self, weights: &Path, image: &RgbaImage) -> Result<Prediction>;
}

/// Raw detector output. Interpretation (area limits, budgets) is the
/// refiner's job, not the detector's.
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub boxes: Vec<Rectangle>,
    pub masks: Vec<GrayImage>,
}

/// A loaded super-resolution backend.
pub trait Scaler: Send {
    /// Fixed integer upscale factor of this backend.
    fn factor(&self) -> u32;

    fn upscale(&mut self, image: &RgbaImage, tile_size: u32, tile_padding: u32)
        -> Result<RgbaImage>;
}

/// Builds accelerator-resident collaborators. One per process.
pub trait Loader: Send + Sync {
    /// Loads a model and fuses the given adapters, returning the pipeline
    /// and its matching text encoder.
    fn load(
        &self,
        model: &Path,
        loras: &[Lora],
        cpu_offload: bool,
    ) -> Result<(Box<dyn Pipeline>, Box<dyn TextEncoder>)>;

    fn load_scaler(&self, model: Upscaling, weights_dir: &Path) -> Result<Box<dyn Scaler>>;

    fn load_detector(&self) -> Result<Box<dyn Detector>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_generator_replay() {
        let mut generator = Generator::from_seed(Some(17));
        let _ = generator.rng().next_u64();
        let state = generator.state();

        let a = generator.rng().next_u64();
        generator.restore(&state);
        let b = generator.rng().next_u64();

        assert_eq!(a, b);
    }

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = Generator::from_seed(Some(42));
        let mut b = Generator::from_seed(Some(42));

        assert_eq!(a.rng().next_u64(), b.rng().next_u64());
    }
}
