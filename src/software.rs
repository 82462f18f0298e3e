// Deterministic software backends.
//
// These stand in for the accelerator stack: they produce procedural images
// by drawing from the request's generator, which makes every caching and
// replay property of the orchestrator observable for real. The binary ships
// with them wired in; a GPU deployment provides its own `Loader`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{GrayImage, Rgba, RgbaImage};
use log::{debug, trace};
use rand::RngCore;

use crate::backend::{
    Configuration, Detector, Embedding, Loader, Pipeline, Prediction, Scaler, StepFn, TextEncoder,
};
use crate::params::{Lora, Sampler, Upscaling};

pub struct SoftwareLoader;

impl SoftwareLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Loader for SoftwareLoader {
    fn load(
        &self,
        model: &Path,
        loras: &[Lora],
        cpu_offload: bool,
    ) -> Result<(Box<dyn Pipeline>, Box<dyn TextEncoder>)> {
        if !model.is_file() {
            bail!("model weights not found: {}", model.display());
        }

        // The checkpoint and its fused adapters are folded into a single
        // hash; it plays the role the fused weights do on a real device.
        let mut hasher = blake3::Hasher::new();
        hasher.update(model.to_string_lossy().as_bytes());
        for lora in loras {
            hasher.update(lora.name().as_bytes());
            hasher.update(&lora.weight().to_le_bytes());
        }

        let pipeline = SoftwarePipeline {
            material: *hasher.finalize().as_bytes(),
            sampler: Sampler::default(),
            cpu_offload,
        };

        Ok((Box::new(pipeline), Box::new(SoftwareEncoder)))
    }

    fn load_scaler(&self, model: Upscaling, weights_dir: &Path) -> Result<Box<dyn Scaler>> {
        debug!(
            "Loading software scaler for {} from {}",
            model.weight(),
            weights_dir.display()
        );

        Ok(Box::new(SoftwareScaler {
            factor: model.scale(),
        }))
    }

    fn load_detector(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(SoftwareDetector))
    }
}

struct SoftwarePipeline {
    material: [u8; 32],
    sampler: Sampler,
    #[allow(dead_code)]
    cpu_offload: bool,
}

impl SoftwarePipeline {
    /// Starting color for a synthesis, derived from everything that should
    /// change the trajectory: weights, sampler, prompts, guidance.
    fn base_pixel(&self, configuration: &Configuration) -> Rgba<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.material);
        hasher.update(&[self.sampler as u8]);
        hasher.update(&configuration.guidance.to_le_bytes());
        for value in configuration
            .prompt
            .0
            .iter()
            .chain(configuration.negative_prompt.0.iter())
        {
            hasher.update(&value.to_le_bytes());
        }

        let bytes = hasher.finalize();
        let bytes = bytes.as_bytes();
        Rgba([bytes[0], bytes[1], bytes[2], 255])
    }

    fn diffuse(
        canvas: &mut RgbaImage,
        configuration: &mut Configuration,
        mask: Option<(&GrayImage, f32)>,
        on_step: StepFn,
    ) -> Result<()> {
        let mut noise = vec![0u8; canvas.as_raw().len()];
        let width = canvas.width();

        for step in 0..configuration.steps {
            configuration.generator.rng().fill_bytes(&mut noise);

            for (x, y, pixel) in canvas.enumerate_pixels_mut() {
                let weight = match mask {
                    None => 0.5,
                    Some((mask, strength)) => {
                        let coverage = mask
                            .get_pixel_checked(x, y)
                            .map(|pixel| pixel[0])
                            .unwrap_or(0);
                        if coverage < 8 {
                            continue;
                        }

                        strength * coverage as f32 / 255.0
                    }
                };

                let offset = ((y * width + x) * 4) as usize;
                for channel in 0..3 {
                    let old = pixel[channel] as f32;
                    let new = noise[offset + channel] as f32;
                    pixel[channel] = (old + (new - old) * weight) as u8;
                }
                pixel[3] = 255;
            }

            on_step(step, canvas)?;
        }

        Ok(())
    }
}

impl Pipeline for SoftwarePipeline {
    fn set_sampler(&mut self, sampler: Sampler) -> Result<()> {
        self.sampler = sampler;
        Ok(())
    }

    fn sample(&mut self, configuration: &mut Configuration, on_step: StepFn) -> Result<RgbaImage> {
        let mut canvas = RgbaImage::from_pixel(
            configuration.width,
            configuration.height,
            self.base_pixel(configuration),
        );

        Self::diffuse(&mut canvas, configuration, None, on_step)?;
        Ok(canvas)
    }

    fn inpaint(
        &mut self,
        image: &RgbaImage,
        mask: &GrayImage,
        strength: f32,
        padding: f32,
        configuration: &mut Configuration,
        on_step: StepFn,
    ) -> Result<RgbaImage> {
        trace!("Inpainting with strength {strength} and padding {padding}");

        let mut canvas = image.clone();
        let strength = strength.clamp(0.0, 1.0);
        Self::diffuse(&mut canvas, configuration, Some((mask, strength)), on_step)?;
        Ok(canvas)
    }
}

struct SoftwareEncoder;

impl TextEncoder for SoftwareEncoder {
    fn encode(&mut self, text: &str) -> Result<Embedding> {
        let hash = blake3::hash(text.as_bytes());

        Ok(Embedding(
            hash.as_bytes()
                .iter()
                .map(|byte| *byte as f32 / 255.0)
                .collect(),
        ))
    }
}

struct SoftwareDetector;

impl Detector for SoftwareDetector {
    fn detect(&mut self, weights: &Path, image: &RgbaImage) -> Result<Prediction> {
        debug!(
            "Software detector has no {} weights; {}x{} image reported clean",
            weights.display(),
            image.width(),
            image.height()
        );

        Ok(Prediction::default())
    }
}

struct SoftwareScaler {
    factor: u32,
}

impl Scaler for SoftwareScaler {
    fn factor(&self) -> u32 {
        self.factor
    }

    fn upscale(
        &mut self,
        image: &RgbaImage,
        tile_size: u32,
        tile_padding: u32,
    ) -> Result<RgbaImage> {
        trace!("Upscaling in {tile_size}px tiles with {tile_padding}px padding");

        let (width, height) = (
            image
                .width()
                .checked_mul(self.factor)
                .context("upscaled width overflows")?,
            image
                .height()
                .checked_mul(self.factor)
                .context("upscaled height overflows")?,
        );

        Ok(image::imageops::resize(
            image,
            width,
            height,
            image::imageops::FilterType::Nearest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Generator;

    use std::io::Write;

    fn configuration(seed: u64) -> Configuration {
        let mut encoder = SoftwareEncoder;

        Configuration {
            steps: 3,
            guidance: 5.0,
            width: 8,
            height: 8,
            prompt: encoder.encode("a lighthouse").unwrap(),
            negative_prompt: encoder.encode("").unwrap(),
            generator: Generator::from_seed(Some(seed)),
        }
    }

    fn pipeline() -> Box<dyn Pipeline> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"weights")
            .unwrap();

        SoftwareLoader::new().load(&path, &[], false).unwrap().0
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let result = SoftwareLoader::new().load(Path::new("/nonexistent.safetensors"), &[], false);
        assert!(result.is_err());
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let mut pipeline = pipeline();

        let a = pipeline
            .sample(&mut configuration(7), &mut |_, _| Ok(()))
            .unwrap();
        let b = pipeline
            .sample(&mut configuration(7), &mut |_, _| Ok(()))
            .unwrap();

        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_sampler_changes_the_trajectory() {
        let mut pipeline = pipeline();

        let a = pipeline
            .sample(&mut configuration(7), &mut |_, _| Ok(()))
            .unwrap();
        pipeline.set_sampler(Sampler::Dpm2mKarras).unwrap();
        let b = pipeline
            .sample(&mut configuration(7), &mut |_, _| Ok(()))
            .unwrap();

        assert_ne!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_inpaint_only_touches_the_mask() {
        let mut pipeline = pipeline();
        let image = pipeline
            .sample(&mut configuration(7), &mut |_, _| Ok(()))
            .unwrap();

        // Mask covering the top-left quadrant.
        let mut mask = GrayImage::new(8, 8);
        for y in 0..4 {
            for x in 0..4 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }

        let refined = pipeline
            .inpaint(
                &image,
                &mask,
                0.8,
                16.0,
                &mut configuration(7),
                &mut |_, _| Ok(()),
            )
            .unwrap();

        assert_ne!(refined.get_pixel(0, 0), image.get_pixel(0, 0));
        assert_eq!(refined.get_pixel(7, 7), image.get_pixel(7, 7));
    }

    #[test]
    fn test_step_callback_fires_per_step() {
        let mut pipeline = pipeline();
        let mut steps = Vec::new();

        pipeline
            .sample(&mut configuration(7), &mut |step, _| {
                steps.push(step);
                Ok(())
            })
            .unwrap();

        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[test]
    fn test_encoder_separates_prompts() {
        let mut encoder = SoftwareEncoder;

        let a = encoder.encode("a lighthouse").unwrap();
        let b = encoder.encode("a cathedral").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, encoder.encode("a lighthouse").unwrap());
    }

    #[test]
    fn test_scaler_factor() {
        let mut scaler = SoftwareScaler { factor: 4 };
        let image = RgbaImage::new(8, 6);

        let upscaled = scaler.upscale(&image, 192, 24).unwrap();
        assert_eq!((upscaled.width(), upscaled.height()), (32, 24));
    }
}
