// Tiled super-resolution pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use log::info;

use crate::backend::{Loader, Scaler};
use crate::error::{self, Error, Result};
use crate::params::{Upscaler, Upscaling};
use crate::pixels::Rectangle;

/// Super-resolution stage with its own resident-backend cache, independent
/// of the synthesis model cache: the scaler reloads only when the requested
/// variant changes.
pub struct UpscaleStage {
    loader: Arc<dyn Loader>,
    weights_dir: PathBuf,
    resident: Option<(Upscaling, Box<dyn Scaler>)>,
}

impl UpscaleStage {
    pub fn new(loader: Arc<dyn Loader>, weights_dir: PathBuf) -> Self {
        Self {
            loader,
            weights_dir,
            resident: None,
        }
    }

    fn ensure(&mut self, model: Upscaling) -> Result<&mut (dyn Scaler + '_)> {
        let stale = !matches!(&self.resident, Some((resident, _)) if *resident == model);

        if stale {
            info!("Loading {} upscaler ({}x)...", model.weight(), model.scale());
            let scaler = self
                .loader
                .load_scaler(model, &self.weights_dir)
                .map_err(|source| Error::ModelLoad {
                    model: model.weight().to_owned(),
                    source,
                })?;
            self.resident = Some((model, scaler));
        }

        Ok(self
            .resident
            .as_mut()
            .expect("scaler resident after ensure")
            .1
            .as_mut())
    }

    /// Runs the heavy pass and rescales the region metadata into the
    /// upscaled coordinate space. `emit` fires once before the pass with
    /// the final-resolution-pending image at ratio 1.0.
    pub fn run(
        &mut self,
        upscaler: &Upscaler,
        image: RgbaImage,
        faces: Vec<Rectangle>,
        hands: Vec<Rectangle>,
        emit: &mut dyn FnMut(f32, &RgbaImage) -> Result<()>,
    ) -> Result<(RgbaImage, Vec<Rectangle>, Vec<Rectangle>)> {
        let scaler = self.ensure(upscaler.model)?;

        emit(1.0, &image)?;

        info!("Upscaling with {}", upscaler.model.weight());
        let start = Instant::now();
        let upscaled = scaler
            .upscale(&image, upscaler.tile_size, upscaler.tile_padding)
            .map_err(|error| error::stage("upscale", error))?;
        info!("Upscaled in {:.2?}", start.elapsed());

        let factor = scaler.factor() as f32;
        let faces = faces.iter().map(|bounds| bounds.scaled(factor)).collect();
        let hands = hands.iter().map(|bounds| bounds.scaled(factor)).collect();

        Ok((upscaled, faces, hands))
    }
}
