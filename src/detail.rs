// Region-detail refinement: detect, mask, inpaint, repeat.

use std::path::Path;

use image::RgbaImage;
use log::{debug, info};

use crate::backend::{Configuration, Pipeline, StepFn};
use crate::detector::DetectorProxy;
use crate::error::{self, Result};
use crate::params::Detail;
use crate::pixels::{self, Rectangle};

/// Blur applied to raw detection masks before inpainting, so refined
/// regions blend into their surroundings.
const MASK_BLUR: f32 = 4.0;

/// Refines up to `budget` detected regions, one at a time, each refinement
/// feeding on the previous one's output. Regions larger than the
/// descriptor's area limit are skipped and do not consume budget. Returns
/// the refined image and the boxes actually processed, in detection order.
///
/// The descriptor's pixel thresholds must already be scaled to the resolved
/// resolution; this loop is resolution-agnostic.
#[allow(clippy::too_many_arguments)]
pub fn refine(
    label: &'static str,
    weights: &Path,
    detail: &Detail,
    configuration: &mut Configuration,
    image: RgbaImage,
    pipeline: &mut dyn Pipeline,
    detector: &DetectorProxy,
    budget: usize,
    on_step: StepFn,
) -> Result<(RgbaImage, Vec<Rectangle>)> {
    let prediction = detector.detect(weights, &image)?;

    if prediction.masks.is_empty() {
        debug!("No {label}s detected");
        return Ok((image, Vec::new()));
    }

    let total = prediction.masks.len();
    info!("{total} {label}(s) detected");

    let budget = budget.min(total);
    let mut image = image;
    let mut processed = Vec::new();

    for (bounds, mask) in prediction.boxes.iter().zip(prediction.masks.iter()) {
        if processed.len() >= budget {
            break;
        }

        let area = bounds.area();
        if let Some(max_area) = detail.max_area {
            if area > max_area {
                debug!("Skipping {label} with area {area} (limit {max_area})");
                continue;
            }
        }

        info!("Detailing {label} with area {area}");
        let mask = pixels::feather(mask, MASK_BLUR);

        image = pipeline
            .inpaint(
                &image,
                &mask,
                detail.strength as f32 / 100.0,
                detail.padding,
                configuration,
                &mut *on_step,
            )
            .map_err(|error| error::stage(label, error))?;

        processed.push(*bounds);
    }

    Ok((image, processed))
}
