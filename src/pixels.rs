// Shared pixel-space helpers: region rectangles, preview filtering, and the
// raw RGBA access the wire protocol needs.

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Gaussian sigma applied to previews before they leave the process.
const PREVIEW_SIGMA: f32 = 2.0;

/// A detected region. Travels on the wire as `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct Rectangle {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rectangle {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Rescales into the coordinate space of an upscaled image.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

impl From<[f32; 4]> for Rectangle {
    fn from([x, y, width, height]: [f32; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<Rectangle> for [f32; 4] {
    fn from(rectangle: Rectangle) -> Self {
        [
            rectangle.x,
            rectangle.y,
            rectangle.width,
            rectangle.height,
        ]
    }
}

/// Blurred, fully opaque copy of an in-flight image, fit for streaming out
/// as a preview.
pub fn preview(image: &RgbaImage) -> RgbaImage {
    let mut preview = image::imageops::blur(image, PREVIEW_SIGMA);
    opaque(&mut preview);
    preview
}

/// Forces the alpha channel to 255. The wire format is RGBA, but nothing
/// upstream promises a meaningful alpha layer.
pub fn opaque(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        pixel[3] = 255;
    }
}

/// Softens a detection mask's edges so refined regions blend into their
/// surroundings instead of seaming.
pub fn feather(mask: &GrayImage, factor: f32) -> GrayImage {
    image::imageops::blur(mask, factor)
}
