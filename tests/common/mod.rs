//! Shared test helpers.
#![allow(dead_code)]

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, imageops::FilterType};
use imagetwin::core::store::FingerprintStore;
use imagetwin::{AppConfig, ImageTwin};
use std::io::Cursor;
use std::path::Path;

pub fn setup() -> ImageTwin {
    let config = AppConfig {
        parallel_workers: 2,
        ..AppConfig::default()
    };
    ImageTwin::with_store(config, FingerprintStore::temporary().unwrap()).unwrap()
}

/// Smooth scene with a bright disc off-centre, so resizes keep their hash.
pub fn scene(width: u32, height: u32) -> DynamicImage {
    let (cx, cy, r) = (width as f32 * 0.3, height as f32 * 0.4, height as f32 * 0.2);
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
        let (dx, dy) = (x as f32 - cx, y as f32 - cy);
        if dx * dx + dy * dy < r * r {
            Rgb([250, 240, 220])
        } else {
            Rgb([(x * 200 / width) as u8, (y * 160 / height) as u8, 60])
        }
    }))
}

pub fn resized(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    img.resize_exact(width, height, FilterType::Triangle)
}

pub fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

pub fn write_png(path: &Path, img: &DynamicImage) -> Vec<u8> {
    let bytes = encode(img, ImageFormat::Png);
    std::fs::write(path, &bytes).unwrap();
    bytes
}
