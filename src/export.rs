//! PNG export of simulation field snapshots for visual debugging.

use std::path::Path;

use image::{ImageBuffer, Luma, Rgb};

use crate::field::Field;

fn min_max(field: &Field<f32>) -> (f32, f32) {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for (_, _, &v) in field.iter() {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    (min, max)
}

/// Save an elevation field as a shaded terrain PNG: green lowlands, brown
/// slopes, white peaks.
pub fn save_terrain_png(field: &Field<f32>, path: &Path) -> Result<(), image::ImageError> {
    let (min, max) = min_max(field);
    let range = (max - min).max(1e-6);
    let size = field.size as u32;

    let img = ImageBuffer::from_fn(size, size, |x, y| {
        let h = *field.get(x as usize, y as usize);
        let t = ((h - min) / range).clamp(0.0, 1.0);
        if t < 0.3 {
            Rgb([(50.0 + 100.0 * t) as u8, (120.0 + 80.0 * t) as u8, 50u8])
        } else if t < 0.7 {
            let s = (t - 0.3) / 0.4;
            Rgb([
                (80.0 + 80.0 * s) as u8,
                (150.0 - 50.0 * s) as u8,
                (50.0 + 30.0 * s) as u8,
            ])
        } else {
            let s = (t - 0.7) / 0.3;
            Rgb([
                (160.0 + 95.0 * s) as u8,
                (100.0 + 155.0 * s) as u8,
                (80.0 + 175.0 * s) as u8,
            ])
        }
    });

    img.save(path)
}

/// Save a scalar field (water depth, sediment load) as a min/max
/// normalized grayscale PNG.
pub fn save_scalar_png(field: &Field<f32>, path: &Path) -> Result<(), image::ImageError> {
    let (min, max) = min_max(field);
    let range = (max - min).max(1e-6);
    let size = field.size as u32;

    let img = ImageBuffer::from_fn(size, size, |x, y| {
        let v = *field.get(x as usize, y as usize);
        let t = ((v - min) / range).clamp(0.0, 1.0);
        Luma([(t * 255.0) as u8])
    });

    img.save(path)
}

/// Save a velocity field as a grayscale PNG of flow speed.
pub fn save_flow_speed_png(
    velocity: &Field<[f32; 2]>,
    path: &Path,
) -> Result<(), image::ImageError> {
    let mut speed = Field::new_with(velocity.size, 0.0f32);
    for (x, y, v) in velocity.iter() {
        speed.set(x, y, (v[0] * v[0] + v[1] * v[1]).sqrt());
    }
    save_scalar_png(&speed, path)
}
