//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Synthetic images for unit tests.
//

use crate::defs::Point;
use crate::image::{Image, PixelFormat};


pub fn mono8_from_fn<F: Fn(u32, u32) -> u8>(width: u32, height: u32, f: F) -> Image {
    let pixels = (0..height).flat_map(|y| (0..width).map(move |x| (x, y))).map(|(x, y)| f(x, y)).collect();
    Image::from_pixels(width, height, PixelFormat::Mono8, None, pixels).unwrap()
}


/// Brightness of a smooth, non-periodic pattern with blobs; varies in every direction.
pub fn texture_value(x: f64, y: f64) -> f64 {
    let mut v = 110.0
        + 35.0 * (0.23 * x + 0.07 * y).sin()
        + 30.0 * (0.17 * y - 0.05 * x + 1.3).cos()
        + 15.0 * (0.031 * x * 0.9 + 0.043 * y + 0.02 * (x * y).sqrt()).sin();

    for i in 0..40 {
        let cx = ((i * 37 + 11) % 197) as f64;
        let cy = ((i * 61 + 29) % 193) as f64;
        let amp = if i % 2 == 0 { 60.0 } else { -45.0 };
        v += amp * (-((x - cx) * (x - cx) + (y - cy) * (y - cy)) / 30.0).exp();
    }

    v.clamp(0.0, 255.0)
}


pub fn textured_frame(width: u32, height: u32) -> Image {
    mono8_from_fn(width, height, |x, y| texture_value(x as f64, y as f64).round() as u8)
}


/// Returns `img` with contents moved by `shift`; pixels uncovered by the shift repeat the border.
pub fn shifted(img: &Image, shift: Point) -> Image {
    let (w, h) = (img.get_width() as i32, img.get_height() as i32);
    let src = img.get_pixels::<u8>();
    mono8_from_fn(w as u32, h as u32, |x, y| {
        let sx = (x as i32 - shift.x).clamp(0, w - 1);
        let sy = (y as i32 - shift.y).clamp(0, h - 1);
        src[(sy * w + sx) as usize]
    })
}
