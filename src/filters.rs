//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Image filters.
//

use crate::image::{Image, PixelFormat};


/// Result of 3 iterations is quite close to a Gaussian blur.
const QUALITY_ESTIMATE_BOX_BLUR_ITERATIONS: usize = 3;

/// Largest box blur radius whose neighborhood sums of 8-bit values still fit in 32 bits.
pub const MAX_BOX_BLUR_RADIUS: u32 = (1 << 11) - 2;


/// Returns a copy of `img` with box blur applied; `img` has to be `Mono8`.
pub fn apply_box_blur(img: &Image, box_radius: u32, iterations: usize) -> Image {
    assert!(img.get_pixel_format() == PixelFormat::Mono8);

    let mut blurred_img = Image::new(img.get_width(), img.get_height(), PixelFormat::Mono8, None);

    box_blur(img.get_pixels::<u8>(), blurred_img.get_pixels_mut::<u8>(),
             img.get_width(), img.get_height(), img.get_width() as usize,
             box_radius, iterations);

    blurred_img
}


/// Fills `sums` with sums of `2*box_radius+1`-element neighborhoods of `line`'s elements.
///
/// Off-line neighbors are copies of the border elements.
///
fn box_blur_pass(line: &[u32], sums: &mut [u32], box_radius: usize) {
    let last = line.len() as isize - 1;
    let at = |i: isize| line[i.clamp(0, last) as usize];
    let r = box_radius as isize;

    let mut sum: u32 = (-r..=r).map(at).sum();
    sums[0] = sum;

    for i in 1..line.len() as isize {
        // The removed element is a part of `sum`, no underflow
        sum = sum + at(i + r) - at(i - r - 1);
        sums[i as usize] = sum;
    }
}


/// Fills `blurred` with box-blurred contents of `src`.
///
/// Both `src` and `blurred` have `width`*`height` elements (8-bit grayscale).
/// `src_line_stride` is the distance between lines in `src` (which may be a part of a larger image).
/// Line stride in `blurred` equals `width`.
///
pub fn box_blur(src: &[u8], blurred: &mut [u8],
                width: u32, height: u32, src_line_stride: usize,
                box_radius: u32, iterations: usize) {
    assert!(iterations > 0);
    assert!(box_radius > 0);

    if width == 0 || height == 0 { return; }

    // The max value of a vertical neighborhood sum of horizontal sums is
    //
    //      (2^8-1) * (box_radius*2 + 1)^2
    //
    // In order for it to fit in 32 bits, box_radius must be below ca. 2^11 - 1.
    assert!(box_radius <= MAX_BOX_BLUR_RADIUS);

    let (w, h) = (width as usize, height as usize);
    let r = box_radius as usize;
    let divisor = sqr!(2 * box_radius + 1);

    let mut values: Vec<u32> = (0..h)
        .flat_map(|y| src[range!(y * src_line_stride, w)].iter().map(|&v| v as u32))
        .collect();

    let mut column = vec![0u32; h];
    let mut sums = vec![0u32; w.max(h)];

    for _ in 0..iterations {
        for row in values.chunks_exact_mut(w) {
            box_blur_pass(row, &mut sums[..w], r);
            row.copy_from_slice(&sums[..w]);
        }

        for x in 0..w {
            for (y, c) in column.iter_mut().enumerate() {
                *c = values[y * w + x];
            }
            box_blur_pass(&column, &mut sums[..h], r);

            // Divide every iteration; a single division at the end would overflow the sums
            for (y, s) in sums[..h].iter().enumerate() {
                values[y * w + x] = s / divisor;
            }
        }
    }

    for (b, v) in blurred.iter_mut().zip(values) {
        *b = v as u8;
    }
}


/// Estimates quality of the specified area (8 bits per pixel).
///
/// Quality is the sum of differences between input image and its blurred version.
/// In other words, sum of values of the high-frequency component.
/// The sum is normalized by dividing by the number of pixels.
///
/// `pixels` starts at the beginning of a `width`x`height` area
/// in an image with `line_stride` distance between lines.
///
pub fn estimate_quality(pixels: &[u8], width: u32, height: u32, line_stride: usize, box_blur_radius: u32) -> f32 {
    if width == 0 || height == 0 { return 0.0; }

    let mut blurred = vec![0u8; (width * height) as usize];
    box_blur(pixels, &mut blurred, width, height, line_stride, box_blur_radius, QUALITY_ESTIMATE_BOX_BLUR_ITERATIONS);

    let quality: u64 = blurred.chunks_exact(width as usize)
        .enumerate()
        .map(|(y, blurred_line)| {
            pixels[range!(y * line_stride, width as usize)].iter()
                .zip(blurred_line)
                .map(|(&p, &b)| (p as i32 - b as i32).unsigned_abs() as u64)
                .sum::<u64>()
        })
        .sum();

    quality as f32 / (width * height) as f32
}


/// Returns contents of `array` after median filtering.
///
/// Off-array neighbors are copies of the border elements.
///
pub fn median_filter(array: &[f64], window_radius: usize) -> Vec<f64> {
    if array.is_empty() { return vec![]; }

    let last = array.len() as isize - 1;
    let r = window_radius as isize;

    // Kept sorted
    let mut window: Vec<f64> = (-r..=r).map(|i| array[i.clamp(0, last) as usize]).collect();
    window.sort_by(f64::total_cmp);

    let mut output = Vec::with_capacity(array.len());

    for i in 0..array.len() as isize {
        output.push(window[window_radius]);

        let removed = array[(i - r).clamp(0, last) as usize];
        let added = array[(i + r + 1).clamp(0, last) as usize];

        if let Ok(pos) = window.binary_search_by(|x| x.total_cmp(&removed)) {
            window.remove(pos);
            let insert_pos = window.partition_point(|x| x.total_cmp(&added).is_lt());
            window.insert(insert_pos, added);
        }
    }

    output
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn blur_of_flat_image_is_unchanged() {
        let img = test_utils::mono8_from_fn(17, 9, |_, _| 123);
        assert_eq!(img, apply_box_blur(&img, 3, 3));
    }

    #[test]
    fn blur_spreads_single_bright_pixel() {
        let img = test_utils::mono8_from_fn(7, 7, |x, y| if x == 3 && y == 3 { 252 } else { 0 });
        let blurred = apply_box_blur(&img, 1, 1);

        // 252 / 9 in the whole 3x3 neighborhood, zero elsewhere
        for y in 0..7 {
            for x in 0..7 {
                let expected = if (2..=4).contains(&x) && (2..=4).contains(&y) { 28 } else { 0 };
                assert_eq!(expected, blurred.get_pixels::<u8>()[y * 7 + x]);
            }
        }
    }

    #[test]
    fn quality_of_flat_region_is_zero() {
        let img = test_utils::mono8_from_fn(32, 32, |_, _| 77);
        assert_eq!(0.0, estimate_quality(img.get_pixels::<u8>(), 32, 32, 32, 4));
    }

    #[test]
    fn quality_grows_with_detail() {
        let smooth = test_utils::mono8_from_fn(32, 32, |x, _| (x * 4) as u8);
        let detailed = test_utils::mono8_from_fn(32, 32, |x, y| if (x + y) % 2 == 0 { 200 } else { 50 });

        let q_smooth = estimate_quality(smooth.get_pixels::<u8>(), 32, 32, 32, 2);
        let q_detailed = estimate_quality(detailed.get_pixels::<u8>(), 32, 32, 32, 2);
        assert!(q_detailed > q_smooth);
    }

    #[test]
    fn quality_of_subarea_uses_stride() {
        // Flat 8x8 area at (4, 4) inside a noisy image
        let img = test_utils::mono8_from_fn(16, 16, |x, y| {
            if (4..12).contains(&x) && (4..12).contains(&y) { 90 } else { ((x * 37 + y * 91) % 256) as u8 }
        });
        let pixels = &img.get_pixels::<u8>()[4 * 16 + 4..];
        assert_eq!(0.0, estimate_quality(pixels, 8, 8, 16, 2));
    }

    #[test]
    fn median_filter_removes_spike() {
        let filtered = median_filter(&[1.0, 1.0, 9.0, 1.0, 2.0, 2.0], 1);
        assert_eq!(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0], filtered);
    }
}
