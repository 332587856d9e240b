//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Utilities.
//

use crate::defs::{Point, WHITE_8BIT};
use crate::filters;
use crate::image::{Image, PixelFormat};


macro_rules! sqr {
    ($x:expr) => { ($x) * ($x) }
}


/// Produces a range of specified length.
macro_rules! range { ($start:expr, $len:expr) => { $start .. $start + $len } }


/// Returns ceil(a/b).
macro_rules! updiv {
    ($a:expr, $b:expr) => { (($a) + ($b) - 1) / ($b) }
}


/// Returns barycentric coordinates `(u, v)` of point `p` in the triangle `(v0, v1, v2)` (`p` can be outside the triangle).
///
/// `u` is the weight of `v0`, `v` the weight of `v1`; the weight of `v2` is `1 - u - v`.
///
macro_rules! calc_barycentric_coords {
    ($p:expr, $v0:expr, $v1:expr, $v2:expr) => {{
        let denom = ($v1.y as f64 - $v2.y as f64) * ($v0.x as f64 - $v2.x as f64) +
                    ($v2.x as f64 - $v1.x as f64) * ($v0.y as f64 - $v2.y as f64);
        ((($v1.y as f64 - $v2.y as f64) * ($p.x as f64 - $v2.x as f64) +
          ($v2.x as f64 - $v1.x as f64) * ($p.y as f64 - $v2.y as f64)) / denom,
         (($v2.y as f64 - $v0.y as f64) * ($p.x as f64 - $v2.x as f64) +
          ($v0.x as f64 - $v2.x as f64) * ($p.y as f64 - $v2.y as f64)) / denom)
    }}
}


/// Returns the min. and max. pixel values in a Mono8 image.
pub fn find_min_max_brightness(img: &Image) -> (u8, u8) {
    assert!(img.get_pixel_format() == PixelFormat::Mono8);

    img.get_pixels::<u8>().iter().fold((WHITE_8BIT, 0u8), |(bmin, bmax), &val| (bmin.min(val), bmax.max(val)))
}


/// Number of bins in the gradient direction histogram.
const NUM_GRADIENT_DIRS: usize = 512;


/// Checks if the specified position `pos` in `img` (Mono8) is appropriate for block matching.
///
/// Uses the distribution of gradient directions around `pos` to decide
/// if the location is safe for block matching. It is not if the image
/// is dominated by a single edge (e.g. the limb of overexposed solar disk,
/// without prominences or resolved spicules). Should block matching be performed
/// in such circumstances, the tracked point would jump along the edge.
///
pub fn assess_gradients_for_block_matching(img: &Image, pos: Point, neighborhood_radius: u32) -> bool {
    let block_size = 2 * neighborhood_radius + 1;

    let block = img.get_fragment_copy(Point{ x: pos.x - neighborhood_radius as i32,
                                             y: pos.y - neighborhood_radius as i32 },
                                      block_size, block_size);

    // Reduce the impact of noise
    let blurred = filters::apply_box_blur(&block, 1, 3);
    let pixels = blurred.get_pixels::<u8>();
    let stride = block_size as usize;
    let px = |x: usize, y: usize| pixels[y * stride + x] as i32;

    // Histogram of gradient directions; each bin contains the sum of gradient lengths
    let mut dirs = [0.0f64; NUM_GRADIENT_DIRS];

    for y in 1..stride - 1 {
        for x in 1..stride - 1 {
            // Sobel operator
            let grad_x = 2 * (px(x + 1, y) - px(x - 1, y))
                         + px(x + 1, y - 1) - px(x - 1, y - 1)
                         + px(x + 1, y + 1) - px(x - 1, y + 1);

            let grad_y = 2 * (px(x, y + 1) - px(x, y - 1))
                         + px(x + 1, y + 1) - px(x + 1, y - 1)
                         + px(x - 1, y + 1) - px(x - 1, y - 1);

            let grad_len = f64::sqrt((sqr!(grad_x) + sqr!(grad_y)) as f64);
            if grad_len > 0.0 {
                let dir = f64::atan2(grad_y as f64, grad_x as f64);
                let index = NUM_GRADIENT_DIRS as i32 / 2 +
                            (dir * NUM_GRADIENT_DIRS as f64 / (2.0 * std::f64::consts::PI)) as i32;

                dirs[index.clamp(0, NUM_GRADIENT_DIRS as i32 - 1) as usize] += grad_len;
            }
        }
    }

    // Remove spikes caused by the Sobel filter's anisotropy
    let dirs_smooth = filters::median_filter(&dirs, 1);

    // Gradient variability is too low if there are consecutive zeros over more than 1/3
    // of the histogram and the longest non-zero run is shorter than 1/4 of it
    let mut zero_count = 0usize;
    let mut nzero_count = 0usize;
    let mut max_zero_count = 0usize;
    let mut max_nzero_count = 0usize;

    for ds in dirs_smooth {
        if ds == 0.0 {
            zero_count += 1;
            nzero_count = 0;
        } else {
            nzero_count += 1;
            zero_count = 0;
        }
        max_zero_count = max_zero_count.max(zero_count);
        max_nzero_count = max_nzero_count.max(nzero_count);
    }

    !(max_zero_count > NUM_GRADIENT_DIRS / 3 && max_nzero_count < NUM_GRADIENT_DIRS / 4)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn barycentric_coords_of_vertices() {
        let v0 = Point{ x: 0, y: 0 };
        let v1 = Point{ x: 10, y: 0 };
        let v2 = Point{ x: 0, y: 10 };

        let (u, v) = calc_barycentric_coords!(v0, v0, v1, v2);
        assert_eq!((1.0, 0.0), (u, v));

        let (u, v) = calc_barycentric_coords!(v1, v0, v1, v2);
        assert_eq!((0.0, 1.0), (u, v));

        let (u, v) = calc_barycentric_coords!(Point{ x: 5, y: 5 }, v0, v1, v2);
        assert!((u - 0.0).abs() < 1.0e-12 && (v - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn min_max_brightness() {
        let img = Image::from_pixels(3, 1, PixelFormat::Mono8, None, vec![7u8, 200, 31]).unwrap();
        assert_eq!((7, 200), find_min_max_brightness(&img));
    }

    #[test]
    fn single_straight_edge_is_rejected_for_block_matching() {
        // Left half dark, right half bright: all gradients point in one direction
        let img = test_utils::mono8_from_fn(96, 96, |x, _| if x < 48 { 20 } else { 220 });
        assert!(!assess_gradients_for_block_matching(&img, Point{ x: 48, y: 48 }, 32));
    }

    #[test]
    fn textured_region_is_accepted_for_block_matching() {
        let img = test_utils::textured_frame(128, 128);
        assert!(assess_gradients_for_block_matching(&img, Point{ x: 64, y: 64 }, 32));
    }
}
