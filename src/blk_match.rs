//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Block matching.
//

use crate::defs::{Point, Rect};
use crate::image::{Image, PixelFormat};


/// A candidate position is rejected if less than 1/4 of the block's width or height overlaps the image.
const MIN_FRACTION_OF_BLOCK_TO_MATCH: u32 = 4;


/// Returns the sum of squared differences between pixels of `img` and `ref_block`.
///
/// `ref_block`'s center is aligned on `pos` over `img`. The differences are
/// calculated only for the `refblk_rect` portion of `ref_block`.
/// `pos` is relative to `img`; `refblk_rect` is relative to `ref_blk`.
///
/// Both `ref_block` and `img` must be `Mono8`. The result is 64-bit, so for
/// 8-bit images it can accommodate a block of 2^(64-2*8) = 2^48 pixels.
///
pub fn calc_sum_of_squared_diffs(img: &Image, ref_block: &Image, pos: &Point, refblk_rect: &Rect) -> u64 {
    assert!(img.get_pixel_format() == PixelFormat::Mono8);
    assert!(ref_block.get_pixel_format() == PixelFormat::Mono8);
    assert!(ref_block.get_img_rect().contains_rect(refblk_rect));

    // Example: an 8x6 block, * = pos, . - block's pixels,
    //          refblk_rect = { x: 2, y: 1, w: 5, h: 3 }
    //
    //         0           pos.x
    //        +----------------------
    //       0|            |
    //        |            |
    //        |       +--------+
    //        |       |........|
    //        |       |..#####.|
    //        |       |..#####.|
    //   pos.y|-------|..##*##.|
    //        |       |........|
    //        |       |........|
    //        |       +--------+
    //        |

    let img_area = Rect{ x: pos.x - ref_block.get_width() as i32 / 2 + refblk_rect.x,
                         y: pos.y - ref_block.get_height() as i32 / 2 + refblk_rect.y,
                         width: refblk_rect.width,
                         height: refblk_rect.height };

    assert!(img.get_img_rect().contains_rect(&img_area));

    let img_pix = img.get_mono8_pixels_from(img_area.get_pos());
    let blk_pix = ref_block.get_mono8_pixels_from(refblk_rect.get_pos());

    let img_stride = img.get_width() as usize;
    let blk_stride = ref_block.get_width() as usize;
    let width = refblk_rect.width as usize;

    (0..refblk_rect.height as usize).map(|row| {
        img_pix[range!(row * img_stride, width)].iter()
            .zip(&blk_pix[range!(row * blk_stride, width)])
            .map(|(&i, &b)| sqr!(i as i32 - b as i32) as u64)
            .sum::<u64>()
    }).sum()
}


/// Returns the sum of squared differences of `ref_block` centered at `pos` in `image`,
/// normalized to the whole block's area.
///
/// The block may extend outside `image`; returns `None` if the overlap is too small to compare.
///
fn normalized_block_diff(image: &Image, ref_block: &Image, pos: Point) -> Option<u64> {
    let (blkw, blkh) = (ref_block.get_width(), ref_block.get_height());

    let blk_area = Rect{ x: pos.x - blkw as i32 / 2, y: pos.y - blkh as i32 / 2, width: blkw, height: blkh };

    // `refblk_rect`: part of `ref_block` which lies within `image`
    //
    //   +======== ref_block ========+
    //   |                           |
    //   |   +-------- img ----------|-------
    //   |   |.......................|
    //   |   |..........*............|
    //   |   |.......................|
    //   +===========================+
    //       |
    //
    let overlap = image.get_img_rect().intersection(&blk_area)?;

    if overlap.width < blkw / MIN_FRACTION_OF_BLOCK_TO_MATCH ||
       overlap.height < blkh / MIN_FRACTION_OF_BLOCK_TO_MATCH {
        return None;
    }

    let refblk_rect = Rect{ x: overlap.x - blk_area.x, y: overlap.y - blk_area.y, ..overlap };
    let sum_sq_diffs = calc_sum_of_squared_diffs(image, ref_block, &pos, &refblk_rect);

    // Normalize to make it comparable with other (differently clipped) positions
    Some(sum_sq_diffs * (blkw as u64 * blkh as u64) / (overlap.width as u64 * overlap.height as u64))
}


/// Finds the position in `image` where `ref_block` matches best (has the smallest sum of squared differences).
///
/// The search covers positions within `search_radius` (per axis) of `ref_pos`, starting
/// with a grid of `initial_search_step` spacing centered on `ref_pos`. The grid is then
/// repeatedly refined around the best position found so far (with half the step),
/// until the step becomes 0. Ties are resolved in favor of the position visited first
/// (row-major order). If no position can be compared, returns `ref_pos`.
///
/// Both `ref_block` and `image` must be `Mono8`; `ref_pos` corresponds to the block's center.
///
pub fn find_matching_position(ref_pos: Point,
                              ref_block: &Image,
                              image: &Image,
                              search_radius: u32,
                              initial_search_step: u32) -> Point {
    assert!(image.get_pixel_format() == PixelFormat::Mono8);
    assert!(ref_block.get_pixel_format() == PixelFormat::Mono8);

    let mut best_pos = ref_pos;

    // Half-extent of the currently searched area around `best_pos`
    let mut search_extent = search_radius as i32;
    let mut search_step = initial_search_step as i32;

    while search_step > 0 {
        let center = best_pos;
        let num_steps = search_extent / search_step;

        let mut min_sq_diff_sum = u64::MAX;

        for ky in -num_steps..=num_steps {
            for kx in -num_steps..=num_steps {
                let pos = Point{ x: center.x + kx * search_step, y: center.y + ky * search_step };

                if let Some(sum_sq_diffs) = normalized_block_diff(image, ref_block, pos) {
                    if sum_sq_diffs < min_sq_diff_sum {
                        min_sq_diff_sum = sum_sq_diffs;
                        best_pos = pos;
                    }
                }
            }
        }

        search_extent = search_step;
        search_step /= 2;
    }

    best_pos
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn ssd_of_partial_block() {
        let img = test_utils::mono8_from_fn(4, 4, |_, _| 10);
        let block = test_utils::mono8_from_fn(2, 2, |x, _| if x == 0 { 13 } else { 10 });

        let full = calc_sum_of_squared_diffs(&img, &block, &Point{ x: 2, y: 2 }, &block.get_img_rect());
        assert_eq!(2 * 9, full);

        let right_column = calc_sum_of_squared_diffs(&img, &block, &Point{ x: 2, y: 2 }, &Rect{ x: 1, y: 0, width: 1, height: 2 });
        assert_eq!(0, right_column);
    }

    #[test]
    fn block_cut_from_image_matches_in_place() {
        let img = test_utils::textured_frame(96, 96);
        let pos = Point{ x: 40, y: 52 };
        let block = img.get_fragment_copy(Point{ x: pos.x - 12, y: pos.y - 12 }, 24, 24);

        assert_eq!(pos, find_matching_position(pos, &block, &img, 10, 4));
    }

    #[test]
    fn finds_displaced_block() {
        let img = test_utils::textured_frame(96, 96);
        let true_pos = Point{ x: 51, y: 45 };
        let block = img.get_fragment_copy(Point{ x: true_pos.x - 10, y: true_pos.y - 10 }, 20, 20);

        assert_eq!(true_pos, find_matching_position(Point{ x: 48, y: 47 }, &block, &img, 8, 2));
    }

    #[test]
    fn block_outside_image_keeps_reference_position() {
        let img = test_utils::textured_frame(32, 32);
        let block = test_utils::mono8_from_fn(8, 8, |_, _| 100);

        let far_away = Point{ x: 500, y: -300 };
        assert_eq!(far_away, find_matching_position(far_away, &block, &img, 4, 2));
    }

    #[test]
    fn clipped_block_is_compared_on_overlap() {
        // Block straddling the left image border still matches at the right place
        let img = test_utils::textured_frame(64, 64);
        let block = img.get_fragment_copy(Point{ x: -4, y: 20 }, 16, 16);

        assert_eq!(Point{ x: 4, y: 28 }, find_matching_position(Point{ x: 6, y: 27 }, &block, &img, 4, 1));
    }
}
