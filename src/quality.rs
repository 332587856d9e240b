//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Processing phase: quality estimation.
//

use crate::blk_match;
use crate::defs::{Point, ProcessingError, ProcessingPhase, Rect, WHITE_8BIT};
use crate::filters;
use crate::image::{Image, ImageError, PixelFormat};
use crate::img_align::ImgAlignmentData;
use crate::img_seq::{ImageSequence, SeekResult};
use crate::utils;
use rayon::prelude::*;
use std::cmp::{max, min};


/// Neighborhood radius used when checking brightness around a candidate reference point.
const BACKGROUND_NEIGHBORHOOD_RADIUS: i32 = 5;


/// Summary of area's quality in all images.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AreaQualitySummary {
    pub min: f32,
    pub max: f32,
    pub avg: f32,

    pub best_img_idx: usize
}


/// Quality estimation area.
#[derive(Clone, Debug)]
struct QualEstArea {
    /// Area's boundaries within the images' intersection.
    rect: Rect,

    summary: AreaQualitySummary
}


/// Fragment of the image in which a quality estimation area has the highest quality.
///
/// The fragment is a rectangle 3x wider and higher than the area, with the area in the middle;
/// for areas near the border of intersection it may be smaller.
///
#[derive(Clone, Debug)]
struct AreaRefBlock {
    /// Mono8 image fragment.
    image: Image,

    /// Position within the images' intersection.
    pos: Point
}


#[derive(Clone, Debug, Default)]
struct OverallQuality {
    /// Average area quality.
    area_avg: f32,
    /// Max. avg. quality of all areas.
    area_max_avg: f32,
    /// Min. non-zero area quality.
    area_min_nonzero_avg: f32,

    /// Index of the best-quality image.
    image_best_img_idx: usize,
    /// Best image quality.
    image_best_quality: f32
}


/// Contains results of processing performed by `QualityEstimationProc`.
#[derive(Clone, Debug, Default)]
pub struct QualityEstimationData {
    /// Images' intersection.
    intersection: Rect,

    /// Number of quality est. areas that span the images' intersection horizontally.
    num_areas_horz: usize,

    /// Number of quality est. areas that span the images' intersection vertically.
    num_areas_vert: usize,

    area_defs: Vec<QualEstArea>,

    /// Reference blocks of areas (one per element of `area_defs`).
    ref_blocks: Vec<AreaRefBlock>,

    // Brightness of quality estimation areas' reference blocks.
    min_ref_block_brightness: u8,
    max_ref_block_brightness: u8,

    /// Most areas are squares with sides of `area_size` length (border areas may be smaller).
    area_size: u32,

    /// Array of the areas' quality in all images.
    ///
    /// Each element corresponds to an active image in the image sequence,
    /// and is a vector containing one element for each quality estimation area.
    ///
    area_quality: Vec<Vec<f32>>,

    overall: OverallQuality,

    /// Overall quality of images in the image sequence.
    img_quality: Vec<f32>
}


impl QualityEstimationData {
    pub fn get_intersection(&self) -> &Rect { &self.intersection }


    pub fn get_num_areas(&self) -> usize {
        self.area_defs.len()
    }


    /// Returns the number of processed (active) images.
    pub fn get_num_images(&self) -> usize {
        self.area_quality.len()
    }


    pub fn get_area_rect(&self, area_idx: usize) -> Rect {
        self.area_defs[area_idx].rect
    }


    pub fn get_min_nonzero_avg_area_quality(&self) -> f32 {
        self.overall.area_min_nonzero_avg
    }


    pub fn get_overall_avg_area_quality(&self) -> f32 {
        self.overall.area_avg
    }


    pub fn get_best_img_idx(&self) -> usize {
        self.overall.image_best_img_idx
    }


    /// Returns the summed quality of all areas in the specified image.
    pub fn get_img_quality(&self, img_idx: usize) -> f32 {
        self.img_quality[img_idx]
    }


    /// Returns area quality in the specified image.
    pub fn get_area_quality(&self, area_idx: usize, img_idx: usize) -> f32 {
        self.area_quality[img_idx][area_idx]
    }


    pub fn get_best_avg_area_quality(&self) -> f32 {
        self.overall.area_max_avg
    }


    pub fn get_avg_area_quality(&self, area_idx: usize) -> f32 {
        self.area_defs[area_idx].summary.avg
    }


    /// Returns min, max, avg quality of the specified area.
    pub fn get_area_quality_summary(&self, area_idx: usize) -> AreaQualitySummary {
        self.area_defs[area_idx].summary
    }


    /// Returns the brightness range of all areas' reference blocks.
    pub fn get_ref_block_brightness_range(&self) -> (u8, u8) {
        (self.min_ref_block_brightness, self.max_ref_block_brightness)
    }


    pub fn get_qual_est_area_center(&self, area_idx: usize) -> Point {
        let arect = &self.area_defs[area_idx].rect;

        Point{ x: arect.x + arect.width as i32 / 2,
               y: arect.y + arect.height as i32 / 2 }
    }


    /// Returns the index of quality estimation area at the specified position in images' intersection.
    ///
    /// Positions outside the intersection are assigned to the nearest border area.
    ///
    pub fn get_area_idx_at_pos(&self, pos: &Point) -> usize {
        // See `QualityEstimationProc::init` for how the estimation areas are placed within the images' intersection

        let col = (max(0, pos.x) as usize / self.area_size as usize).min(self.num_areas_horz - 1);
        let row = (max(0, pos.y) as usize / self.area_size as usize).min(self.num_areas_vert - 1);

        row * self.num_areas_horz + col
    }


    /// Returns a square image to be used as reference block for reference point alignment.
    ///
    /// # Parameters
    ///
    /// * `pos` - Center of the reference block (within images' intersection).
    /// * `blk_size` - Desired width & height; the result may be smaller than this (but always a square).
    ///   A `pos` on the border of the area's reference block yields an empty (0x0) image.
    ///
    pub fn create_reference_block(&self, pos: Point, blk_size: u32) -> Image {
        let ref_block = &self.ref_blocks[self.get_area_idx_at_pos(&pos)];

        // Caller is requesting a square block of `blk_size`. It is copied from the area's reference block,
        // so the result has to be reduced if `pos` is closer to the reference block's border than `blk_size/2`.
        //
        // +----------images' intersection-------------...
        // |
        // |    ref_block.pos
        // |                 *-----------ref_block.image-------+
        // .                 |                                 |
        // .                 |                    +============+
        // .                 |                    |            |
        //                   |        result_size{|     *pos   |
        //                   |                    |            |
        //                   |                    +============+
        //                   |                                 |
        //                   ...

        let rel_pos = pos - ref_block.pos;
        let (w, h) = (ref_block.image.get_width() as i32, ref_block.image.get_height() as i32);

        let result_size = [blk_size as i32, 2 * rel_pos.x, 2 * rel_pos.y, 2 * (w - rel_pos.x), 2 * (h - rel_pos.y)]
            .into_iter().min().map_or(0, |s| max(0, s)) as u32;

        ref_block.image.get_fragment_copy(Point{ x: rel_pos.x - result_size as i32 / 2,
                                                 y: rel_pos.y - result_size as i32 / 2 },
                                          result_size, result_size)
    }


    /// Returns suggested reference point positions.
    ///
    /// The intersection is covered by a grid of `spacing`-sized cells; each cell receives at most one point,
    /// at the location with the highest structure score (if it reaches `structure_threshold`).
    ///
    /// # Parameters
    ///
    /// * `brightness_threshold` - Min. image brightness that a ref. point can be placed at;
    ///                            value (from [0; 1]) is relative to the darkest (0.0)
    ///                            and brightest (1.0) pixels.
    /// * `structure_threshold` - Structure detection threshold; value of 1.2 is recommended.
    ///                           The greater the value, the more local contrast is required
    ///                           to place a reference point.
    /// * `structure_scale` - Corresponds to pixel size of the smallest structures. Should equal 1
    ///                       for optimally-sampled or undersampled images. Use higher values
    ///                       for oversampled (blurry) material.
    /// * `spacing` - Spacing in pixels between reference points.
    /// * `ref_block_size` - Size of reference blocks used for block matching.
    ///
    pub fn suggest_ref_point_positions(&self,
                                       brightness_threshold: f32,
                                       structure_threshold: f32,
                                       structure_scale: u32,
                                       spacing: u32,
                                       ref_block_size: u32) -> Vec<Point> {
        if spacing == 0 || structure_scale == 0 || ref_block_size == 0 || self.ref_blocks.is_empty() {
            return vec![];
        }

        let grid_step = spacing as i32;
        let num_grid_cols = self.intersection.width as i32 / grid_step;
        let num_grid_rows = self.intersection.height as i32 / grid_step;
        let half_block = ref_block_size as i32 / 2;
        let search_step = max(1, half_block) as usize;

        let bthreshold = self.min_ref_block_brightness as f32 +
                         brightness_threshold * (self.max_ref_block_brightness - self.min_ref_block_brightness) as f32;

        // Uniform grid covering the images' intersection, each element may contain one reference point
        let mut grid: Vec<Option<Point>> = vec![None; (num_grid_cols * num_grid_rows) as usize];
        let mut result = vec![];

        for grid_row in 0..num_grid_rows {
            for grid_col in 0..num_grid_cols {
                // Do not try to place ref. points too close to images' intersection border
                let ystart = if grid_row > 0 { 0 } else { half_block };
                let yend = if grid_row < num_grid_rows - 1 { grid_step }
                           else { self.intersection.height as i32 - (num_grid_rows - 1) * grid_step - half_block };

                let xstart = if grid_col > 0 { 0 } else { half_block };
                let xend = if grid_col < num_grid_cols - 1 { grid_step }
                           else { self.intersection.width as i32 - (num_grid_cols - 1) * grid_step - half_block };

                // Already existing ref. points in the 8 neighboring cells
                let mut neighbor_points = Vec::<Point>::with_capacity(8);
                for d_row in -1..=1 {
                    for d_col in -1..=1 {
                        let (row, col) = (grid_row + d_row, grid_col + d_col);
                        if (d_row != 0 || d_col != 0) && row >= 0 && row < num_grid_rows && col >= 0 && col < num_grid_cols {
                            if let Some(p) = grid[(row * num_grid_cols + col) as usize] {
                                neighbor_points.push(p);
                            }
                        }
                    }
                }

                let mut best_fitness = 0.0f64;
                let mut best_pos = Point::default();

                for y in (ystart..yend).step_by(search_step) {
                    for x in (xstart..xend).step_by(search_step) {
                        let curr_pos = Point{ x: grid_col * grid_step + x, y: grid_row * grid_step + y };

                        // Do not assess a location if there are already reference points
                        // in neighboring grid cells closer than `spacing`
                        if neighbor_points.iter().any(|np| Point::sqr_dist(np, &curr_pos) < sqr!(spacing as i32)) {
                            continue;
                        }

                        let fitness = self.assess_ref_pt_location(curr_pos, ref_block_size, structure_scale, bthreshold);
                        if fitness > best_fitness {
                            best_fitness = fitness;
                            best_pos = curr_pos;
                        }
                    }
                }

                if best_fitness >= structure_threshold as f64 {
                    grid[(grid_row * num_grid_cols + grid_col) as usize] = Some(best_pos);
                    result.push(best_pos);
                }
            }
        }

        log::debug!("suggested {} reference point(s)", result.len());

        result
    }


    /// Returns `true` if the neighborhood of `pos` contains pixels above `brightness_threshold`
    /// and not too many white ones (e.g. belonging to an overexposed solar disk).
    ///
    /// `pos` is relative to `ref_block.image`.
    ///
    fn background_threshold_met(ref_block: &Image, pos: Point, brightness_threshold: f32) -> bool {
        let r = BACKGROUND_NEIGHBORHOOD_RADIUS;
        let mut is_neighb_brightness_sufficient = false;
        let mut non_white_px_count = 0usize;

        for ny in max(pos.y - r, 0) ..= min(pos.y + r, ref_block.get_height() as i32 - 1) {
            let line = ref_block.get_line::<u8>(ny as u32);

            for nx in max(pos.x - r, 0) ..= min(pos.x + r, ref_block.get_width() as i32 - 1) {
                let val = line[nx as usize];
                if val as f32 >= brightness_threshold {
                    is_neighb_brightness_sufficient = true;
                }

                if val < WHITE_8BIT { non_white_px_count += 1; }
            }
        }

        // Require at least 1/3rd of neighborhood's pixels to be non-white
        let is_outside_white_disc = non_white_px_count > sqr!(2 * r as usize + 1) / 3;

        is_neighb_brightness_sufficient && is_outside_white_disc
    }


    /// Assesses a potential location of a reference point and returns its quality (the higher, the better).
    ///
    /// Uses two criteria to check if `pos` is appropriate for block matching:
    ///
    ///   * distribution of pixel brightness gradients around `pos`
    ///   * variability of pixel differences during block matching around `pos`
    ///
    /// `pos` is relative to the images' intersection.
    ///
    fn assess_ref_pt_location(&self, pos: Point, block_size: u32, structure_scale: u32, brightness_threshold: f32) -> f64 {
        let ref_block = &self.ref_blocks[self.get_area_idx_at_pos(&pos)];
        let rel_pos = pos - ref_block.pos;

        if !QualityEstimationData::background_threshold_met(&ref_block.image, rel_pos, brightness_threshold) {
            return 0.0;
        }

        // Neighborhood radius cannot be too small, or the histogram of gradient directions would be too sparse
        if !utils::assess_gradients_for_block_matching(&ref_block.image, rel_pos, 32) {
            return 0.0;
        }

        let block = ref_block.image.get_fragment_copy(
            Point{ x: rel_pos.x - block_size as i32 / 2, y: rel_pos.y - block_size as i32 / 2 },
            block_size, block_size);

        // A good ref. point location should have a significant difference between sums of pixel differences
        // obtained in square "shells" centered at `pos`, having radii of 1x and 2x `structure_scale`

        let sum_diffs_1 = get_sum_diffs_in_shell(&ref_block.image, &block, rel_pos, structure_scale) / structure_scale as u64;
        let sum_diffs_2 = get_sum_diffs_in_shell(&ref_block.image, &block, rel_pos, 2 * structure_scale) / (2 * structure_scale) as u64;

        if sum_diffs_1 > 0 { sum_diffs_2 as f64 / sum_diffs_1 as f64 } else { 0.0 }
    }


    /// Returns a composite image (Mono8) consisting of the best fragments of all frames.
    pub fn get_best_fragments_img(&self) -> Image {
        let mut result = Image::new(self.intersection.width, self.intersection.height, PixelFormat::Mono8, None);

        for (area, ref_block) in self.area_defs.iter().zip(&self.ref_blocks) {
            ref_block.image.resize_and_translate_into(&mut result,
                                                      area.rect.get_pos() - ref_block.pos,
                                                      area.rect.width, area.rect.height,
                                                      area.rect.get_pos(),
                                                      false);
        }

        result
    }
}


/// Performs quality estimation of images.
///
/// Determines quality of image fragments and overall quality of whole images.
/// Quality is the sum of differences between an image (or a fragment) and its blurred version.
/// In other words, sum of values of the high-frequency component. The sum is normalized
/// by dividing by the number of pixels.
///
pub struct QualityEstimationProc<'a> {
    img_seq: &'a mut ImageSequence,

    img_align_data: &'a ImgAlignmentData,

    is_estimation_complete: bool,

    box_blur_radius: u32,

    first_step_complete: bool,

    data: QualityEstimationData
}


impl<'a> QualityEstimationProc<'a> {
    /// Returns image quality data determined during processing.
    pub fn get_data(self) -> Result<QualityEstimationData, ProcessingError> {
        if !self.is_estimation_complete {
            return Err(ProcessingError::NotComplete);
        }
        Ok(self.data)
    }


    /// Initializes quality estimation.
    ///
    /// # Parameters
    ///
    /// * `img_seq` - Image sequence aligned by `ImgAlignmentProc`.
    /// * `estimation_area_size` - Aligned image sequence will be divided into areas of this size for quality estimation.
    /// * `detail_scale` - Corresponds to box blur radius used for quality estimation.
    ///
    pub fn init(img_seq: &'a mut ImageSequence,
                img_align_data: &'a ImgAlignmentData,
                estimation_area_size: u32,
                detail_scale: u32) -> Result<QualityEstimationProc<'a>, ProcessingError> {

        if estimation_area_size == 0 || detail_scale == 0 {
            return Err(ProcessingError::InvalidParameters(
                format!("area size ({}) and detail scale ({}) must be positive", estimation_area_size, detail_scale)));
        }

        if detail_scale > filters::MAX_BOX_BLUR_RADIUS {
            return Err(ProcessingError::InvalidParameters(
                format!("detail scale ({}) must not exceed {}", detail_scale, filters::MAX_BOX_BLUR_RADIUS)));
        }

        let intersection = img_align_data.get_intersection();
        if intersection.is_empty() {
            return Err(ProcessingError::InvalidParameters("images' intersection is empty".to_string()));
        }

        if img_seq.get_active_img_count() != img_align_data.get_image_ofs().len() {
            return Err(ProcessingError::InvalidParameters(
                format!("alignment data covers {} images, but the sequence has {} active images",
                        img_align_data.get_image_ofs().len(), img_seq.get_active_img_count())));
        }

        // Divide the aligned images' intersection into quality estimation areas.
        // Each area is a square of `estimation_area_size` pixels. If there are left-overs,
        // assign them to appropriately smaller areas at the intersection's right and bottom border:
        //
        // Example: num_areas_horz = 4, num_areas_vert = 3
        //
        //  +----+----+----+--+
        //  |    |    |    |  |
        //  |    |    |    |  |
        //  +----+----+----+--+
        //  |    |    |    |  |
        //  |    |    |    |  |
        //  +----+----+----+--+
        //  |    |    |    |  |
        //  +----+----+----+--+
        //

        let num_areas_horz = updiv!(intersection.width, estimation_area_size);
        let num_areas_vert = updiv!(intersection.height, estimation_area_size);

        let mut area_defs = Vec::<QualEstArea>::with_capacity((num_areas_horz * num_areas_vert) as usize);

        for row in 0..num_areas_vert {
            for col in 0..num_areas_horz {
                let x = col * estimation_area_size;
                let y = row * estimation_area_size;

                area_defs.push(QualEstArea{
                    rect: Rect{ x: x as i32,
                                y: y as i32,
                                width: min(estimation_area_size, intersection.width - x),
                                height: min(estimation_area_size, intersection.height - y) },
                    summary: AreaQualitySummary{ min: f32::MAX, max: 0.0, avg: 0.0, best_img_idx: 0 }
                });
            }
        }

        log::info!("quality estimation of {} area(s) ({}x{}) in {} image(s)",
                   area_defs.len(), num_areas_horz, num_areas_vert, img_seq.get_active_img_count());

        img_seq.seek_start();

        Ok(QualityEstimationProc{
            img_seq,
            img_align_data,
            is_estimation_complete: false,
            box_blur_radius: detail_scale,
            first_step_complete: false,
            data: QualityEstimationData{
                intersection,
                num_areas_horz: num_areas_horz as usize,
                num_areas_vert: num_areas_vert as usize,
                area_defs,
                ref_blocks: vec![],
                min_ref_block_brightness: u8::MAX,
                max_ref_block_brightness: u8::MIN,
                area_size: estimation_area_size,
                overall: OverallQuality::default(),
                area_quality: vec![],
                img_quality: vec![]
            }
        })
    }


    pub fn is_complete(&self) -> bool { self.is_estimation_complete }


    /// Creates reference blocks for the quality estimation areas, using images where the areas have the best quality.
    fn create_reference_blocks(&mut self) -> Result<Vec<AreaRefBlock>, ImageError> {
        let intrs_ofs = self.data.intersection.get_pos();
        let asize = self.data.area_size as i32;

        let mut ref_blocks: Vec<Option<AreaRefBlock>> = vec![None; self.data.area_defs.len()];

        self.img_seq.seek_start();
        loop {
            let curr_img_idx = self.img_seq.get_curr_img_idx_within_active_subset();

            let mut curr_img: Option<Image> = None;

            for (qarea, ref_block) in self.data.area_defs.iter().zip(ref_blocks.iter_mut()) {
                if qarea.summary.best_img_idx != curr_img_idx {
                    continue;
                }

                if curr_img.is_none() {
                    curr_img = Some(self.img_seq.get_curr_img()?.convert_pix_fmt(PixelFormat::Mono8));
                }
                let img = match &curr_img { Some(img) => img, None => continue };

                let curr_img_ofs = self.img_align_data.get_image_ofs()[curr_img_idx];

                // Position of `qarea` in `img`
                let curr_area_pos = intrs_ofs + curr_img_ofs + qarea.rect.get_pos();

                // The desired size of ref. block is `3*asize` in width and height;
                // need to make sure it fits in `img`
                let ifrag_x = max(0, curr_area_pos.x + qarea.rect.width as i32 / 2 - 3 * asize / 2);
                let ifrag_y = max(0, curr_area_pos.y + qarea.rect.height as i32 / 2 - 3 * asize / 2);
                let ifrag_width = min(img.get_width() as i32 - ifrag_x, 3 * asize);
                let ifrag_height = min(img.get_height() as i32 - ifrag_y, 3 * asize);

                *ref_block = Some(AreaRefBlock{
                    image: img.get_fragment_copy(Point{ x: ifrag_x, y: ifrag_y }, ifrag_width as u32, ifrag_height as u32),
                    pos: Point{ x: ifrag_x, y: ifrag_y } - intrs_ofs - curr_img_ofs
                });
            }

            if let Err(SeekResult::NoMoreImages) = self.img_seq.seek_next() {
                break;
            }
        }

        // Every area has a best image within the active subset
        Ok(ref_blocks.into_iter().flatten().collect())
    }


    fn on_final_step(&mut self) -> Result<(), ImageError> {
        let num_images = self.data.area_quality.len();

        self.data.ref_blocks = self.create_reference_blocks()?;

        let mut overall = OverallQuality{
            area_min_nonzero_avg: f32::MAX,
            image_best_img_idx: self.data.overall.image_best_img_idx,
            image_best_quality: self.data.overall.image_best_quality,
            ..Default::default()
        };

        let mut overall_sum = 0.0f64;

        for (i, area) in self.data.area_defs.iter_mut().enumerate() {
            let quality_sum: f64 = self.data.area_quality.iter().map(|img_qual| img_qual[i] as f64).sum();
            overall_sum += quality_sum;

            let qavg = (quality_sum / num_images as f64) as f32;
            area.summary.avg = qavg;

            if qavg > overall.area_max_avg {
                overall.area_max_avg = qavg;
            }

            if qavg > 0.0 && qavg < overall.area_min_nonzero_avg {
                overall.area_min_nonzero_avg = qavg;
            }
        }

        if overall.area_min_nonzero_avg == f32::MAX {
            overall.area_min_nonzero_avg = 0.0;
        }

        for ref_block in &self.data.ref_blocks {
            let (bmin, bmax) = utils::find_min_max_brightness(&ref_block.image);
            self.data.min_ref_block_brightness = min(self.data.min_ref_block_brightness, bmin);
            self.data.max_ref_block_brightness = max(self.data.max_ref_block_brightness, bmax);
        }

        overall.area_avg = (overall_sum / (self.data.area_defs.len() * num_images) as f64) as f32;
        self.data.overall = overall;
        self.is_estimation_complete = true;

        log::info!("quality estimation complete; best image: {}, avg. area quality: {:.3}, best avg. area quality: {:.3}",
                   self.data.overall.image_best_img_idx, self.data.overall.area_avg, self.data.overall.area_max_avg);

        Ok(())
    }
}


impl<'a> ProcessingPhase for QualityEstimationProc<'a> {
    fn get_curr_img(&mut self) -> Result<Image, ImageError> {
        self.img_seq.get_curr_img()
    }


    fn step(&mut self) -> Result<(), ProcessingError> {
        if self.is_estimation_complete {
            return Err(ProcessingError::NoMoreSteps);
        }

        if self.first_step_complete {
            if let Err(SeekResult::NoMoreImages) = self.img_seq.seek_next() {
                self.on_final_step()?;
                return Err(ProcessingError::NoMoreSteps);
            }
        }

        let curr_img_idx = self.img_seq.get_curr_img_idx_within_active_subset();

        let mut curr_img = self.img_seq.get_curr_img()?;
        if curr_img.get_pixel_format() != PixelFormat::Mono8 {
            curr_img = curr_img.convert_pix_fmt(PixelFormat::Mono8);
        }

        let area_origin = self.img_align_data.get_intersection().get_pos() + self.img_align_data.get_image_ofs()[curr_img_idx];
        let box_blur_radius = self.box_blur_radius;
        let line_stride = curr_img.get_width() as usize;

        // Current image's quality values for all estimation areas
        let curr_img_area_quality: Vec<f32> = self.data.area_defs.par_iter().map(|area| {
            filters::estimate_quality(curr_img.get_mono8_pixels_from(area_origin + area.rect.get_pos()),
                                      area.rect.width,
                                      area.rect.height,
                                      line_stride,
                                      box_blur_radius)
        }).collect();

        let mut curr_img_qual = 0.0f32;

        for (area, &aqual) in self.data.area_defs.iter_mut().zip(&curr_img_area_quality) {
            curr_img_qual += aqual;
            if aqual > area.summary.max || curr_img_idx == 0 {
                area.summary.max = aqual;
                area.summary.best_img_idx = curr_img_idx;
            }
            if aqual < area.summary.min {
                area.summary.min = aqual;
            }
        }

        self.data.area_quality.push(curr_img_area_quality);
        self.data.img_quality.push(curr_img_qual);

        if curr_img_qual > self.data.overall.image_best_quality || curr_img_idx == 0 {
            self.data.overall.image_best_quality = curr_img_qual;
            self.data.overall.image_best_img_idx = curr_img_idx;
        }

        log::debug!("image {}: quality {:.3}", curr_img_idx, curr_img_qual);

        self.first_step_complete = true;

        Ok(())
    }
}


/// Calculates the sum of squared differences of pixel values between `img` and `ref_block` positioned in a shell.
///
/// For the calculation, `ref_block`'s center is positioned on every `img`'s pixel belonging to a square shell
/// (1-pixel thick) with the specified center and radius. Only the parts of `ref_block` overlapping `img` are compared.
///
/// # Parameters
///
/// * `cmp_pos` - Center of the shell (relative to `img`).
/// * `radius` - Radius of a square shell around `cmp_pos`; must be > 0.
///
fn get_sum_diffs_in_shell(img: &Image, ref_block: &Image, cmp_pos: Point, radius: u32) -> u64 {
    assert!(radius > 0);

    let r = radius as i32;
    let (blk_w, blk_h) = (ref_block.get_width(), ref_block.get_height());

    let shell_positions = (-r..=r).flat_map(|i| [Point{ x: i, y: -r }, Point{ x: i, y: r }])
        .chain((-r + 1..r).flat_map(|i| [Point{ x: -r, y: i }, Point{ x: r, y: i }]));

    shell_positions.map(|delta| {
        let shell_pos = cmp_pos + delta;

        // Extents of `ref_block` relative to `img`
        let cmp_rect = Rect{ x: shell_pos.x - blk_w as i32 / 2, y: shell_pos.y - blk_h as i32 / 2, width: blk_w, height: blk_h };

        match img.get_img_rect().intersection(&cmp_rect) {
            Some(overlap) => blk_match::calc_sum_of_squared_diffs(
                img, ref_block, &shell_pos,
                &Rect{ x: overlap.x - cmp_rect.x, y: overlap.y - cmp_rect.y, ..overlap }),

            None => 0
        }
    }).sum()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn run_to_completion(proc: &mut QualityEstimationProc) {
        loop {
            match proc.step() {
                Ok(()) => (),
                Err(ProcessingError::NoMoreSteps) => break,
                Err(err) => panic!("unexpected error: {}", err)
            }
        }
    }

    fn unaligned(num_images: usize, width: u32, height: u32) -> ImgAlignmentData {
        ImgAlignmentData::new(Rect{ x: 0, y: 0, width, height }, vec![Point::default(); num_images])
    }

    fn estimate(img_seq: &mut ImageSequence, align_data: &ImgAlignmentData, area_size: u32, detail_scale: u32) -> QualityEstimationData {
        let mut proc = QualityEstimationProc::init(img_seq, align_data, area_size, detail_scale).unwrap();
        run_to_completion(&mut proc);
        proc.get_data().unwrap()
    }

    /// Texture with added fine-grained pattern.
    fn sharp_frame(width: u32, height: u32) -> Image {
        test_utils::mono8_from_fn(width, height, |x, y| {
            (test_utils::texture_value(x as f64, y as f64) * 0.8 + ((x * 7 + y * 13) % 5 * 9) as f64).round() as u8
        })
    }

    fn smooth_frame(width: u32, height: u32) -> Image {
        filters::apply_box_blur(&test_utils::textured_frame(width, height), 2, 3)
    }

    #[test]
    fn areas_tile_intersection() {
        let mut img_seq = ImageSequence::new_in_memory(vec![test_utils::textured_frame(100, 70)]);
        let align_data = unaligned(1, 100, 70);
        let data = estimate(&mut img_seq, &align_data, 30, 2);

        assert_eq!(12, data.get_num_areas());

        let mut coverage = vec![0u32; 100 * 70];
        for i in 0..data.get_num_areas() {
            let r = data.get_area_rect(i);
            for y in range!(r.y, r.height as i32) {
                for x in range!(r.x, r.width as i32) {
                    coverage[(y * 100 + x) as usize] += 1;
                    assert_eq!(i, data.get_area_idx_at_pos(&Point{ x, y }));
                }
            }
        }
        assert!(coverage.iter().all(|&c| c == 1));

        assert_eq!(Rect{ x: 90, y: 60, width: 10, height: 10 }, data.get_area_rect(11));
    }

    #[test]
    fn sharpest_image_is_best_everywhere() {
        let frames = vec![smooth_frame(64, 64), sharp_frame(64, 64), smooth_frame(64, 64)];
        let mut img_seq = ImageSequence::new_in_memory(frames);
        let align_data = unaligned(3, 64, 64);
        let data = estimate(&mut img_seq, &align_data, 16, 2);

        assert_eq!(1, data.get_best_img_idx());
        for i in 0..data.get_num_areas() {
            let summary = data.get_area_quality_summary(i);
            assert_eq!(1, summary.best_img_idx);
            assert!(summary.min <= summary.avg && summary.avg <= summary.max);
            assert_eq!(summary.max, data.get_area_quality(i, 1));
        }

        assert!(data.get_best_avg_area_quality() >= data.get_overall_avg_area_quality());
        assert!(data.get_img_quality(1) > data.get_img_quality(0));
    }

    #[test]
    fn reference_block_comes_from_best_image() {
        let sharp = sharp_frame(96, 96);
        let frames = vec![smooth_frame(96, 96), sharp.clone()];
        let mut img_seq = ImageSequence::new_in_memory(frames);

        // Intersection starting at (8, 8) of each image
        let align_data = ImgAlignmentData::new(Rect{ x: 8, y: 8, width: 80, height: 80 }, vec![Point::default(); 2]);
        let data = estimate(&mut img_seq, &align_data, 20, 2);

        let block = data.create_reference_block(Point{ x: 40, y: 30 }, 16);
        assert_eq!((16, 16), (block.get_width(), block.get_height()));
        assert_eq!(sharp.get_fragment_copy(Point{ x: 8 + 40 - 8, y: 8 + 30 - 8 }, 16, 16), block);

        // Near the intersection's corner the block is limited by the image border
        let corner_block = data.create_reference_block(Point{ x: 2, y: 2 }, 16);
        assert_eq!(16, corner_block.get_width());
        let edge_block = data.create_reference_block(Point{ x: -6, y: 40 }, 16);
        assert_eq!(4, edge_block.get_width());

        let best = data.get_best_fragments_img();
        assert_eq!(sharp.get_fragment_copy(Point{ x: 8, y: 8 }, 80, 80), best);
    }

    #[test]
    fn flat_images_have_zero_quality() {
        let flat = test_utils::mono8_from_fn(40, 40, |_, _| 90);
        let mut img_seq = ImageSequence::new_in_memory(vec![flat.clone(), flat]);
        let align_data = unaligned(2, 40, 40);
        let data = estimate(&mut img_seq, &align_data, 20, 3);

        assert_eq!(0.0, data.get_overall_avg_area_quality());
        assert_eq!(0.0, data.get_min_nonzero_avg_area_quality());
        assert!(data.suggest_ref_point_positions(0.33, 1.2, 1, 10, 8).is_empty());
    }

    #[test]
    fn suggested_points_are_spaced_and_inside() {
        let mut img_seq = ImageSequence::new_in_memory(vec![sharp_frame(120, 120)]);
        let align_data = unaligned(1, 120, 120);
        let data = estimate(&mut img_seq, &align_data, 40, 2);

        let points = data.suggest_ref_point_positions(0.1, 1.0, 1, 30, 16);
        for (i, p) in points.iter().enumerate() {
            assert!(data.get_intersection().contains_point(p));
            for q in &points[i + 1..] {
                assert!(Point::sqr_dist(p, q) >= sqr!(30));
            }
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut img_seq = ImageSequence::new_in_memory(vec![test_utils::textured_frame(32, 32)]);
        let align_data = unaligned(1, 32, 32);

        assert!(matches!(QualityEstimationProc::init(&mut img_seq, &align_data, 0, 2),
                         Err(ProcessingError::InvalidParameters(_))));

        let mismatched = unaligned(2, 32, 32);
        assert!(matches!(QualityEstimationProc::init(&mut img_seq, &mismatched, 16, 2),
                         Err(ProcessingError::InvalidParameters(_))));

        let empty = unaligned(1, 0, 32);
        assert!(matches!(QualityEstimationProc::init(&mut img_seq, &empty, 16, 2),
                         Err(ProcessingError::InvalidParameters(_))));
    }

    #[test]
    fn detail_scale_is_limited_by_box_blur_range() {
        let mut img_seq = ImageSequence::new_in_memory(vec![test_utils::textured_frame(32, 32)]);
        let align_data = unaligned(1, 32, 32);

        assert!(matches!(QualityEstimationProc::init(&mut img_seq, &align_data, 16, 5000),
                         Err(ProcessingError::InvalidParameters(_))));
        assert!(matches!(QualityEstimationProc::init(&mut img_seq, &align_data, 16, filters::MAX_BOX_BLUR_RADIUS + 1),
                         Err(ProcessingError::InvalidParameters(_))));
        assert!(QualityEstimationProc::init(&mut img_seq, &align_data, 16, filters::MAX_BOX_BLUR_RADIUS).is_ok());
    }
}
