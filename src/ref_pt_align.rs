//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Processing phase: reference point alignment.
//

use crate::blk_match;
use crate::defs::{Point, PointFlt, ProcessingError, ProcessingPhase, Rect};
use crate::image::{Image, ImageError, PixelFormat};
use crate::img_align::ImgAlignmentData;
use crate::img_seq::{ImageSequence, SeekResult};
use crate::quality::QualityEstimationData;
use crate::triangulation::Triangulation;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::max;


/// Value in pixels.
const BLOCK_MATCHING_INITIAL_SEARCH_STEP: u32 = 2;

const ADDITIONAL_FIXED_PTS_PER_BORDER: usize = 4;
const ADDITIONAL_FIXED_PT_OFFSET_DIV: u32 = 4;

/// Reference blocks smaller than this (in pixels) are not used for tracking.
const MIN_TRACKED_BLOCK_SIZE: u32 = 4;

/// Number of the most recent images used to keep a "sliding window" average of ref. pt. translation vector lengths.
const TVEC_SUM_NUM_IMAGES: usize = 10;

/// Translation vectors longer than the sliding window average by this many standard deviations are rejected.
const OUTLIER_STD_DEVIATIONS: f64 = 1.5;

/// Absorbs rounding errors of the sliding window average (e.g. when all translation vectors are equal).
const TVEC_LEN_TOLERANCE: f64 = 1.0e-9;


/// Selection criterion used for reference point alignment and stacking.
///
/// A "fragment" is a triangular patch.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCriterion {
    /// Percentage of best-quality fragments.
    PercentageBest(u32),

    /// Minimum relative quality (%).
    ///
    /// Only fragments with quality above specified threshold (% relative to [min,max] of
    /// the corresponding quality estimation area) will be used.
    ///
    MinRelative(f32),

    /// Number of best-quality fragments.
    NumberBest(usize)
}


/// Parameters of reference point alignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefPtAlignmentConfig {
    /// Criterion for updating ref. point position (and later for stacking).
    pub quality_criterion: QualityCriterion,

    /// Size (in pixels) of reference blocks used for block matching.
    pub ref_block_size: u32,

    /// Search radius (in pixels) used during block matching.
    pub search_radius: u32,

    /// Min. image brightness that a reference point can be placed at (automatic placement only).
    ///
    /// Value (from [0; 1]) is relative to the image's darkest (0.0) and brightest (1.0) pixels.
    ///
    pub placement_brightness_threshold: f32,

    /// Structure detection threshold (automatic placement only); value of 1.2 is recommended.
    ///
    /// The greater the value, the more local contrast is required to place a ref. point.
    ///
    pub structure_threshold: f32,

    /// Corresponds to pixel size of smallest structures (automatic placement only).
    ///
    /// Should equal 1 for optimally-sampled or undersampled images. Use higher values for oversampled (blurry) material.
    ///
    pub structure_scale: u32,

    /// Spacing in pixels between reference points.
    ///
    /// Also limits the first position update of a point: moves longer than `spacing/6` are rejected.
    ///
    pub spacing: u32
}


impl Default for RefPtAlignmentConfig {
    fn default() -> RefPtAlignmentConfig {
        RefPtAlignmentConfig{
            quality_criterion: QualityCriterion::PercentageBest(30),
            ref_block_size: 32,
            search_radius: 20,
            placement_brightness_threshold: 0.33,
            structure_threshold: 1.2,
            structure_scale: 1,
            spacing: 40
        }
    }
}


/// Position of a reference point in image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefPtPosition {
    pub pos: Point,
    /// True if the quality criteria for the image are met.
    pub is_valid: bool
}


#[derive(Clone, Debug)]
struct ReferencePoint {
    /// Index of the associated quality estimation area; `None` for fixed points.
    qual_est_area_idx: Option<usize>,

    /// Reference block used for block matching.
    ref_block: Option<Image>,

    /// Positions (and their validity) in every active image.
    positions: Vec<RefPtPosition>,

    /// Index of the last valid position in `positions`.
    last_valid_pos_idx: Option<usize>
}


impl ReferencePoint {
    /// Creates a fixed reference point (not tracked during processing).
    fn fixed(pos: Point, num_images: usize) -> ReferencePoint {
        ReferencePoint{
            qual_est_area_idx: None,
            ref_block: None,
            positions: vec![RefPtPosition{ pos, is_valid: true }; num_images],
            last_valid_pos_idx: Some(0)
        }
    }


    fn is_fixed(&self) -> bool { self.qual_est_area_idx.is_none() }
}


/// Sum of reference points translation vector lengths in an image.
#[derive(Default, Clone, Copy, Debug)]
struct TVecSum {
    sum_len: f64,
    sum_sq_len: f64,
    num_terms: usize
}


/// Outcome of updating a single reference point in an image.
enum PointUpdate {
    /// Point is fixed or its position in the image is not valid.
    NotTracked,

    /// New valid position; contains the squared length of translation vector from the last valid position (if any).
    Valid(Option<f64>)
}


#[derive(Clone, Debug, Default)]
pub struct RefPointAlignmentData {
    reference_pts: Vec<ReferencePoint>,

    /// Delaunay triangulation of the reference points
    triangulation: Triangulation,

    /// Number of valid positions of all points in all images.
    num_valid_positions: u64,

    /// Number of rejected positions of all points in all images.
    ///
    /// Concerns positions rejected by outlier testing, not by
    /// too low image quality.
    ///
    num_rejected_positions: u64
}


impl RefPointAlignmentData {
    /// Returns the number of reference points (including the fixed ones).
    pub fn get_num_ref_points(&self) -> usize {
        self.reference_pts.len()
    }


    /// Returns the number of images the points have positions in.
    pub fn get_num_images(&self) -> usize {
        self.reference_pts.first().map_or(0, |p| p.positions.len())
    }


    /// Returns `true` if the point is not tracked (it is one of the points surrounding the images' intersection).
    pub fn is_fixed_point(&self, point_idx: usize) -> bool {
        self.reference_pts[point_idx].is_fixed()
    }


    /// Returns the final (i.e. averaged over all images where valid) positions of reference points.
    ///
    /// A point never found valid keeps its initial position.
    ///
    pub fn get_final_positions(&self) -> Vec<PointFlt> {
        self.reference_pts.iter().map(|ref_pt| {
            let (sum_x, sum_y, count) = ref_pt.positions.iter()
                .filter(|p| p.is_valid)
                .fold((0.0f64, 0.0f64, 0usize), |(sx, sy, n), p| (sx + p.pos.x as f64, sy + p.pos.y as f64, n + 1));

            if count > 0 {
                PointFlt{ x: (sum_x / count as f64) as f32, y: (sum_y / count as f64) as f32 }
            } else {
                let initial = ref_pt.positions.first().map_or(Point::default(), |p| p.pos);
                PointFlt{ x: initial.x as f32, y: initial.y as f32 }
            }
        }).collect()
    }


    pub fn get_ref_pts_triangulation(&self) -> &Triangulation {
        &self.triangulation
    }


    /// Returns a reference point's position in the specified image and the position's "valid" flag.
    pub fn get_ref_pt_pos(&self, point_idx: usize, img_idx: usize) -> &RefPtPosition {
        &self.reference_pts[point_idx].positions[img_idx]
    }


    pub fn get_num_valid_positions(&self) -> u64 { self.num_valid_positions }


    /// Returns the number of positions rejected as outliers.
    pub fn get_num_rejected_positions(&self) -> u64 { self.num_rejected_positions }
}


#[derive(Clone, Debug)]
struct TriangleQuality {
    // Min and max sum of triangle vertices' quality in an image.
    qmin: f32,
    qmax: f32,

    /// i-th element is the sum of triangle vertices' quality in i-th image.
    qsum: Vec<f32>,

    /// i-th element is the sorted quality index in i-th image (quality index 0==worst).
    sorted_idx: Vec<usize>
}


impl TriangleQuality {
    fn is_sufficient(&self, criterion: QualityCriterion, img_idx: usize) -> bool {
        let num_images = self.sorted_idx.len();

        match criterion {
            QualityCriterion::PercentageBest(percentage) =>
                self.sorted_idx[img_idx] >= (100 - percentage as usize) * num_images / 100,

            QualityCriterion::MinRelative(threshold) =>
                self.qsum[img_idx] >= self.qmin + 0.01 * threshold * (self.qmax - self.qmin),

            QualityCriterion::NumberBest(num_best) =>
                num_best > num_images || self.sorted_idx[img_idx] >= num_images - num_best
        }
    }
}


/// Performs reference point alignment.
///
/// Tracks reference points placed over the images' intersection and triangulated,
/// updating a point only in images where any of its triangles meets the quality criterion.
///
pub struct RefPointAlignmentProc<'a> {
    img_seq: &'a mut ImageSequence,

    img_align_data: &'a ImgAlignmentData,

    qual_est_data: &'a QualityEstimationData,

    config: RefPtAlignmentConfig,

    /// Contains one element for each triangle in `triangulation`.
    tri_quality: Vec<TriangleQuality>,

    is_complete: bool,

    /// Translation vectors of ref. points in recent images.
    ///
    /// Summary (for all ref. points) of the translation vectors between subsequent
    /// "valid" positions within the most recent `TVEC_SUM_NUM_IMAGES`.
    /// Used for clipping outliers in `update_ref_pt_positions()`.
    ///
    tvec_img_sum: [TVecSum; TVEC_SUM_NUM_IMAGES],

    /// Index in `tvec_img_sum` to store the next sum at.
    tvec_next_entry: usize,

    data: RefPointAlignmentData
}


impl<'a> RefPointAlignmentProc<'a> {
    /// Returns reference point alignment data determined during processing.
    pub fn get_data(self) -> Result<RefPointAlignmentData, ProcessingError> {
        if !self.is_complete {
            return Err(ProcessingError::NotComplete);
        }
        Ok(self.data)
    }


    /// Initializes reference point alignment processor and processes the first active image.
    ///
    /// # Parameters
    ///
    /// * `img_seq` - Image sequence to process.
    ///
    /// * `points` - Reference point positions; if none, points will be placed automatically.
    ///     Positions are specified within the images' intersection and must not lie outside it.
    ///
    /// * `config` - Alignment parameters.
    ///
    pub fn init(img_seq: &'a mut ImageSequence,
                img_align_data: &'a ImgAlignmentData,
                qual_est_data: &'a QualityEstimationData,
                points: Option<Vec<Point>>,
                config: RefPtAlignmentConfig) -> Result<RefPointAlignmentProc<'a>, ProcessingError> {

        if config.ref_block_size == 0 || config.search_radius == 0 || config.spacing == 0 {
            return Err(ProcessingError::InvalidParameters(
                format!("reference block size ({}), search radius ({}) and spacing ({}) must be positive",
                        config.ref_block_size, config.search_radius, config.spacing)));
        }

        match config.quality_criterion {
            QualityCriterion::PercentageBest(p) if p == 0 || p > 100 =>
                return Err(ProcessingError::InvalidParameters(format!("percentage of best fragments ({}) not in [1; 100]", p))),

            QualityCriterion::MinRelative(t) if !(0.0..=100.0).contains(&t) =>
                return Err(ProcessingError::InvalidParameters(format!("min. relative quality ({}) not in [0; 100]", t))),

            QualityCriterion::NumberBest(0) =>
                return Err(ProcessingError::InvalidParameters("number of best fragments must be positive".to_string())),

            _ => ()
        }

        let num_images = img_seq.get_active_img_count();
        if num_images == 0 || num_images != qual_est_data.get_num_images() || num_images != img_align_data.get_image_ofs().len() {
            return Err(ProcessingError::InvalidParameters(
                format!("sequence has {} active images, alignment data covers {}, quality data covers {}",
                        num_images, img_align_data.get_image_ofs().len(), qual_est_data.get_num_images())));
        }

        let intersection = *qual_est_data.get_intersection();

        let actual_points = match points {
            Some(points) => points,
            None => qual_est_data.suggest_ref_point_positions(
                config.placement_brightness_threshold,
                config.structure_threshold,
                config.structure_scale,
                config.spacing,
                config.ref_block_size)
        };

        if actual_points.is_empty() {
            log::warn!("no reference points; the stack will follow only the global alignment");
        }

        let mut reference_pts = Vec::<ReferencePoint>::with_capacity(actual_points.len() + 4 * ADDITIONAL_FIXED_PTS_PER_BORDER + 3);

        for point in actual_points {
            if point.x < 0 || point.x >= intersection.width as i32 || point.y < 0 || point.y >= intersection.height as i32 {
                return Err(ProcessingError::InvalidParameters(
                    format!("reference point {} lies outside the {}x{} images' intersection", point, intersection.width, intersection.height)));
            }

            // Not initializing the reference block yet, as it is not known if the current area
            // meets the quality criteria in the first image
            reference_pts.push(ReferencePoint{
                qual_est_area_idx: Some(qual_est_data.get_area_idx_at_pos(&point)),
                ref_block: None,
                positions: vec![RefPtPosition{ pos: point, is_valid: false }; num_images],
                last_valid_pos_idx: None
            });
        }

        append_surrounding_fixed_points(&mut reference_pts, &intersection, num_images);

        let initial_positions: Vec<Point> = reference_pts.iter().map(|p| p.positions[0].pos).collect();

        let triangulation = Triangulation::find_delaunay_triangulation(&initial_positions, &fixed_points_envelope(&intersection))?;

        // The triangulation contains 3 additional points comprising a triangle that covers all the other points.
        // These 3 points shall have fixed position and are not associated with any quality estimation area.
        let num_vertices = triangulation.get_vertices().len();
        for &v in &triangulation.get_vertices()[num_vertices - 3..] {
            reference_pts.push(ReferencePoint::fixed(v, num_images));
        }

        log::info!("reference point alignment: {} point(s) in {} triangle(s)",
                   reference_pts.iter().filter(|p| !p.is_fixed()).count(), triangulation.get_triangles().len());

        let tri_quality = calc_triangle_quality(&triangulation, &reference_pts, qual_est_data, num_images);

        img_seq.seek_start();
        let first_img = img_seq.get_curr_img()?.convert_pix_fmt(PixelFormat::Mono8);

        let mut ref_pt_align = RefPointAlignmentProc{
            img_seq,
            img_align_data,
            qual_est_data,
            config,
            tri_quality,
            is_complete: false,
            tvec_img_sum: [TVecSum::default(); TVEC_SUM_NUM_IMAGES],
            tvec_next_entry: 0,
            data: RefPointAlignmentData{ reference_pts, triangulation, num_valid_positions: 0, num_rejected_positions: 0 }
        };

        ref_pt_align.update_ref_pt_positions(&first_img, 0);

        Ok(ref_pt_align)
    }


    pub fn is_complete(&self) -> bool { self.is_complete }


    /// Returns the points' triangulation (available from initialization on).
    pub fn get_ref_pts_triangulation(&self) -> &Triangulation {
        &self.data.triangulation
    }


    /// Returns reference points' positions (relative to the images' intersection) in the most recently processed image.
    pub fn get_current_positions(&self) -> Vec<RefPtPosition> {
        let img_idx = self.img_seq.get_curr_img_idx_within_active_subset();
        self.data.reference_pts.iter().map(|p| p.positions[img_idx]).collect()
    }


    /// Updates positions of reference points in image `img_idx` (`img` is Mono8).
    fn update_ref_pt_positions(&mut self, img: &Image, img_idx: usize) {
        // Reminder: positions of reference points and quality estimation areas are specified
        // within the intersection of all images after alignment. Accesses to `img` have to take it into account.
        let img_origin = self.img_align_data.get_intersection().get_pos() + self.img_align_data.get_image_ofs()[img_idx];

        let criterion = self.config.quality_criterion;
        let tri_sufficient: Vec<bool> = self.tri_quality.par_iter().map(|q| q.is_sufficient(criterion, img_idx)).collect();

        // A point is updated if any of its triangles meets the quality criterion
        let mut point_eligible = vec![false; self.data.reference_pts.len()];
        for (tri, _) in self.data.triangulation.get_triangles().iter().zip(&tri_sufficient).filter(|&(_, &s)| s) {
            for v in [tri.v0, tri.v1, tri.v2] {
                point_eligible[v] = true;
            }
        }

        let qual_est_data = self.qual_est_data;
        let config = &self.config;

        let updates: Vec<PointUpdate> = self.data.reference_pts.par_iter_mut().zip(point_eligible.par_iter()).map(|(ref_pt, &eligible)| {
            update_ref_pt(ref_pt, eligible, img, img_idx, img_origin, qual_est_data, config)
        }).collect();

        let curr_step_tvec = updates.iter().fold(TVecSum::default(), |acc, u| match u {
            PointUpdate::Valid(Some(sqlen)) => TVecSum{ sum_len: acc.sum_len + sqlen.sqrt(),
                                                       sum_sq_len: acc.sum_sq_len + sqlen,
                                                       num_terms: acc.num_terms + 1 },
            _ => acc
        });

        let mut accepted_tvec = curr_step_tvec;

        if curr_step_tvec.num_terms > 0 {
            let prev = self.tvec_img_sum.iter().fold(TVecSum::default(), |acc, t| TVecSum{
                sum_len: acc.sum_len + t.sum_len,
                sum_sq_len: acc.sum_sq_len + t.sum_sq_len,
                num_terms: acc.num_terms + t.num_terms
            });

            let num_terms = (prev.num_terms + curr_step_tvec.num_terms) as f64;
            let len_avg = (prev.sum_len + curr_step_tvec.sum_len) / num_terms;
            let sq_len_avg = (prev.sum_sq_len + curr_step_tvec.sum_sq_len) / num_terms;
            let std_deviation = f64::sqrt(f64::max(0.0, sq_len_avg - sqr!(len_avg)));

            // Points whose current translation lies too far from the "sliding window" translation average
            // are not valid in the current image
            for (ref_pt, update) in self.data.reference_pts.iter_mut().zip(&updates) {
                if let PointUpdate::Valid(Some(sqlen)) = update {
                    let len = sqlen.sqrt();
                    if len > len_avg + OUTLIER_STD_DEVIATIONS * std_deviation + TVEC_LEN_TOLERANCE {
                        let prev_pos = ref_pt.positions[img_idx - 1].pos;
                        ref_pt.positions[img_idx] = RefPtPosition{ pos: prev_pos, is_valid: false };

                        accepted_tvec.sum_len -= len;
                        accepted_tvec.sum_sq_len -= sqlen;
                        accepted_tvec.num_terms -= 1;

                        self.data.num_rejected_positions += 1;
                    }
                }
            }

            self.tvec_img_sum[self.tvec_next_entry] = accepted_tvec;
            self.tvec_next_entry = (self.tvec_next_entry + 1) % TVEC_SUM_NUM_IMAGES;
        }

        for (ref_pt, update) in self.data.reference_pts.iter_mut().zip(&updates) {
            if let PointUpdate::Valid(_) = update {
                if ref_pt.positions[img_idx].is_valid {
                    ref_pt.last_valid_pos_idx = Some(img_idx);
                    self.data.num_valid_positions += 1;
                }
            }
        }

        log::debug!("image {}: {} of {} triangles meet the quality criterion, {} point(s) updated, {} rejected",
                    img_idx,
                    tri_sufficient.iter().filter(|&&s| s).count(),
                    tri_sufficient.len(),
                    accepted_tvec.num_terms,
                    curr_step_tvec.num_terms - accepted_tvec.num_terms);
    }


    /// Makes sure that for every triangle there is at least 1 image where all 3 vertices are "valid".
    fn ensure_tris_are_valid(&mut self) {
        let ref_pts = &mut self.data.reference_pts;

        for (tri, tri_q) in self.data.triangulation.get_triangles().iter().zip(&self.tri_quality) {
            let tri_v = [tri.v0, tri.v1, tri.v2];

            let num_images = tri_q.qsum.len();
            if (0..num_images).any(|img_idx| tri_v.iter().all(|&v| ref_pts[v].positions[img_idx].is_valid)) {
                continue;
            }

            // The triangle's vertices turned out not to be simultaneously "valid" in any image,
            // which is required (in at least one image) during stacking phase.
            // Mark them "valid" anyway in the image where their quality sum is highest.
            let mut best_idx = 0;
            for img_idx in 1..num_images {
                if tri_q.qsum[img_idx] >= tri_q.qsum[best_idx] {
                    best_idx = img_idx;
                }
            }

            log::debug!("triangle {:?} forced valid in image {}", tri_v, best_idx);

            for v in tri_v {
                ref_pts[v].positions[best_idx].is_valid = true;
            }
        }
    }
}


/// Updates a single reference point's position in image `img_idx`.
///
/// `img_origin` is the position of the images' intersection in `img`.
///
fn update_ref_pt(ref_pt: &mut ReferencePoint,
                 eligible: bool,
                 img: &Image,
                 img_idx: usize,
                 img_origin: Point,
                 qual_est_data: &QualityEstimationData,
                 config: &RefPtAlignmentConfig) -> PointUpdate {

    if ref_pt.is_fixed() {
        return PointUpdate::NotTracked;
    }

    let prev_pos = ref_pt.positions[img_idx.saturating_sub(1)].pos;
    ref_pt.positions[img_idx] = RefPtPosition{ pos: prev_pos, is_valid: false };

    if !eligible {
        return PointUpdate::NotTracked;
    }

    let is_first_update = ref_pt.ref_block.is_none();

    // This is the first time this point meets the quality criteria; initialize its reference block
    let ref_block = ref_pt.ref_block.get_or_insert_with(|| qual_est_data.create_reference_block(prev_pos, config.ref_block_size));

    // Too close to the border of the area's reference block
    if ref_block.get_width() < MIN_TRACKED_BLOCK_SIZE {
        if is_first_update {
            log::warn!("reference point at {:?} is too close to the images' border to be tracked", prev_pos);
        }
        return PointUpdate::NotTracked;
    }

    let new_pos = blk_match::find_matching_position(prev_pos + img_origin,
                                                    ref_block,
                                                    img,
                                                    config.search_radius,
                                                    BLOCK_MATCHING_INITIAL_SEARCH_STEP) - img_origin;

    // Ignore the first position update if the new position is too distant. Otherwise the point could be moved
    // too far at the very start and might not recover (its subsequent updates would be rejected as outliers).
    let max_first_move = config.spacing as i32 / 6;
    if is_first_update && Point::sqr_dist(&new_pos, &prev_pos) > sqr!(max_first_move) {
        return PointUpdate::NotTracked;
    }

    ref_pt.positions[img_idx] = RefPtPosition{ pos: new_pos, is_valid: true };

    PointUpdate::Valid(ref_pt.last_valid_pos_idx.map(|lvi| Point::sqr_dist(&new_pos, &ref_pt.positions[lvi].pos) as f64))
}


/// Calculates the quality sums of triangles' vertices in all images and their ranks.
fn calc_triangle_quality(triangulation: &Triangulation,
                         reference_pts: &[ReferencePoint],
                         qual_est_data: &QualityEstimationData,
                         num_images: usize) -> Vec<TriangleQuality> {

    triangulation.get_triangles().par_iter().map(|tri| {
        let areas: Vec<usize> = [tri.v0, tri.v1, tri.v2].iter()
            // Fixed boundary points do not affect triangle's quality
            .filter_map(|&v| reference_pts[v].qual_est_area_idx)
            .collect();

        let qsum: Vec<f32> = (0..num_images)
            .map(|img_idx| areas.iter().map(|&a| qual_est_data.get_area_quality(a, img_idx)).sum())
            .collect();

        let qmin = qsum.iter().copied().fold(f32::MAX, f32::min);
        let qmax = qsum.iter().copied().fold(0.0, f32::max);

        let mut by_quality: Vec<usize> = (0..num_images).collect();
        by_quality.sort_by(|&a, &b| qsum[a].total_cmp(&qsum[b]));

        // See comment at `TriangleQuality::sorted_idx` declaration for details
        let mut sorted_idx = vec![0usize; num_images];
        for (rank, &img_idx) in by_quality.iter().enumerate() {
            sorted_idx[img_idx] = rank;
        }

        TriangleQuality{ qmin, qmax, qsum, sorted_idx }
    }).collect()
}


/// Adds a few fixed points along and just outside intersection's borders.
///
/// This way after triangulation the near-border points will not generate skinny triangles,
/// which would result in locally degraded stack quality.
///
/// Example of triangulation without the additional points:
///
/// ```text
///  o                                                o
///
///                  +--------------+
///                  |  *   *   *   |
///                  |              |<--images' intersection
///                  |              |
///                  +--------------+
///
///
///                         o
/// ```
/// `o` = external fixed points added by `Triangulation::find_delaunay_triangulation()`
///
/// The internal near-border points (`*`) would generate skinny triangles with the upper (`o`) points.
/// With additional fixed points:
///
/// ```text
///  o                                                o
///
///                     o   o   o
///
///                  +--------------+
///                o |  *   *   *   |   o
///                  |              |
///                o |              |   o
/// ```
///
fn append_surrounding_fixed_points(ref_points: &mut Vec<ReferencePoint>, intersection: &Rect, num_images: usize) {
    let (w, h) = (intersection.width as i32, intersection.height as i32);
    let ofs = fixed_point_offset(intersection);
    let n = ADDITIONAL_FIXED_PTS_PER_BORDER as i32 + 1;
    let num_user_pts = ref_points.len();

    for i in 1..n {
        for pos in [Point{ x: i * w / n, y: -ofs.y },     // along top border
                    Point{ x: i * w / n, y: h + ofs.y },  // along bottom border
                    Point{ x: -ofs.x, y: i * h / n },     // along left border
                    Point{ x: w + ofs.x, y: i * h / n }] {  // along right border

            // A narrow intersection yields repeated positions
            if ref_points[num_user_pts..].iter().any(|p| p.positions[0].pos == pos) {
                continue;
            }
            ref_points.push(ReferencePoint::fixed(pos, num_images));
        }
    }
}


/// Distance of the additional fixed points from intersection's borders; at least 1 pixel.
fn fixed_point_offset(intersection: &Rect) -> Point {
    let div = ADDITIONAL_FIXED_PT_OFFSET_DIV as i32;
    Point{ x: max(1, intersection.width as i32 / div),
           y: max(1, intersection.height as i32 / div) }
}


/// Envelope of all reference points, including the fixed ones.
fn fixed_points_envelope(intersection: &Rect) -> Rect {
    let ofs = fixed_point_offset(intersection);
    Rect{ x: -ofs.x,
          y: -ofs.y,
          width: intersection.width + 2 * ofs.x as u32,
          height: intersection.height + 2 * ofs.y as u32 }
}


impl<'a> ProcessingPhase for RefPointAlignmentProc<'a> {
    fn get_curr_img(&mut self) -> Result<Image, ImageError> {
        self.img_seq.get_curr_img()
    }


    fn step(&mut self) -> Result<(), ProcessingError> {
        if self.is_complete {
            return Err(ProcessingError::NoMoreSteps);
        }

        if let Err(SeekResult::NoMoreImages) = self.img_seq.seek_next() {
            self.ensure_tris_are_valid();
            self.is_complete = true;

            log::info!("reference point alignment complete; {} valid position(s), {} rejected",
                       self.data.num_valid_positions, self.data.num_rejected_positions);

            return Err(ProcessingError::NoMoreSteps);
        }

        let img_idx = self.img_seq.get_curr_img_idx_within_active_subset();

        let mut img = self.img_seq.get_curr_img()?;
        if img.get_pixel_format() != PixelFormat::Mono8 {
            img = img.convert_pix_fmt(PixelFormat::Mono8);
        }

        self.update_ref_pt_positions(&img, img_idx);

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters;
    use crate::quality::QualityEstimationProc;
    use crate::test_utils;

    fn run_to_completion<P: ProcessingPhase>(proc: &mut P) {
        loop {
            match proc.step() {
                Ok(()) => (),
                Err(ProcessingError::NoMoreSteps) => break,
                Err(err) => panic!("unexpected error: {}", err)
            }
        }
    }

    fn tri_quality(qsum: Vec<f32>) -> TriangleQuality {
        let mut by_quality: Vec<usize> = (0..qsum.len()).collect();
        by_quality.sort_by(|&a, &b| qsum[a].total_cmp(&qsum[b]));
        let mut sorted_idx = vec![0; qsum.len()];
        for (rank, &i) in by_quality.iter().enumerate() {
            sorted_idx[i] = rank;
        }
        TriangleQuality{
            qmin: qsum.iter().copied().fold(f32::MAX, f32::min),
            qmax: qsum.iter().copied().fold(0.0, f32::max),
            qsum,
            sorted_idx
        }
    }

    #[test]
    fn quality_criteria() {
        // Ranks: image 0 -> 1, 1 -> 3, 2 -> 0, 3 -> 2
        let q = tri_quality(vec![2.0, 8.0, 1.0, 4.0]);

        let sufficient = |c: QualityCriterion| (0..4).filter(|&i| q.is_sufficient(c, i)).collect::<Vec<_>>();

        assert_eq!(vec![1, 3], sufficient(QualityCriterion::PercentageBest(50)));
        assert_eq!(vec![0, 1, 2, 3], sufficient(QualityCriterion::PercentageBest(100)));
        assert_eq!(vec![1], sufficient(QualityCriterion::PercentageBest(25)));

        assert_eq!(vec![1, 3], sufficient(QualityCriterion::MinRelative(30.0)));
        assert_eq!(vec![0, 1, 2, 3], sufficient(QualityCriterion::MinRelative(0.0)));

        assert_eq!(vec![1], sufficient(QualityCriterion::NumberBest(1)));
        assert_eq!(vec![0, 1, 3], sufficient(QualityCriterion::NumberBest(3)));
        assert_eq!(vec![0, 1, 2, 3], sufficient(QualityCriterion::NumberBest(10)));
    }

    #[test]
    fn fixed_points_surround_intersection() {
        let mut points = vec![];
        append_surrounding_fixed_points(&mut points, &Rect{ x: 5, y: 5, width: 100, height: 80 }, 2);

        assert_eq!(16, points.len());
        for p in &points {
            assert!(p.is_fixed());
            assert_eq!(Some(0), p.last_valid_pos_idx);
            assert!(p.positions.iter().all(|pos| pos.is_valid));

            let pos = p.positions[0].pos;
            assert!(pos.x < 0 || pos.x > 100 || pos.y < 0 || pos.y > 80);
            assert!(pos.x >= -25 && pos.x <= 125 && pos.y >= -20 && pos.y <= 100);
        }
    }

    #[test]
    fn fixed_points_of_narrow_intersection_are_distinct() {
        let intersection = Rect{ x: 0, y: 0, width: 3, height: 2 };
        let mut points: Vec<ReferencePoint> = vec![];
        for y in 0..2 {
            for x in 0..3 {
                points.push(ReferencePoint{
                    qual_est_area_idx: Some(0),
                    ref_block: None,
                    positions: vec![RefPtPosition{ pos: Point{ x, y }, is_valid: false }],
                    last_valid_pos_idx: None
                });
            }
        }
        append_surrounding_fixed_points(&mut points, &intersection, 1);

        let positions: Vec<Point> = points.iter().map(|p| p.positions[0].pos).collect();
        for (i, p) in positions.iter().enumerate().skip(6) {
            assert!(p.x < 0 || p.x >= 3 || p.y < 0 || p.y >= 2);
            assert!(!positions[..i].contains(p));
        }
        assert_eq!(10, positions.len() - 6);

        let triangulation = Triangulation::find_delaunay_triangulation(&positions, &fixed_points_envelope(&intersection)).unwrap();
        assert_eq!(positions.len() + 3, triangulation.get_vertices().len());
    }

    struct Fixture {
        img_seq: ImageSequence,
        align_data: ImgAlignmentData,
        qual_data: QualityEstimationData
    }

    fn fixture(frames: Vec<Image>) -> Fixture {
        let (w, h) = (frames[0].get_width(), frames[0].get_height());
        let num_images = frames.len();
        let mut img_seq = ImageSequence::new_in_memory(frames);
        let align_data = ImgAlignmentData::new(Rect{ x: 0, y: 0, width: w, height: h }, vec![Point::default(); num_images]);

        let qual_data = {
            let mut proc = QualityEstimationProc::init(&mut img_seq, &align_data, 32, 2).unwrap();
            run_to_completion(&mut proc);
            proc.get_data().unwrap()
        };

        Fixture{ img_seq, align_data, qual_data }
    }

    fn config(spacing: u32) -> RefPtAlignmentConfig {
        RefPtAlignmentConfig{
            quality_criterion: QualityCriterion::PercentageBest(100),
            ref_block_size: 16,
            search_radius: 6,
            spacing,
            ..RefPtAlignmentConfig::default()
        }
    }

    #[test]
    fn tracks_local_shift() {
        let base = test_utils::textured_frame(128, 128);
        let frames = vec![base.clone(), test_utils::shifted(&base, Point{ x: 2, y: -1 }), base.clone()];
        let mut f = fixture(frames);

        let points = vec![Point{ x: 40, y: 40 }, Point{ x: 88, y: 48 }, Point{ x: 64, y: 90 }];

        let mut proc = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data, Some(points.clone()), config(60)).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        // 3 points + 16 surrounding + 3 enclosing
        assert_eq!(22, data.get_num_ref_points());
        assert_eq!(3, data.get_num_images());

        for i in 0..points.len() {
            assert!(!data.is_fixed_point(i));

            // Reference blocks come from the best image, so the initial position may be adjusted in image 0
            let pos0 = data.get_ref_pt_pos(i, 0);
            assert!(pos0.is_valid);
            assert_eq!(&RefPtPosition{ pos: pos0.pos + Point{ x: 2, y: -1 }, is_valid: true }, data.get_ref_pt_pos(i, 1));
            assert_eq!(&RefPtPosition{ pos: pos0.pos, is_valid: true }, data.get_ref_pt_pos(i, 2));
        }
        assert!(data.is_fixed_point(3));
    }

    #[test]
    fn final_positions_average_valid_positions() {
        let base = test_utils::textured_frame(128, 128);
        let frames = vec![base.clone(), test_utils::shifted(&base, Point{ x: 1, y: 0 }), test_utils::shifted(&base, Point{ x: 2, y: 0 })];
        let mut f = fixture(frames);

        let mut proc = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data,
                                                   Some(vec![Point{ x: 64, y: 64 }]), config(60)).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        let final_pos = data.get_final_positions();
        let valid: Vec<&RefPtPosition> = (0..3).map(|i| data.get_ref_pt_pos(0, i)).filter(|p| p.is_valid).collect();
        let expected_x = valid.iter().map(|p| p.pos.x as f32).sum::<f32>() / valid.len() as f32;

        assert!(!valid.is_empty());
        approx::assert_abs_diff_eq!(expected_x, final_pos[0].x, epsilon = 1.0e-5);
        approx::assert_abs_diff_eq!(64.0, final_pos[0].y, epsilon = 1.0e-5);

        // Fixed points do not move
        let fixed_initial = data.get_ref_pt_pos(1, 0).pos;
        assert_eq!(PointFlt{ x: fixed_initial.x as f32, y: fixed_initial.y as f32 }, final_pos[1]);
    }

    #[test]
    fn every_triangle_is_valid_in_some_image() {
        let base = test_utils::textured_frame(96, 96);
        let mut f = fixture(vec![base.clone(), base.clone(), base]);

        let mut cfg = config(40);
        cfg.quality_criterion = QualityCriterion::NumberBest(1);

        let mut proc = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data,
                                                   Some(vec![Point{ x: 30, y: 30 }, Point{ x: 66, y: 60 }]), cfg).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        for tri in data.get_ref_pts_triangulation().get_triangles() {
            assert!((0..3).any(|img_idx| [tri.v0, tri.v1, tri.v2].iter().all(|&v| data.get_ref_pt_pos(v, img_idx).is_valid)));
        }
    }

    #[test]
    fn outlier_translation_is_rejected() {
        let base = test_utils::textured_frame(128, 128);
        let moved = test_utils::shifted(&base, Point{ x: 5, y: 0 });
        let base_pixels = base.get_pixels::<u8>();
        let moved_pixels = moved.get_pixels::<u8>();

        // In image 6 only the neighborhood of the first point moves
        let disturbed = test_utils::mono8_from_fn(128, 128, |x, y| {
            let idx = (y * 128 + x) as usize;
            if (32..64).contains(&x) && (32..64).contains(&y) { moved_pixels[idx] } else { base_pixels[idx] }
        });

        let mut frames = vec![base.clone(); 10];
        frames[6] = disturbed;
        let mut f = fixture(frames);

        let points = vec![Point{ x: 48, y: 48 }, Point{ x: 100, y: 40 }, Point{ x: 40, y: 100 }, Point{ x: 100, y: 100 }];
        let mut proc = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data, Some(points), config(60)).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        let pos5 = data.get_ref_pt_pos(0, 5).pos;
        assert!(data.get_ref_pt_pos(0, 5).is_valid);
        assert_eq!(&RefPtPosition{ pos: pos5, is_valid: false }, data.get_ref_pt_pos(0, 6));
        assert_eq!(&RefPtPosition{ pos: pos5, is_valid: true }, data.get_ref_pt_pos(0, 7));

        for i in 1..4 {
            assert!((0..10).all(|img_idx| data.get_ref_pt_pos(i, img_idx).is_valid));
        }

        assert_eq!(1, data.get_num_rejected_positions());
        assert_eq!(39, data.get_num_valid_positions());
    }

    #[test]
    fn distant_first_move_is_ignored() {
        let base = test_utils::textured_frame(128, 128);
        // The first image is less sharp, so reference blocks come from the second one
        let blurred_and_moved = test_utils::shifted(&filters::apply_box_blur(&base, 1, 3), Point{ x: 7, y: 0 });
        let mut f = fixture(vec![blurred_and_moved, base]);

        let mut cfg = config(24);
        cfg.search_radius = 10;

        let mut proc = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data,
                                                   Some(vec![Point{ x: 64, y: 64 }]), cfg).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        assert_eq!(&RefPtPosition{ pos: Point{ x: 64, y: 64 }, is_valid: false }, data.get_ref_pt_pos(0, 0));
        assert_eq!(&RefPtPosition{ pos: Point{ x: 64, y: 64 }, is_valid: true }, data.get_ref_pt_pos(0, 1));
        assert_eq!(0, data.get_num_rejected_positions());
        assert_eq!(1, data.get_num_valid_positions());
    }

    #[test]
    fn point_on_reference_block_border_is_not_tracked() {
        let base = test_utils::textured_frame(128, 128);
        let mut f = fixture(vec![base.clone(), base.clone(), base]);

        let mut proc = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data,
                                                   Some(vec![Point{ x: 0, y: 0 }, Point{ x: 64, y: 64 }]), config(60)).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        // Only forced valid, at the initial position
        assert!((0..3).filter(|&i| data.get_ref_pt_pos(0, i).is_valid).count() <= 1);
        assert!((0..3).all(|i| data.get_ref_pt_pos(0, i).pos == Point{ x: 0, y: 0 }));
        assert!((0..3).all(|i| data.get_ref_pt_pos(1, i).is_valid));
        assert_eq!(3, data.get_num_valid_positions());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let base = test_utils::textured_frame(64, 64);
        let mut f = fixture(vec![base]);

        let outside = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data, Some(vec![Point{ x: 64, y: 10 }]), config(20));
        assert!(matches!(outside, Err(ProcessingError::InvalidParameters(_))));

        let zero_spacing = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data, None, config(0));
        assert!(matches!(zero_spacing, Err(ProcessingError::InvalidParameters(_))));

        let mut cfg = config(20);
        cfg.quality_criterion = QualityCriterion::PercentageBest(120);
        let bad_percentage = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data, None, cfg);
        assert!(matches!(bad_percentage, Err(ProcessingError::InvalidParameters(_))));

        let duplicate = RefPointAlignmentProc::init(&mut f.img_seq, &f.align_data, &f.qual_data,
                                                    Some(vec![Point{ x: 10, y: 10 }, Point{ x: 10, y: 10 }]), config(20));
        assert!(matches!(duplicate, Err(ProcessingError::Triangulation(_))));
    }

    #[test]
    fn config_from_json() {
        let cfg: RefPtAlignmentConfig = serde_json::from_str(r#"{ "quality_criterion": { "number_best": 5 }, "spacing": 25 }"#).unwrap();
        assert_eq!(QualityCriterion::NumberBest(5), cfg.quality_criterion);
        assert_eq!(25, cfg.spacing);
        assert_eq!(RefPtAlignmentConfig::default().ref_block_size, cfg.ref_block_size);
    }
}
