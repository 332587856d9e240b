//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Processing phase: image alignment (video stabilization).
//

use crate::blk_match;
use crate::defs::{Point, ProcessingError, ProcessingPhase, Rect, WHITE_8BIT};
use crate::filters;
use crate::image::{Image, ImageError, PixelFormat};
use crate::img_seq::{ImageSequence, SeekResult};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};


/// Parameters of anchor-based alignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Anchor positions in the first active image. If `None`, one anchor is placed automatically.
    pub initial_anchors: Option<Vec<Point>>,

    /// Radius (in pixels) of anchors' square reference blocks (default: 32).
    pub block_radius: u32,

    /// Images are aligned by matching blocks that are offset (horz. and vert.) by up to this radius in pixels (default: 32).
    pub search_radius: u32,

    /// Min. image brightness that an anchor can be placed at (values: [0; 1]; default: 0.33).
    ///
    /// Value is relative to the image's darkest (0.0) and brightest (1.0) pixels.
    ///
    pub placement_brightness_threshold: f32
}


impl Default for AnchorConfig {
    fn default() -> AnchorConfig {
        AnchorConfig{
            initial_anchors: None,
            block_radius: 32,
            search_radius: 32,
            placement_brightness_threshold: 0.33
        }
    }
}


#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AlignmentMethod {
    /// Alignment via block-matching around anchor points
    Anchors(AnchorConfig),

    /// Alignment using the image centroid
    Centroid
}


impl Default for AlignmentMethod {
    fn default() -> AlignmentMethod { AlignmentMethod::Anchors(AnchorConfig::default()) }
}


const QUALITY_EST_BOX_BLUR_RADIUS: u32 = 2;

/// Value in pixels.
const BLOCK_MATCHING_INITIAL_SEARCH_STEP: u32 = 4;


struct AnchorData {
    /// Current position
    pos: Point,

    is_valid: bool,

    /// Square image fragment (of the best quality so far) centered (after alignment) on `pos`
    ref_block: Image,

    /// Quality of `ref_block`
    ref_block_qual: f32
}


impl AnchorData {
    /// Creates an anchor with reference block taken from `img8` (Mono8) around `pos`.
    fn new(img8: &Image, pos: Point, block_radius: u32) -> AnchorData {
        let ref_block = img8.get_fragment_copy(Point{ x: pos.x - block_radius as i32, y: pos.y - block_radius as i32 },
                                               2 * block_radius, 2 * block_radius);

        let ref_block_qual = filters::estimate_quality(ref_block.get_pixels::<u8>(),
                                                       ref_block.get_width(),
                                                       ref_block.get_height(),
                                                       ref_block.get_width() as usize,
                                                       QUALITY_EST_BOX_BLUR_RADIUS);

        AnchorData{ pos, is_valid: true, ref_block, ref_block_qual }
    }
}


/// Set-theoretic intersection of all images after alignment (i.e. the fragment which is visible in all images).
#[derive(Clone, Debug, Default)]
struct ImgIntersection {
    /// Offset, relative to the first image's origin.
    offset: Point,

    /// Coordinates of the bottom right corner (belongs to the intersection), relative to the first image's origin.
    bottom_right: Point,

    width: u32,
    height: u32
}


impl ImgIntersection {
    fn to_rect(&self) -> Rect {
        Rect{ x: self.offset.x, y: self.offset.y, width: self.width, height: self.height }
    }
}


/// Contains results of processing performed by `ImgAlignmentProc`.
#[derive(Clone, Debug, Default)]
pub struct ImgAlignmentData {
    /// Images' intersection
    intersection: ImgIntersection,

    /// Image offsets (relative to each image's origin) necessary for them to be aligned.
    ///
    /// Concerns only active images of the sequence. Position `p` of the intersection
    /// (relative to its origin) corresponds to position `intersection.offset + p + img_offsets[i]`
    /// in the i-th active image.
    ///
    img_offsets: Vec<Point>
}


impl ImgAlignmentData {
    /// Creates alignment data from known intersection and image offsets.
    pub fn new(intersection: Rect, img_offsets: Vec<Point>) -> ImgAlignmentData {
        ImgAlignmentData{
            intersection: ImgIntersection{
                offset: intersection.get_pos(),
                bottom_right: Point{ x: intersection.x + intersection.width as i32 - 1,
                                     y: intersection.y + intersection.height as i32 - 1 },
                width: intersection.width,
                height: intersection.height
            },
            img_offsets
        }
    }


    /// Returns offset of images' intersection relative to the first image's origin.
    pub fn get_intersection(&self) -> Rect {
        self.intersection.to_rect()
    }


    /// Returns offsets (relative to each image's origin) required for images to be aligned.
    pub fn get_image_ofs(&self) -> &[Point] {
        &self.img_offsets[..]
    }
}


/// Performs image alignment (video stabilization).
///
/// Completed alignment results in determining the images' intersection,
/// i.e. the common rectangular area visible in all frames. Due to the likely
/// image drift, this area is usually smaller than the smallest image in the sequence.
///
pub struct ImgAlignmentProc<'a> {
    is_complete: bool,

    img_seq: &'a mut ImageSequence,

    /// Current image index (within the active images' subset).
    curr_img_idx: usize,

    align_method: AlignmentMethod,

    /// Anchor points used for alignment (there is at least one if using `AlignmentMethod::Anchors`).
    ///
    /// Coordinates are relative to the current image's origin.
    ///
    anchors: Vec<AnchorData>,

    active_anchor_idx: usize,

    /// Current centroid position (if using `AlignmentMethod::Centroid`).
    centroid_pos: Point,

    data: ImgAlignmentData
}


impl<'a> ImgAlignmentProc<'a> {
    /// Returns image alignment data determined during processing.
    pub fn get_data(self) -> Result<ImgAlignmentData, ProcessingError> {
        if !self.is_complete {
            return Err(ProcessingError::NotComplete);
        }
        Ok(self.data)
    }


    /// Initializes image alignment (video stabilization).
    ///
    /// With `AlignmentMethod::Anchors` and no initial anchors, an anchor is placed automatically.
    ///
    pub fn init(img_seq: &'a mut ImageSequence, align_method: AlignmentMethod) -> Result<ImgAlignmentProc<'a>, ProcessingError> {
        if img_seq.get_active_img_count() == 0 {
            return Err(ProcessingError::InvalidParameters("image sequence has no active images".to_string()));
        }

        img_seq.seek_start();
        let first_img = img_seq.get_curr_img()?;

        let mut centroid_pos = Point::default();
        let mut anchors: Vec<AnchorData> = vec![];

        match &align_method {
            AlignmentMethod::Anchors(config) => {
                if config.block_radius == 0 || config.search_radius == 0 {
                    return Err(ProcessingError::InvalidParameters(
                        format!("block radius ({}) and search radius ({}) must be positive", config.block_radius, config.search_radius)));
                }

                let img8 = first_img.convert_pix_fmt(PixelFormat::Mono8);

                let anchor_positions = match &config.initial_anchors {
                    Some(positions) if !positions.is_empty() => positions.clone(),
                    _ => vec![ImgAlignmentProc::suggest_anchor_pos(&img8, config.placement_brightness_threshold, 2 * config.block_radius)]
                };

                let r = config.block_radius as i32;
                for pos in anchor_positions {
                    if pos.x < r || pos.y < r || pos.x + r > img8.get_width() as i32 || pos.y + r > img8.get_height() as i32 {
                        return Err(ProcessingError::InvalidParameters(
                            format!("anchor {} (block radius {}) does not fit in the {}x{} image", pos, r, img8.get_width(), img8.get_height())));
                    }
                    anchors.push(AnchorData::new(&img8, pos, config.block_radius));
                }

                log::info!("image alignment using {} anchor(s): {:?}", anchors.len(), anchors.iter().map(|a| a.pos).collect::<Vec<_>>());
            },

            AlignmentMethod::Centroid => {
                centroid_pos = centroid_of(&first_img);
                log::info!("image alignment using centroid, initial position {}", centroid_pos);
            }
        }

        Ok(ImgAlignmentProc{
            is_complete: false,
            img_seq,
            curr_img_idx: 0,
            align_method,
            anchors,
            active_anchor_idx: 0,
            centroid_pos,
            data: ImgAlignmentData{
                intersection: ImgIntersection{ offset: Point{ x: 0, y: 0 },
                                               bottom_right: Point{ x: i32::MAX, y: i32::MAX },
                                               width: 0,
                                               height: 0 },
                img_offsets: vec![]
            }
        })
    }


    pub fn is_complete(&self) -> bool { self.is_complete }


    /// Returns the current number of anchors.
    ///
    /// The return value may increase during processing (when all existing
    /// anchors became invalid and a new one had to be automatically created).
    ///
    pub fn get_anchor_count(&self) -> usize { self.anchors.len() }


    /// Returns current positions of anchor points.
    pub fn get_anchors(&self) -> Vec<Point> {
        self.anchors.iter().map(|a| a.pos).collect()
    }


    pub fn is_anchor_valid(&self, anchor_idx: usize) -> bool {
        self.anchors[anchor_idx].is_valid
    }


    pub fn get_active_anchor_idx(&self) -> usize { self.active_anchor_idx }


    pub fn get_alignment_method(&self) -> &AlignmentMethod { &self.align_method }


    /// Returns the current centroid position.
    pub fn get_current_centroid_pos(&self) -> Point {
        self.centroid_pos
    }


    /// Returns the intersection of images processed so far.
    ///
    /// The result shrinks (or stays the same) with every step. Before the first step
    /// the result is empty.
    ///
    pub fn get_current_intersection(&self) -> Rect {
        let isect = &self.data.intersection;
        if self.data.img_offsets.is_empty() {
            return Rect::default();
        }

        Rect{ x: isect.offset.x,
              y: isect.offset.y,
              width: max(0, isect.bottom_right.x - isect.offset.x + 1) as u32,
              height: max(0, isect.bottom_right.y - isect.offset.y + 1) as u32 }
    }


    /// Returns the optimal position of a video stabilization anchor in `img8` (Mono8).
    ///
    /// Considers only the middle 3/4 of the image. A candidate block must have more than 1/5 of pixels
    /// above the placement threshold, less than 1/10 of white pixels and sufficient variety of gradient
    /// directions; the one with the highest quality is chosen. If there is no candidate, returns image's center.
    ///
    /// `placement_brightness_threshold` - min. image brightness that an anchor point can be placed at;
    ///                                    value is relative to the image's darkest (0.0) and brightest (1.0) pixels
    ///
    pub fn suggest_anchor_pos(img8: &Image, placement_brightness_threshold: f32, ref_block_size: u32) -> Point {
        let width = img8.get_width() as i32;
        let height = img8.get_height() as i32;
        let bsize = ref_block_size as i32;
        let step = max(1, bsize / 3) as usize;

        let (bmin, bmax) = utils::find_min_max_brightness(img8);
        let threshold = bmin as f32 + placement_brightness_threshold * (bmax - bmin) as f32;

        let mut result = Point{ x: width / 2, y: height / 2 };
        let mut best_qual = 0.0;

        let num_pixels_in_block = sqr!(ref_block_size) as usize;

        for y in (height / 8 + bsize / 2 .. 7 * height / 8 - bsize / 2).step_by(step) {
            for x in (width / 8 + bsize / 2 .. 7 * width / 8 - bsize / 2).step_by(step) {
                let top_left = Point{ x: x - bsize / 2, y: y - bsize / 2 };

                let mut num_above_thresh = 0usize;
                let mut num_white = 0usize;

                for ny in range!(top_left.y, bsize) {
                    for &val in &img8.get_line::<u8>(ny as u32)[range!(top_left.x as usize, bsize as usize)] {
                        if val == WHITE_8BIT {
                            num_white += 1;
                        } else if val as f32 >= threshold {
                            num_above_thresh += 1;
                        }
                    }
                }

                if num_above_thresh > num_pixels_in_block / 5 &&
                    // Reject locations at the limb of an overexposed (fully white) disc; the white pixels
                    // would weigh heavily during block matching and the point would tend to jump along the limb
                    num_white < num_pixels_in_block / 10 &&
                    utils::assess_gradients_for_block_matching(img8, Point{ x, y }, max(ref_block_size / 2, 32)) {

                    let qual = filters::estimate_quality(img8.get_mono8_pixels_from(top_left),
                                                         ref_block_size, ref_block_size, width as usize, 4);

                    if qual > best_qual {
                        best_qual = qual;
                        result = Point{ x, y };
                    }
                }
            }
        }

        result
    }


    fn determine_img_offset_using_anchors(&mut self, img8: &Image, config: &AnchorConfig) -> Point {
        let width = img8.get_width() as i32;
        let height = img8.get_height() as i32;
        let block_size = 2 * config.block_radius;

        // Anchors closer to the image border are discarded
        let margin = (config.block_radius + config.search_radius) as i32;

        let prev_active_idx = self.active_anchor_idx;
        let mut offsets: Vec<Option<Point>> = vec![None; self.anchors.len()];

        for (i, anchor) in self.anchors.iter_mut().enumerate().filter(|(_, a)| a.is_valid) {
            let new_pos = blk_match::find_matching_position(anchor.pos, &anchor.ref_block, img8,
                                                            config.search_radius, BLOCK_MATCHING_INITIAL_SEARCH_STEP);

            // Still a valid measurement for the current image, even if the anchor is discarded below
            offsets[i] = Some(new_pos - anchor.pos);

            if new_pos.x < margin || new_pos.x > width - margin || new_pos.y < margin || new_pos.y > height - margin {
                log::debug!("anchor {} at {} moved too close to image border, discarding", i, new_pos);
                anchor.is_valid = false;
                continue;
            }

            let block_pos = Point{ x: new_pos.x - config.block_radius as i32, y: new_pos.y - config.block_radius as i32 };

            let new_qual = filters::estimate_quality(img8.get_mono8_pixels_from(block_pos),
                                                     block_size, block_size, width as usize, QUALITY_EST_BOX_BLUR_RADIUS);

            if new_qual > anchor.ref_block_qual {
                // Refresh the reference block using the current image at the block's new position
                anchor.ref_block_qual = new_qual;
                anchor.ref_block = img8.get_fragment_copy(block_pos, block_size, block_size);
            }

            anchor.pos = new_pos;
        }

        if !self.anchors[self.active_anchor_idx].is_valid {
            match self.anchors.iter().position(|a| a.is_valid) {
                Some(idx) => {
                    log::info!("active anchor changed from {} to {}", self.active_anchor_idx, idx);
                    self.active_anchor_idx = idx;
                },

                None => {
                    // There are no more existing valid anchors; choose and add a new one
                    let new_pos = ImgAlignmentProc::suggest_anchor_pos(img8, config.placement_brightness_threshold, block_size);
                    log::warn!("all anchors became invalid in image {}; placing a new one at {}", self.curr_img_idx, new_pos);

                    self.anchors.push(AnchorData::new(img8, new_pos, config.block_radius));
                    self.active_anchor_idx = self.anchors.len() - 1;
                }
            }
        }

        // A newly placed anchor has no offset yet; use the last active one's
        offsets.get(self.active_anchor_idx).copied().flatten()
            .or(offsets[prev_active_idx])
            .unwrap_or_default()
    }


    fn determine_img_offset_using_centroid(&mut self, img: &Image) -> Point {
        let new_centroid_pos = centroid_of(img);
        let offset = new_centroid_pos - self.centroid_pos;
        self.centroid_pos = new_centroid_pos;

        offset
    }
}


/// Returns the brightness centroid of the whole image.
fn centroid_of(img: &Image) -> Point {
    if img.get_pixel_format() == PixelFormat::Pal8 {
        let converted = img.convert_pix_fmt(PixelFormat::Mono8);
        converted.get_centroid(converted.get_img_rect())
    } else {
        img.get_centroid(img.get_img_rect())
    }
}


impl<'a> ProcessingPhase for ImgAlignmentProc<'a> {
    fn get_curr_img(&mut self) -> Result<Image, ImageError> {
        self.img_seq.get_curr_img()
    }


    fn step(&mut self) -> Result<(), ProcessingError> {
        if self.is_complete {
            return Err(ProcessingError::NoMoreSteps);
        }

        if self.curr_img_idx == 0 {
            self.data.img_offsets.push(Point{ x: 0, y: 0 });

            let (width, height, _) = self.img_seq.get_curr_img_metadata()?;

            self.data.intersection.bottom_right.x = width as i32 - 1;
            self.data.intersection.bottom_right.y = height as i32 - 1;
            self.curr_img_idx += 1;

            return Ok(());
        }

        if let Err(SeekResult::NoMoreImages) = self.img_seq.seek_next() {
            let isect = self.get_current_intersection();
            self.data.intersection.width = isect.width;
            self.data.intersection.height = isect.height;

            if isect.is_empty() {
                log::warn!("images have no common area after alignment");
            }
            log::info!("image alignment complete; images' intersection: {}x{} at {}",
                       isect.width, isect.height, isect.get_pos());

            self.is_complete = true;
            return Err(ProcessingError::NoMoreSteps);
        }

        let img = self.img_seq.get_curr_img()?;

        let detected_img_offset = match self.align_method.clone() {
            AlignmentMethod::Anchors(config) => {
                let img8 = if img.get_pixel_format() == PixelFormat::Mono8 { img.clone() } else { img.convert_pix_fmt(PixelFormat::Mono8) };
                self.determine_img_offset_using_anchors(&img8, &config)
            },

            AlignmentMethod::Centroid => self.determine_img_offset_using_centroid(&img)
        };

        // `img_offsets` contain offsets relative to the first image, so store the current offset incrementally w.r.t. the previous one
        let new_ofs = self.data.img_offsets.last().copied().unwrap_or_default() + detected_img_offset;
        self.data.img_offsets.push(new_ofs);

        log::debug!("image {}: offset {}", self.curr_img_idx, new_ofs);

        let isect = &mut self.data.intersection;
        isect.offset.x = max(isect.offset.x, -new_ofs.x);
        isect.offset.y = max(isect.offset.y, -new_ofs.y);
        isect.bottom_right.x = min(isect.bottom_right.x, -new_ofs.x + img.get_width() as i32 - 1);
        isect.bottom_right.y = min(isect.bottom_right.y, -new_ofs.y + img.get_height() as i32 - 1);
        self.curr_img_idx += 1;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn run_to_completion(proc: &mut ImgAlignmentProc) {
        loop {
            match proc.step() {
                Ok(()) => (),
                Err(ProcessingError::NoMoreSteps) => break,
                Err(err) => panic!("unexpected error: {}", err)
            }
        }
    }

    fn anchors_at(pos: Point, block_radius: u32, search_radius: u32) -> AlignmentMethod {
        AlignmentMethod::Anchors(AnchorConfig{
            initial_anchors: Some(vec![pos]),
            block_radius,
            search_radius,
            placement_brightness_threshold: 0.33
        })
    }

    #[test]
    fn shifted_frame_offset_and_intersection() {
        let frame0 = test_utils::textured_frame(100, 100);
        let frame1 = test_utils::shifted(&frame0, Point{ x: 3, y: -2 });
        let mut img_seq = ImageSequence::new_in_memory(vec![frame0, frame1]);

        let mut proc = ImgAlignmentProc::init(&mut img_seq, anchors_at(Point{ x: 50, y: 50 }, 8, 8)).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        assert_eq!(&[Point{ x: 0, y: 0 }, Point{ x: 3, y: -2 }], data.get_image_ofs());
        assert_eq!(Rect{ x: 0, y: 2, width: 97, height: 98 }, data.get_intersection());
    }

    #[test]
    fn intersection_never_grows() {
        let base = test_utils::textured_frame(120, 120);
        let shifts = [Point{ x: 0, y: 0 }, Point{ x: 2, y: 1 }, Point{ x: -3, y: 4 }, Point{ x: 1, y: -2 }, Point{ x: 0, y: 0 }];
        let frames = shifts.iter().map(|s| test_utils::shifted(&base, *s)).collect();
        let mut img_seq = ImageSequence::new_in_memory(frames);

        let mut proc = ImgAlignmentProc::init(&mut img_seq, anchors_at(Point{ x: 60, y: 60 }, 10, 8)).unwrap();

        let mut prev: Option<Rect> = None;
        while proc.step().is_ok() {
            let curr = proc.get_current_intersection();
            if let Some(p) = prev {
                assert!(p.contains_rect(&curr), "{:?} is not contained in {:?}", curr, p);
            }
            prev = Some(curr);
        }

        let data = proc.get_data().unwrap();
        assert_eq!(shifts.to_vec(), data.get_image_ofs());
        assert_eq!(Rect{ x: 3, y: 2, width: 115, height: 114 }, data.get_intersection());
    }

    /// Image `i` shows `base` moved left by `4*i` pixels.
    fn drifting_left(base: &Image, num_images: i32) -> Vec<Image> {
        (0..num_images).map(|i| test_utils::shifted(base, Point{ x: -4 * i, y: 0 })).collect()
    }

    #[test]
    fn switches_to_next_anchor_near_border() {
        let base = test_utils::textured_frame(120, 120);
        let mut img_seq = ImageSequence::new_in_memory(drifting_left(&base, 6));

        let method = AlignmentMethod::Anchors(AnchorConfig{
            initial_anchors: Some(vec![Point{ x: 30, y: 60 }, Point{ x: 70, y: 60 }]),
            block_radius: 8,
            search_radius: 8,
            ..AnchorConfig::default()
        });
        let mut proc = ImgAlignmentProc::init(&mut img_seq, method).unwrap();
        run_to_completion(&mut proc);

        // The first anchor reaches x = 14 (closer than 16 to the border) in image 4
        assert_eq!(2, proc.get_anchor_count());
        assert_eq!(1, proc.get_active_anchor_idx());
        assert!(!proc.is_anchor_valid(0));

        let expected: Vec<Point> = (0..6).map(|i| Point{ x: -4 * i, y: 0 }).collect();
        assert_eq!(expected, proc.get_data().unwrap().get_image_ofs());
    }

    #[test]
    fn places_new_anchor_when_all_are_discarded() {
        let base = test_utils::textured_frame(120, 120);
        let mut img_seq = ImageSequence::new_in_memory(drifting_left(&base, 5));

        let mut proc = ImgAlignmentProc::init(&mut img_seq, anchors_at(Point{ x: 30, y: 60 }, 8, 8)).unwrap();
        run_to_completion(&mut proc);

        assert_eq!(2, proc.get_anchor_count());
        assert_eq!(1, proc.get_active_anchor_idx());
        assert!(!proc.is_anchor_valid(0));
        assert!(proc.is_anchor_valid(1));

        let expected: Vec<Point> = (0..5).map(|i| Point{ x: -4 * i, y: 0 }).collect();
        assert_eq!(expected, proc.get_data().unwrap().get_image_ofs());
    }

    #[test]
    fn centroid_alignment_follows_bright_spot() {
        let spot = |cx: u32, cy: u32| test_utils::mono8_from_fn(64, 64, move |x, y| {
            if x.abs_diff(cx) <= 2 && y.abs_diff(cy) <= 2 { 200 } else { 0 }
        });
        let mut img_seq = ImageSequence::new_in_memory(vec![spot(30, 30), spot(33, 26), spot(28, 31)]);

        let mut proc = ImgAlignmentProc::init(&mut img_seq, AlignmentMethod::Centroid).unwrap();
        run_to_completion(&mut proc);
        let data = proc.get_data().unwrap();

        assert_eq!(&[Point{ x: 0, y: 0 }, Point{ x: 3, y: -4 }, Point{ x: -2, y: 1 }], data.get_image_ofs());
    }

    #[test]
    fn inactive_images_are_skipped() {
        let base = test_utils::textured_frame(100, 100);
        let frames = vec![base.clone(), test_utils::shifted(&base, Point{ x: 5, y: 5 }), test_utils::shifted(&base, Point{ x: 1, y: 2 })];
        let mut img_seq = ImageSequence::new_in_memory(frames);
        img_seq.set_active_imgs(&[true, false, true]);

        let mut proc = ImgAlignmentProc::init(&mut img_seq, anchors_at(Point{ x: 50, y: 50 }, 8, 8)).unwrap();
        run_to_completion(&mut proc);

        assert_eq!(&[Point{ x: 0, y: 0 }, Point{ x: 1, y: 2 }], proc.get_data().unwrap().get_image_ofs());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut img_seq = ImageSequence::new_in_memory(vec![test_utils::textured_frame(64, 64)]);

        assert!(matches!(ImgAlignmentProc::init(&mut img_seq, anchors_at(Point{ x: 32, y: 32 }, 0, 8)),
                         Err(ProcessingError::InvalidParameters(_))));

        assert!(matches!(ImgAlignmentProc::init(&mut img_seq, anchors_at(Point{ x: 60, y: 32 }, 8, 8)),
                         Err(ProcessingError::InvalidParameters(_))));

        img_seq.set_active_imgs(&[false]);
        assert!(matches!(ImgAlignmentProc::init(&mut img_seq, AlignmentMethod::Centroid),
                         Err(ProcessingError::InvalidParameters(_))));
    }

    #[test]
    fn data_is_unavailable_before_completion() {
        let mut img_seq = ImageSequence::new_in_memory(vec![test_utils::textured_frame(64, 64)]);
        let proc = ImgAlignmentProc::init(&mut img_seq, AlignmentMethod::Centroid).unwrap();

        assert!(matches!(proc.get_data(), Err(ProcessingError::NotComplete)));
    }

    #[test]
    fn suggested_anchor_lies_in_image_middle() {
        let img = test_utils::textured_frame(160, 160);
        let pos = ImgAlignmentProc::suggest_anchor_pos(&img, 0.33, 32);

        assert!(pos.x >= 20 + 16 && pos.x < 140 - 16);
        assert!(pos.y >= 20 + 16 && pos.y < 140 - 16);
    }

    #[test]
    fn alignment_method_from_json() {
        let method: AlignmentMethod = serde_json::from_str(r#"{ "method": "anchors", "block_radius": 16 }"#).unwrap();
        assert_eq!(AlignmentMethod::Anchors(AnchorConfig{ block_radius: 16, ..AnchorConfig::default() }), method);

        let method: AlignmentMethod = serde_json::from_str(r#"{ "method": "centroid" }"#).unwrap();
        assert_eq!(AlignmentMethod::Centroid, method);
    }
}
