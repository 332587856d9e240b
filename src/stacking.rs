//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Processing phase: image stacking (shift-and-add summation).
//

use crate::defs::{Point, PointFlt, ProcessingError, ProcessingPhase, Rect};
use crate::image::{self, Image, ImageError, PixelFormat};
use crate::img_align::ImgAlignmentData;
use crate::img_seq::{ImageSequence, SeekResult};
use crate::ref_pt_align::RefPointAlignmentData;
use crate::triangulation::Triangle;
use rayon::prelude::*;
use std::cmp::max;


/// Pixels whose barycentric coordinates are outside [0; 1] by less than this still belong to the triangle.
const BARYCENTRIC_EPSILON: f64 = 1.0e-6;

/// Samples falling outside an image by less than this (in pixels) are clamped to its border.
const SAMPLE_MARGIN: f32 = 0.01;


#[derive(Clone, Copy, Debug)]
struct StackTrianglePoint {
    // Image coordinates in the stack
    x: i32,
    y: i32,

    // Barycentric coordinates in the parent triangle
    u: f32,
    v: f32
}


/// Performs image stacking (shift-and-add summation).
pub struct StackingProc<'a> {
    img_seq: &'a mut ImageSequence,

    img_align_data: &'a ImgAlignmentData,

    ref_pt_align_data: &'a RefPointAlignmentData,

    is_complete: bool,

    /// For each triangle in `ref_pt_align_data.triangulation`, contains a list of points comprising it.
    rasterized_tris: Vec<Vec<StackTrianglePoint>>,

    /// Final positions (within the images' intersection) of the reference points,
    /// i.e. the average over all images where the points are valid.
    final_ref_pt_pos: Vec<PointFlt>,

    /// Element [i] = number of images that were stacked to produce the i-th pixel in `image_stack`.
    added_img_count: Vec<usize>,

    /// Format: Mono32f or RGB32f.
    image_stack: Image,

    first_step_complete: bool,

    /// Triangle indices (from `ref_pt_align_data.triangulation`) stacked in the current step.
    curr_step_stacked_triangles: Vec<usize>,

    /// Contains inverted flat-field values (max/flat-field), Mono32f.
    flatfield_inv: Option<Image>
}


impl<'a> StackingProc<'a> {
    /// Initializes image stacking.
    ///
    /// # Parameters
    ///
    /// * `flatfield` - Optional flat-field image (any pixel format) of the same size as the images;
    ///                 stacked pixels are divided by its (relative) values.
    ///
    pub fn init(img_seq: &'a mut ImageSequence,
                img_align_data: &'a ImgAlignmentData,
                ref_pt_align_data: &'a RefPointAlignmentData,
                flatfield: Option<&Image>) -> Result<StackingProc<'a>, ProcessingError> {

        let intersection = img_align_data.get_intersection();
        if intersection.is_empty() {
            return Err(ProcessingError::InvalidParameters("images' intersection is empty".to_string()));
        }

        let num_images = img_seq.get_active_img_count();
        if num_images == 0 || ref_pt_align_data.get_num_images() != num_images || img_align_data.get_image_ofs().len() != num_images {
            return Err(ProcessingError::InvalidParameters(
                format!("sequence has {} active images, alignment data covers {}, reference point data covers {}",
                        num_images, img_align_data.get_image_ofs().len(), ref_pt_align_data.get_num_images())));
        }

        img_seq.seek_start();

        let (img_width, img_height, pix_fmt) = img_seq.get_curr_img_metadata()?;

        let final_ref_pt_pos = ref_pt_align_data.get_final_positions();

        let rasterized_tris = rasterize_triangles(&final_ref_pt_pos,
                                                  ref_pt_align_data.get_ref_pts_triangulation().get_triangles(),
                                                  intersection.width,
                                                  intersection.height);

        let stack_pix_fmt = if image::get_num_channels(pix_fmt) == 1 && pix_fmt != PixelFormat::Pal8 {
            PixelFormat::Mono32f
        } else {
            PixelFormat::RGB32f
        };

        let image_stack = Image::try_new(intersection.width, intersection.height, stack_pix_fmt).map_err(|err| match err {
            ImageError::OutOfMemory => ProcessingError::OutOfMemory,
            other => ProcessingError::ImageError(other)
        })?;

        let num_pixels = intersection.width as usize * intersection.height as usize;
        let mut added_img_count = Vec::<usize>::new();
        added_img_count.try_reserve_exact(num_pixels).map_err(|_| ProcessingError::OutOfMemory)?;
        added_img_count.resize(num_pixels, 0);

        let flatfield_inv = match flatfield {
            Some(ffield) => {
                if ffield.get_width() != img_width || ffield.get_height() != img_height {
                    return Err(ProcessingError::InvalidParameters(
                        format!("flat-field size {}x{} differs from image size {}x{}",
                                ffield.get_width(), ffield.get_height(), img_width, img_height)));
                }
                Some(invert_flatfield(ffield))
            },
            None => None
        };

        log::info!("stacking {} image(s) into a {}x{} {:?} stack using {} triangle(s){}",
                   num_images, intersection.width, intersection.height, stack_pix_fmt, rasterized_tris.len(),
                   if flatfield_inv.is_some() { " and flat-field" } else { "" });

        Ok(StackingProc{
            img_seq,
            img_align_data,
            ref_pt_align_data,
            is_complete: false,
            curr_step_stacked_triangles: Vec::with_capacity(rasterized_tris.len()),
            rasterized_tris,
            final_ref_pt_pos,
            added_img_count,
            image_stack,
            first_step_complete: false,
            flatfield_inv
        })
    }


    /// Returns the image stack; can be used only after stacking completes.
    pub fn get_image_stack(&self) -> Result<&Image, ProcessingError> {
        if !self.is_complete {
            return Err(ProcessingError::NotComplete);
        }
        Ok(&self.image_stack)
    }


    /// Consumes the processor and returns the image stack; can be used only after stacking completes.
    pub fn into_image_stack(self) -> Result<Image, ProcessingError> {
        if !self.is_complete {
            return Err(ProcessingError::NotComplete);
        }
        Ok(self.image_stack)
    }


    /// Returns an incomplete image stack, updated after every stacking step.
    pub fn get_partial_image_stack(&self) -> Image {
        if self.is_complete {
            return self.image_stack.clone();
        }

        let mut pstack = self.image_stack.clone();
        normalize_image_stack(&self.added_img_count, &mut pstack, self.flatfield_inv.is_some());
        pstack
    }


    pub fn is_complete(&self) -> bool {
        self.is_complete
    }


    /// Returns an array of triangle indices stacked in current step.
    ///
    /// Meant to be called right after `step()`. Values are indices into triangle array
    /// of the triangulation returned by `RefPointAlignmentData::get_ref_pts_triangulation()`.
    /// Vertex coordinates do not correspond to the triangulation, but to the array
    /// returned by `get_ref_pt_stacking_pos()`.
    ///
    pub fn get_curr_step_stacked_triangles(&self) -> &[usize] {
        &self.curr_step_stacked_triangles
    }


    /// Returns reference point positions as used during stacking.
    pub fn get_ref_pt_stacking_pos(&self) -> &[PointFlt] {
        &self.final_ref_pt_pos
    }
}


impl<'a> ProcessingPhase for StackingProc<'a> {
    fn get_curr_img(&mut self) -> Result<Image, ImageError> {
        self.img_seq.get_curr_img()
    }


    fn step(&mut self) -> Result<(), ProcessingError> {
        if self.is_complete {
            return Err(ProcessingError::NoMoreSteps);
        }

        if self.first_step_complete {
            if let Err(SeekResult::NoMoreImages) = self.img_seq.seek_next() {
                normalize_image_stack(&self.added_img_count, &mut self.image_stack, self.flatfield_inv.is_some());
                self.is_complete = true;
                log::info!("stacking complete");
                return Err(ProcessingError::NoMoreSteps);
            }
        }

        let mut img = self.img_seq.get_curr_img()?;
        let curr_img_idx = self.img_seq.get_curr_img_idx_within_active_subset();

        let intersection = self.img_align_data.get_intersection();
        let img_origin = intersection.get_pos() + self.img_align_data.get_image_ofs()[curr_img_idx];

        if img.get_pixel_format() != self.image_stack.get_pixel_format() {
            img = img.convert_pix_fmt(self.image_stack.get_pixel_format());
        }

        let num_channels = image::get_num_channels(img.get_pixel_format());
        let ref_pt_data = self.ref_pt_align_data;
        let triangles = ref_pt_data.get_ref_pts_triangulation().get_triangles();

        // Positions of reference points are relative to the intersection's origin
        let envelope = Rect{ x: 0, y: 0, width: intersection.width, height: intersection.height };

        // First, find the list of triangles valid in the current step

        self.curr_step_stacked_triangles.clear();
        for (tri_idx, tri) in triangles.iter().enumerate() {
            let tri_pos = [tri.v0, tri.v1, tri.v2].map(|v| ref_pt_data.get_ref_pt_pos(v, curr_img_idx));

            // A point may be outside the images' intersection at some times; such triangles are stacked
            // if any of their vertices is inside, and samples falling outside the current image are skipped
            if tri_pos.iter().all(|p| p.is_valid) && tri_pos.iter().any(|p| envelope.contains_point(&p.pos)) {
                self.curr_step_stacked_triangles.push(tri_idx);
            }
        }

        // Second, gather the triangles' contributions; every stack pixel belongs to a single triangle

        let rasterized_tris = &self.rasterized_tris;
        let flatfield_inv = self.flatfield_inv.as_ref();
        let stack_width = self.image_stack.get_width() as usize;
        let src = &img;

        let contributions: Vec<(usize, [f32; 3])> = self.curr_step_stacked_triangles.par_iter().flat_map_iter(|&tri_idx| {
            let tri = &triangles[tri_idx];
            let [p0, p1, p2] = [tri.v0, tri.v1, tri.v2].map(|v| {
                let pos = ref_pt_data.get_ref_pt_pos(v, curr_img_idx).pos + img_origin;
                (pos.x as f32, pos.y as f32)
            });

            rasterized_tris[tri_idx].iter().filter_map(move |stp| {
                let w = 1.0 - stp.u - stp.v;
                let srcx = stp.u * p0.0 + stp.v * p1.0 + w * p2.0;
                let srcy = stp.u * p0.1 + stp.v * p1.1 + w * p2.1;

                let mut values = interpolate_pixel_value(src, srcx, srcy)?;

                if let Some(ff_inv) = flatfield_inv {
                    // `ff_inv` contains inverted flat-field values, so multiply instead of dividing
                    let ffx = (srcx.round() as i32).clamp(0, ff_inv.get_width() as i32 - 1) as u32;
                    let ffy = (srcy.round() as i32).clamp(0, ff_inv.get_height() as i32 - 1) as u32;
                    let factor = ff_inv.get_line::<f32>(ffy)[ffx as usize];
                    for val in values.iter_mut().take(num_channels) {
                        *val *= factor;
                    }
                }

                Some((stp.y as usize * stack_width + stp.x as usize, values))
            })
        }).collect();

        let stack_pixels = self.image_stack.get_pixels_mut::<f32>();
        for (pix_idx, values) in contributions {
            for (ch, val) in values.iter().take(num_channels).enumerate() {
                stack_pixels[pix_idx * num_channels + ch] += val;
            }
            self.added_img_count[pix_idx] += 1;
        }

        log::debug!("image {}: stacked {} of {} triangles", curr_img_idx, self.curr_step_stacked_triangles.len(), triangles.len());

        self.first_step_complete = true;

        Ok(())
    }
}


/// Returns Mono32f image with `max/value` for every (positive) flat-field pixel value; non-positive values become 1.
fn invert_flatfield(flatfield: &Image) -> Image {
    let mut ffield_inv = flatfield.convert_pix_fmt(PixelFormat::Mono32f);

    let pixels = ffield_inv.get_pixels_mut::<f32>();
    let max_val = pixels.iter().copied().fold(0.0f32, f32::max);

    for pix in pixels.iter_mut() {
        *pix = if *pix > 0.0 { max_val / *pix } else { 1.0 };
    }

    ffield_inv
}


/// Returns lists of pixels belonging to `triangles` with vertices `vertices`.
///
/// Every pixel of the `width`x`height` area is assigned to exactly one triangle; pixels missed
/// by all triangles (due to rounding) are assigned to the triangle they are closest to.
///
fn rasterize_triangles(vertices: &[PointFlt], triangles: &[Triangle], width: u32, height: u32) -> Vec<Vec<StackTrianglePoint>> {
    let envelope = Rect{ x: 0, y: 0, width, height };
    let mut pixel_occupied = vec![false; width as usize * height as usize];

    let mut rasterized: Vec<Vec<StackTrianglePoint>> = triangles.iter().map(|tri| {
        rasterize_triangle(&vertices[tri.v0], &vertices[tri.v1], &vertices[tri.v2], envelope, &mut pixel_occupied)
    }).collect();

    let mut num_unclaimed = 0usize;

    for (idx, _) in pixel_occupied.iter().enumerate().filter(|(_, &occupied)| !occupied) {
        let pos = Point{ x: (idx % width as usize) as i32, y: (idx / width as usize) as i32 };

        // The closest triangle has the greatest minimum barycentric coordinate of `pos`
        let closest = triangles.iter().enumerate().filter_map(|(tri_idx, tri)| {
            let (u, v) = calc_barycentric_coords!(pos, vertices[tri.v0], vertices[tri.v1], vertices[tri.v2]);
            let min_coord = u.min(v).min(1.0 - u - v);
            if min_coord.is_nan() { None } else { Some((tri_idx, min_coord, u, v)) }
        }).max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((tri_idx, _, u, v)) = closest {
            rasterized[tri_idx].push(StackTrianglePoint{ x: pos.x, y: pos.y, u: u as f32, v: v as f32 });
            num_unclaimed += 1;
        }
    }

    if num_unclaimed > 0 {
        log::debug!("{} pixel(s) not covered by rasterized triangles assigned to the closest ones", num_unclaimed);
    }

    rasterized
}


/// Returns list of pixels belonging to triangle `(v0, v1, v2)`.
///
/// # Parameters
///
/// * `envelope` - Image region corresponding to `pixel_occupied`.
/// * `pixel_occupied` - Pixels of `envelope` (row-major order). If a pixel belongs
///                      to the rasterized triangle, will be set to `true`.
///
fn rasterize_triangle(v0: &PointFlt,
                      v1: &PointFlt,
                      v2: &PointFlt,
                      envelope: Rect,
                      pixel_occupied: &mut [bool]) -> Vec<StackTrianglePoint> {

    // Test every point of the rectangular axis-aligned bounding box of
    // the triangle (v0, v1, v2) and if it is inside triangle, add it
    // to the returned list.

    let mut points: Vec<StackTrianglePoint> = vec![];

    let xs = [v0.x, v1.x, v2.x];
    let ys = [v0.y, v1.y, v2.y];

    let xmin = max(envelope.x, xs.iter().copied().fold(f32::MAX, f32::min).floor() as i32);
    let xmax = (envelope.x + envelope.width as i32 - 1).min(xs.iter().copied().fold(f32::MIN, f32::max).ceil() as i32);
    let ymin = max(envelope.y, ys.iter().copied().fold(f32::MAX, f32::min).floor() as i32);
    let ymax = (envelope.y + envelope.height as i32 - 1).min(ys.iter().copied().fold(f32::MIN, f32::max).ceil() as i32);

    for y in ymin..=ymax {
        for x in xmin..=xmax {
            let is_pix_occupied = &mut pixel_occupied[(x - envelope.x + (y - envelope.y) * envelope.width as i32) as usize];
            if *is_pix_occupied {
                continue;
            }

            let (u, v) = calc_barycentric_coords!(Point{ x, y }, v0, v1, v2);
            if u >= -BARYCENTRIC_EPSILON && v >= -BARYCENTRIC_EPSILON && u + v <= 1.0 + BARYCENTRIC_EPSILON {
                points.push(StackTrianglePoint{ x, y, u: u as f32, v: v as f32 });
                *is_pix_occupied = true;
            }
        }
    }

    points
}


/// Normalizes `img_stack` using the specified counts of stacked images for each pixel.
///
/// Pixels with no stacked images stay unchanged. If `uses_flatfield` is true, the result is scaled
/// so that its maximum value is 1.0.
///
fn normalize_image_stack(added_img_count: &[usize], img_stack: &mut Image, uses_flatfield: bool) {
    let num_channels = image::get_num_channels(img_stack.get_pixel_format());
    let pixels = img_stack.get_pixels_mut::<f32>();

    for (pix, &count) in pixels.chunks_exact_mut(num_channels).zip(added_img_count) {
        for val in pix {
            *val /= max(1, count) as f32;
        }
    }

    if uses_flatfield {
        let max_stack_value = pixels.iter().copied().fold(0.0f32, f32::max);
        if max_stack_value > 0.0 {
            for pix in pixels.iter_mut() {
                *pix /= max_stack_value;
            }
        }
    }
}


/// Performs bilinear interpolation of pixel values of a Mono32f or RGB32f image.
///
/// Returns `None` if (`x`, `y`) lies outside the image. Unused channels of the result are zero.
///
fn interpolate_pixel_value(img: &Image, x: f32, y: f32) -> Option<[f32; 3]> {
    let (width, height) = (img.get_width(), img.get_height());

    if x < -SAMPLE_MARGIN || x > (width - 1) as f32 + SAMPLE_MARGIN ||
       y < -SAMPLE_MARGIN || y > (height - 1) as f32 + SAMPLE_MARGIN {
        return None;
    }

    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let num_channels = image::get_num_channels(img.get_pixel_format());

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width as usize - 1);
    let y1 = (y0 + 1).min(height as usize - 1);
    let tx = x - x0 as f32;
    let ty = y - y0 as f32;

    let line_lo = img.get_line::<f32>(y0 as u32);
    let line_hi = img.get_line::<f32>(y1 as u32);

    let mut result = [0.0f32; 3];
    for (ch, res) in result.iter_mut().enumerate().take(num_channels) {
        let v00 = line_lo[x0 * num_channels + ch];
        let v10 = line_lo[x1 * num_channels + ch];
        let v01 = line_hi[x0 * num_channels + ch];
        let v11 = line_hi[x1 * num_channels + ch];

        *res = (1.0 - ty) * ((1.0 - tx) * v00 + tx * v10) + ty * ((1.0 - tx) * v01 + tx * v11);
    }

    Some(result)
}
