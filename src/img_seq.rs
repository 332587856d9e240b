//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Image sequence.
//

use crate::image::{Image, ImageError, PixelFormat};
use crate::img_list::ImageList;
use crate::img_mem::InMemoryImages;
use std::path::PathBuf;


/// Image provider used by `ImageSequence`.
pub trait ImageProvider {
    fn img_count(&self) -> usize;

    fn get_img(&mut self, idx: usize) -> Result<Image, ImageError>;

    /// Returns width, height, pixel format.
    fn get_img_metadata(&self, idx: usize) -> Result<(u32, u32, PixelFormat), ImageError>;

    /// Releases any resources held between reads.
    fn deactivate(&mut self);
}


#[derive(Debug, PartialEq, Eq)]
pub enum SeekResult {
    NoMoreImages
}


pub struct ImageSequence {
    img_provider: Box<dyn ImageProvider>,

    active_flags: Vec<bool>,

    curr_img_idx: usize,

    curr_img_idx_within_active_subset: usize,

    num_active_imgs: usize,

    /// Cache of the most recently loaded image and its index.
    last_loaded: Option<(usize, Image)>
}


impl ImageSequence {
    pub fn new(img_provider: Box<dyn ImageProvider>) -> ImageSequence {
        let num_images = img_provider.img_count();

        ImageSequence {
            img_provider,
            active_flags: vec![true; num_images],
            curr_img_idx: 0,
            curr_img_idx_within_active_subset: 0,
            num_active_imgs: num_images,
            last_loaded: None
        }
    }


    pub fn new_image_list<P: Into<PathBuf> + Clone>(file_names: &[P]) -> ImageSequence {
        ImageSequence::new(Box::new(ImageList::new(file_names)))
    }


    pub fn new_in_memory(images: Vec<Image>) -> ImageSequence {
        ImageSequence::new(Box::new(InMemoryImages::new(images)))
    }


    fn get_img(&mut self, idx: usize) -> Result<Image, ImageError> {
        let count = self.img_provider.img_count();
        if idx >= count {
            return Err(ImageError::IndexOutOfRange{ index: idx, count });
        }

        if let Some((loaded_idx, img)) = &self.last_loaded {
            if *loaded_idx == idx {
                return Ok(img.clone());
            }
        }

        let img = self.img_provider.get_img(idx)?;
        self.last_loaded = Some((idx, img.clone()));

        Ok(img)
    }


    pub fn get_curr_img_idx(&self) -> usize {
        self.curr_img_idx
    }


    pub fn get_curr_img_idx_within_active_subset(&self) -> usize {
        self.curr_img_idx_within_active_subset
    }


    pub fn get_img_count(&self) -> usize {
        self.img_provider.img_count()
    }


    /// Seeks to the first active image.
    ///
    /// If no image is active, the current index is left at the end of the sequence.
    ///
    pub fn seek_start(&mut self) {
        self.curr_img_idx = self.active_flags.iter().position(|&active| active).unwrap_or(self.active_flags.len());
        self.curr_img_idx_within_active_subset = 0;
    }


    /// Seeks forward to the next active image.
    pub fn seek_next(&mut self) -> Result<(), SeekResult> {
        let next = self.active_flags.iter()
            .enumerate()
            .skip(self.curr_img_idx + 1)
            .find(|(_, &active)| active)
            .map(|(idx, _)| idx);

        match next {
            Some(idx) => {
                self.curr_img_idx = idx;
                self.curr_img_idx_within_active_subset += 1;
                Ok(())
            },
            None => Err(SeekResult::NoMoreImages)
        }
    }


    pub fn get_curr_img(&mut self) -> Result<Image, ImageError> {
        let idx_to_load = self.curr_img_idx;
        self.get_img(idx_to_load)
    }


    /// Returns (width, height, pixel format).
    pub fn get_curr_img_metadata(&mut self) -> Result<(u32, u32, PixelFormat), ImageError> {
        if let Some((loaded_idx, img)) = &self.last_loaded {
            if *loaded_idx == self.curr_img_idx {
                return Ok((img.get_width(), img.get_height(), img.get_pixel_format()));
            }
        }

        let count = self.img_provider.img_count();
        if self.curr_img_idx >= count {
            return Err(ImageError::IndexOutOfRange{ index: self.curr_img_idx, count });
        }

        self.img_provider.get_img_metadata(self.curr_img_idx)
    }


    pub fn get_img_by_index(&mut self, idx: usize) -> Result<Image, ImageError> {
        self.get_img(idx)
    }


    /// Should be called when the sequence will not be read for some time.
    pub fn deactivate(&mut self) {
        self.img_provider.deactivate()
    }


    /// Marks images as active. Element count of `is_active` must equal the number of images in the sequence.
    pub fn set_active_imgs(&mut self, is_active: &[bool]) {
        assert!(is_active.len() == self.active_flags.len());
        self.active_flags.clear();
        self.active_flags.extend_from_slice(is_active);

        self.num_active_imgs = self.active_flags.iter().filter(|&&active| active).count();
    }


    pub fn is_img_active(&self, img_idx: usize) -> bool {
        self.active_flags[img_idx]
    }


    /// Element count of the result equals the number of images in the sequence.
    pub fn get_img_active_flags(&self) -> &[bool] {
        &self.active_flags[..]
    }


    pub fn get_active_img_count(&self) -> usize {
        self.num_active_imgs
    }


    /// Translates index in the active images' subset into absolute index.
    ///
    /// Returns the image count if `active_img_idx` is not less than the number of active images.
    ///
    pub fn get_absolute_img_idx(&self, active_img_idx: usize) -> usize {
        self.active_flags.iter()
            .enumerate()
            .filter(|(_, &active)| active)
            .nth(active_img_idx)
            .map_or(self.active_flags.len(), |(idx, _)| idx)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn sequence(count: usize) -> ImageSequence {
        ImageSequence::new_in_memory((0..count).map(|i| test_utils::mono8_from_fn(4, 4, |_, _| i as u8)).collect())
    }

    #[test]
    fn seek_visits_only_active_images() {
        let mut img_seq = sequence(5);
        img_seq.set_active_imgs(&[false, true, false, true, true]);
        assert_eq!(3, img_seq.get_active_img_count());

        img_seq.seek_start();
        let mut visited = vec![(img_seq.get_curr_img_idx(), img_seq.get_curr_img_idx_within_active_subset())];
        while img_seq.seek_next().is_ok() {
            visited.push((img_seq.get_curr_img_idx(), img_seq.get_curr_img_idx_within_active_subset()));
        }

        assert_eq!(vec![(1, 0), (3, 1), (4, 2)], visited);
        assert_eq!(Err(SeekResult::NoMoreImages), img_seq.seek_next());
    }

    #[test]
    fn absolute_index_of_active_image() {
        let mut img_seq = sequence(4);
        img_seq.set_active_imgs(&[true, false, false, true]);

        assert_eq!(0, img_seq.get_absolute_img_idx(0));
        assert_eq!(3, img_seq.get_absolute_img_idx(1));
        assert_eq!(4, img_seq.get_absolute_img_idx(2));
    }

    #[test]
    fn current_image_is_loaded_from_provider() {
        let mut img_seq = sequence(3);
        img_seq.seek_start();
        img_seq.seek_next().unwrap();

        let img = img_seq.get_curr_img().unwrap();
        assert_eq!(1, img.get_pixels::<u8>()[0]);
        assert_eq!((4, 4, PixelFormat::Mono8), img_seq.get_curr_img_metadata().unwrap());
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let mut img_seq = sequence(2);
        assert!(matches!(img_seq.get_img_by_index(2), Err(ImageError::IndexOutOfRange{ index: 2, count: 2 })));
    }
}
