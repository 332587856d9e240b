//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Image provider: images held in memory.
//

use crate::image::{Image, ImageError, PixelFormat};
use crate::img_seq::ImageProvider;


pub struct InMemoryImages {
    images: Vec<Image>
}


impl InMemoryImages {
    pub fn new(images: Vec<Image>) -> InMemoryImages {
        InMemoryImages{ images }
    }


    fn get(&self, idx: usize) -> Result<&Image, ImageError> {
        self.images.get(idx).ok_or(ImageError::IndexOutOfRange{ index: idx, count: self.images.len() })
    }
}


impl ImageProvider for InMemoryImages {
    fn get_img(&mut self, idx: usize) -> Result<Image, ImageError> {
        self.get(idx).cloned()
    }


    fn get_img_metadata(&self, idx: usize) -> Result<(u32, u32, PixelFormat), ImageError> {
        let img = self.get(idx)?;
        Ok((img.get_width(), img.get_height(), img.get_pixel_format()))
    }


    fn img_count(&self) -> usize {
        self.images.len()
    }


    fn deactivate(&mut self) {}
}
