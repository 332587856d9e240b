//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Image provider: list of image files.
//

use crate::image::{Image, ImageError, PixelFormat};
use crate::img_seq::ImageProvider;
use std::path::PathBuf;


pub struct ImageList {
    file_names: Vec<PathBuf>
}


impl ImageList {
    pub fn new<P: Into<PathBuf> + Clone>(file_names: &[P]) -> ImageList {
        ImageList{ file_names: file_names.iter().cloned().map(Into::into).collect() }
    }
}


impl ImageProvider for ImageList {
    fn get_img(&mut self, idx: usize) -> Result<Image, ImageError> {
        log::trace!("loading {}", self.file_names[idx].display());
        Image::load(&self.file_names[idx])
    }


    fn get_img_metadata(&self, idx: usize) -> Result<(u32, u32, PixelFormat), ImageError> {
        Image::get_metadata(&self.file_names[idx])
    }


    fn img_count(&self) -> usize {
        self.file_names.len()
    }


    fn deactivate(&mut self) {
        // Do nothing
    }
}


#[cfg(test)]
mod tests {
    use crate::image::{Image, PixelFormat};
    use crate::img_seq::ImageSequence;
    use crate::test_utils;

    #[test]
    fn sequence_reads_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = vec![];
        for i in 0..3u8 {
            let path = dir.path().join(format!("frame{}.png", i));
            test_utils::mono8_from_fn(6, 5, |x, _| 10 * i + x as u8).save(&path).unwrap();
            paths.push(path);
        }

        let mut img_seq = ImageSequence::new_image_list(&paths);
        assert_eq!(3, img_seq.get_img_count());

        img_seq.seek_start();
        img_seq.seek_next().unwrap();
        img_seq.seek_next().unwrap();
        assert_eq!((6, 5, PixelFormat::Mono8), img_seq.get_curr_img_metadata().unwrap());

        let img: Image = img_seq.get_curr_img().unwrap();
        assert_eq!(&[20u8, 21, 22, 23, 24, 25], img.get_line::<u8>(0));
    }

    #[test]
    fn missing_file_is_reported() {
        let mut img_seq = ImageSequence::new_image_list(&["/nonexistent/frame.png"]);
        img_seq.seek_start();
        assert!(img_seq.get_curr_img().is_err());
    }
}
