//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Image structure.
//

use ::image as imageio;
use ::image::ImageDecoder;
use crate::defs::{Point, Rect};
use std::path::Path;
use thiserror::Error;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    /// 8 bits per pixel, values from a 256-entry palette.
    Pal8,
    Mono8,
    /// Channel order: R, G, B.
    RGB8,

    Mono16,
    RGB16,

    Mono32f,
    RGB32f,

    Mono64f,
    RGB64f
}


pub fn get_num_channels(pix_fmt: PixelFormat) -> usize {
    match pix_fmt {
        PixelFormat::Pal8    |
        PixelFormat::Mono8   |
        PixelFormat::Mono16  |
        PixelFormat::Mono32f |
        PixelFormat::Mono64f => 1,

        PixelFormat::RGB8   |
        PixelFormat::RGB16  |
        PixelFormat::RGB32f |
        PixelFormat::RGB64f => 3
    }
}


pub fn bytes_per_channel(pix_fmt: PixelFormat) -> usize {
    match pix_fmt {
        PixelFormat::Pal8 | PixelFormat::Mono8 | PixelFormat::RGB8 => 1,
        PixelFormat::Mono16 | PixelFormat::RGB16 => 2,
        PixelFormat::Mono32f | PixelFormat::RGB32f => 4,
        PixelFormat::Mono64f | PixelFormat::RGB64f => 8
    }
}


pub fn bytes_per_pixel(pix_fmt: PixelFormat) -> usize {
    get_num_channels(pix_fmt) * bytes_per_channel(pix_fmt)
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    pub pal: [u8; 3 * Palette::NUM_ENTRIES]
}


impl Palette {
    pub const NUM_ENTRIES: usize = 256;

    /// Returns a palette mapping index `i` to gray level `i`.
    pub fn grayscale() -> Palette {
        let mut pal = [0u8; 3 * Palette::NUM_ENTRIES];
        for (i, entry) in pal.chunks_exact_mut(3).enumerate() {
            entry.fill(i as u8);
        }
        Palette{ pal }
    }
}


impl Default for Palette {
    fn default() -> Palette { Palette{ pal: [0; 3 * Palette::NUM_ENTRIES] } }
}


#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Codec(#[from] imageio::ImageError),

    #[error("unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),

    #[error("pixel buffer has {actual} elements, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("image index {index} out of range (image count: {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("out of memory")]
    OutOfMemory
}


/// Pixel storage; the element type follows the pixel format's channel type.
#[derive(Clone, Debug, PartialEq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
    F64(Vec<f64>)
}


impl PixelBuffer {
    fn zeroed(pix_fmt: PixelFormat, len: usize) -> PixelBuffer {
        match bytes_per_channel(pix_fmt) {
            1 => PixelBuffer::U8(vec![0; len]),
            2 => PixelBuffer::U16(vec![0; len]),
            4 => PixelBuffer::F32(vec![0.0; len]),
            _ => PixelBuffer::F64(vec![0.0; len])
        }
    }


    /// Like `zeroed`, but reports allocation failure instead of aborting.
    fn try_zeroed(pix_fmt: PixelFormat, len: usize) -> Result<PixelBuffer, ImageError> {
        fn alloc<T: Copy + Default>(len: usize) -> Result<Vec<T>, ImageError> {
            let mut v = Vec::new();
            v.try_reserve_exact(len).map_err(|_| ImageError::OutOfMemory)?;
            v.resize(len, T::default());
            Ok(v)
        }

        Ok(match bytes_per_channel(pix_fmt) {
            1 => PixelBuffer::U8(alloc(len)?),
            2 => PixelBuffer::U16(alloc(len)?),
            4 => PixelBuffer::F32(alloc(len)?),
            _ => PixelBuffer::F64(alloc(len)?)
        })
    }


    fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::U16(v) => v.len(),
            PixelBuffer::F32(v) => v.len(),
            PixelBuffer::F64(v) => v.len()
        }
    }
}


/// Channel value type stored in a `PixelBuffer`.
pub trait PixelValue: Copy + Default + Send + Sync + 'static {
    /// Value corresponding to full brightness (1.0 for floating-point types).
    const MAX: f64;

    fn from_buffer(buf: &PixelBuffer) -> Option<&[Self]>;

    fn from_buffer_mut(buf: &mut PixelBuffer) -> Option<&mut [Self]>;

    fn to_f64(self) -> f64;

    /// Converts with rounding and saturation (for integer types).
    fn from_f64(value: f64) -> Self;
}


macro_rules! impl_pixel_value {
    ($t:ty, $variant:ident, $max:expr, $from_f64:expr) => {
        impl PixelValue for $t {
            const MAX: f64 = $max;

            fn from_buffer(buf: &PixelBuffer) -> Option<&[$t]> {
                match buf { PixelBuffer::$variant(v) => Some(v), _ => None }
            }

            fn from_buffer_mut(buf: &mut PixelBuffer) -> Option<&mut [$t]> {
                match buf { PixelBuffer::$variant(v) => Some(v), _ => None }
            }

            fn to_f64(self) -> f64 { self as f64 }

            fn from_f64(value: f64) -> $t { $from_f64(value) }
        }
    }
}


impl_pixel_value!(u8, U8, u8::MAX as f64, |v: f64| v.round().clamp(0.0, u8::MAX as f64) as u8);
impl_pixel_value!(u16, U16, u16::MAX as f64, |v: f64| v.round().clamp(0.0, u16::MAX as f64) as u16);
impl_pixel_value!(f32, F32, 1.0, |v: f64| v as f32);
impl_pixel_value!(f64, F64, 1.0, |v: f64| v);


#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    pix_fmt: PixelFormat,
    palette: Option<Palette>,
    pixels: PixelBuffer
}


impl Image {
    /// Creates a zero-filled image.
    pub fn new(width: u32, height: u32, pix_fmt: PixelFormat, palette: Option<Palette>) -> Image {
        let len = width as usize * height as usize * get_num_channels(pix_fmt);
        Image{ width, height, pix_fmt, palette, pixels: PixelBuffer::zeroed(pix_fmt, len) }
    }


    /// Creates a zero-filled image; fails with `ImageError::OutOfMemory` if the pixels cannot be allocated.
    pub fn try_new(width: u32, height: u32, pix_fmt: PixelFormat) -> Result<Image, ImageError> {
        let len = (width as usize).checked_mul(height as usize)
            .and_then(|n| n.checked_mul(get_num_channels(pix_fmt)))
            .ok_or(ImageError::OutOfMemory)?;

        Ok(Image{ width, height, pix_fmt, palette: None, pixels: PixelBuffer::try_zeroed(pix_fmt, len)? })
    }


    /// Creates an image from a pixel vector (rows stored consecutively, no padding).
    ///
    /// `T` must be the channel type of `pix_fmt`. A `Pal8` image without a palette
    /// gets a grayscale one.
    ///
    pub fn from_pixels<T: PixelValue>(width: u32,
                                      height: u32,
                                      pix_fmt: PixelFormat,
                                      palette: Option<Palette>,
                                      pixels: Vec<T>) -> Result<Image, ImageError> {
        let expected = width as usize * height as usize * get_num_channels(pix_fmt);
        if pixels.len() != expected {
            return Err(ImageError::BufferSize{ expected, actual: pixels.len() });
        }

        let any_pixels: Box<dyn std::any::Any> = Box::new(pixels);
        let buffer = match bytes_per_channel(pix_fmt) {
            1 => any_pixels.downcast::<Vec<u8>>().map(|v| PixelBuffer::U8(*v)),
            2 => any_pixels.downcast::<Vec<u16>>().map(|v| PixelBuffer::U16(*v)),
            4 => any_pixels.downcast::<Vec<f32>>().map(|v| PixelBuffer::F32(*v)),
            _ => any_pixels.downcast::<Vec<f64>>().map(|v| PixelBuffer::F64(*v))
        }.map_err(|_| ImageError::UnsupportedPixelFormat(
            format!("{:?} cannot be stored as {}", pix_fmt, std::any::type_name::<T>())))?;

        let palette = if pix_fmt == PixelFormat::Pal8 { Some(palette.unwrap_or_else(Palette::grayscale)) } else { palette };

        Ok(Image{ width, height, pix_fmt, palette, pixels: buffer })
    }


    pub fn get_width(&self) -> u32 { self.width }


    pub fn get_height(&self) -> u32 { self.height }


    pub fn get_pixel_format(&self) -> PixelFormat { self.pix_fmt }


    pub fn get_palette(&self) -> &Option<Palette> { &self.palette }


    pub fn get_img_rect(&self) -> Rect { Rect{ x: 0, y: 0, width: self.width, height: self.height } }


    pub fn get_pixel_buffer(&self) -> &PixelBuffer { &self.pixels }


    /// Number of channel values per line.
    pub fn get_values_per_line(&self) -> usize {
        self.width as usize * get_num_channels(self.pix_fmt)
    }


    /// Returns all pixels; `T` must match the pixel format's channel type.
    pub fn get_pixels<T: PixelValue>(&self) -> &[T] {
        match T::from_buffer(&self.pixels) {
            Some(pixels) => pixels,
            None => panic!("pixel type {} does not match pixel format {:?}", std::any::type_name::<T>(), self.pix_fmt)
        }
    }


    /// Returns all pixels; `T` must match the pixel format's channel type.
    pub fn get_pixels_mut<T: PixelValue>(&mut self) -> &mut [T] {
        let pix_fmt = self.pix_fmt;
        match T::from_buffer_mut(&mut self.pixels) {
            Some(pixels) => pixels,
            None => panic!("pixel type {} does not match pixel format {:?}", std::any::type_name::<T>(), pix_fmt)
        }
    }


    /// Returns pixels of a Mono8 image starting from `start`.
    pub fn get_mono8_pixels_from(&self, start: Point) -> &[u8] {
        assert!(self.pix_fmt == PixelFormat::Mono8);
        &self.get_pixels::<u8>()[start.y as usize * self.width as usize + start.x as usize ..]
    }


    pub fn get_line<T: PixelValue>(&self, y: u32) -> &[T] {
        let vpl = self.get_values_per_line();
        &self.get_pixels::<T>()[range!(y as usize * vpl, vpl)]
    }


    pub fn get_line_mut<T: PixelValue>(&mut self, y: u32) -> &mut [T] {
        let vpl = self.get_values_per_line();
        &mut self.get_pixels_mut::<T>()[range!(y as usize * vpl, vpl)]
    }


    /// Calculates and returns image moments: M00, M10, M01.
    fn get_moments<T: PixelValue>(&self, img_fragment: Rect) -> (f64, f64, f64) {
        let mut m00 = 0.0; // Sum of pixels' brightness
        let mut m10 = 0.0;
        let mut m01 = 0.0;

        let num_channels = get_num_channels(self.pix_fmt);

        for y in range!(img_fragment.y, img_fragment.height as i32) {
            let line = self.get_line::<T>(y as u32);
            for x in range!(img_fragment.x, img_fragment.width as i32) {
                let brightness: f64 = line[range!(num_channels * x as usize, num_channels)].iter().map(|v| v.to_f64()).sum();

                m00 += brightness;
                m10 += (x - img_fragment.x) as f64 * brightness;
                m01 += (y - img_fragment.y) as f64 * brightness;
            }
        }

        (m00, m10, m01)
    }


    /// Finds the centroid of the specified image fragment.
    ///
    /// Returned coords are relative to `img_fragment`. For `PixelFormat::Pal8` the palette indices
    /// are used as brightness values.
    ///
    pub fn get_centroid(&self, img_fragment: Rect) -> Point {
        let (m00, m10, m01) = match self.pixels {
            PixelBuffer::U8(_) => self.get_moments::<u8>(img_fragment),
            PixelBuffer::U16(_) => self.get_moments::<u16>(img_fragment),
            PixelBuffer::F32(_) => self.get_moments::<f32>(img_fragment),
            PixelBuffer::F64(_) => self.get_moments::<f64>(img_fragment)
        };

        if m00 == 0.0 {
            Point{ x: img_fragment.width as i32 / 2, y: img_fragment.height as i32 / 2 }
        } else {
            Point{ x: (m10 / m00) as i32, y: (m01 / m00) as i32 }
        }
    }


    /// Converts a fragment of the image to `dest_img`'s pixel format and writes it into `dest_img`.
    ///
    /// The fragment to convert starts at `src_pos` in `&self`, has `width`x`height` pixels and will
    /// be written to `dest_img` starting at `dest_pos`. Cropping is performed if necessary.
    /// Values are rescaled between channel types (e.g. 255 in Mono8 becomes 65535 in Mono16
    /// and 1.0 in Mono32f). Color is converted to mono by averaging the channels.
    /// `dest_img` must not be `PixelFormat::Pal8`.
    ///
    pub fn convert_pix_fmt_of_subimage_into(&self,
                                            dest_img: &mut Image,
                                            src_pos: Point,
                                            dest_pos: Point,
                                            width: u32,
                                            height: u32) {
        assert!(dest_img.pix_fmt != PixelFormat::Pal8, "conversion to a palettized format is not supported");

        let (dest_rect, src_start) = match self.clip_copy_region(dest_img, src_pos, width, height, dest_pos) {
            Some(region) => region,
            None => return
        };

        match &self.pixels {
            PixelBuffer::U8(src) => convert_from(self, src, src_start, dest_img, &dest_rect),
            PixelBuffer::U16(src) => convert_from(self, src, src_start, dest_img, &dest_rect),
            PixelBuffer::F32(src) => convert_from(self, src, src_start, dest_img, &dest_rect),
            PixelBuffer::F64(src) => convert_from(self, src, src_start, dest_img, &dest_rect)
        }
    }


    /// Converts a fragment of the image to the specified pixel format.
    ///
    /// The fragment to convert starts at `src_pos` and has `width`x`height` pixels.
    /// Areas outside the image are zero-filled.
    ///
    pub fn convert_pix_fmt_of_subimage(&self,
                                       dest_pix_fmt: PixelFormat,
                                       src_pos: Point,
                                       width: u32,
                                       height: u32) -> Image {
        if self.pix_fmt == dest_pix_fmt {
            return self.get_fragment_copy(src_pos, width, height);
        }

        let mut dest_img = Image::new(width, height, dest_pix_fmt, None);
        self.convert_pix_fmt_of_subimage_into(&mut dest_img, src_pos, Point::default(), width, height);

        dest_img
    }


    /// Returns the image converted to the specified pixel format.
    pub fn convert_pix_fmt(&self, dest_pix_fmt: PixelFormat) -> Image {
        self.convert_pix_fmt_of_subimage(dest_pix_fmt, Point::default(), self.width, self.height)
    }


    /// Returns a copy of image's fragment. The fragment boundaries may extend outside of the image.
    ///
    /// The fragment to copy is `width`x`height` pixels and starts at `src_pos`.
    /// Fragment's areas outside of the image are zero.
    ///
    pub fn get_fragment_copy(&self, src_pos: Point, width: u32, height: u32) -> Image {
        let mut dest_img = Image::new(width, height, self.pix_fmt, self.palette);
        self.resize_and_translate_into(&mut dest_img, src_pos, width, height, Point::default(), false);
        dest_img
    }


    /// Copies (with cropping or padding) a fragment of image to another. There is no scaling.
    ///
    /// Pixel formats of source and destination must be the same.
    /// The fragment to copy is `width`x`height` pixels and starts at `src_pos` in `&self`
    /// and at `dest_pos` at `dest_img`. If `clear_to_zero` is true, `dest_img`'s areas not copied on
    /// will be cleared to zero.
    ///
    pub fn resize_and_translate_into(&self,
                                     dest_img: &mut Image,
                                     src_pos: Point,
                                     width: u32,
                                     height: u32,
                                     dest_pos: Point,
                                     clear_to_zero: bool) {
        assert!(self.pix_fmt == dest_img.pix_fmt);

        let copy_region = self.clip_copy_region(dest_img, src_pos, width, height, dest_pos);

        if clear_to_zero {
            dest_img.clear_outside(copy_region.map(|(dest_rect, _)| dest_rect));
        }

        let (dest_rect, src_start) = match copy_region { Some(r) => r, None => return };
        let num_ch = get_num_channels(self.pix_fmt);
        let (src_w, dest_w) = (self.width, dest_img.width);

        match (&self.pixels, &mut dest_img.pixels) {
            (PixelBuffer::U8(src), PixelBuffer::U8(dest)) => copy_rect(src, src_w, dest, dest_w, num_ch, src_start, &dest_rect),
            (PixelBuffer::U16(src), PixelBuffer::U16(dest)) => copy_rect(src, src_w, dest, dest_w, num_ch, src_start, &dest_rect),
            (PixelBuffer::F32(src), PixelBuffer::F32(dest)) => copy_rect(src, src_w, dest, dest_w, num_ch, src_start, &dest_rect),
            (PixelBuffer::F64(src), PixelBuffer::F64(dest)) => copy_rect(src, src_w, dest, dest_w, num_ch, src_start, &dest_rect),
            _ => unreachable!("pixel buffers of equal pixel formats have the same type")
        }
    }


    /// Clips a `width`x`height` copy from `src_pos` (in `self`) to `dest_pos` (in `dest_img`) against both images.
    ///
    /// Returns the destination rectangle and the corresponding source start position.
    ///
    fn clip_copy_region(&self, dest_img: &Image, src_pos: Point, width: u32, height: u32, dest_pos: Point) -> Option<(Rect, Point)> {
        let shift = dest_pos - src_pos;

        Rect{ x: src_pos.x, y: src_pos.y, width, height }
            .intersection(&self.get_img_rect())
            .and_then(|src_rect| Rect{ x: src_rect.x + shift.x, y: src_rect.y + shift.y, ..src_rect }
                                     .intersection(&dest_img.get_img_rect()))
            .map(|dest_rect| (dest_rect, dest_rect.get_pos() - shift))
    }


    /// Zeroes all pixels except those in `keep`.
    fn clear_outside(&mut self, keep: Option<Rect>) {
        fn clear<T: PixelValue>(pixels: &mut [T], vpl: usize, num_ch: usize, keep: Option<Rect>) {
            for (y, line) in pixels.chunks_exact_mut(vpl).enumerate() {
                match keep {
                    Some(k) if (y as i32) >= k.y && (y as i32) < k.y + k.height as i32 => {
                        line[..k.x as usize * num_ch].fill(T::default());
                        line[(k.x as usize + k.width as usize) * num_ch..].fill(T::default());
                    },
                    _ => line.fill(T::default())
                }
            }
        }

        let num_ch = get_num_channels(self.pix_fmt);
        let vpl = self.get_values_per_line();
        if vpl == 0 { return; }

        match &mut self.pixels {
            PixelBuffer::U8(p) => clear(p, vpl, num_ch, keep),
            PixelBuffer::U16(p) => clear(p, vpl, num_ch, keep),
            PixelBuffer::F32(p) => clear(p, vpl, num_ch, keep),
            PixelBuffer::F64(p) => clear(p, vpl, num_ch, keep)
        }
    }


    /// Loads an image file; the format is determined from contents (BMP, PNG, TIFF, JPEG).
    ///
    /// Alpha channels are discarded.
    ///
    pub fn load<P: AsRef<Path>>(file_name: P) -> Result<Image, ImageError> {
        let dynimg = imageio::ImageReader::open(file_name)?.with_guessed_format()?.decode()?;
        let (width, height) = (dynimg.width(), dynimg.height());

        match dynimg {
            imageio::DynamicImage::ImageLuma8(buf) => Image::from_pixels(width, height, PixelFormat::Mono8, None, buf.into_raw()),
            imageio::DynamicImage::ImageLumaA8(_) => Image::from_pixels(width, height, PixelFormat::Mono8, None, dynimg.to_luma8().into_raw()),
            imageio::DynamicImage::ImageLuma16(buf) => Image::from_pixels(width, height, PixelFormat::Mono16, None, buf.into_raw()),
            imageio::DynamicImage::ImageLumaA16(_) => Image::from_pixels(width, height, PixelFormat::Mono16, None, dynimg.to_luma16().into_raw()),
            imageio::DynamicImage::ImageRgb8(buf) => Image::from_pixels(width, height, PixelFormat::RGB8, None, buf.into_raw()),
            imageio::DynamicImage::ImageRgb16(buf) => Image::from_pixels(width, height, PixelFormat::RGB16, None, buf.into_raw()),
            imageio::DynamicImage::ImageRgba16(_) => Image::from_pixels(width, height, PixelFormat::RGB16, None, dynimg.to_rgb16().into_raw()),
            imageio::DynamicImage::ImageRgb32F(buf) => Image::from_pixels(width, height, PixelFormat::RGB32f, None, buf.into_raw()),
            imageio::DynamicImage::ImageRgba32F(_) => Image::from_pixels(width, height, PixelFormat::RGB32f, None, dynimg.to_rgb32f().into_raw()),
            _ => Image::from_pixels(width, height, PixelFormat::RGB8, None, dynimg.to_rgb8().into_raw())
        }
    }


    /// Saves the image; the file format is determined from the extension.
    ///
    /// Floating-point images are stored as 16-bit integer ones (values clamped to [0; 1]);
    /// palettized images as RGB8.
    ///
    pub fn save<P: AsRef<Path>>(&self, file_name: P) -> Result<(), ImageError> {
        let storable = match self.pix_fmt {
            PixelFormat::Pal8 => self.convert_pix_fmt(PixelFormat::RGB8),
            PixelFormat::Mono32f | PixelFormat::Mono64f => self.convert_pix_fmt(PixelFormat::Mono16),
            PixelFormat::RGB32f | PixelFormat::RGB64f => self.convert_pix_fmt(PixelFormat::RGB16),
            _ => self.clone()
        };

        let (width, height) = (storable.width, storable.height);
        let expected = width as usize * height as usize * get_num_channels(storable.pix_fmt);
        let actual = storable.pixels.len();
        let size_error = move || ImageError::BufferSize{ expected, actual };

        let dynimg = match (storable.pix_fmt, storable.pixels) {
            (PixelFormat::Mono8, PixelBuffer::U8(v)) =>
                imageio::DynamicImage::ImageLuma8(imageio::GrayImage::from_raw(width, height, v).ok_or_else(size_error)?),

            (PixelFormat::RGB8, PixelBuffer::U8(v)) =>
                imageio::DynamicImage::ImageRgb8(imageio::RgbImage::from_raw(width, height, v).ok_or_else(size_error)?),

            (PixelFormat::Mono16, PixelBuffer::U16(v)) =>
                imageio::DynamicImage::ImageLuma16(imageio::ImageBuffer::from_raw(width, height, v).ok_or_else(size_error)?),

            (PixelFormat::RGB16, PixelBuffer::U16(v)) =>
                imageio::DynamicImage::ImageRgb16(imageio::ImageBuffer::from_raw(width, height, v).ok_or_else(size_error)?),

            (pix_fmt, _) => return Err(ImageError::UnsupportedPixelFormat(format!("{:?}", pix_fmt)))
        };

        dynimg.save(file_name)?;
        Ok(())
    }


    /// Returns width, height and pixel format of an image file without decoding its pixels.
    ///
    /// The pixel format is the one `Image::load` would produce.
    ///
    pub fn get_metadata<P: AsRef<Path>>(file_name: P) -> Result<(u32, u32, PixelFormat), ImageError> {
        let decoder = imageio::ImageReader::open(file_name)?.with_guessed_format()?.into_decoder()?;
        let (width, height) = decoder.dimensions();

        Ok((width, height, pix_fmt_from_color_type(decoder.color_type())))
    }
}


fn pix_fmt_from_color_type(color_type: imageio::ColorType) -> PixelFormat {
    match color_type {
        imageio::ColorType::L8 | imageio::ColorType::La8 => PixelFormat::Mono8,
        imageio::ColorType::L16 | imageio::ColorType::La16 => PixelFormat::Mono16,
        imageio::ColorType::Rgb16 | imageio::ColorType::Rgba16 => PixelFormat::RGB16,
        imageio::ColorType::Rgb32F | imageio::ColorType::Rgba32F => PixelFormat::RGB32f,
        _ => PixelFormat::RGB8
    }
}


/// Copies `dest_rect` from `src` (starting at `src_start`) to `dest`.
fn copy_rect<T: PixelValue>(src: &[T],
                            src_width: u32,
                            dest: &mut [T],
                            dest_width: u32,
                            num_ch: usize,
                            src_start: Point,
                            dest_rect: &Rect) {
    let src_vpl = src_width as usize * num_ch;
    let dest_vpl = dest_width as usize * num_ch;
    let line_len = dest_rect.width as usize * num_ch;

    for row in 0..dest_rect.height as usize {
        let src_ofs = (src_start.y as usize + row) * src_vpl + src_start.x as usize * num_ch;
        let dest_ofs = (dest_rect.y as usize + row) * dest_vpl + dest_rect.x as usize * num_ch;
        dest[range!(dest_ofs, line_len)].copy_from_slice(&src[range!(src_ofs, line_len)]);
    }
}


fn convert_from<S: PixelValue>(src_img: &Image, src: &[S], src_start: Point, dest_img: &mut Image, dest_rect: &Rect) {
    let dest_ch = get_num_channels(dest_img.pix_fmt);
    let dest_width = dest_img.width;
    match &mut dest_img.pixels {
        PixelBuffer::U8(dest) => convert_region(src_img, src, src_start, dest, dest_ch, dest_width, dest_rect),
        PixelBuffer::U16(dest) => convert_region(src_img, src, src_start, dest, dest_ch, dest_width, dest_rect),
        PixelBuffer::F32(dest) => convert_region(src_img, src, src_start, dest, dest_ch, dest_width, dest_rect),
        PixelBuffer::F64(dest) => convert_region(src_img, src, src_start, dest, dest_ch, dest_width, dest_rect)
    }
}


fn convert_region<S: PixelValue, D: PixelValue>(src_img: &Image,
                                                src: &[S],
                                                src_start: Point,
                                                dest: &mut [D],
                                                dest_ch: usize,
                                                dest_width: u32,
                                                dest_rect: &Rect) {
    let src_ch = get_num_channels(src_img.pix_fmt);
    let src_vpl = src_img.width as usize * src_ch;
    let dest_vpl = dest_width as usize * dest_ch;
    let palette = if src_img.pix_fmt == PixelFormat::Pal8 { src_img.palette } else { None };
    let width = dest_rect.width as usize;

    for row in 0..dest_rect.height as usize {
        let src_line = &src[range!((src_start.y as usize + row) * src_vpl + src_start.x as usize * src_ch, width * src_ch)];
        let dest_line = &mut dest[range!((dest_rect.y as usize + row) * dest_vpl + dest_rect.x as usize * dest_ch, width * dest_ch)];

        for (s, d) in src_line.chunks_exact(src_ch).zip(dest_line.chunks_exact_mut(dest_ch)) {
            // Normalized to [0; 1]
            let rgb: [f64; 3] = match palette {
                Some(ref pal) => {
                    let entry = &pal.pal[range!(3 * s[0].to_f64() as usize, 3)];
                    [entry[0] as f64 / 255.0, entry[1] as f64 / 255.0, entry[2] as f64 / 255.0]
                },
                None if src_ch == 1 => [s[0].to_f64() / S::MAX; 3],
                None => [s[0].to_f64() / S::MAX, s[1].to_f64() / S::MAX, s[2].to_f64() / S::MAX]
            };

            if dest_ch == 1 {
                let mono = if src_ch == 1 && palette.is_none() { rgb[0] } else { (rgb[0] + rgb[1] + rgb[2]) / 3.0 };
                d[0] = D::from_f64(mono * D::MAX);
            } else {
                for (dv, v) in d.iter_mut().zip(rgb) {
                    *dv = D::from_f64(v * D::MAX);
                }
            }
        }
    }
}
