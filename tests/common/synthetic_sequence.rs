use skry::defs::Point;
use skry::image::{Image, PixelFormat};


/// Brightness of a smooth, non-periodic pattern with blobs; varies in every direction.
pub fn texture_value(x: f64, y: f64) -> f64 {
    let mut v = 110.0
        + 35.0 * (0.23 * x + 0.07 * y).sin()
        + 30.0 * (0.17 * y - 0.05 * x + 1.3).cos();

    for i in 0..40 {
        let cx = ((i * 37 + 11) % 197) as f64;
        let cy = ((i * 61 + 29) % 193) as f64;
        let amp = if i % 2 == 0 { 60.0 } else { -45.0 };
        v += amp * (-((x - cx) * (x - cx) + (y - cy) * (y - cy)) / 30.0).exp();
    }

    v.clamp(0.0, 255.0)
}


/// Mono8 frame showing the texture moved by `shift`.
pub fn shifted_frame(width: u32, height: u32, shift: Point) -> Image {
    let pixels = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| texture_value(x as f64 - shift.x as f64, y as f64 - shift.y as f64).round() as u8)
        .collect();

    Image::from_pixels(width, height, PixelFormat::Mono8, None, pixels).unwrap()
}


/// Frame-to-frame jitter of the synthetic sequence.
pub const JITTER: [Point; 6] = [
    Point{ x: 0, y: 0 },
    Point{ x: 2, y: 1 },
    Point{ x: -3, y: 2 },
    Point{ x: 1, y: -2 },
    Point{ x: -1, y: -1 },
    Point{ x: 3, y: 3 }
];


pub fn jittered_sequence(width: u32, height: u32) -> Vec<Image> {
    JITTER.iter().map(|&shift| shifted_frame(width, height, shift)).collect()
}
