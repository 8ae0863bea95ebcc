//! Frame → planar float tensor.
//!
//! Every frame is stretched (aspect ratio is not preserved) so that, once
//! rotated by the frame's orientation, it matches the model's input size. It
//! is then written channel-major as `(byte / 255 - mean) / std`.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel, Rgb, Rgba};
use ndarray::{Array4, ArrayD};

use crate::error::AnalyzerError;
use crate::pipeline::Preprocessor;
use crate::types::{FrameView, InputCfg, InputSpec, PixelFormat};

pub struct ImagePreprocessor {
    spec: InputSpec,
    mean: [f32; 3],
    std: [f32; 3],
    filter: FilterType,
}

impl ImagePreprocessor {
    pub fn new(spec: InputSpec, cfg: &InputCfg) -> Self {
        Self {
            spec,
            mean: cfg.mean,
            std: cfg.std,
            filter: cfg.resize_filter.into(),
        }
    }

    /// Value a zero byte maps to in channel `c`.
    pub fn zero_level(&self, c: usize) -> f32 {
        (0.0 - self.mean[c]) / self.std[c]
    }

    fn tensor_from<P>(&self, frame: &FrameView<'_>) -> Result<Array4<f32>, AnalyzerError>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let src: ImageBuffer<P, &[u8]> = ImageBuffer::from_raw(frame.width, frame.height, frame.pixels)
            .ok_or_else(|| {
                AnalyzerError::Preprocess(format!(
                    "pixel buffer of {} bytes is too small for {}x{} {:?}",
                    frame.pixels.len(),
                    frame.width,
                    frame.height,
                    frame.format
                ))
            })?;

        let turns = quarter_turns(frame.rotation_degrees)?;
        let (w, h) = (self.spec.width as u32, self.spec.height as u32);
        // odd quarter turns swap the axes, so resize to the transposed target
        let (w, h) = if turns % 2 == 1 { (h, w) } else { (w, h) };
        let resized = imageops::resize(&src, w, h, self.filter);
        let oriented = match turns {
            0 => resized,
            1 => imageops::rotate90(&resized),
            2 => imageops::rotate180(&resized),
            _ => imageops::rotate270(&resized),
        };
        Ok(planar(&oriented, self.mean, self.std))
    }
}

impl Preprocessor for ImagePreprocessor {
    fn run(&self, frame: FrameView<'_>) -> Result<ArrayD<f32>, AnalyzerError> {
        if frame.width == 0 || frame.height == 0 || frame.pixels.is_empty() {
            return Err(AnalyzerError::Preprocess("empty frame".into()));
        }
        let tensor = match frame.format {
            PixelFormat::Rgb8 => self.tensor_from::<Rgb<u8>>(&frame)?,
            PixelFormat::Rgba8 => self.tensor_from::<Rgba<u8>>(&frame)?,
        };
        Ok(tensor.into_dyn())
    }
}

/// Clockwise quarter turns for a rotation in degrees.
pub fn quarter_turns(degrees: i32) -> Result<u8, AnalyzerError> {
    let normalized = degrees.rem_euclid(360);
    if normalized % 90 != 0 {
        return Err(AnalyzerError::Preprocess(format!(
            "unsupported rotation of {} degrees",
            degrees
        )));
    }
    Ok((normalized / 90) as u8)
}

/// Interleaved pixels → (1, 3, H, W); alpha is ignored.
pub fn planar<P>(image: &ImageBuffer<P, Vec<u8>>, mean: [f32; 3], std: [f32; 3]) -> Array4<f32>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = image.dimensions();
    Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        let byte = image.get_pixel(x as u32, y as u32).channels()[c];
        (byte as f32 / 255.0 - mean[c]) / std[c]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use ndarray::Ix4;

    fn preprocessor() -> ImagePreprocessor {
        let cfg = InputCfg::default();
        let spec = InputSpec { batch: 1, channels: 3, height: 256, width: 256 };
        ImagePreprocessor::new(spec, &cfg)
    }

    #[test]
    fn test_black_frame_fills_zero_level() {
        let pre = preprocessor();
        let pixels = vec![0u8; 10 * 10 * 3];
        let frame = FrameView { pixels: &pixels, width: 10, height: 10, format: PixelFormat::Rgb8, rotation_degrees: 0 };

        let tensor = pre.run(frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 256, 256]);
        for c in 0..3 {
            let expected = pre.zero_level(c);
            let plane = tensor.index_axis(ndarray::Axis(1), c);
            assert!(plane.iter().all(|v| (v - expected).abs() < 1e-6));
        }
    }

    #[test]
    fn test_layout_is_channel_row_column() {
        let cfg = InputCfg { mean: [0.0; 3], std: [1.0; 3], ..InputCfg::default() };
        let spec = InputSpec { batch: 1, channels: 3, height: 2, width: 2 };
        let pre = ImagePreprocessor::new(spec, &cfg);

        let mut img = RgbImage::new(2, 2);
        img.put_pixel(1, 0, Rgb([255, 0, 51]));
        let frame = FrameView { pixels: img.as_raw(), width: 2, height: 2, format: PixelFormat::Rgb8, rotation_degrees: 0 };

        let tensor = pre.run(frame).unwrap().into_dimensionality::<Ix4>().unwrap();
        assert_eq!(tensor[[0, 0, 0, 1]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 1]], 0.0);
        assert!((tensor[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 1, 0]], 0.0);
    }

    #[test]
    fn test_rotation_moves_pixels_clockwise() {
        let cfg = InputCfg { mean: [0.0; 3], std: [1.0; 3], ..InputCfg::default() };
        let spec = InputSpec { batch: 1, channels: 3, height: 2, width: 2 };
        let pre = ImagePreprocessor::new(spec, &cfg);

        // white pixel at top-left ends up top-right after 90 degrees
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 255, 255]));
        let frame = FrameView { pixels: img.as_raw(), width: 2, height: 2, format: PixelFormat::Rgb8, rotation_degrees: 90 };

        let tensor = pre.run(frame).unwrap().into_dimensionality::<Ix4>().unwrap();
        assert_eq!(tensor[[0, 0, 0, 1]], 1.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_stretch_ignores_aspect_ratio() {
        let pre = preprocessor();
        let pixels = vec![255u8; 40 * 10 * 4];
        let frame = FrameView { pixels: &pixels, width: 40, height: 10, format: PixelFormat::Rgba8, rotation_degrees: 270 };

        let tensor = pre.run(frame).unwrap().into_dimensionality::<Ix4>().unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 256, 256]);
        let white = (1.0 - 0.485) / 0.229;
        assert!((tensor[[0, 0, 0, 0]] - white).abs() < 1e-5);
        assert!((tensor[[0, 0, 255, 255]] - white).abs() < 1e-5);
    }

    #[test]
    fn test_non_square_input_keeps_shape_under_rotation() {
        let cfg = InputCfg::default();
        let spec = InputSpec { batch: 1, channels: 3, height: 224, width: 256 };
        let pre = ImagePreprocessor::new(spec.clone(), &cfg);
        let pixels = vec![0u8; 10 * 10 * 3];

        for rotation in [0, 90, 180, 270] {
            let frame = FrameView { pixels: &pixels, width: 10, height: 10, format: PixelFormat::Rgb8, rotation_degrees: rotation };
            let tensor = pre.run(frame).unwrap();
            assert_eq!(tensor.shape(), &[1, 3, 224, 256], "rotation {}", rotation);
            assert!(spec.validate(tensor.shape()).is_ok());
        }
    }

    #[test]
    fn test_quarter_turn_on_non_square_target() {
        let cfg = InputCfg { mean: [0.0; 3], std: [1.0; 3], ..InputCfg::default() };
        let spec = InputSpec { batch: 1, channels: 3, height: 2, width: 3 };
        let pre = ImagePreprocessor::new(spec, &cfg);

        // 2 wide, 3 tall; white top-left lands top-right after 90 degrees
        let mut img = RgbImage::new(2, 3);
        img.put_pixel(0, 0, Rgb([255, 255, 255]));
        let frame = FrameView { pixels: img.as_raw(), width: 2, height: 3, format: PixelFormat::Rgb8, rotation_degrees: 90 };

        let tensor = pre.run(frame).unwrap().into_dimensionality::<Ix4>().unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 2, 3]);
        assert_eq!(tensor[[0, 0, 0, 2]], 1.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_rejects_empty_and_short_frames() {
        let pre = preprocessor();
        let empty = FrameView { pixels: &[], width: 0, height: 0, format: PixelFormat::Rgb8, rotation_degrees: 0 };
        assert!(matches!(pre.run(empty), Err(AnalyzerError::Preprocess(_))));

        let pixels = vec![0u8; 5];
        let short = FrameView { pixels: &pixels, width: 4, height: 4, format: PixelFormat::Rgb8, rotation_degrees: 0 };
        assert!(matches!(pre.run(short), Err(AnalyzerError::Preprocess(_))));
    }

    #[test]
    fn test_quarter_turns() {
        assert_eq!(quarter_turns(0).unwrap(), 0);
        assert_eq!(quarter_turns(90).unwrap(), 1);
        assert_eq!(quarter_turns(-90).unwrap(), 3);
        assert_eq!(quarter_turns(540).unwrap(), 2);
        assert!(quarter_turns(45).is_err());
    }
}
