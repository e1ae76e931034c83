//! Frame images and network input sampling.

use std::path::Path;

use anyhow::Context;
use image::{Rgba, RgbaImage};
use nalgebra::Point2;

use crate::{nn::CnnInputShape, resolution::Resolution};

/// An 8-bit sRGB frame with alpha channel.
///
/// This is the image type the pipeline consumes. The alpha channel is ignored.
#[derive(Clone)]
pub struct Image {
    buf: RgbaImage,
}

impl Image {
    /// Creates a black image of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buf: RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255])),
        }
    }

    /// Creates an image by calling `f` for every pixel, which returns RGB values.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 3]) -> Self {
        Self {
            buf: RgbaImage::from_fn(width, height, |x, y| {
                let [r, g, b] = f(x, y);
                Rgba([r, g, b, 255])
            }),
        }
    }

    /// Wraps a buffer of tightly packed RGBA8 pixels, as delivered by most capture APIs.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> anyhow::Result<Self> {
        let len = data.len();
        let buf = RgbaImage::from_raw(width, height, data).with_context(|| {
            format!("RGBA buffer of {len} bytes does not match resolution {width}x{height}")
        })?;
        Ok(Self { buf })
    }

    /// Loads an image from the filesystem (any format enabled in the `image` crate).
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let buf = image::open(path)
            .with_context(|| format!("failed to open image '{}'", path.display()))?
            .to_rgba8();
        Ok(Self { buf })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.buf.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.buf.height()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    /// Returns the RGB value of the pixel at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        let [r, g, b, _] = self.buf.get_pixel(x, y).0;
        [r, g, b]
    }

    fn get_or_black(&self, x: i64, y: i64) -> [f32; 3] {
        if x < 0 || y < 0 || x >= i64::from(self.width()) || y >= i64::from(self.height()) {
            return [0.0; 3];
        }
        self.get(x as u32, y as u32).map(|c| f32::from(c) / 255.0)
    }

    /// Bilinearly samples the image at continuous pixel coordinates, returning RGB in `[0, 1]`.
    ///
    /// Pixel `(x, y)` covers the area `[x, x + 1) × [y, y + 1)`, so its center is at
    /// `(x + 0.5, y + 0.5)`. Samples outside of the image blend towards black.
    pub fn sample_bilinear(&self, p: Point2<f32>) -> [f32; 3] {
        let x = p.x - 0.5;
        let y = p.y - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let tl = self.get_or_black(x0, y0);
        let tr = self.get_or_black(x0 + 1, y0);
        let bl = self.get_or_black(x0, y0 + 1);
        let br = self.get_or_black(x0 + 1, y0 + 1);

        let mut out = [0.0; 3];
        for c in 0..3 {
            let top = tl[c] + (tr[c] - tl[c]) * fx;
            let bottom = bl[c] + (br[c] - bl[c]) * fx;
            out[c] = top + (bottom - top) * fy;
        }
        out
    }

    /// Fills a square `size x size` network input tensor by sampling this image.
    ///
    /// `map` maps normalized tensor coordinates (`[0, 1]²`, sampled at tensor pixel centers) to
    /// pixel coordinates of this image. Color values are written in `[0, 1]`, in the order given
    /// by `layout`.
    ///
    /// # Panics
    ///
    /// Panics if `out` does not hold exactly `3 * size * size` values.
    pub fn sample_tensor(
        &self,
        size: u32,
        layout: CnnInputShape,
        out: &mut [f32],
        map: impl Fn(Point2<f32>) -> Point2<f32>,
    ) {
        let n = size as usize;
        assert_eq!(out.len(), 3 * n * n, "input tensor has wrong length");

        for ty in 0..n {
            for tx in 0..n {
                let uv = Point2::new(
                    (tx as f32 + 0.5) / size as f32,
                    (ty as f32 + 0.5) / size as f32,
                );
                let rgb = self.sample_bilinear(map(uv));
                for (c, value) in rgb.into_iter().enumerate() {
                    let index = match layout {
                        CnnInputShape::NCHW => c * n * n + ty * n + tx,
                        CnnInputShape::NHWC => (ty * n + tx) * 3 + c,
                    };
                    out[index] = value;
                }
            }
        }
    }
}
