use std::fmt;

use image::{DynamicImage, RgbImage, RgbaImage};

use crate::error::DecodeError;

/// Channel layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb,
    Rgba,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// Interleaved 8-bit pixels, row-major, no padding.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Zero-filled buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    pub fn from_raw(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(DecodeError::InvalidBuffer(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Convert a decoded image, keeping alpha only when the source has it.
    pub fn from_image(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        if image.color().has_alpha() {
            Self {
                width,
                height,
                format: PixelFormat::Rgba,
                data: image.into_rgba8().into_raw(),
            }
        } else {
            Self {
                width,
                height,
                format: PixelFormat::Rgb,
                data: image.into_rgb8().into_raw(),
            }
        }
    }

    pub fn into_image(self) -> Option<DynamicImage> {
        match self.format {
            PixelFormat::Rgb => RgbImage::from_raw(self.width, self.height, self.data)
                .map(DynamicImage::ImageRgb8),
            PixelFormat::Rgba => RgbaImage::from_raw(self.width, self.height, self.data)
                .map(DynamicImage::ImageRgba8),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.format.bytes_per_pixel()
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let start = self.offset(x, y);
        &self.data[start..start + self.format.bytes_per_pixel()]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: &[u8]) {
        let bpp = self.format.bytes_per_pixel();
        let start = self.offset(x, y);
        self.data[start..start + bpp].copy_from_slice(&value[..bpp]);
    }

    /// Copy out the rectangle at (`x`, `y`), clipped to the buffer bounds.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> PixelBuffer {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);

        let bpp = self.format.bytes_per_pixel();
        let row_len = width as usize * bpp;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in y..y + height {
            let start = self.offset(x, row);
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        PixelBuffer {
            width,
            height,
            format: self.format,
            data,
        }
    }

    /// Paste `src` with its top-left corner at (`x`, `y`), clipped.
    pub fn blit(&mut self, src: &PixelBuffer, x: u32, y: u32) {
        if x >= self.width || y >= self.height || src.format != self.format {
            return;
        }
        let width = src.width.min(self.width - x);
        let height = src.height.min(self.height - y);
        let row_len = width as usize * self.format.bytes_per_pixel();
        for row in 0..height {
            let dst = self.offset(x, y + row);
            let from = src.offset(0, row);
            self.data[dst..dst + row_len].copy_from_slice(&src.data[from..from + row_len]);
        }
    }

    /// Half-size box-filtered copy.
    ///
    /// Each output pixel is the rounded mean of a 2x2 block. Dimensions are
    /// halved with integer division but never drop below one pixel; blocks
    /// at the edge of odd-sized buffers reuse the last row or column.
    pub fn halve(&self) -> PixelBuffer {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let bpp = self.format.bytes_per_pixel();
        let max_x = self.width.saturating_sub(1);
        let max_y = self.height.saturating_sub(1);

        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height {
            let y0 = (2 * y).min(max_y);
            let y1 = (2 * y + 1).min(max_y);
            for x in 0..width {
                let x0 = (2 * x).min(max_x);
                let x1 = (2 * x + 1).min(max_x);
                let (a, b, c, d) = (
                    self.pixel(x0, y0),
                    self.pixel(x1, y0),
                    self.pixel(x0, y1),
                    self.pixel(x1, y1),
                );
                for ch in 0..bpp {
                    let sum = a[ch] as u32 + b[ch] as u32 + c[ch] as u32 + d[ch] as u32;
                    data.push(((sum + 2) / 4) as u8);
                }
            }
        }

        PixelBuffer {
            width,
            height,
            format: self.format,
            data,
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
