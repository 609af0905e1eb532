//! RGBA pixel surface that protocol clients render onto.

use chrono::Utc;
use image::{ImageFormat, RgbaImage};
use sessionview_core::{CapturedFrame, Error, Result};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedSurface = Arc<Mutex<PixelSurface>>;

pub fn shared(surface: PixelSurface) -> SharedSurface {
    Arc::new(Mutex::new(surface))
}

pub fn lock_surface(surface: &SharedSurface) -> MutexGuard<'_, PixelSurface> {
    surface.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    /// Row-major RGBA, `width * height * 4` bytes.
    pixels: Vec<u8>,
    frames_rendered: u64,
}

impl PixelSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(width: u32, height: u32) -> Self {
        let mut surface = Self::new();
        surface.resize(width, height);
        surface
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Resize to the given dimensions, clearing to opaque black.
    /// Returns false when the size was already current.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if width == self.width && height == self.height && !self.pixels.is_empty() {
            return false;
        }
        self.width = width;
        self.height = height;
        let mut pixels = vec![0u8; (width as usize) * (height as usize) * 4];
        for px in pixels.chunks_exact_mut(4) {
            px[3] = 255;
        }
        self.pixels = pixels;
        true
    }

    /// Draw a whole decoded image, adopting its native size.
    pub fn draw_image(&mut self, image: RgbaImage) {
        let (width, height) = image.dimensions();
        self.width = width;
        self.height = height;
        self.pixels = image.into_raw();
    }

    /// Copy an RGBA rectangle into the surface. Alpha is forced opaque.
    pub fn put_rect(&mut self, x: u32, y: u32, width: u32, height: u32, rgba: &[u8]) -> Result<()> {
        self.check_bounds(x, y, width, height)?;
        let expected = (width as usize) * (height as usize) * 4;
        if rgba.len() != expected {
            return Err(Error::Decode(format!(
                "rect payload is {} bytes, expected {}",
                rgba.len(),
                expected
            )));
        }
        let row_bytes = width as usize * 4;
        for row in 0..height as usize {
            let src = &rgba[row * row_bytes..(row + 1) * row_bytes];
            let start = self.offset(x, y + row as u32);
            let dst = &mut self.pixels[start..start + row_bytes];
            dst.copy_from_slice(src);
            for px in dst.chunks_exact_mut(4) {
                px[3] = 255;
            }
        }
        Ok(())
    }

    /// Copy a rectangle from another position of the surface.
    pub fn copy_rect(
        &mut self,
        src_x: u32,
        src_y: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.check_bounds(src_x, src_y, width, height)?;
        self.check_bounds(x, y, width, height)?;
        let row_bytes = width as usize * 4;
        let mut scratch = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height {
            let start = self.offset(src_x, src_y + row);
            scratch.extend_from_slice(&self.pixels[start..start + row_bytes]);
        }
        for row in 0..height as usize {
            let start = self.offset(x, y + row as u32);
            self.pixels[start..start + row_bytes]
                .copy_from_slice(&scratch[row * row_bytes..(row + 1) * row_bytes]);
        }
        Ok(())
    }

    /// Count one rendered frame and return the new total.
    pub fn mark_frame(&mut self) -> u64 {
        self.frames_rendered += 1;
        self.frames_rendered
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ])
    }

    /// Encode the current contents as PNG.
    ///
    /// Returns `None` until at least one frame has been rendered.
    pub fn capture(&self) -> Result<Option<CapturedFrame>> {
        if self.frames_rendered == 0 || self.width == 0 || self.height == 0 {
            return Ok(None);
        }
        let image = RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| Error::Decode("surface buffer does not match its dimensions".into()))?;
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| Error::Decode(format!("PNG encode failed: {}", e)))?;
        Ok(Some(CapturedFrame {
            png,
            width: self.width,
            height: self.height,
            captured_at: Utc::now(),
        }))
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.width as usize) + x as usize) * 4
    }

    fn check_bounds(&self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        let fits = x.checked_add(width).is_some_and(|r| r <= self.width)
            && y.checked_add(height).is_some_and(|b| b <= self.height);
        if fits {
            Ok(())
        } else {
            Err(Error::Decode(format!(
                "rect {}x{}+{}+{} outside {}x{} surface",
                width, height, x, y, self.width, self.height
            )))
        }
    }
}

/// Capture a shared surface, logging instead of failing.
pub fn capture_shared(surface: &SharedSurface) -> Option<CapturedFrame> {
    match lock_surface(surface).capture() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to capture last frame");
            None
        }
    }
}
