//! A minimal decoded-image representation shared between the frame
//! source and the scan engine.
//!
//! The scan engine only ever needs random pixel access over a rectangle
//! of either 3-channel BGR or 1-channel grayscale samples; it has no
//! opinion on how those samples were decoded. Real decoding is an
//! external collaborator (see `source::FfmpegFrameSource`).

/// Pixel layout of a decoded `Image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
    /// 3 bytes per pixel, in B, G, R order.
    Bgr,
    /// 1 byte per pixel.
    Gray,
}

/// A decoded rectangular image.
#[derive(Debug, Clone)]
pub struct Image {
    width: u32,
    height: u32,
    channels: Channels,
    data: Vec<u8>,
}

impl Image {
    /// Build an image from raw pixel bytes. `data.len()` must equal
    /// `width * height * bytes_per_pixel(channels)`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not sized for `width`, `height`, and
    /// `channels` — this is an internal invariant violated only by a
    /// malformed decoder, not by caller input.
    #[must_use]
    pub fn new(width: u32, height: u32, channels: Channels, data: Vec<u8>) -> Self {
        let bpp = match channels {
            Channels::Bgr => 3,
            Channels::Gray => 1,
        };
        assert_eq!(
            data.len(),
            width as usize * height as usize * bpp,
            "image buffer size does not match width/height/channels"
        );
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn channels(&self) -> Channels {
        self.channels
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Sample the pixel at `(x, y)` as `(b, g, r)`, or `None` if out of
    /// bounds or if this is a grayscale sample that reads as pure black
    /// (treated as "no sample" — see `scan::Phase A`).
    #[must_use]
    pub fn sample_bgr(&self, x: i64, y: i64) -> Option<(u8, u8, u8)> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        match self.channels {
            Channels::Bgr => {
                let idx = (y * self.width as usize + x) * 3;
                Some((self.data[idx], self.data[idx + 1], self.data[idx + 2]))
            }
            Channels::Gray => {
                let idx = y * self.width as usize + x;
                let v = self.data[idx];
                if v == 0 {
                    None
                } else {
                    Some((v, v, v))
                }
            }
        }
    }

    /// Nearest-neighbor resize to `new_width x new_height`. Used by the
    /// video driver loop when the configured output dimensions differ
    /// from the source's native dimensions; a no-op clone when they
    /// already match.
    #[must_use]
    pub fn resize_nearest(&self, new_width: u32, new_height: u32) -> Image {
        if new_width == self.width && new_height == self.height {
            return self.clone();
        }
        let bpp = match self.channels {
            Channels::Bgr => 3,
            Channels::Gray => 1,
        };
        let mut data = vec![0u8; new_width as usize * new_height as usize * bpp];
        for ny in 0..new_height {
            let sy = (u64::from(ny) * u64::from(self.height) / u64::from(new_height.max(1))) as u32;
            let sy = sy.min(self.height.saturating_sub(1));
            for nx in 0..new_width {
                let sx = (u64::from(nx) * u64::from(self.width) / u64::from(new_width.max(1))) as u32;
                let sx = sx.min(self.width.saturating_sub(1));
                let src_idx = (sy as usize * self.width as usize + sx as usize) * bpp;
                let dst_idx = (ny as usize * new_width as usize + nx as usize) * bpp;
                data[dst_idx..dst_idx + bpp].copy_from_slice(&self.data[src_idx..src_idx + bpp]);
            }
        }
        Image {
            width: new_width,
            height: new_height,
            channels: self.channels,
            data,
        }
    }

    /// Raw pixel bytes at `(x, y)` without the grayscale-black skip rule,
    /// for the peripheral accumulation phase, which always counts its
    /// contribution (averaging treats black as a legitimate sample).
    #[must_use]
    pub fn raw_bgr(&self, x: u32, y: u32) -> (u8, u8, u8) {
        match self.channels {
            Channels::Bgr => {
                let idx = (y as usize * self.width as usize + x as usize) * 3;
                (self.data[idx], self.data[idx + 1], self.data[idx + 2])
            }
            Channels::Gray => {
                let idx = y as usize * self.width as usize + x as usize;
                let v = self.data[idx];
                (v, v, v)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_bgr_pixel() {
        let img = Image::new(2, 1, Channels::Bgr, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(img.sample_bgr(0, 0), Some((1, 2, 3)));
        assert_eq!(img.sample_bgr(1, 0), Some((4, 5, 6)));
    }

    #[test]
    fn out_of_bounds_sample_is_none() {
        let img = Image::new(2, 1, Channels::Bgr, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(img.sample_bgr(-1, 0), None);
        assert_eq!(img.sample_bgr(2, 0), None);
    }

    #[test]
    fn black_grayscale_sample_is_none() {
        let img = Image::new(2, 1, Channels::Gray, vec![0, 200]);
        assert_eq!(img.sample_bgr(0, 0), None);
        assert_eq!(img.sample_bgr(1, 0), Some((200, 200, 200)));
    }

    #[test]
    fn resize_to_same_dimensions_is_unchanged() {
        let img = Image::new(2, 1, Channels::Bgr, vec![1, 2, 3, 4, 5, 6]);
        let resized = img.resize_nearest(2, 1);
        assert_eq!(resized.sample_bgr(0, 0), img.sample_bgr(0, 0));
        assert_eq!(resized.sample_bgr(1, 0), img.sample_bgr(1, 0));
    }

    #[test]
    fn resize_upscales_with_nearest_neighbor() {
        let img = Image::new(1, 1, Channels::Bgr, vec![9, 8, 7]);
        let resized = img.resize_nearest(2, 2);
        assert_eq!(resized.width(), 2);
        assert_eq!(resized.height(), 2);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(resized.sample_bgr(x, y), Some((9, 8, 7)));
            }
        }
    }
}
