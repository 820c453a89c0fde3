//! Camera capability.
//!
//! The cameras are triggered over the shared bus (`FRM`), but frame readout,
//! ROI/exposure register access and format conversion belong to an external
//! camera driver. This trait is the seam that driver plugs into; the core
//! never implements it against real hardware.

use anyhow::Result;
use chrono::{DateTime, Utc};

/// One acquired frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row-major 16-bit pixel data, `width * height` long.
    pub pixel_data: Vec<u16>,
}

/// Register-level camera access plus frame acquisition.
pub trait Camera: Send {
    /// Frame width in pixels.
    fn width(&self) -> Result<u32>;
    /// Set the frame width in pixels.
    fn set_width(&mut self, width: u32) -> Result<()>;
    /// Frame height in pixels.
    fn height(&self) -> Result<u32>;
    /// Set the frame height in pixels.
    fn set_height(&mut self, height: u32) -> Result<()>;
    /// ROI x offset in pixels.
    fn offset_x(&self) -> Result<u32>;
    /// Set the ROI x offset in pixels.
    fn set_offset_x(&mut self, offset: u32) -> Result<()>;
    /// ROI y offset in pixels.
    fn offset_y(&self) -> Result<u32>;
    /// Set the ROI y offset in pixels.
    fn set_offset_y(&mut self, offset: u32) -> Result<()>;
    /// Exposure time in ms.
    fn exposure_ms(&self) -> Result<f64>;
    /// Set the exposure time in ms.
    fn set_exposure_ms(&mut self, exposure_ms: f64) -> Result<()>;
    /// Block until the next frame and return it with its timestamp.
    fn acquire_image(&mut self) -> Result<(CameraFrame, DateTime<Utc>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-memory camera, enough to exercise the trait surface.
    struct StubCamera {
        width: u32,
        height: u32,
        offset: (u32, u32),
        exposure_ms: f64,
    }

    impl Camera for StubCamera {
        fn width(&self) -> Result<u32> {
            Ok(self.width)
        }
        fn set_width(&mut self, width: u32) -> Result<()> {
            self.width = width;
            Ok(())
        }
        fn height(&self) -> Result<u32> {
            Ok(self.height)
        }
        fn set_height(&mut self, height: u32) -> Result<()> {
            self.height = height;
            Ok(())
        }
        fn offset_x(&self) -> Result<u32> {
            Ok(self.offset.0)
        }
        fn set_offset_x(&mut self, offset: u32) -> Result<()> {
            self.offset.0 = offset;
            Ok(())
        }
        fn offset_y(&self) -> Result<u32> {
            Ok(self.offset.1)
        }
        fn set_offset_y(&mut self, offset: u32) -> Result<()> {
            self.offset.1 = offset;
            Ok(())
        }
        fn exposure_ms(&self) -> Result<f64> {
            Ok(self.exposure_ms)
        }
        fn set_exposure_ms(&mut self, exposure_ms: f64) -> Result<()> {
            self.exposure_ms = exposure_ms;
            Ok(())
        }
        fn acquire_image(&mut self) -> Result<(CameraFrame, DateTime<Utc>)> {
            let frame = CameraFrame {
                width: self.width,
                height: self.height,
                pixel_data: vec![0; (self.width * self.height) as usize],
            };
            Ok((frame, Utc::now()))
        }
    }

    #[test]
    fn test_stub_camera_roundtrip() {
        let mut camera = StubCamera {
            width: 2048,
            height: 2048,
            offset: (0, 0),
            exposure_ms: 10.0,
        };
        camera.set_width(1024).unwrap();
        camera.set_exposure_ms(5.0).unwrap();
        let (frame, _stamp) = camera.acquire_image().unwrap();
        assert_eq!(frame.width, 1024);
        assert_eq!(frame.pixel_data.len(), 1024 * 2048);
    }
}
