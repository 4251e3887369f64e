//! Framebuffer device access.
//!
//! [`FbDevice::apply_config`] forces a 32-bit true-colour mode, loads the
//! identity colour ramp and maps the pixel memory. The mapping exists only
//! while the session owns the display; [`FbDevice::unmap`] drops it on
//! switch-away and [`FbDevice::put_span`] silently does nothing without it.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::error::{DeviceError, Result};
use crate::os::{ColorRamp, DeviceOs, FbBitField, FbFixScreenInfo, FbVarScreenInfo, OpenMode};

const BYTES_PER_PIXEL: usize = 4;

/// A live mapping of the pixel memory.
struct Mapping {
    base: NonNull<u8>,
    len: usize,
    /// Sub-page offset of the first pixel within the mapping.
    offset: usize,
    stride: usize,
    width: usize,
    height: usize,
}

pub struct FbDevice<O: DeviceOs> {
    os: Arc<O>,
    fd: RawFd,
    path: String,
    var: FbVarScreenInfo,
    fix: FbFixScreenInfo,
    ramp: ColorRamp,
    mapping: Option<Mapping>,
}

impl<O: DeviceOs> FbDevice<O> {
    /// Open the device and read its current geometry. Nothing is mapped yet.
    pub fn open(os: Arc<O>, path: &str) -> Result<Self> {
        let fd = os
            .open(path, OpenMode::ReadWrite)
            .map_err(|source| DeviceError::DeviceUnavailable {
                path: path.to_string(),
                source,
            })?;

        let var = match os.fb_get_var(fd) {
            Ok(var) => var,
            Err(e) => {
                os.close(fd);
                return Err(DeviceError::control("FBIOGET_VSCREENINFO", e));
            }
        };
        info!(path, xres = var.xres, yres = var.yres, bpp = var.bits_per_pixel, "Framebuffer opened");

        Ok(Self {
            os,
            fd,
            path: path.to_string(),
            var,
            fix: FbFixScreenInfo::default(),
            ramp: ColorRamp::identity(),
            mapping: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.var.xres
    }

    pub fn height(&self) -> u32 {
        self.var.yres
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Program the display mode and map the pixel memory.
    pub fn apply_config(&mut self) -> Result<()> {
        self.unmap();
        let os = &*self.os;

        let channel = FbBitField {
            offset: 0,
            length: 8,
            msb_right: 0,
        };
        let mut wanted = self.var;
        wanted.xres_virtual = wanted.xres;
        wanted.yres_virtual = wanted.yres;
        wanted.bits_per_pixel = 32;
        wanted.red = channel;
        wanted.green = channel;
        wanted.blue = channel;
        wanted.transp = channel;

        os.fb_put_var(self.fd, &wanted)
            .map_err(|e| DeviceError::control("FBIOPUT_VSCREENINFO", e))?;
        self.var = os
            .fb_get_var(self.fd)
            .map_err(|e| DeviceError::control("FBIOGET_VSCREENINFO", e))?;
        debug!(
            path = %self.path,
            xres = self.var.xres,
            yres = self.var.yres,
            bpp = self.var.bits_per_pixel,
            "Framebuffer mode applied"
        );

        if self.var.bits_per_pixel != 32 {
            return Err(DeviceError::ConfigurationRejected(format!(
                "{} bits per pixel, need 32",
                self.var.bits_per_pixel
            )));
        }

        os.fb_put_cmap(self.fd, &self.ramp)
            .map_err(|e| DeviceError::control("FBIOPUTCMAP", e))?;
        self.fix = os
            .fb_get_fix(self.fd)
            .map_err(|e| DeviceError::control("FBIOGET_FSCREENINFO", e))?;

        let page = os.page_size();
        let offset = (self.fix.smem_start as usize) & (page - 1);
        let len = (self.fix.smem_len as usize + offset).next_multiple_of(page);
        let base = os.map(self.fd, len).map_err(DeviceError::MapFailed)?;

        self.mapping = Some(Mapping {
            base,
            len,
            offset,
            stride: self.fix.line_length as usize,
            width: self.var.xres as usize,
            height: self.var.yres as usize,
        });
        info!(len, offset, stride = self.fix.line_length, "Framebuffer mapped");
        Ok(())
    }

    /// Release the pixel memory mapping, if any.
    pub fn unmap(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            self.os.unmap(mapping.base, mapping.len);
            debug!(path = %self.path, "Framebuffer unmapped");
        }
    }

    /// Copy one row of pixels to `(left, top)`, clipped to the visible area
    /// and the mapped memory. Dropped when nothing is mapped.
    pub fn put_span(&mut self, left: i32, top: i32, right: i32, pixels: &[u32]) {
        let Some(mapping) = self.mapping.as_ref() else {
            trace!(left, top, right, "Span dropped, framebuffer not mapped");
            return;
        };
        if top < 0 || top as usize >= mapping.height {
            return;
        }

        let skip = (-left).max(0) as usize;
        let left = left.max(0) as usize;
        let right = (right.max(0) as usize).min(mapping.width);
        if left >= right || skip >= pixels.len() {
            return;
        }
        let count = (right - left).min(pixels.len() - skip);

        let start = mapping.offset + top as usize * mapping.stride + left * BYTES_PER_PIXEL;
        let bytes = count * BYTES_PER_PIXEL;
        if start + bytes > mapping.len {
            return;
        }

        // SAFETY: [start, start + bytes) lies inside the live mapping and the
        // source slice holds at least `count` pixels.
        unsafe {
            std::ptr::copy_nonoverlapping(
                pixels[skip..].as_ptr() as *const u8,
                mapping.base.as_ptr().add(start),
                bytes,
            );
        }
    }
}

impl<O: DeviceOs> Drop for FbDevice<O> {
    fn drop(&mut self) {
        self.unmap();
        self.os.close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockOs;

    #[test]
    fn test_open_reads_geometry_without_mapping() {
        let os = Arc::new(MockOs::new());
        let fb = FbDevice::open(os.clone(), "/dev/fb0").unwrap();
        assert_eq!((fb.width(), fb.height()), (640, 480));
        assert!(!fb.is_mapped());
        assert_eq!(os.maps(), 0);
    }

    #[test]
    fn test_apply_config_maps_with_page_offset() {
        let os = Arc::new(MockOs::new());
        os.set_smem_offset(0x40);
        let mut fb = FbDevice::open(os.clone(), "/dev/fb0").unwrap();
        fb.apply_config().unwrap();

        assert!(fb.is_mapped());
        let var = os.var();
        assert_eq!(var.bits_per_pixel, 32);
        assert_eq!(var.xres_virtual, var.xres);
        for field in [var.red, var.green, var.blue, var.transp] {
            assert_eq!((field.offset, field.length), (0, 8));
        }
        assert_eq!(os.cmap_loads(), 1);

        let mapped = os.last_map_len();
        assert_eq!(mapped % os.page_size(), 0);
        assert!(mapped >= 640 * 480 * 4 + 0x40);

        fb.put_span(0, 0, 2, &[0x11223344, 0x55667788]);
        assert_eq!(os.pixel(0, 0), Some(0x11223344));
        assert_eq!(os.pixel(1, 0), Some(0x55667788));
    }

    #[test]
    fn test_rejected_depth_leaves_unmapped() {
        let os = Arc::new(MockOs::new());
        os.reject_depth();
        let mut fb = FbDevice::open(os.clone(), "/dev/fb0").unwrap();
        let err = fb.apply_config().unwrap_err();
        assert!(matches!(err, DeviceError::ConfigurationRejected(_)));
        assert!(!fb.is_mapped());
        assert_eq!(os.maps(), 0);
    }

    #[test]
    fn test_span_is_clipped() {
        let os = Arc::new(MockOs::new());
        let mut fb = FbDevice::open(os.clone(), "/dev/fb0").unwrap();
        fb.apply_config().unwrap();

        fb.put_span(-1, 3, 1, &[0xaaaa_aaaa, 0xbbbb_bbbb]);
        assert_eq!(os.pixel(0, 3), Some(0xbbbb_bbbb));

        fb.put_span(639, 4, 642, &[1, 2, 3]);
        assert_eq!(os.pixel(639, 4), Some(1));
        assert_eq!(os.pixel(0, 5), Some(0));

        fb.put_span(0, 480, 4, &[9, 9, 9, 9]);
        fb.put_span(0, -1, 4, &[9, 9, 9, 9]);
    }

    #[test]
    fn test_unmap_drops_spans() {
        let os = Arc::new(MockOs::new());
        let mut fb = FbDevice::open(os.clone(), "/dev/fb0").unwrap();
        fb.apply_config().unwrap();
        fb.unmap();
        fb.put_span(0, 0, 1, &[0xffff_ffff]);
        assert_eq!(os.pixel(0, 0), Some(0));
        assert_eq!(os.unmaps(), 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let os = Arc::new(MockOs::new());
        {
            let mut fb = FbDevice::open(os.clone(), "/dev/fb0").unwrap();
            fb.apply_config().unwrap();
        }
        assert_eq!(os.maps(), os.unmaps());
        assert_eq!(os.opens(), os.closes());
    }
}
