use std::{fmt, os::unix::io::OwnedFd, rc::Rc};

use drm::control::framebuffer;
use drm_fourcc::DrmFourcc;

use crate::{
    backend::drm::plane::atomic::to_fixed,
    utils::{Buffer, Physical, Rectangle, Size, Transform},
};

/// A buffer registered as framebuffer and ready for scanout
///
/// A buffer exposes two framebuffers: one with its real format, used when the plane
/// blends it, and one with the alpha channel ignored.
pub trait ScanoutBuffer: fmt::Debug {
    /// Framebuffer with the buffer's format
    fn framebuffer(&self) -> framebuffer::Handle;
    /// Framebuffer ignoring the alpha channel
    fn opaque_framebuffer(&self) -> framebuffer::Handle;
    /// Format of [`ScanoutBuffer::framebuffer`]
    fn format(&self) -> DrmFourcc;
    /// Format of [`ScanoutBuffer::opaque_framebuffer`]
    fn opaque_format(&self) -> DrmFourcc;
    /// Size of the buffer
    fn size(&self) -> Size<i32, Buffer>;
}

/// A buffer the compositor wants scanned out on one plane
#[derive(Debug, Clone)]
pub struct OverlayPlane {
    /// The buffer
    pub buffer: Rc<dyn ScanoutBuffer>,
    /// Stacking position, 0 is the primary plane
    pub z_order: i32,
    /// Transform applied by the plane
    pub transform: Transform,
    /// Destination on the crtc
    pub display_bounds: Rectangle<i32, Physical>,
    /// Source rectangle, normalized to the buffer size
    pub crop_rect: Rectangle<f64, Buffer>,
    /// Whether the plane blends the buffer with the planes below
    pub enable_blend: bool,
    /// Fence signaled once rendering into the buffer finished
    pub fence: Option<Rc<OwnedFd>>,
}

impl OverlayPlane {
    /// A plane covering `display_bounds` with the whole buffer, without blending
    pub fn new(buffer: Rc<dyn ScanoutBuffer>, z_order: i32, display_bounds: Rectangle<i32, Physical>) -> Self {
        OverlayPlane {
            buffer,
            z_order,
            transform: Transform::Normal,
            display_bounds,
            crop_rect: Rectangle::from_size((1.0, 1.0)),
            enable_blend: false,
            fence: None,
        }
    }

    /// Format the plane has to support to scan out this buffer
    #[inline]
    pub fn required_format(&self) -> DrmFourcc {
        if self.enable_blend {
            self.buffer.format()
        } else {
            self.buffer.opaque_format()
        }
    }

    /// Framebuffer matching [`OverlayPlane::required_format`]
    #[inline]
    pub fn framebuffer(&self) -> framebuffer::Handle {
        if self.enable_blend {
            self.buffer.framebuffer()
        } else {
            self.buffer.opaque_framebuffer()
        }
    }

    /// Source rectangle in buffer pixels, as 16.16 fixed point
    pub(crate) fn fixed_src_rect(&self) -> Rectangle<u32, Buffer> {
        let size = self.buffer.size().to_f64();
        let crop = self.crop_rect.scale(size.w, size.h);
        Rectangle::from_loc_and_size(
            (to_fixed(crop.loc.x), to_fixed(crop.loc.y)),
            (to_fixed(crop.size.w), to_fixed(crop.size.h)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::mock::MockBuffer;

    #[test]
    fn fixed_src_rect_scales_crop() {
        let buffer = MockBuffer::new(1, DrmFourcc::Xrgb8888, (200, 100));
        let mut plane = OverlayPlane::new(buffer, 0, Rectangle::from_size((200, 100)));
        plane.crop_rect = Rectangle::from_loc_and_size((0.5, 0.0), (0.5, 0.25));

        let src = plane.fixed_src_rect();
        assert_eq!(src.loc.x, 100 << 16);
        assert_eq!(src.loc.y, 0);
        assert_eq!(src.size.w, 100 << 16);
        assert_eq!(src.size.h, 25 << 16);
    }

    #[test]
    fn blending_selects_framebuffer() {
        let buffer = MockBuffer::new(1, DrmFourcc::Argb8888, (64, 64));
        let mut plane = OverlayPlane::new(buffer.clone(), 1, Rectangle::from_size((64, 64)));
        assert_eq!(plane.required_format(), DrmFourcc::Xrgb8888);
        assert_eq!(plane.framebuffer(), buffer.opaque_framebuffer());

        plane.enable_blend = true;
        assert_eq!(plane.required_format(), DrmFourcc::Argb8888);
        assert_eq!(plane.framebuffer(), buffer.framebuffer());
    }
}
