use std::os::unix::io::{AsRawFd, OwnedFd};

use drm::control::{crtc, framebuffer, plane, property, RawResourceHandle};

use crate::{
    backend::drm::{
        device::{AtomicRequest, PropMap},
        error::Error,
    },
    utils::{Buffer, Physical, Rectangle, Transform},
};

/// Property handles needed to program a plane through an atomic commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AtomicPlaneProperties {
    pub crtc_id: property::Handle,
    pub fb_id: property::Handle,
    pub crtc_x: property::Handle,
    pub crtc_y: property::Handle,
    pub crtc_w: property::Handle,
    pub crtc_h: property::Handle,
    pub src_x: property::Handle,
    pub src_y: property::Handle,
    pub src_w: property::Handle,
    pub src_h: property::Handle,
    pub rotation: Option<property::Handle>,
    pub in_fence_fd: Option<property::Handle>,
    pub plane_ctm: Option<property::Handle>,
}

fn plane_prop_handle(props: &PropMap, handle: plane::Handle, name: &'static str) -> Result<property::Handle, Error> {
    props
        .get(name)
        .map(|(prop, _)| *prop)
        .ok_or_else(|| Error::UnknownProperty {
            handle: handle.into(),
            name,
        })
}

impl AtomicPlaneProperties {
    pub fn from_props(handle: plane::Handle, props: &PropMap) -> Result<Self, Error> {
        Ok(AtomicPlaneProperties {
            crtc_id: plane_prop_handle(props, handle, "CRTC_ID")?,
            fb_id: plane_prop_handle(props, handle, "FB_ID")?,
            crtc_x: plane_prop_handle(props, handle, "CRTC_X")?,
            crtc_y: plane_prop_handle(props, handle, "CRTC_Y")?,
            crtc_w: plane_prop_handle(props, handle, "CRTC_W")?,
            crtc_h: plane_prop_handle(props, handle, "CRTC_H")?,
            src_x: plane_prop_handle(props, handle, "SRC_X")?,
            src_y: plane_prop_handle(props, handle, "SRC_Y")?,
            src_w: plane_prop_handle(props, handle, "SRC_W")?,
            src_h: plane_prop_handle(props, handle, "SRC_H")?,
            rotation: props.get("rotation").map(|(prop, _)| *prop),
            in_fence_fd: props.get("IN_FENCE_FD").map(|(prop, _)| *prop),
            plane_ctm: props.get("PLANE_CTM").map(|(prop, _)| *prop),
        })
    }

    /// Add the full state of a plane to `req`
    ///
    /// `src` has to be in 16.16 fixed point already.
    #[allow(clippy::too_many_arguments)]
    pub fn append_plane_state(
        &self,
        req: &mut AtomicRequest,
        plane: plane::Handle,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        dst: Rectangle<i32, Physical>,
        src: Rectangle<u32, Buffer>,
        transform: Transform,
        fence: Option<&OwnedFd>,
    ) -> Result<(), Error> {
        let plane_id = RawResourceHandle::from(plane).get();

        let rotation = match (self.rotation, transform) {
            (Some(prop), transform) => Some((prop, DrmRotation::from(transform))),
            (None, Transform::Normal) => None,
            (None, _) => return Err(Error::UnsupportedPlaneConfiguration(plane_id)),
        };
        let fence = match (self.in_fence_fd, fence) {
            (Some(prop), Some(fence)) => Some((prop, fence.as_raw_fd())),
            (_, None) => None,
            (None, Some(_)) => return Err(Error::UnsupportedPlaneConfiguration(plane_id)),
        };

        req.add_property(plane, self.crtc_id, RawResourceHandle::from(crtc).get() as u64);
        req.add_property(plane, self.fb_id, RawResourceHandle::from(framebuffer).get() as u64);
        req.add_property(plane, self.crtc_x, dst.loc.x as i64 as u64);
        req.add_property(plane, self.crtc_y, dst.loc.y as i64 as u64);
        req.add_property(plane, self.crtc_w, dst.size.w as u64);
        req.add_property(plane, self.crtc_h, dst.size.h as u64);
        // these are 16.16. fixed point
        req.add_property(plane, self.src_x, src.loc.x as u64);
        req.add_property(plane, self.src_y, src.loc.y as u64);
        req.add_property(plane, self.src_w, src.size.w as u64);
        req.add_property(plane, self.src_h, src.size.h as u64);

        if let Some((prop, rotation)) = rotation {
            req.add_property(plane, prop, rotation.bits() as u64);
        }
        if let Some((prop, fd)) = fence {
            req.add_property(plane, prop, fd as i64 as u64);
        }

        Ok(())
    }

    /// Add a state to `req` that detaches the plane from any crtc
    pub fn append_reset_plane_state(&self, req: &mut AtomicRequest, plane: plane::Handle) {
        req.add_property(plane, self.crtc_id, 0);
        req.add_property(plane, self.fb_id, 0);

        // reset the plane properties
        for prop in [
            self.crtc_x,
            self.crtc_y,
            self.crtc_w,
            self.crtc_h,
            self.src_x,
            self.src_y,
            self.src_w,
            self.src_h,
        ] {
            req.add_property(plane, prop, 0);
        }

        // reset the rotation, needed for some drivers
        if let Some(prop) = self.rotation {
            req.add_property(plane, prop, DrmRotation::ROTATE_0.bits() as u64);
        }

        // disable the fence, -1 means no fence
        if let Some(prop) = self.in_fence_fd {
            req.add_property(plane, prop, -1i64 as u64);
        }
    }
}

/// Convert a coordinate to 16.16 fixed point, truncating the fraction
#[inline]
pub(crate) fn to_fixed(n: f64) -> u32 {
    (n * (1 << 16) as f64) as u32
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub(crate) struct DrmRotation: u8 {
        const ROTATE_0      =   0b00000001;
        const ROTATE_90     =   0b00000010;
        const ROTATE_180    =   0b00000100;
        const ROTATE_270    =   0b00001000;
        const REFLECT_X     =   0b00010000;
        const REFLECT_Y     =   0b00100000;
    }
}

impl From<Transform> for DrmRotation {
    fn from(transform: Transform) -> Self {
        match transform {
            Transform::Normal => DrmRotation::ROTATE_0,
            Transform::_90 => DrmRotation::ROTATE_90,
            Transform::_180 => DrmRotation::ROTATE_180,
            Transform::_270 => DrmRotation::ROTATE_270,
            Transform::Flipped => DrmRotation::REFLECT_Y,
            Transform::Flipped90 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_90,
            Transform::Flipped180 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_180,
            Transform::Flipped270 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_270,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{to_fixed, DrmRotation};
    use crate::utils::{Buffer, Rectangle, Transform};

    #[test]
    fn test_fixed_point() {
        let geometry: Rectangle<f64, Buffer> = Rectangle::from_loc_and_size((0.0, 0.0), (1920.0, 1080.0));
        let fixed = to_fixed(geometry.size.w) as u64;
        assert_eq!(125829120, fixed);
    }

    #[test]
    fn test_fractional_fixed_point_truncates() {
        let geometry: Rectangle<f64, Buffer> = Rectangle::from_loc_and_size((0.0, 0.0), (1920.1, 1080.0));
        let fixed = to_fixed(geometry.size.w) as u64;
        assert_eq!(125835673, fixed);
    }

    #[test]
    fn rotation_from_transform() {
        assert_eq!(DrmRotation::from(Transform::Normal), DrmRotation::ROTATE_0);
        assert_eq!(
            DrmRotation::from(Transform::Flipped270),
            DrmRotation::REFLECT_Y | DrmRotation::ROTATE_270
        );
    }
}
