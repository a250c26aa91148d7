use std::{cell::Cell, fmt, rc::Weak};

use drm::control::{crtc, plane, RawResourceHandle};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{trace, warn};

use crate::backend::drm::{
    device::{map_props, DrmObject, KmsDevice},
    error::{AccessError, Error},
    CrtcController,
};

pub(crate) mod atomic;
pub mod format;

use self::atomic::AtomicPlaneProperties;
use self::format::{FormatBlob, FormatModifier};

const DRM_PLANE_TYPE_OVERLAY: u64 = 0;
const DRM_PLANE_TYPE_PRIMARY: u64 = 1;
const DRM_PLANE_TYPE_CURSOR: u64 = 2;

/// Role of a hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Primary plane of a crtc
    Primary,
    /// Overlay plane
    Overlay,
    /// Cursor plane, never used for overlays
    Cursor,
    /// Stand-in for the hidden primary plane of a crtc on devices without universal planes
    Dummy,
}

/// A hardware plane of a kms device
///
/// The static capabilities are read once from the device, only the ownership state
/// changes from frame to frame.
pub struct HardwarePlane {
    id: u32,
    handle: Option<plane::Handle>,
    crtc_mask: u32,
    kind: PlaneType,
    formats: Vec<u32>,
    modifiers: Vec<FormatModifier>,
    last_used_format: Cell<Option<u32>>,
    props: Option<AtomicPlaneProperties>,
    pub(crate) in_use: bool,
    pub(crate) owning_crtc: Option<crtc::Handle>,
    pub(crate) controller: Option<Weak<dyn CrtcController>>,
}

impl fmt::Debug for HardwarePlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwarePlane")
            .field("id", &self.id)
            .field("crtc_mask", &format_args!("{:#b}", self.crtc_mask))
            .field("type", &self.kind)
            .field("formats", &self.formats.len())
            .field("modifiers", &self.modifiers.len())
            .field("atomic", &self.props.is_some())
            .field("in_use", &self.in_use)
            .field("owning_crtc", &self.owning_crtc)
            .finish()
    }
}

impl HardwarePlane {
    /// Read the capabilities of a plane from the device
    ///
    /// With `atomic` set, the plane has to expose every property needed to program it
    /// through an atomic commit.
    pub(crate) fn new<D: KmsDevice + ?Sized>(
        dev: &D,
        handle: plane::Handle,
        atomic: bool,
    ) -> Result<HardwarePlane, Error> {
        let info = dev.plane_info(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get plane info",
                dev: dev.dev_path(),
                source,
            })
        })?;
        let props = map_props(dev, DrmObject::Plane(handle))?;

        let kind = match props.get("type").map(|(_, value)| *value) {
            Some(DRM_PLANE_TYPE_PRIMARY) => PlaneType::Primary,
            Some(DRM_PLANE_TYPE_CURSOR) => PlaneType::Cursor,
            Some(DRM_PLANE_TYPE_OVERLAY) | None => PlaneType::Overlay,
            Some(other) => {
                warn!(?handle, "Unknown plane type {}, treating as overlay", other);
                PlaneType::Overlay
            }
        };

        let in_formats = match props.get("IN_FORMATS") {
            Some((_, blob)) if *blob != 0 => match dev
                .property_blob(*blob)
                .map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Failed to read IN_FORMATS blob",
                        dev: dev.dev_path(),
                        source,
                    })
                })
                .and_then(|data| FormatBlob::parse(&data))
            {
                Ok(blob) => Some(blob),
                Err(err) => {
                    warn!(?handle, "Ignoring IN_FORMATS: {}", err);
                    None
                }
            },
            _ => None,
        };
        let FormatBlob { formats, modifiers } = in_formats.unwrap_or_else(|| FormatBlob {
            formats: info.formats.clone(),
            modifiers: Vec::new(),
        });

        let props = if atomic {
            Some(AtomicPlaneProperties::from_props(handle, &props)?)
        } else {
            None
        };

        trace!(
            ?handle,
            ?kind,
            possible_crtcs = info.possible_crtcs,
            "Plane has {} formats and {} modifiers",
            formats.len(),
            modifiers.len()
        );

        Ok(HardwarePlane {
            id: RawResourceHandle::from(handle).get(),
            handle: Some(handle),
            crtc_mask: info.possible_crtcs,
            kind,
            formats,
            modifiers,
            last_used_format: Cell::new(None),
            props,
            in_use: false,
            owning_crtc: None,
            controller: None,
        })
    }

    /// Synthesize the primary plane of a crtc, for devices hiding them
    pub(crate) fn dummy(crtc: crtc::Handle, crtc_index: usize) -> HardwarePlane {
        HardwarePlane {
            id: RawResourceHandle::from(crtc).get() - 1,
            handle: None,
            crtc_mask: 1 << crtc_index,
            kind: PlaneType::Dummy,
            formats: vec![DrmFourcc::Xrgb8888 as u32, DrmFourcc::Xbgr8888 as u32],
            modifiers: Vec::new(),
            last_used_format: Cell::new(None),
            props: None,
            in_use: false,
            owning_crtc: None,
            controller: None,
        }
    }

    /// Id of the plane, synthesized for dummy planes
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Kernel handle, `None` for dummy planes
    pub fn handle(&self) -> Option<plane::Handle> {
        self.handle
    }

    /// Bitmask of the crtc indices this plane may be used with
    pub fn crtc_mask(&self) -> u32 {
        self.crtc_mask
    }

    /// Role of the plane
    pub fn plane_type(&self) -> PlaneType {
        self.kind
    }

    /// Supported fourcc codes, in kernel order
    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    /// Supported modifiers with their format masks
    pub fn modifiers(&self) -> &[FormatModifier] {
        &self.modifiers
    }

    /// Whether the plane is assigned in the current or the last committed frame
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Crtc the plane is currently assigned to
    pub fn owning_crtc(&self) -> Option<crtc::Handle> {
        self.owning_crtc
    }

    pub(crate) fn properties(&self) -> Option<&AtomicPlaneProperties> {
        self.props.as_ref()
    }

    /// Checks if the plane can scan out the given fourcc code
    pub fn is_supported_format(&self, format: u32) -> bool {
        if self.last_used_format.get() == Some(format) {
            return true;
        }

        if self.formats.contains(&format) {
            self.last_used_format.set(Some(format));
            return true;
        }

        false
    }

    /// Modifiers the plane supports for the given fourcc code
    ///
    /// Returns an empty list for formats the plane does not support.
    pub fn modifiers_for_format(&self, format: u32) -> Vec<DrmModifier> {
        let Some(index) = self.formats.iter().position(|f| *f == format) else {
            return Vec::new();
        };

        self.modifiers
            .iter()
            .filter(|modifier| modifier.covers(index))
            .map(|modifier| modifier.modifier)
            .collect()
    }

    /// Checks if the plane may be used with the crtc at the given index
    #[inline]
    pub fn can_use_for_crtc(&self, crtc_index: usize) -> bool {
        crtc_index < 32 && self.crtc_mask & (1 << crtc_index) != 0
    }

    pub(crate) fn release(&mut self) {
        self.in_use = false;
        self.owning_crtc = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::mock::{MockKmsDevice, MockPlane};
    use drm::control::from_u32;

    #[test]
    fn reads_in_formats() {
        let blob = FormatBlob {
            formats: vec![DrmFourcc::Xrgb8888 as u32, DrmFourcc::Nv12 as u32],
            modifiers: vec![FormatModifier {
                formats: 0b10,
                offset: 0,
                modifier: DrmModifier::Linear,
            }],
        };
        let dev = MockKmsDevice::new(1, vec![MockPlane::overlay(10, 0b1).in_formats(blob)]);
        let plane = HardwarePlane::new(&dev, from_u32(10).unwrap(), true).unwrap();

        assert_eq!(plane.id(), 10);
        assert_eq!(plane.plane_type(), PlaneType::Overlay);
        assert_eq!(plane.formats(), &[DrmFourcc::Xrgb8888 as u32, DrmFourcc::Nv12 as u32]);
        assert!(plane.modifiers_for_format(DrmFourcc::Xrgb8888 as u32).is_empty());
        assert_eq!(
            plane.modifiers_for_format(DrmFourcc::Nv12 as u32),
            vec![DrmModifier::Linear]
        );
        assert!(plane.modifiers_for_format(DrmFourcc::Uyvy as u32).is_empty());
    }

    #[test]
    fn falls_back_to_plane_formats() {
        let dev = MockKmsDevice::new(
            1,
            vec![MockPlane::primary(10, 0b1).formats(vec![DrmFourcc::Argb8888 as u32])],
        );
        let plane = HardwarePlane::new(&dev, from_u32(10).unwrap(), false).unwrap();
        assert_eq!(plane.plane_type(), PlaneType::Primary);
        assert!(plane.is_supported_format(DrmFourcc::Argb8888 as u32));
        // cached
        assert!(plane.is_supported_format(DrmFourcc::Argb8888 as u32));
        assert!(!plane.is_supported_format(DrmFourcc::Xrgb8888 as u32));
        assert!(plane.properties().is_none());
    }

    #[test]
    fn atomic_plane_requires_properties() {
        let dev = MockKmsDevice::new(1, vec![MockPlane::overlay(10, 0b1).without_property("SRC_W")]);
        let res = HardwarePlane::new(&dev, from_u32(10).unwrap(), true);
        assert!(matches!(res, Err(Error::UnknownProperty { name: "SRC_W", .. })));
        // legacy planes are programmed without properties
        assert!(HardwarePlane::new(&dev, from_u32(10).unwrap(), false).is_ok());
    }

    #[test]
    fn crtc_affinity() {
        let dev = MockKmsDevice::new(3, vec![MockPlane::cursor(10, 0b101)]);
        let plane = HardwarePlane::new(&dev, from_u32(10).unwrap(), false).unwrap();
        assert_eq!(plane.plane_type(), PlaneType::Cursor);
        assert!(plane.can_use_for_crtc(0));
        assert!(!plane.can_use_for_crtc(1));
        assert!(plane.can_use_for_crtc(2));
        assert!(!plane.can_use_for_crtc(40));
    }

    #[test]
    fn dummy_plane() {
        let crtc: crtc::Handle = from_u32(5).unwrap();
        let plane = HardwarePlane::dummy(crtc, 2);
        assert_eq!(plane.id(), 4);
        assert_eq!(plane.handle(), None);
        assert_eq!(plane.crtc_mask(), 0b100);
        assert_eq!(plane.plane_type(), PlaneType::Dummy);
        assert!(plane.is_supported_format(DrmFourcc::Xbgr8888 as u32));
        assert!(!plane.is_supported_format(DrmFourcc::Argb8888 as u32));
    }
}
