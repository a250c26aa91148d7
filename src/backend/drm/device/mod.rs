//! Kernel interface used by the plane manager
//!
//! [`KmsDevice`] abstracts the handful of kms calls the plane manager needs:
//! resource and property enumeration, property blobs, page flips, legacy plane updates
//! and atomic commits. [`DrmKmsDevice`] implements it on top of the [`drm`] crate.

use std::{
    collections::HashMap,
    fmt, io,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use drm::{
    control::{crtc, framebuffer, plane, property, AtomicCommitFlags, RawResourceHandle},
    ClientCapability,
};

use tracing::warn;

use crate::{
    backend::drm::{
        color::LutEntry,
        error::{AccessError, Error},
    },
    utils::{Buffer, Physical, Rectangle},
};

#[cfg(feature = "backend_drm")]
mod fd;
#[cfg(feature = "backend_drm")]
pub use self::fd::DrmKmsDevice;

/// Callback invoked once a page flip or commit completed on every crtc it touched
pub type PageFlipCallback = Box<dyn FnOnce(EventMetadata)>;

/// Timing metadata for page-flip events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMetadata {
    /// The time the frame flip happend
    pub time: Time,
    /// The sequence number of the frame
    pub sequence: u32,
}

/// Either a realtime or monotonic timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Time {
    /// Monotonic time stamp, relative to the clock's epoch
    Monotonic(Duration),
    /// Realtime time stamp
    Realtime(SystemTime),
}

/// Kms object carrying properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrmObject {
    /// A crtc
    Crtc(crtc::Handle),
    /// A plane
    Plane(plane::Handle),
}

impl From<DrmObject> for RawResourceHandle {
    #[inline]
    fn from(object: DrmObject) -> Self {
        match object {
            DrmObject::Crtc(crtc) => crtc.into(),
            DrmObject::Plane(plane) => plane.into(),
        }
    }
}

/// Static plane information as reported by the plane resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Bitmask of crtc indices this plane may be used with
    pub possible_crtcs: u32,
    /// Formats enumerated by the plane resource
    pub formats: Vec<u32>,
}

/// Set of property changes submitted in one atomic commit
///
/// Entries are kept in insertion order; a later entry for the same object and
/// property overrides an earlier one on the kernel side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    properties: Vec<(RawResourceHandle, property::Handle, u64)>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property change to the request
    pub fn add_property(&mut self, object: impl Into<RawResourceHandle>, prop: property::Handle, value: u64) {
        self.properties.push((object.into(), prop, value));
    }

    /// All property changes of this request
    pub fn properties(&self) -> &[(RawResourceHandle, property::Handle, u64)] {
        &self.properties
    }

    /// Last value written for the given object and property
    pub fn value_of(&self, object: impl Into<RawResourceHandle>, prop: property::Handle) -> Option<u64> {
        let object = object.into();
        self.properties
            .iter()
            .rev()
            .find(|(obj, p, _)| *obj == object && *p == prop)
            .map(|(_, _, value)| *value)
    }

    /// Returns true if the request carries no changes
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Drop every property change
    pub fn clear(&mut self) {
        self.properties.clear();
    }
}

/// Kernel mode-setting interface
///
/// All methods take `&self`, the kernel serializes concurrent access to a device node.
pub trait KmsDevice: fmt::Debug {
    /// Path of the underlying device node, if known
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }

    /// Enable or disable a client capability
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;

    /// Crtcs of the device, in kernel (index) order
    fn crtcs(&self) -> io::Result<Vec<crtc::Handle>>;

    /// Planes exposed to this client
    fn planes(&self) -> io::Result<Vec<plane::Handle>>;

    /// Static information about a plane
    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo>;

    /// Properties of an object and their current values
    fn object_properties(&self, object: DrmObject) -> io::Result<Vec<(property::Handle, u64)>>;

    /// Name of a property
    fn property_name(&self, prop: property::Handle) -> io::Result<String>;

    /// Contents of a property blob
    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>>;

    /// Store a property blob and return its id
    fn create_property_blob(&self, data: &[u8]) -> io::Result<u64>;

    /// Release a property blob
    fn destroy_property_blob(&self, blob: u64) -> io::Result<()>;

    /// Flip the primary framebuffer of a crtc
    fn page_flip(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        callback: PageFlipCallback,
    ) -> io::Result<()>;

    /// Legacy plane update, `None` disables the plane
    ///
    /// `src` is given in 16.16 fixed point.
    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        dst: Rectangle<i32, Physical>,
        src: Rectangle<u32, Buffer>,
    ) -> io::Result<()>;

    /// Change a single property without an atomic commit
    fn set_object_property(&self, object: DrmObject, prop: property::Handle, value: u64) -> io::Result<()>;

    /// Legacy gamma ramp update
    fn set_gamma_ramp(&self, crtc: crtc::Handle, lut: &[LutEntry]) -> io::Result<()>;

    /// Submit an atomic commit
    ///
    /// `crtcs` are the crtcs the commit touches, the kernel sends one completion event
    /// for each of them. `callback` fires once all of them arrived.
    fn commit_properties(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
        crtcs: &[crtc::Handle],
        callback: Option<PageFlipCallback>,
    ) -> io::Result<()>;
}

/// Properties of an object by name, with their handle and current value
pub(crate) type PropMap = HashMap<String, (property::Handle, u64)>;

pub(crate) fn map_props<D: KmsDevice + ?Sized>(dev: &D, object: DrmObject) -> Result<PropMap, Error> {
    let props = dev.object_properties(object).map_err(|source| {
        Error::Access(AccessError {
            errmsg: "Failed to get properties",
            dev: dev.dev_path(),
            source,
        })
    })?;

    props
        .into_iter()
        .map(|(handle, value)| {
            let name = dev.property_name(handle).map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to get property info",
                    dev: dev.dev_path(),
                    source,
                })
            })?;
            Ok((name, (handle, value)))
        })
        .collect()
}

/// Property blob, released again once dropped
///
/// The kernel keeps its own reference for as long as a property points at the blob.
#[derive(Debug)]
pub(crate) struct PropertyBlob<'a, D: KmsDevice + ?Sized> {
    dev: &'a D,
    id: u64,
}

impl<'a, D: KmsDevice + ?Sized> PropertyBlob<'a, D> {
    pub fn new(dev: &'a D, data: &[u8]) -> Result<Self, Error> {
        let id = dev.create_property_blob(data).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to create property blob",
                dev: dev.dev_path(),
                source,
            })
        })?;
        Ok(PropertyBlob { dev, id })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<'a, D: KmsDevice + ?Sized> Drop for PropertyBlob<'a, D> {
    fn drop(&mut self) {
        if let Err(err) = self.dev.destroy_property_blob(self.id) {
            warn!(blob = self.id, "Failed to destroy property blob: {}", err);
        }
    }
}

/// Returns true if the environment forces the legacy commit path
pub(crate) fn force_legacy() -> bool {
    std::env::var("DRMPLANE_USE_LEGACY")
        .map(|x| {
            x == "1" || x.to_lowercase() == "true" || x.to_lowercase() == "yes" || x.to_lowercase() == "y"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{force_legacy, AtomicRequest, DrmObject};
    use drm::control::{crtc, from_u32, plane, property, RawResourceHandle};

    #[test]
    fn request_last_write_wins() {
        let plane: plane::Handle = from_u32(31).unwrap();
        let prop: property::Handle = from_u32(7).unwrap();
        let mut req = AtomicRequest::new();
        assert!(req.is_empty());
        req.add_property(plane, prop, 1);
        req.add_property(plane, prop, 2);
        assert_eq!(req.value_of(plane, prop), Some(2));
        assert_eq!(req.properties().len(), 2);
        req.clear();
        assert_eq!(req.value_of(plane, prop), None);
    }

    #[test]
    fn object_raw_handle() {
        let crtc: crtc::Handle = from_u32(12).unwrap();
        let raw: RawResourceHandle = DrmObject::Crtc(crtc).into();
        assert_eq!(raw.get(), 12);
    }

    #[test]
    fn legacy_env_var() {
        std::env::set_var("DRMPLANE_USE_LEGACY", "Yes");
        assert!(force_legacy());
        std::env::set_var("DRMPLANE_USE_LEGACY", "0");
        assert!(!force_legacy());
        std::env::remove_var("DRMPLANE_USE_LEGACY");
        assert!(!force_legacy());
    }
}
