//! In-memory kms device recording every kernel call

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::Rc,
    time::Duration,
};

use drm::{
    control::{crtc, framebuffer, from_u32, plane, property, AtomicCommitFlags, RawResourceHandle},
    ClientCapability,
};
use drm_fourcc::DrmFourcc;

use crate::{
    backend::drm::{
        color::LutEntry,
        device::{AtomicRequest, DrmObject, EventMetadata, KmsDevice, PageFlipCallback, PlaneInfo, Time},
        plane::format::FormatBlob,
        CrtcController, ScanoutBuffer,
    },
    utils::{Buffer, Physical, Rectangle, Size},
};

const CRTC_ID_BASE: u32 = 100;
const PROPERTY_ID_BASE: u32 = 1000;
const BLOB_ID_BASE: u64 = 5000;
const FORMATS_BLOB_ID_BASE: u64 = 9000;

const PLANE_PROPERTIES: [&str; 12] = [
    "type",
    "CRTC_ID",
    "FB_ID",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "rotation",
];

#[derive(Debug, Clone)]
pub struct MockPlane {
    id: u32,
    possible_crtcs: u32,
    kind: u64,
    formats: Vec<u32>,
    in_formats: Option<FormatBlob>,
    missing: Vec<&'static str>,
    extra: Vec<&'static str>,
}

impl MockPlane {
    fn new(id: u32, possible_crtcs: u32, kind: u64, formats: Vec<DrmFourcc>) -> Self {
        MockPlane {
            id,
            possible_crtcs,
            kind,
            formats: formats.into_iter().map(|f| f as u32).collect(),
            in_formats: None,
            missing: Vec::new(),
            extra: vec!["IN_FENCE_FD"],
        }
    }

    pub fn primary(id: u32, possible_crtcs: u32) -> Self {
        Self::new(
            id,
            possible_crtcs,
            1,
            vec![DrmFourcc::Xrgb8888, DrmFourcc::Xbgr8888],
        )
    }

    pub fn overlay(id: u32, possible_crtcs: u32) -> Self {
        Self::new(
            id,
            possible_crtcs,
            0,
            vec![
                DrmFourcc::Xrgb8888,
                DrmFourcc::Argb8888,
                DrmFourcc::Uyvy,
                DrmFourcc::Nv12,
            ],
        )
    }

    pub fn cursor(id: u32, possible_crtcs: u32) -> Self {
        Self::new(id, possible_crtcs, 2, vec![DrmFourcc::Argb8888, DrmFourcc::Xrgb8888])
    }

    pub fn formats(mut self, formats: Vec<u32>) -> Self {
        self.formats = formats;
        self
    }

    pub fn in_formats(mut self, blob: FormatBlob) -> Self {
        self.in_formats = Some(blob);
        self
    }

    pub fn without_property(mut self, name: &'static str) -> Self {
        self.missing.push(name);
        self
    }

    pub fn with_property(mut self, name: &'static str) -> Self {
        self.extra.push(name);
        self
    }

    fn handle(&self) -> plane::Handle {
        from_u32(self.id).unwrap()
    }
}

#[derive(Default)]
pub struct MockKmsDevice {
    crtcs: Vec<crtc::Handle>,
    planes: Vec<MockPlane>,
    properties: HashMap<DrmObject, Vec<(property::Handle, u64)>>,
    property_names: HashMap<property::Handle, String>,
    format_blobs: HashMap<u64, Vec<u8>>,

    pub atomic_supported: bool,
    pub universal_planes_supported: bool,
    universal_planes: Cell<bool>,

    pub fail_commits: Cell<bool>,
    pub fail_page_flips: Cell<bool>,
    pub fail_set_plane: Cell<bool>,
    pub sync_flips: Cell<bool>,

    pub commits: RefCell<Vec<(AtomicRequest, AtomicCommitFlags, Vec<crtc::Handle>)>>,
    pub page_flips: RefCell<Vec<(crtc::Handle, framebuffer::Handle)>>,
    pub set_planes: RefCell<Vec<(plane::Handle, crtc::Handle, Option<framebuffer::Handle>)>>,
    pub property_sets: RefCell<Vec<(DrmObject, property::Handle, u64)>>,
    pub gamma_ramps: RefCell<Vec<(crtc::Handle, Vec<LutEntry>)>>,
    pub blobs: RefCell<HashMap<u64, Vec<u8>>>,
    pub destroyed_blobs: RefCell<Vec<u64>>,
    next_blob: Cell<u64>,
    callbacks: RefCell<Vec<PageFlipCallback>>,
    sequence: Cell<u32>,
}

impl MockKmsDevice {
    /// Device with `crtc_count` crtcs (ids 100, 101, ...) and the given planes
    pub fn new(crtc_count: u32, planes: Vec<MockPlane>) -> Self {
        let mut dev = MockKmsDevice {
            crtcs: (0..crtc_count)
                .map(|i| from_u32(CRTC_ID_BASE + i).unwrap())
                .collect(),
            atomic_supported: true,
            universal_planes_supported: true,
            next_blob: Cell::new(BLOB_ID_BASE),
            ..Default::default()
        };
        for crtc in dev.crtcs.clone() {
            dev.properties.insert(DrmObject::Crtc(crtc), Vec::new());
        }
        for (i, plane) in planes.iter().enumerate() {
            let object = DrmObject::Plane(plane.handle());
            for name in PLANE_PROPERTIES.iter().chain(plane.extra.iter()) {
                if plane.missing.contains(name) {
                    continue;
                }
                let value = if *name == "type" { plane.kind } else { 0 };
                dev.add_property(object, name, value);
            }
            if let Some(blob) = plane.in_formats.as_ref() {
                let id = FORMATS_BLOB_ID_BASE + i as u64;
                dev.format_blobs.insert(id, blob.encode());
                dev.add_property(object, "IN_FORMATS", id);
            }
        }
        dev.planes = planes;
        dev
    }

    /// Two crtcs with a primary, an overlay and a cursor plane each
    pub fn two_crtcs() -> Self {
        MockKmsDevice::new(
            2,
            vec![
                MockPlane::primary(10, 0b01),
                MockPlane::overlay(11, 0b01),
                MockPlane::cursor(12, 0b01),
                MockPlane::primary(20, 0b10),
                MockPlane::overlay(21, 0b10),
                MockPlane::cursor(22, 0b10),
            ],
        )
    }

    /// Add the color management properties to a crtc
    pub fn with_color_management(mut self, crtc_index: usize, lut_size: u64) -> Self {
        let object = DrmObject::Crtc(self.crtcs[crtc_index]);
        self.add_property(object, "CTM", 0);
        self.add_property(object, "GAMMA_LUT", 0);
        self.add_property(object, "GAMMA_LUT_SIZE", lut_size);
        self.add_property(object, "DEGAMMA_LUT", 0);
        self.add_property(object, "DEGAMMA_LUT_SIZE", lut_size);
        self
    }

    pub fn with_crtc_property(mut self, crtc_index: usize, name: &str, value: u64) -> Self {
        let object = DrmObject::Crtc(self.crtcs[crtc_index]);
        self.add_property(object, name, value);
        self
    }

    pub fn legacy_only(mut self) -> Self {
        self.atomic_supported = false;
        self
    }

    pub fn without_universal_planes(mut self) -> Self {
        self.universal_planes_supported = false;
        self
    }

    fn add_property(&mut self, object: DrmObject, name: &str, value: u64) {
        let handle = self.property_handle(name);
        self.properties.entry(object).or_default().push((handle, value));
    }

    pub fn property_handle(&mut self, name: &str) -> property::Handle {
        if let Some((handle, _)) = self.property_names.iter().find(|(_, n)| n.as_str() == name) {
            return *handle;
        }
        let handle = from_u32(PROPERTY_ID_BASE + self.property_names.len() as u32).unwrap();
        self.property_names.insert(handle, name.to_string());
        handle
    }

    /// Handle of an already registered property
    pub fn prop(&self, name: &str) -> property::Handle {
        self.property_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(handle, _)| *handle)
            .unwrap()
    }

    pub fn crtc(&self, index: usize) -> crtc::Handle {
        self.crtcs[index]
    }

    /// Number of calls that change device state
    pub fn kernel_calls(&self) -> usize {
        self.commits.borrow().len()
            + self.page_flips.borrow().len()
            + self.set_planes.borrow().len()
            + self.property_sets.borrow().len()
            + self.gamma_ramps.borrow().len()
            + self.blobs.borrow().len()
    }

    pub fn last_commit(&self) -> (AtomicRequest, AtomicCommitFlags, Vec<crtc::Handle>) {
        self.commits.borrow().last().cloned().unwrap()
    }

    /// Deliver all pending completion events
    pub fn run_callbacks(&self) -> usize {
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        let count = callbacks.len();
        for callback in callbacks {
            callback(self.next_metadata());
        }
        count
    }

    fn next_metadata(&self) -> EventMetadata {
        let sequence = self.sequence.get() + 1;
        self.sequence.set(sequence);
        EventMetadata {
            time: Time::Monotonic(Duration::from_millis(16 * sequence as u64)),
            sequence,
        }
    }

    fn queue(&self, callback: PageFlipCallback) {
        if self.sync_flips.get() {
            callback(self.next_metadata());
        } else {
            self.callbacks.borrow_mut().push(callback);
        }
    }
}

impl std::fmt::Debug for MockKmsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockKmsDevice")
            .field("crtcs", &self.crtcs)
            .field("planes", &self.planes)
            .field("commits", &self.commits.borrow().len())
            .field("pending_callbacks", &self.callbacks.borrow().len())
            .finish_non_exhaustive()
    }
}

fn rejected() -> io::Error {
    io::Error::from_raw_os_error(22)
}

impl KmsDevice for MockKmsDevice {
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        match cap {
            ClientCapability::Atomic if !self.atomic_supported => Err(rejected()),
            ClientCapability::UniversalPlanes if !self.universal_planes_supported => Err(rejected()),
            ClientCapability::UniversalPlanes => {
                self.universal_planes.set(enable);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn crtcs(&self) -> io::Result<Vec<crtc::Handle>> {
        Ok(self.crtcs.clone())
    }

    fn planes(&self) -> io::Result<Vec<plane::Handle>> {
        // primary and cursor planes are hidden without universal planes
        Ok(self
            .planes
            .iter()
            .filter(|plane| self.universal_planes.get() || plane.kind == 0)
            .map(MockPlane::handle)
            .collect())
    }

    fn plane_info(&self, handle: plane::Handle) -> io::Result<PlaneInfo> {
        self.planes
            .iter()
            .find(|plane| plane.handle() == handle)
            .map(|plane| PlaneInfo {
                possible_crtcs: plane.possible_crtcs,
                formats: plane.formats.clone(),
            })
            .ok_or_else(rejected)
    }

    fn object_properties(&self, object: DrmObject) -> io::Result<Vec<(property::Handle, u64)>> {
        self.properties.get(&object).cloned().ok_or_else(rejected)
    }

    fn property_name(&self, prop: property::Handle) -> io::Result<String> {
        self.property_names.get(&prop).cloned().ok_or_else(rejected)
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        if let Some(data) = self.format_blobs.get(&blob) {
            return Ok(data.clone());
        }
        let data = self.blobs.borrow().get(&blob).cloned();
        data.ok_or_else(rejected)
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u64> {
        let id = self.next_blob.get();
        self.next_blob.set(id + 1);
        self.blobs.borrow_mut().insert(id, data.to_vec());
        Ok(id)
    }

    fn destroy_property_blob(&self, blob: u64) -> io::Result<()> {
        self.destroyed_blobs.borrow_mut().push(blob);
        Ok(())
    }

    fn page_flip(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        callback: PageFlipCallback,
    ) -> io::Result<()> {
        self.page_flips.borrow_mut().push((crtc, framebuffer));
        if self.fail_page_flips.get() {
            return Err(rejected());
        }
        self.queue(callback);
        Ok(())
    }

    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        _dst: Rectangle<i32, Physical>,
        _src: Rectangle<u32, Buffer>,
    ) -> io::Result<()> {
        self.set_planes.borrow_mut().push((plane, crtc, framebuffer));
        if self.fail_set_plane.get() {
            return Err(rejected());
        }
        Ok(())
    }

    fn set_object_property(&self, object: DrmObject, prop: property::Handle, value: u64) -> io::Result<()> {
        self.property_sets.borrow_mut().push((object, prop, value));
        Ok(())
    }

    fn set_gamma_ramp(&self, crtc: crtc::Handle, lut: &[LutEntry]) -> io::Result<()> {
        self.gamma_ramps.borrow_mut().push((crtc, lut.to_vec()));
        Ok(())
    }

    fn commit_properties(
        &self,
        request: &AtomicRequest,
        flags: AtomicCommitFlags,
        crtcs: &[crtc::Handle],
        callback: Option<PageFlipCallback>,
    ) -> io::Result<()> {
        self.commits
            .borrow_mut()
            .push((request.clone(), flags, crtcs.to_vec()));
        if self.fail_commits.get() {
            return Err(rejected());
        }
        if let Some(callback) = callback {
            if !flags.contains(AtomicCommitFlags::TEST_ONLY) {
                self.queue(callback);
            }
        }
        Ok(())
    }
}

/// Buffer with fixed framebuffer ids, the opaque framebuffer is `id + 1000`
#[derive(Debug)]
pub struct MockBuffer {
    id: u32,
    format: DrmFourcc,
    size: Size<i32, Buffer>,
}

impl MockBuffer {
    pub fn new(id: u32, format: DrmFourcc, size: (i32, i32)) -> Rc<MockBuffer> {
        Rc::new(MockBuffer {
            id,
            format,
            size: size.into(),
        })
    }
}

impl ScanoutBuffer for MockBuffer {
    fn framebuffer(&self) -> framebuffer::Handle {
        from_u32(self.id).unwrap()
    }

    fn opaque_framebuffer(&self) -> framebuffer::Handle {
        from_u32(self.id + 1000).unwrap()
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn opaque_format(&self) -> DrmFourcc {
        match self.format {
            DrmFourcc::Argb8888 => DrmFourcc::Xrgb8888,
            DrmFourcc::Abgr8888 => DrmFourcc::Xbgr8888,
            format => format,
        }
    }

    fn size(&self) -> Size<i32, Buffer> {
        self.size
    }
}

/// Controller counting its page flips
#[derive(Debug)]
pub struct MockController {
    crtc: crtc::Handle,
    pub flips: Cell<usize>,
    pub last_sequence: Cell<u32>,
}

impl MockController {
    pub fn new(crtc: crtc::Handle) -> Rc<MockController> {
        Rc::new(MockController {
            crtc,
            flips: Cell::new(0),
            last_sequence: Cell::new(0),
        })
    }
}

impl CrtcController for MockController {
    fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    fn on_page_flip(&self, metadata: &EventMetadata) {
        self.flips.set(self.flips.get() + 1);
        self.last_sequence.set(metadata.sequence);
    }
}

pub fn raw(handle: impl Into<RawResourceHandle>) -> u32 {
    handle.into().get()
}

/// Route the crate's logs to the test output
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
