//! Shared harness: a fake foreign device with a writable method table, minimal
//! COM-style child objects, a stub compiler, and a recording stereo bridge.
#![allow(dead_code)]

use core::ffi::c_void;
use std::mem::transmute;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use glint::abi::{Hresult, E_FAIL, S_OK};
use glint::{CompileError, ForeignObject, ShaderCompiler, StereoBridge, StereoError};

/// Installs a test-writer subscriber once per binary; repeat calls are no-ops.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

// ---- minimal child object (shader, buffer, surface) ------------------------

#[repr(C)]
pub struct FakeUnknown {
    vtbl: *mut usize,
    table: Box<[usize; 3]>,
    refs: AtomicU32,
    releases: Arc<AtomicU32>,
}

unsafe extern "system" fn unk_query_interface(
    _this: *mut ForeignObject,
    _iid: *const c_void,
    _out: *mut *mut c_void,
) -> Hresult {
    E_FAIL
}

unsafe extern "system" fn unk_add_ref(this: *mut ForeignObject) -> u32 {
    let u = &*(this as *const FakeUnknown);
    u.refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn unk_release(this: *mut ForeignObject) -> u32 {
    let u = &*(this as *const FakeUnknown);
    u.releases.fetch_add(1, Ordering::SeqCst);
    u.refs.fetch_sub(1, Ordering::SeqCst) - 1
}

// Fn items must pass through their pointer type before becoming table entries.
type QueryFn =
    unsafe extern "system" fn(*mut ForeignObject, *const c_void, *mut *mut c_void) -> Hresult;
type RefCountFn = unsafe extern "system" fn(*mut ForeignObject) -> u32;
type NullaryFn = unsafe extern "system" fn(*mut ForeignObject) -> Hresult;
type CreateShaderFn =
    unsafe extern "system" fn(*mut ForeignObject, *const u8, usize, *mut *mut c_void) -> Hresult;
type SetHandleFn = unsafe extern "system" fn(*mut ForeignObject, *mut c_void) -> Hresult;
type SetTargetFn = unsafe extern "system" fn(*mut ForeignObject, u32, *mut c_void) -> Hresult;
type DrawFn = unsafe extern "system" fn(*mut ForeignObject, u32, u32, u32) -> Hresult;
type DrawIndexedFn =
    unsafe extern "system" fn(*mut ForeignObject, u32, i32, u32, u32, u32, u32) -> Hresult;
type CreateResourceFn =
    unsafe extern "system" fn(*mut ForeignObject, u32, u32, u32, u32, *mut *mut c_void) -> Hresult;

/// Allocates a leaked child object; the counter records how many times it was
/// released.
pub fn fake_unknown() -> (usize, Arc<AtomicU32>) {
    let releases = Arc::new(AtomicU32::new(0));
    let mut obj = Box::new(FakeUnknown {
        vtbl: ptr::null_mut(),
        table: Box::new([
            unk_query_interface as QueryFn as usize,
            unk_add_ref as RefCountFn as usize,
            unk_release as RefCountFn as usize,
        ]),
        refs: AtomicU32::new(1),
        releases: releases.clone(),
    });
    obj.vtbl = obj.table.as_mut_ptr();
    (Box::into_raw(obj) as usize, releases)
}

// ---- fake device ------------------------------------------------------------

pub struct CreatedObject {
    pub handle: usize,
    pub bytecode: Vec<u8>,
    pub releases: Arc<AtomicU32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRecord {
    pub vs: usize,
    pub ps: usize,
    pub ib: usize,
}

#[derive(Default)]
pub struct DeviceState {
    /// Shader objects in creation order, including ones the sweep creates.
    pub created: Vec<CreatedObject>,
    pub bound_vs: usize,
    pub bound_ps: usize,
    pub bound_ib: usize,
    pub draws: Vec<DrawRecord>,
    pub presents: u32,
}

#[repr(C)]
pub struct FakeDevice {
    vtbl: *mut usize,
    table: Box<[usize; 17]>,
    refs: AtomicU32,
    state: Mutex<DeviceState>,
}

fn dev<'a>(this: *mut ForeignObject) -> &'a FakeDevice {
    unsafe { &*(this as *const FakeDevice) }
}

unsafe extern "system" fn dev_add_ref(this: *mut ForeignObject) -> u32 {
    dev(this).refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn dev_release(this: *mut ForeignObject) -> u32 {
    dev(this).refs.fetch_sub(1, Ordering::SeqCst) - 1
}

unsafe extern "system" fn dev_ok(_this: *mut ForeignObject) -> Hresult {
    S_OK
}

unsafe extern "system" fn dev_present(this: *mut ForeignObject) -> Hresult {
    dev(this).state.lock().unwrap().presents += 1;
    S_OK
}

unsafe fn dev_create_shader(
    this: *mut ForeignObject,
    bytecode: *const u8,
    len: usize,
    out: *mut *mut c_void,
) -> Hresult {
    if bytecode.is_null() || out.is_null() {
        return E_FAIL;
    }
    let bytes = slice::from_raw_parts(bytecode, len).to_vec();
    let (handle, releases) = fake_unknown();
    dev(this).state.lock().unwrap().created.push(CreatedObject {
        handle,
        bytecode: bytes,
        releases,
    });
    *out = handle as *mut c_void;
    S_OK
}

unsafe extern "system" fn dev_create_vertex_shader(
    this: *mut ForeignObject,
    bytecode: *const u8,
    len: usize,
    out: *mut *mut c_void,
) -> Hresult {
    dev_create_shader(this, bytecode, len, out)
}

unsafe extern "system" fn dev_create_pixel_shader(
    this: *mut ForeignObject,
    bytecode: *const u8,
    len: usize,
    out: *mut *mut c_void,
) -> Hresult {
    dev_create_shader(this, bytecode, len, out)
}

unsafe extern "system" fn dev_set_vertex_shader(
    this: *mut ForeignObject,
    shader: *mut c_void,
) -> Hresult {
    dev(this).state.lock().unwrap().bound_vs = shader as usize;
    S_OK
}

unsafe extern "system" fn dev_set_pixel_shader(
    this: *mut ForeignObject,
    shader: *mut c_void,
) -> Hresult {
    dev(this).state.lock().unwrap().bound_ps = shader as usize;
    S_OK
}

unsafe extern "system" fn dev_set_indices(
    this: *mut ForeignObject,
    index_buffer: *mut c_void,
) -> Hresult {
    dev(this).state.lock().unwrap().bound_ib = index_buffer as usize;
    S_OK
}

unsafe extern "system" fn dev_set_render_target(
    _this: *mut ForeignObject,
    _index: u32,
    _surface: *mut c_void,
) -> Hresult {
    S_OK
}

unsafe fn dev_record_draw(this: *mut ForeignObject) -> Hresult {
    let mut state = dev(this).state.lock().unwrap();
    let record = DrawRecord {
        vs: state.bound_vs,
        ps: state.bound_ps,
        ib: state.bound_ib,
    };
    state.draws.push(record);
    S_OK
}

unsafe extern "system" fn dev_draw_primitive(
    this: *mut ForeignObject,
    _primitive_type: u32,
    _start_vertex: u32,
    _primitive_count: u32,
) -> Hresult {
    dev_record_draw(this)
}

unsafe extern "system" fn dev_draw_indexed_primitive(
    this: *mut ForeignObject,
    _primitive_type: u32,
    _base_vertex: i32,
    _min_index: u32,
    _num_vertices: u32,
    _start_index: u32,
    _primitive_count: u32,
) -> Hresult {
    dev_record_draw(this)
}

unsafe extern "system" fn dev_create_index_buffer(
    this: *mut ForeignObject,
    _length: u32,
    _usage: u32,
    _format: u32,
    _pool: u32,
    out: *mut *mut c_void,
) -> Hresult {
    let (handle, releases) = fake_unknown();
    dev(this).state.lock().unwrap().created.push(CreatedObject {
        handle,
        bytecode: Vec::new(),
        releases,
    });
    *out = handle as *mut c_void;
    S_OK
}

unsafe extern "system" fn dev_create_render_target(
    this: *mut ForeignObject,
    _width: u32,
    _height: u32,
    _format: u32,
    _multisample: u32,
    out: *mut *mut c_void,
) -> Hresult {
    let (handle, releases) = fake_unknown();
    dev(this).state.lock().unwrap().created.push(CreatedObject {
        handle,
        bytecode: Vec::new(),
        releases,
    });
    *out = handle as *mut c_void;
    S_OK
}

unsafe extern "system" fn dev_query_interface(
    _this: *mut ForeignObject,
    _iid: *const c_void,
    _out: *mut *mut c_void,
) -> Hresult {
    E_FAIL
}

impl FakeDevice {
    /// Allocates a leaked device. Controllers, the instance router, and the
    /// interceptor's shape map all key on addresses, so a fake device's storage
    /// (and its table's) must never be reused by a later test.
    pub fn new() -> &'static Self {
        let mut device = Box::new(Self {
            vtbl: ptr::null_mut(),
            table: Box::new([
                dev_query_interface as QueryFn as usize,
                dev_add_ref as RefCountFn as usize,
                dev_release as RefCountFn as usize,
                dev_ok as NullaryFn as usize, // test_cooperative_level
                dev_ok as NullaryFn as usize, // begin_scene
                dev_ok as NullaryFn as usize, // end_scene
                dev_present as NullaryFn as usize,
                dev_create_vertex_shader as CreateShaderFn as usize,
                dev_create_pixel_shader as CreateShaderFn as usize,
                dev_set_vertex_shader as SetHandleFn as usize,
                dev_set_pixel_shader as SetHandleFn as usize,
                dev_set_indices as SetHandleFn as usize,
                dev_set_render_target as SetTargetFn as usize,
                dev_draw_primitive as DrawFn as usize,
                dev_draw_indexed_primitive as DrawIndexedFn as usize,
                dev_create_index_buffer as CreateResourceFn as usize,
                dev_create_render_target as CreateResourceFn as usize,
            ]),
            refs: AtomicU32::new(1),
            state: Mutex::new(DeviceState::default()),
        });
        device.vtbl = device.table.as_mut_ptr();
        Box::leak(device)
    }

    pub fn as_foreign(&self) -> *mut ForeignObject {
        self as *const Self as *mut ForeignObject
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// The unpatched entry currently stored at `slot` of the live table.
    pub fn table_entry(&self, slot: usize) -> usize {
        self.table[slot]
    }
}

// ---- virtual-call helpers (dispatch through the live, possibly patched table)

unsafe fn entry(device: *mut ForeignObject, slot: usize) -> usize {
    ptr::read((*device).vtbl.add(slot))
}

pub unsafe fn vcall_release(device: *mut ForeignObject) -> u32 {
    let f: unsafe extern "system" fn(*mut ForeignObject) -> u32 = transmute(entry(device, 2));
    f(device)
}

pub unsafe fn vcall_present(device: *mut ForeignObject) -> Hresult {
    let f: unsafe extern "system" fn(*mut ForeignObject) -> Hresult = transmute(entry(device, 6));
    f(device)
}

unsafe fn vcall_create_shader(device: *mut ForeignObject, slot: usize, bytes: &[u8]) -> usize {
    let f: unsafe extern "system" fn(
        *mut ForeignObject,
        *const u8,
        usize,
        *mut *mut c_void,
    ) -> Hresult = transmute(entry(device, slot));
    let mut out: *mut c_void = ptr::null_mut();
    assert_eq!(f(device, bytes.as_ptr(), bytes.len(), &mut out), S_OK);
    out as usize
}

pub unsafe fn vcall_create_vertex_shader(device: *mut ForeignObject, bytes: &[u8]) -> usize {
    vcall_create_shader(device, 7, bytes)
}

pub unsafe fn vcall_create_pixel_shader(device: *mut ForeignObject, bytes: &[u8]) -> usize {
    vcall_create_shader(device, 8, bytes)
}

unsafe fn vcall_set_handle(device: *mut ForeignObject, slot: usize, handle: usize) -> Hresult {
    let f: unsafe extern "system" fn(*mut ForeignObject, *mut c_void) -> Hresult =
        transmute(entry(device, slot));
    f(device, handle as *mut c_void)
}

pub unsafe fn vcall_set_vertex_shader(device: *mut ForeignObject, handle: usize) -> Hresult {
    vcall_set_handle(device, 9, handle)
}

pub unsafe fn vcall_set_pixel_shader(device: *mut ForeignObject, handle: usize) -> Hresult {
    vcall_set_handle(device, 10, handle)
}

pub unsafe fn vcall_set_indices(device: *mut ForeignObject, handle: usize) -> Hresult {
    vcall_set_handle(device, 11, handle)
}

pub unsafe fn vcall_create_index_buffer(
    device: *mut ForeignObject,
    length: u32,
    usage: u32,
    format: u32,
    pool: u32,
) -> usize {
    let f: unsafe extern "system" fn(
        *mut ForeignObject,
        u32,
        u32,
        u32,
        u32,
        *mut *mut c_void,
    ) -> Hresult = transmute(entry(device, 15));
    let mut out: *mut c_void = ptr::null_mut();
    assert_eq!(f(device, length, usage, format, pool, &mut out), S_OK);
    out as usize
}

pub unsafe fn vcall_draw_primitive(device: *mut ForeignObject) -> Hresult {
    let f: unsafe extern "system" fn(*mut ForeignObject, u32, u32, u32) -> Hresult =
        transmute(entry(device, 13));
    f(device, 4, 0, 2)
}

pub unsafe fn vcall_draw_indexed(device: *mut ForeignObject) -> Hresult {
    let f: unsafe extern "system" fn(
        *mut ForeignObject,
        u32,
        i32,
        u32,
        u32,
        u32,
        u32,
    ) -> Hresult = transmute(entry(device, 14));
    f(device, 4, 0, 0, 6, 0, 2)
}

// ---- stub compiler ----------------------------------------------------------

/// Deterministic text-based "compiler": the blob is the source prefixed, so
/// tests can assert which source a replacement was built from. A source
/// containing `#error` fails with that line as the diagnostics.
pub struct StubCompiler;

impl ShaderCompiler for StubCompiler {
    fn compile(&self, source: &str, _entry_point: &str, model: &str) -> Result<Vec<u8>, CompileError> {
        if let Some(line) = source.lines().find(|l| l.contains("#error")) {
            return Err(CompileError::Failed {
                model: model.to_owned(),
                diagnostics: line.to_owned(),
            });
        }
        Ok(format!("BLOB[{model}]:{source}").into_bytes())
    }

    fn disassemble(&self, bytecode: &[u8]) -> Result<String, CompileError> {
        Ok(format!("; listing of {} bytes\n", bytecode.len()))
    }

    fn decompile(&self, bytecode: &[u8]) -> Result<String, CompileError> {
        Ok(format!("// recovered from {} bytes\nreturn 0;\n", bytecode.len()))
    }
}

// ---- recording stereo bridge ------------------------------------------------

#[derive(Debug)]
pub struct RecordingStereo {
    pub separation: Mutex<f32>,
    pub convergence: Mutex<f32>,
    /// Every successful set, in order.
    pub log: Mutex<Vec<(&'static str, f32)>>,
}

impl RecordingStereo {
    pub fn new(separation: f32, convergence: f32) -> Arc<Self> {
        Arc::new(Self {
            separation: Mutex::new(separation),
            convergence: Mutex::new(convergence),
            log: Mutex::new(Vec::new()),
        })
    }
}

impl StereoBridge for RecordingStereo {
    fn separation(&self) -> Result<f32, StereoError> {
        Ok(*self.separation.lock().unwrap())
    }

    fn set_separation(&self, value: f32) -> Result<(), StereoError> {
        *self.separation.lock().unwrap() = value;
        self.log.lock().unwrap().push(("separation", value));
        Ok(())
    }

    fn convergence(&self) -> Result<f32, StereoError> {
        Ok(*self.convergence.lock().unwrap())
    }

    fn set_convergence(&self, value: f32) -> Result<(), StereoError> {
        *self.convergence.lock().unwrap() = value;
        self.log.lock().unwrap().push(("convergence", value));
        Ok(())
    }
}

/// Shared handle to a [`RecordingStereo`]: the controller owns one end, the
/// test keeps the other to inspect the log.
pub struct SharedStereo(pub Arc<RecordingStereo>);

impl StereoBridge for SharedStereo {
    fn separation(&self) -> Result<f32, StereoError> {
        self.0.separation()
    }

    fn set_separation(&self, value: f32) -> Result<(), StereoError> {
        self.0.set_separation(value)
    }

    fn convergence(&self) -> Result<f32, StereoError> {
        self.0.convergence()
    }

    fn set_convergence(&self, value: f32) -> Result<(), StereoError> {
        self.0.set_convergence(value)
    }
}
