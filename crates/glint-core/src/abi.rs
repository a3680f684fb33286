//! Foreign device ABI: the method-table shape this workspace intercepts.
//!
//! The slot indices, signatures, and `extern "system"` calling convention below
//! describe the third-party graphics device interface as the application's
//! runtime lays it out. Only a handful of slots participate in shader identity,
//! binding tracking, or draw gating; the rest are declared so the table snapshot
//! and trampoline cover them with transparent passthrough.

use glint_vtbl::{foreign_interface, ForeignObject};

/// COM-style status code returned by every device method.
pub type Hresult = i32;

/// Success.
pub const S_OK: Hresult = 0;
/// Generic failure (`E_FAIL`).
pub const E_FAIL: Hresult = 0x8000_4005_u32 as i32;

pub fn succeeded(hr: Hresult) -> bool {
    hr >= 0
}

foreign_interface! {
    /// The intercepted graphics device interface.
    ///
    /// Slots 0-5 are pure passthrough; they are declared so the pre-patch
    /// snapshot and trampoline objects cover the full table.
    pub interface device {
        slot 0 fn query_interface(
            this,
            iid: *const core::ffi::c_void,
            out: *mut *mut core::ffi::c_void,
        ) -> Hresult;
        slot 1 fn add_ref(this) -> u32;
        slot 2 fn release(this) -> u32;
        slot 3 fn test_cooperative_level(this) -> Hresult;
        slot 4 fn begin_scene(this) -> Hresult;
        slot 5 fn end_scene(this) -> Hresult;
        slot 6 fn present(this) -> Hresult;
        slot 7 fn create_vertex_shader(
            this,
            bytecode: *const u8,
            len: usize,
            out: *mut *mut core::ffi::c_void,
        ) -> Hresult;
        slot 8 fn create_pixel_shader(
            this,
            bytecode: *const u8,
            len: usize,
            out: *mut *mut core::ffi::c_void,
        ) -> Hresult;
        slot 9 fn set_vertex_shader(this, shader: *mut core::ffi::c_void) -> Hresult;
        slot 10 fn set_pixel_shader(this, shader: *mut core::ffi::c_void) -> Hresult;
        slot 11 fn set_indices(this, index_buffer: *mut core::ffi::c_void) -> Hresult;
        slot 12 fn set_render_target(
            this,
            index: u32,
            surface: *mut core::ffi::c_void,
        ) -> Hresult;
        slot 13 fn draw_primitive(
            this,
            primitive_type: u32,
            start_vertex: u32,
            primitive_count: u32,
        ) -> Hresult;
        slot 14 fn draw_indexed_primitive(
            this,
            primitive_type: u32,
            base_vertex: i32,
            min_index: u32,
            num_vertices: u32,
            start_index: u32,
            primitive_count: u32,
        ) -> Hresult;
        slot 15 fn create_index_buffer(
            this,
            length: u32,
            usage: u32,
            format: u32,
            pool: u32,
            out: *mut *mut core::ffi::c_void,
        ) -> Hresult;
        slot 16 fn create_render_target(
            this,
            width: u32,
            height: u32,
            format: u32,
            multisample: u32,
            out: *mut *mut core::ffi::c_void,
        ) -> Hresult;
    }
}

/// Invokes `Release` (slot 2) through an object's *own* table.
///
/// Only valid for objects whose tables are never patched (shader objects,
/// surfaces, buffers). Device pointers must be released through
/// [`device::Original::release`] instead, or this would re-enter the
/// replacement function.
///
/// # Safety
///
/// `object` must be a live foreign object with the COM trio in slots 0-2.
pub unsafe fn release_unknown(object: *mut ForeignObject) -> u32 {
    let table = (*object).vtbl;
    let f: unsafe extern "system" fn(*mut ForeignObject) -> u32 =
        core::mem::transmute(core::ptr::read(table.add(2)));
    f(object)
}
