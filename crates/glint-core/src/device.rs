//! Per-device controller: owns the tracker, forwards intercepted calls, and
//! drives marking, reload sweeps, and teardown.
//!
//! Replacement functions (`hk_*`) resolve their receiver through the instance
//! router; a device no controller claims passes straight through to the
//! pre-patch entry. All forwarding to foreign code happens with no lock held:
//! the tracker lock is taken, consulted, and dropped before any original entry
//! is invoked.

use core::ffi::c_void;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock};
use std::time::{Duration, Instant};

use glint_vtbl::{
    DirectWrite, ForeignObject, InstallError, Interceptor, PatchSlots, TableShape, Trampoline,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::abi::{self, device, succeeded, Hresult, E_FAIL, S_OK};
use crate::compile::{CompileError, ShaderCompiler};
use crate::gate::{DrawAction, StereoOverride};
use crate::hunt::{Direction, HuntCommand, IDLE_RESET};
use crate::identity::{
    IndexBufferDesc, RenderTargetDesc, ResourceClass, ShaderIdentity, ShaderStage,
};
use crate::reload::{
    asm_file_name, bytecode_file_name, identities_on_disk, replace_file_name, scan_override_dir,
    ReloadError, ReplacementRecord, SweepOutcome,
};
use crate::router;
use crate::stereo::StereoBridge;
use crate::track::{SetShaderOutcome, Tracker};

/// File the cross-reference dump is written to on every mark.
const USAGE_FILE: &str = "usage.txt";

/// Attachment-time configuration.
#[derive(Debug, Clone)]
pub struct HuntConfig {
    /// Directory holding exports and `_replace` override files.
    pub override_dir: PathBuf,
    /// When false, bindings are still tracked (replacements keep working) but
    /// no hunting history accumulates and the Draw Gate passes through.
    pub hunting: bool,
    /// Shader-model strings handed to the compiler per stage.
    pub vs_model: String,
    pub ps_model: String,
    pub entry_point: String,
    pub idle_reset: Duration,
}

impl Default for HuntConfig {
    fn default() -> Self {
        Self {
            override_dir: PathBuf::from("ShaderFixes"),
            hunting: true,
            vs_model: "vs_3_0".to_owned(),
            ps_model: "ps_3_0".to_owned(),
            entry_point: "main".to_owned(),
            idle_reset: IDLE_RESET,
        }
    }
}

/// External collaborators a controller delegates to.
pub struct Services {
    pub compiler: Box<dyn ShaderCompiler>,
    pub stereo: Box<dyn StereoBridge>,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("device {device:#x} already has a controller attached")]
    AlreadyAttached { device: usize },
    #[error(transparent)]
    Install(#[from] InstallError),
}

#[derive(Debug, Error)]
enum MarkError {
    #[error("nothing selected for {class:?}")]
    NothingSelected { class: ResourceClass },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MarkError {
    fn io(path: PathBuf, source: io::Error) -> Self {
        Self::Io { path, source }
    }
}

static INTERCEPTOR: OnceLock<Interceptor> = OnceLock::new();

/// The process-wide installer. Defaults to the direct-write patch backend.
pub fn interceptor() -> &'static Interceptor {
    INTERCEPTOR.get_or_init(|| Interceptor::new(Box::new(DirectWrite)))
}

/// Replaces the default patch backend. Must run before the first [`attach`];
/// returns false if the installer already exists.
pub fn install_patch_backend(backend: Box<dyn PatchSlots>) -> bool {
    INTERCEPTOR.set(Interceptor::new(backend)).is_ok()
}

fn device_shape() -> TableShape {
    // A fn item has no address of its own; it must pass through its pointer
    // type before becoming a table entry.
    type ReleaseFn = unsafe extern "system" fn(*mut ForeignObject) -> u32;
    type NullaryFn = unsafe extern "system" fn(*mut ForeignObject) -> Hresult;
    type CreateShaderFn =
        unsafe extern "system" fn(*mut ForeignObject, *const u8, usize, *mut *mut c_void) -> Hresult;
    type SetHandleFn = unsafe extern "system" fn(*mut ForeignObject, *mut c_void) -> Hresult;
    type SetTargetFn = unsafe extern "system" fn(*mut ForeignObject, u32, *mut c_void) -> Hresult;
    type DrawFn = unsafe extern "system" fn(*mut ForeignObject, u32, u32, u32) -> Hresult;
    type DrawIndexedFn =
        unsafe extern "system" fn(*mut ForeignObject, u32, i32, u32, u32, u32, u32) -> Hresult;
    type CreateResourceFn = unsafe extern "system" fn(
        *mut ForeignObject,
        u32,
        u32,
        u32,
        u32,
        *mut *mut c_void,
    ) -> Hresult;

    TableShape {
        tag: "device",
        slot_count: device::SLOT_COUNT,
        overrides: vec![
            (2, hk_release as ReleaseFn as usize),
            (6, hk_present as NullaryFn as usize),
            (7, hk_create_vertex_shader as CreateShaderFn as usize),
            (8, hk_create_pixel_shader as CreateShaderFn as usize),
            (9, hk_set_vertex_shader as SetHandleFn as usize),
            (10, hk_set_pixel_shader as SetHandleFn as usize),
            (11, hk_set_indices as SetHandleFn as usize),
            (12, hk_set_render_target as SetTargetFn as usize),
            (13, hk_draw_primitive as DrawFn as usize),
            (14, hk_draw_indexed_primitive as DrawIndexedFn as usize),
            (15, hk_create_index_buffer as CreateResourceFn as usize),
            (16, hk_create_render_target as CreateResourceFn as usize),
        ],
    }
}

/// One draw submission, either form.
#[derive(Debug, Clone, Copy)]
enum DrawCall {
    Primitive {
        primitive_type: u32,
        start_vertex: u32,
        primitive_count: u32,
    },
    Indexed {
        primitive_type: u32,
        base_vertex: i32,
        min_index: u32,
        num_vertices: u32,
        start_index: u32,
        primitive_count: u32,
    },
}

pub struct DeviceController {
    device: usize,
    original: device::Original,
    trampoline: Box<Trampoline>,
    tracker: Mutex<Tracker>,
    compiler: Box<dyn ShaderCompiler>,
    stereo: Box<dyn StereoBridge>,
    config: HuntConfig,
    sweep_requested: AtomicBool,
    torn_down: AtomicBool,
    unknown_bind_warned: Once,
}

impl fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceController")
            .field("device", &format_args!("{:#x}", self.device))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Installs interception on `device`'s method table and registers a controller
/// for it.
///
/// Installation is all-or-nothing per table: if any slot fails to patch the
/// table is rolled back, no controller is registered, and the device keeps
/// running unmodified.
///
/// # Safety
///
/// `device` must be a live foreign device whose table matches the declared
/// interface, and must outlive the controller (the controller detaches itself
/// when the device's reference count reaches zero).
pub unsafe fn attach(
    device_obj: *mut ForeignObject,
    services: Services,
    config: HuntConfig,
) -> Result<Arc<DeviceController>, AttachError> {
    let key = device_obj as usize;
    if router::global().is_attached(key) {
        return Err(AttachError::AlreadyAttached { device: key });
    }

    let snapshot = interceptor().install(device_obj, &device_shape())?;
    let controller = Arc::new(DeviceController {
        device: key,
        original: device::Original(snapshot.clone()),
        trampoline: device::trampoline(snapshot, device_obj),
        tracker: Mutex::new(Tracker::new(config.hunting)),
        compiler: services.compiler,
        stereo: services.stereo,
        config,
        sweep_requested: AtomicBool::new(false),
        torn_down: AtomicBool::new(false),
        unknown_bind_warned: Once::new(),
    });
    router::global().register(key, controller.clone());
    info!(
        device = format_args!("{key:#x}"),
        hunting = controller.config.hunting,
        override_dir = %controller.config.override_dir.display(),
        "controller attached"
    );
    Ok(controller)
}

impl DeviceController {
    pub fn device(&self) -> usize {
        self.device
    }

    /// A proxy that behaves like the device but can never re-enter a
    /// replacement function; hand this to code that must see unmodified
    /// behavior.
    pub fn proxy(&self) -> *mut ForeignObject {
        self.trampoline.as_foreign()
    }

    pub fn config(&self) -> &HuntConfig {
        &self.config
    }

    /// Runs `f` under the tracker lock. Test and embedder access; intercepted
    /// calls use the internal guard directly.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut Tracker) -> R) -> R {
        f(&mut self.lock_tracker())
    }

    fn lock_tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- operator commands ----------------------------------------------

    /// Applies one hunting command. Failures are logged, never propagated to
    /// the render thread.
    pub fn hunt(&self, cmd: HuntCommand) {
        let now = Instant::now();
        match cmd {
            HuntCommand::Next(class) => self.step(class, Direction::Forward, now),
            HuntCommand::Previous(class) => self.step(class, Direction::Back, now),
            HuntCommand::Reset => {
                let mut tracker = self.lock_tracker();
                tracker.note_input(now);
                tracker.reset_hunting();
            }
            HuntCommand::Reload => {
                self.lock_tracker().note_input(now);
                self.sweep_requested.store(true, Ordering::Release);
            }
            HuntCommand::Mark(class) => {
                self.lock_tracker().note_input(now);
                if let Err(err) = self.mark(class) {
                    warn!(?class, error = %err, "mark failed");
                }
            }
        }
    }

    fn step(&self, class: ResourceClass, dir: Direction, now: Instant) {
        let mut tracker = self.lock_tracker();
        tracker.note_input(now);
        tracker.step_selection(class, dir);
        match tracker.selection(class).id() {
            Some(id) => info!(?class, identity = format_args!("{id:016x}"), "cursor moved"),
            None => debug!(?class, "cursor idle; nothing visited yet"),
        }
    }

    /// Exports the current selection: cross-reference dump always, and for
    /// shader classes the assembly listing, original bytecode, and (unless the
    /// operator already has one) an editable `_replace` source file.
    fn mark(&self, class: ResourceClass) -> Result<(), MarkError> {
        let (shader, dump) = {
            let tracker = self.lock_tracker();
            let Some(raw) = tracker.selection(class).id() else {
                return Err(MarkError::NothingSelected { class });
            };
            let shader = class.shader_stage().and_then(|stage| {
                let identity = ShaderIdentity::from_raw(raw);
                tracker
                    .bytecode_of(identity)
                    .map(|bytes| (identity, stage, bytes.to_vec()))
            });
            (shader, tracker.crossref_dump())
        };

        let dir = &self.config.override_dir;
        fs::create_dir_all(dir).map_err(|e| MarkError::io(dir.clone(), e))?;
        let usage = dir.join(USAGE_FILE);
        fs::write(&usage, dump).map_err(|e| MarkError::io(usage, e))?;

        let Some((identity, stage, bytes)) = shader else {
            return Ok(());
        };
        let asm = self.compiler.disassemble(&bytes)?;
        let asm_path = dir.join(asm_file_name(identity, stage));
        fs::write(&asm_path, asm).map_err(|e| MarkError::io(asm_path, e))?;
        let bin_path = dir.join(bytecode_file_name(identity, stage));
        fs::write(&bin_path, &bytes).map_err(|e| MarkError::io(bin_path, e))?;

        let replace_path = dir.join(replace_file_name(identity, stage));
        if replace_path.exists() {
            // Never clobber the operator's edits.
            debug!(path = %replace_path.display(), "replace file already present; left alone");
        } else {
            let source = self.compiler.decompile(&bytes)?;
            fs::write(&replace_path, source).map_err(|e| MarkError::io(replace_path, e))?;
        }
        info!(identity = %identity, stage = %stage, "shader exported");
        Ok(())
    }

    // ---- reload sweep ----------------------------------------------------

    /// Scans the override directory and reconciles live replacements with it:
    /// compiles new or changed `_replace` files, reverts identities whose file
    /// vanished, and rebinds the active stages so the swap is visible without
    /// waiting for the application's next bind.
    ///
    /// Normally runs on the frame after a reload command; public for embedders
    /// that drive sweeps on their own schedule.
    ///
    /// # Safety
    ///
    /// Must be called on a thread that may legally invoke the device (shader
    /// creation and rebinding go through pre-patch entries).
    pub unsafe fn run_reload_sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let candidates = match scan_override_dir(&self.config.override_dir) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "override directory scan failed; sweep aborted");
                return outcome;
            }
        };
        let on_disk: BTreeSet<ShaderIdentity> = identities_on_disk(&candidates);

        // Revert pass: a deleted replace file takes its replacement down.
        let reverted = self
            .lock_tracker()
            .take_replacements_not_on_disk(&on_disk);
        for (identity, record) in reverted {
            abi::release_unknown(record.object as *mut ForeignObject);
            info!(identity = %identity, "replacement reverted to original");
            outcome.reverted += 1;
        }

        for candidate in candidates {
            match self.reload_one(&candidate.path, candidate.identity, candidate.stage, candidate.mtime)
            {
                Ok(true) => outcome.compiled += 1,
                Ok(false) => outcome.skipped += 1,
                Err(err) => {
                    warn!(identity = %candidate.identity, error = %err, "reload failed");
                    outcome.failed += 1;
                }
            }
        }

        if outcome.compiled > 0 || outcome.reverted > 0 {
            self.rebind_current(self.device as *mut ForeignObject);
        }
        info!(
            compiled = outcome.compiled,
            skipped = outcome.skipped,
            failed = outcome.failed,
            reverted = outcome.reverted,
            "reload sweep finished"
        );
        outcome
    }

    /// Returns Ok(true) when a new replacement went live, Ok(false) when the
    /// file was unchanged.
    unsafe fn reload_one(
        &self,
        path: &std::path::Path,
        identity: ShaderIdentity,
        stage: ShaderStage,
        mtime: std::time::SystemTime,
    ) -> Result<bool, ReloadError> {
        {
            let tracker = self.lock_tracker();
            let Some(registered) = tracker.registered_stage(identity) else {
                return Err(ReloadError::UnknownIdentity { identity });
            };
            if registered != stage {
                return Err(ReloadError::StageMismatch {
                    identity,
                    registered,
                    requested: stage,
                });
            }
            if tracker.replacement_mtime(identity) == Some(mtime) {
                return Ok(false);
            }
        }

        let source = fs::read_to_string(path).map_err(|e| ReloadError::io(path, e))?;
        let model = match stage {
            ShaderStage::Vertex => self.config.vs_model.as_str(),
            ShaderStage::Pixel => self.config.ps_model.as_str(),
        };
        let binary = self
            .compiler
            .compile(&source, &self.config.entry_point, model)?;
        let object = self.create_shader_object(stage, &binary)?;

        let superseded = self.lock_tracker().publish_replacement(
            identity,
            ReplacementRecord { object, source_mtime: mtime },
        );
        if let Some(old) = superseded {
            abi::release_unknown(old.object as *mut ForeignObject);
        }
        info!(identity = %identity, stage = %stage, "replacement live");
        Ok(true)
    }

    /// Creates a shader object through the pre-patch entry, so replacement
    /// objects never enter the identity maps.
    unsafe fn create_shader_object(
        &self,
        stage: ShaderStage,
        blob: &[u8],
    ) -> Result<usize, ReloadError> {
        let this = self.device as *mut ForeignObject;
        let mut out: *mut c_void = ptr::null_mut();
        let hr = match stage {
            ShaderStage::Vertex => {
                self.original
                    .create_vertex_shader(this, blob.as_ptr(), blob.len(), &mut out)
            }
            ShaderStage::Pixel => {
                self.original
                    .create_pixel_shader(this, blob.as_ptr(), blob.len(), &mut out)
            }
        };
        if !succeeded(hr) || out.is_null() {
            return Err(ReloadError::CreateFailed { hresult: hr });
        }
        Ok(out as usize)
    }

    /// Re-issues the bind for each stage so whatever replacement state is
    /// current actually reaches the device.
    unsafe fn rebind_current(&self, this: *mut ForeignObject) {
        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            let handle = self.lock_tracker().current_bind_handle(stage);
            if let Some(handle) = handle {
                self.bind_stage(this, stage, handle);
            }
        }
    }

    // ---- intercepted calls -----------------------------------------------

    unsafe fn on_create_shader(
        &self,
        this: *mut ForeignObject,
        stage: ShaderStage,
        bytecode: *const u8,
        len: usize,
        out: *mut *mut c_void,
    ) -> Hresult {
        let hr = match stage {
            ShaderStage::Vertex => self.original.create_vertex_shader(this, bytecode, len, out),
            ShaderStage::Pixel => self.original.create_pixel_shader(this, bytecode, len, out),
        };
        if succeeded(hr) && !bytecode.is_null() && !out.is_null() {
            let handle = (*out) as usize;
            if handle != 0 {
                let bytes = slice::from_raw_parts(bytecode, len);
                let identity = self
                    .lock_tracker()
                    .register_shader(stage, bytes, handle);
                debug!(identity = %identity, stage = %stage, len, "shader registered");
            }
        }
        hr
    }

    unsafe fn on_set_shader(
        &self,
        this: *mut ForeignObject,
        stage: ShaderStage,
        shader: *mut c_void,
    ) -> Hresult {
        let outcome = self.lock_tracker().on_set_shader(stage, shader as usize);
        let bind = match outcome {
            SetShaderOutcome::Tracked { bind } => bind as *mut c_void,
            SetShaderOutcome::Unknown => {
                // Pre-attach objects bind every frame; warn once, then stay quiet.
                self.unknown_bind_warned.call_once(|| {
                    warn!(
                        stage = %stage,
                        handle = format_args!("{:#x}", shader as usize),
                        "set-shader with unregistered handle; passing through"
                    );
                });
                shader
            }
        };
        self.bind_stage(this, stage, bind as usize)
    }

    unsafe fn bind_stage(&self, this: *mut ForeignObject, stage: ShaderStage, handle: usize) -> Hresult {
        let shader = handle as *mut c_void;
        match stage {
            ShaderStage::Vertex => self.original.set_vertex_shader(this, shader),
            ShaderStage::Pixel => self.original.set_pixel_shader(this, shader),
        }
    }

    unsafe fn on_set_indices(&self, this: *mut ForeignObject, index_buffer: *mut c_void) -> Hresult {
        let hr = self.original.set_indices(this, index_buffer);
        if succeeded(hr) && !self.lock_tracker().on_set_indices(index_buffer as usize) {
            debug!(
                handle = format_args!("{:#x}", index_buffer as usize),
                "set-indices with unregistered handle"
            );
        }
        hr
    }

    unsafe fn on_set_render_target(
        &self,
        this: *mut ForeignObject,
        index: u32,
        surface: *mut c_void,
    ) -> Hresult {
        let hr = self.original.set_render_target(this, index, surface);
        if succeeded(hr) && !self.lock_tracker().on_set_render_target(index, surface as usize) {
            debug!(
                index,
                handle = format_args!("{:#x}", surface as usize),
                "set-render-target with unregistered handle"
            );
        }
        hr
    }

    unsafe fn on_create_index_buffer(
        &self,
        this: *mut ForeignObject,
        length: u32,
        usage: u32,
        format: u32,
        pool: u32,
        out: *mut *mut c_void,
    ) -> Hresult {
        let hr = self
            .original
            .create_index_buffer(this, length, usage, format, pool, out);
        if succeeded(hr) && !out.is_null() {
            let handle = (*out) as usize;
            if handle != 0 {
                let desc = IndexBufferDesc { length, usage, format, pool };
                self.lock_tracker().register_resource(
                    ResourceClass::IndexBuffer,
                    desc.identity(),
                    handle,
                );
            }
        }
        hr
    }

    unsafe fn on_create_render_target(
        &self,
        this: *mut ForeignObject,
        width: u32,
        height: u32,
        format: u32,
        multisample: u32,
        out: *mut *mut c_void,
    ) -> Hresult {
        let hr = self
            .original
            .create_render_target(this, width, height, format, multisample, out);
        if succeeded(hr) && !out.is_null() {
            let handle = (*out) as usize;
            if handle != 0 {
                let desc = RenderTargetDesc { width, height, format, multisample };
                self.lock_tracker().register_resource(
                    ResourceClass::RenderTarget,
                    desc.identity(),
                    handle,
                );
            }
        }
        hr
    }

    unsafe fn on_draw(&self, this: *mut ForeignObject, call: DrawCall) -> Hresult {
        let (decision, restore_handle) = {
            let mut tracker = self.lock_tracker();
            let decision = tracker.decide_draw();
            let restore = match decision.action {
                DrawAction::SubstituteShader { stage, .. } => {
                    tracker.current_bind_handle(stage)
                }
                _ => None,
            };
            (decision, restore)
        };

        if decision.action == DrawAction::Skip {
            return S_OK;
        }

        let stereo_restore = decision.stereo.map(|o| self.apply_stereo(o));

        if let DrawAction::SubstituteShader { stage, handle } = decision.action {
            self.bind_stage(this, stage, handle);
        }
        let hr = self.submit(this, call);
        if let DrawAction::SubstituteShader { stage, .. } = decision.action {
            if let Some(previous) = restore_handle {
                self.bind_stage(this, stage, previous);
            }
        }
        if let Some(restore) = stereo_restore {
            self.restore_stereo(restore);
        }
        hr
    }

    unsafe fn submit(&self, this: *mut ForeignObject, call: DrawCall) -> Hresult {
        match call {
            DrawCall::Primitive { primitive_type, start_vertex, primitive_count } => self
                .original
                .draw_primitive(this, primitive_type, start_vertex, primitive_count),
            DrawCall::Indexed {
                primitive_type,
                base_vertex,
                min_index,
                num_vertices,
                start_index,
                primitive_count,
            } => self.original.draw_indexed_primitive(
                this,
                primitive_type,
                base_vertex,
                min_index,
                num_vertices,
                start_index,
                primitive_count,
            ),
        }
    }

    /// Applies a stereo override, returning the previous values that were
    /// actually replaced. A declined parameter is logged and the draw proceeds
    /// with that parameter unmodified.
    fn apply_stereo(&self, wanted: StereoOverride) -> StereoOverride {
        let mut restore = StereoOverride::default();
        if let Some(value) = wanted.separation {
            match self
                .stereo
                .separation()
                .and_then(|prev| self.stereo.set_separation(value).map(|()| prev))
            {
                Ok(prev) => restore.separation = Some(prev),
                Err(err) => warn!(error = %err, "separation override declined"),
            }
        }
        if let Some(value) = wanted.convergence {
            match self
                .stereo
                .convergence()
                .and_then(|prev| self.stereo.set_convergence(value).map(|()| prev))
            {
                Ok(prev) => restore.convergence = Some(prev),
                Err(err) => warn!(error = %err, "convergence override declined"),
            }
        }
        restore
    }

    fn restore_stereo(&self, restore: StereoOverride) {
        if let Some(value) = restore.separation {
            if let Err(err) = self.stereo.set_separation(value) {
                warn!(error = %err, "separation restore failed");
            }
        }
        if let Some(value) = restore.convergence {
            if let Err(err) = self.stereo.set_convergence(value) {
                warn!(error = %err, "convergence restore failed");
            }
        }
    }

    unsafe fn on_present(&self, this: *mut ForeignObject) -> Hresult {
        let hr = self.original.present(this);
        self.frame_tick();
        hr
    }

    unsafe fn frame_tick(&self) {
        let now = Instant::now();
        {
            let mut tracker = self.lock_tracker();
            tracker.begin_frame();
            if tracker.idle_reset_due(now, self.config.idle_reset) {
                info!("input idle; hunting history reset");
                tracker.reset_hunting();
            }
        }
        if self.sweep_requested.swap(false, Ordering::AcqRel) {
            self.run_reload_sweep();
        }
    }

    unsafe fn on_release(&self, this: *mut ForeignObject) -> u32 {
        let remaining = self.original.release(this);
        if remaining == 0 {
            self.teardown();
        }
        remaining
    }

    /// Detaches and releases every replacement object exactly once.
    unsafe fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        router::global().unregister(self.device);
        let records = self.lock_tracker().drain_replacements();
        let count = records.len();
        for record in records {
            abi::release_unknown(record.object as *mut ForeignObject);
        }
        info!(
            device = format_args!("{:#x}", self.device),
            replacements_released = count,
            "device released; controller detached"
        );
    }
}

// ---- replacement entry points ---------------------------------------------

fn controller_for(object: *mut ForeignObject) -> Option<Arc<DeviceController>> {
    router::global().resolve(object as usize)
}

/// Pre-patch callers for a receiver no controller claims.
unsafe fn passthrough(object: *mut ForeignObject) -> Option<device::Original> {
    interceptor().snapshot_for(object).map(device::Original)
}

unsafe extern "system" fn hk_release(this: *mut ForeignObject) -> u32 {
    match controller_for(this) {
        Some(c) => c.on_release(this),
        None => match passthrough(this) {
            Some(original) => original.release(this),
            None => 0,
        },
    }
}

unsafe extern "system" fn hk_present(this: *mut ForeignObject) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_present(this),
        None => match passthrough(this) {
            Some(original) => original.present(this),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_create_vertex_shader(
    this: *mut ForeignObject,
    bytecode: *const u8,
    len: usize,
    out: *mut *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_create_shader(this, ShaderStage::Vertex, bytecode, len, out),
        None => match passthrough(this) {
            Some(original) => original.create_vertex_shader(this, bytecode, len, out),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_create_pixel_shader(
    this: *mut ForeignObject,
    bytecode: *const u8,
    len: usize,
    out: *mut *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_create_shader(this, ShaderStage::Pixel, bytecode, len, out),
        None => match passthrough(this) {
            Some(original) => original.create_pixel_shader(this, bytecode, len, out),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_set_vertex_shader(
    this: *mut ForeignObject,
    shader: *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_set_shader(this, ShaderStage::Vertex, shader),
        None => match passthrough(this) {
            Some(original) => original.set_vertex_shader(this, shader),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_set_pixel_shader(
    this: *mut ForeignObject,
    shader: *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_set_shader(this, ShaderStage::Pixel, shader),
        None => match passthrough(this) {
            Some(original) => original.set_pixel_shader(this, shader),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_set_indices(
    this: *mut ForeignObject,
    index_buffer: *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_set_indices(this, index_buffer),
        None => match passthrough(this) {
            Some(original) => original.set_indices(this, index_buffer),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_set_render_target(
    this: *mut ForeignObject,
    index: u32,
    surface: *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_set_render_target(this, index, surface),
        None => match passthrough(this) {
            Some(original) => original.set_render_target(this, index, surface),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_draw_primitive(
    this: *mut ForeignObject,
    primitive_type: u32,
    start_vertex: u32,
    primitive_count: u32,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_draw(
            this,
            DrawCall::Primitive { primitive_type, start_vertex, primitive_count },
        ),
        None => match passthrough(this) {
            Some(original) => {
                original.draw_primitive(this, primitive_type, start_vertex, primitive_count)
            }
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_draw_indexed_primitive(
    this: *mut ForeignObject,
    primitive_type: u32,
    base_vertex: i32,
    min_index: u32,
    num_vertices: u32,
    start_index: u32,
    primitive_count: u32,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_draw(
            this,
            DrawCall::Indexed {
                primitive_type,
                base_vertex,
                min_index,
                num_vertices,
                start_index,
                primitive_count,
            },
        ),
        None => match passthrough(this) {
            Some(original) => original.draw_indexed_primitive(
                this,
                primitive_type,
                base_vertex,
                min_index,
                num_vertices,
                start_index,
                primitive_count,
            ),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_create_index_buffer(
    this: *mut ForeignObject,
    length: u32,
    usage: u32,
    format: u32,
    pool: u32,
    out: *mut *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_create_index_buffer(this, length, usage, format, pool, out),
        None => match passthrough(this) {
            Some(original) => original.create_index_buffer(this, length, usage, format, pool, out),
            None => E_FAIL,
        },
    }
}

unsafe extern "system" fn hk_create_render_target(
    this: *mut ForeignObject,
    width: u32,
    height: u32,
    format: u32,
    multisample: u32,
    out: *mut *mut c_void,
) -> Hresult {
    match controller_for(this) {
        Some(c) => c.on_create_render_target(this, width, height, format, multisample, out),
        None => match passthrough(this) {
            Some(original) => {
                original.create_render_target(this, width, height, format, multisample, out)
            }
            None => E_FAIL,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn shape_overrides_fit_the_declared_table() {
        let shape = device_shape();
        assert_eq!(shape.slot_count, device::SLOT_COUNT);
        let mut slots: Vec<usize> = shape.overrides.iter().map(|&(slot, _)| slot).collect();
        slots.sort_unstable();
        let mut unique = slots.clone();
        unique.dedup();
        assert_eq!(slots, unique, "duplicate override slot");
        assert!(slots.iter().all(|&s| s < shape.slot_count));
        // The COM trio and scene begin/end stay unpatched.
        for untouched in [0, 1, 3, 4, 5] {
            assert!(!slots.contains(&untouched));
        }
    }

    #[test]
    fn default_config_matches_conventions() {
        let config = HuntConfig::default();
        assert_eq!(config.override_dir, PathBuf::from("ShaderFixes"));
        assert!(config.hunting);
        assert_eq!(config.vs_model, "vs_3_0");
        assert_eq!(config.ps_model, "ps_3_0");
        assert_eq!(config.idle_reset, Duration::from_secs(60));
    }
}
