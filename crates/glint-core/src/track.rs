//! Per-device tracking state: shader identities, current bindings, visited
//! sets, replacement records.
//!
//! Everything in [`Tracker`] lives behind one mutex (owned by the controller);
//! the interception callbacks mutate it as the application issues create/bind
//! calls and the Draw Gate reads it immediately before each draw. The instance
//! router and the interception installer have their own, independent locks and
//! are never taken while this one is held.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::debug;

use crate::gate::{MarkingMode, OverrideRule};
use crate::hunt::{Direction, HuntState, Selection};
use crate::identity::{ResourceClass, ResourceIdentity, ShaderIdentity, ShaderStage};
use crate::reload::ReplacementRecord;

/// Currently bound shader for one stage: the identity plus the handle the
/// application bound (which may differ from what the device actually has bound
/// when a replacement is active).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundShader {
    pub identity: ShaderIdentity,
    pub handle: usize,
}

/// Currently bound non-shader resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundResource {
    pub identity: ResourceIdentity,
    pub handle: usize,
}

/// Snapshot of the pipeline bindings the Draw Gate consults.
#[derive(Debug, Clone, Default)]
pub struct BindingSnapshot {
    pub vertex_shader: Option<BoundShader>,
    pub pixel_shader: Option<BoundShader>,
    pub index_buffer: Option<BoundResource>,
    /// Render targets by slot index.
    pub render_targets: Vec<Option<BoundResource>>,
}

impl BindingSnapshot {
    pub fn shader(&self, stage: ShaderStage) -> Option<BoundShader> {
        match stage {
            ShaderStage::Vertex => self.vertex_shader,
            ShaderStage::Pixel => self.pixel_shader,
        }
    }

    fn shader_mut(&mut self, stage: ShaderStage) -> &mut Option<BoundShader> {
        match stage {
            ShaderStage::Vertex => &mut self.vertex_shader,
            ShaderStage::Pixel => &mut self.pixel_shader,
        }
    }
}

/// Every identity observed since the last hunting reset, per resource class.
///
/// Raw `u64` values keep the four walks uniform; the class distinguishes
/// shader identities from resource identities at the edges.
#[derive(Debug, Clone, Default)]
pub struct VisitedSets {
    vertex_shaders: BTreeSet<u64>,
    pixel_shaders: BTreeSet<u64>,
    index_buffers: BTreeSet<u64>,
    render_targets: BTreeSet<u64>,
}

impl VisitedSets {
    pub fn set(&self, class: ResourceClass) -> &BTreeSet<u64> {
        match class {
            ResourceClass::VertexShader => &self.vertex_shaders,
            ResourceClass::PixelShader => &self.pixel_shaders,
            ResourceClass::IndexBuffer => &self.index_buffers,
            ResourceClass::RenderTarget => &self.render_targets,
        }
    }

    fn set_mut(&mut self, class: ResourceClass) -> &mut BTreeSet<u64> {
        match class {
            ResourceClass::VertexShader => &mut self.vertex_shaders,
            ResourceClass::PixelShader => &mut self.pixel_shaders,
            ResourceClass::IndexBuffer => &mut self.index_buffers,
            ResourceClass::RenderTarget => &mut self.render_targets,
        }
    }

    pub fn insert(&mut self, class: ResourceClass, raw: u64) {
        self.set_mut(class).insert(raw);
    }

    pub fn clear(&mut self) {
        self.vertex_shaders.clear();
        self.pixel_shaders.clear();
        self.index_buffers.clear();
        self.render_targets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_shaders.is_empty()
            && self.pixel_shaders.is_empty()
            && self.index_buffers.is_empty()
            && self.render_targets.is_empty()
    }
}

/// Everything known about one shader identity.
#[derive(Debug, Clone)]
pub(crate) struct ShaderRecord {
    pub stage: ShaderStage,
    /// Exact bytes the application supplied; the hot-reload export reads these.
    pub bytecode: Vec<u8>,
    /// Live foreign objects sharing this identity (byte-identical blobs may be
    /// loaded more than once). Never pruned before teardown.
    pub handles: Vec<usize>,
    /// Optional zeroed shader variant for the `zero` marking mode.
    pub zero_variant: Option<usize>,
}

/// Per-frame counters, reset on present.
#[derive(Debug, Default)]
pub struct FrameCounters {
    occurrences: HashMap<u64, u32>,
}

impl FrameCounters {
    /// 1-based count of draws this frame with `identity` bound.
    fn next_occurrence(&mut self, identity: ShaderIdentity) -> u32 {
        let n = self.occurrences.entry(identity.raw()).or_insert(0);
        *n += 1;
        *n
    }

    fn reset(&mut self) {
        self.occurrences.clear();
    }
}

/// Outcome of a tracked set-shader call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetShaderOutcome {
    /// Bind this handle (the replacement object when one is active, otherwise
    /// the handle the application passed).
    Tracked { bind: usize },
    /// The pointer was never registered (created before interception was
    /// installed). Tracking is skipped; the call passes through unchanged.
    Unknown,
}

pub struct Tracker {
    pub bindings: BindingSnapshot,
    pub visited: VisitedSets,
    pub hunt: HuntState,
    pub marking_mode: MarkingMode,
    pub blocking_mode: bool,
    /// When false, bind calls update the snapshot but hunting history is not
    /// collected and the Draw Gate always passes through.
    pub hunting: bool,

    pub(crate) shaders_by_handle: HashMap<usize, ShaderIdentity>,
    pub(crate) shaders: HashMap<ShaderIdentity, ShaderRecord>,
    pub(crate) resources_by_handle: HashMap<usize, (ResourceClass, ResourceIdentity)>,
    pub(crate) rules: HashMap<ShaderIdentity, OverrideRule>,
    pub(crate) replacements: HashMap<ShaderIdentity, ReplacementRecord>,

    /// Index buffer -> pixel shaders drawn with it, and the reverse; filled
    /// during hunting for the diagnostic dump.
    crossref_ib_ps: BTreeMap<u64, BTreeSet<u64>>,
    crossref_ps_ib: BTreeMap<u64, BTreeSet<u64>>,

    pub(crate) frame: FrameCounters,
    pub(crate) last_input: Instant,
}

impl Tracker {
    pub fn new(hunting: bool) -> Self {
        Self {
            bindings: BindingSnapshot::default(),
            visited: VisitedSets::default(),
            hunt: HuntState::default(),
            marking_mode: MarkingMode::default(),
            blocking_mode: false,
            hunting,
            shaders_by_handle: HashMap::new(),
            shaders: HashMap::new(),
            resources_by_handle: HashMap::new(),
            rules: HashMap::new(),
            replacements: HashMap::new(),
            crossref_ib_ps: BTreeMap::new(),
            crossref_ps_ib: BTreeMap::new(),
            frame: FrameCounters::default(),
            last_input: Instant::now(),
        }
    }

    // ---- creation-time registration ------------------------------------

    /// Registers a shader object created by the application. Byte-identical
    /// blobs share one identity and one record.
    pub fn register_shader(
        &mut self,
        stage: ShaderStage,
        bytecode: &[u8],
        handle: usize,
    ) -> ShaderIdentity {
        let identity = ShaderIdentity::of_bytecode(bytecode);
        let record = self
            .shaders
            .entry(identity)
            .or_insert_with(|| ShaderRecord {
                stage,
                bytecode: bytecode.to_vec(),
                handles: Vec::new(),
                zero_variant: None,
            });
        if !record.handles.contains(&handle) {
            record.handles.push(handle);
        }
        self.shaders_by_handle.insert(handle, identity);
        identity
    }

    pub fn register_resource(
        &mut self,
        class: ResourceClass,
        identity: ResourceIdentity,
        handle: usize,
    ) {
        self.resources_by_handle.insert(handle, (class, identity));
    }

    pub fn identity_of_handle(&self, handle: usize) -> Option<ShaderIdentity> {
        self.shaders_by_handle.get(&handle).copied()
    }

    /// The stage `identity` was registered with, or `None` for an identity this
    /// device has never seen.
    pub(crate) fn registered_stage(&self, identity: ShaderIdentity) -> Option<ShaderStage> {
        self.shaders.get(&identity).map(|r| r.stage)
    }

    pub(crate) fn bytecode_of(&self, identity: ShaderIdentity) -> Option<&[u8]> {
        self.shaders.get(&identity).map(|r| r.bytecode.as_slice())
    }

    /// Registers a zeroed variant object for the `zero` marking mode. Returns
    /// false if the identity is unknown.
    pub fn set_zero_variant(&mut self, identity: ShaderIdentity, handle: usize) -> bool {
        match self.shaders.get_mut(&identity) {
            Some(record) => {
                record.zero_variant = Some(handle);
                true
            }
            None => false,
        }
    }

    // ---- bind tracking --------------------------------------------------

    /// Tracks a set-shader call. A null handle clears the binding.
    pub fn on_set_shader(&mut self, stage: ShaderStage, handle: usize) -> SetShaderOutcome {
        if handle == 0 {
            *self.bindings.shader_mut(stage) = None;
            return SetShaderOutcome::Tracked { bind: 0 };
        }
        let Some(identity) = self.identity_of_handle(handle) else {
            return SetShaderOutcome::Unknown;
        };
        *self.bindings.shader_mut(stage) = Some(BoundShader { identity, handle });
        if self.hunting {
            let class = match stage {
                ShaderStage::Vertex => ResourceClass::VertexShader,
                ShaderStage::Pixel => ResourceClass::PixelShader,
            };
            self.visited.insert(class, identity.raw());
        }
        let bind = self
            .replacements
            .get(&identity)
            .map(|r| r.object)
            .unwrap_or(handle);
        SetShaderOutcome::Tracked { bind }
    }

    /// Tracks a set-index-buffer call. Returns false when the handle was never
    /// registered (the snapshot field is then left unchanged).
    pub fn on_set_indices(&mut self, handle: usize) -> bool {
        if handle == 0 {
            self.bindings.index_buffer = None;
            return true;
        }
        match self.resources_by_handle.get(&handle) {
            Some(&(ResourceClass::IndexBuffer, identity)) => {
                self.bindings.index_buffer = Some(BoundResource { identity, handle });
                if self.hunting {
                    self.visited.insert(ResourceClass::IndexBuffer, identity.raw());
                }
                true
            }
            _ => false,
        }
    }

    /// Tracks a set-render-target call for one slot.
    pub fn on_set_render_target(&mut self, index: u32, handle: usize) -> bool {
        let index = index as usize;
        if self.bindings.render_targets.len() <= index {
            self.bindings.render_targets.resize(index + 1, None);
        }
        if handle == 0 {
            self.bindings.render_targets[index] = None;
            return true;
        }
        match self.resources_by_handle.get(&handle) {
            Some(&(ResourceClass::RenderTarget, identity)) => {
                self.bindings.render_targets[index] = Some(BoundResource { identity, handle });
                if self.hunting {
                    self.visited.insert(ResourceClass::RenderTarget, identity.raw());
                }
                true
            }
            _ => false,
        }
    }

    /// The handle the device actually has bound for `stage` right now: the
    /// replacement object when one is active, otherwise the application's.
    pub fn current_bind_handle(&self, stage: ShaderStage) -> Option<usize> {
        let bound = self.bindings.shader(stage)?;
        Some(
            self.replacements
                .get(&bound.identity)
                .map(|r| r.object)
                .unwrap_or(bound.handle),
        )
    }

    // ---- hunting --------------------------------------------------------

    pub fn step_selection(&mut self, class: ResourceClass, dir: Direction) {
        // Split borrow: the cursor walks the visited set for its own class.
        let visited = match class {
            ResourceClass::VertexShader => &self.visited.vertex_shaders,
            ResourceClass::PixelShader => &self.visited.pixel_shaders,
            ResourceClass::IndexBuffer => &self.visited.index_buffers,
            ResourceClass::RenderTarget => &self.visited.render_targets,
        };
        self.hunt.step(class, visited, dir);
    }

    pub fn selection(&self, class: ResourceClass) -> Selection {
        self.hunt.selection(class)
    }

    /// Clears hunting history only: visited sets and cursors. Identity maps and
    /// replacement records are untouched, so a hot-reloaded shader stays
    /// hot-reloaded across a reset.
    pub fn reset_hunting(&mut self) {
        self.visited.clear();
        self.hunt.reset();
        debug!("hunting history reset");
    }

    pub fn note_input(&mut self, now: Instant) {
        self.last_input = now;
    }

    /// Coarse sampled wall-clock check; called once per frame.
    pub fn idle_reset_due(&self, now: Instant, idle: Duration) -> bool {
        self.hunting
            && !self.visited.is_empty()
            && now.duration_since(self.last_input) >= idle
    }

    // ---- per-frame ------------------------------------------------------

    pub fn begin_frame(&mut self) {
        self.frame.reset();
    }

    pub(crate) fn next_occurrence(&mut self, identity: ShaderIdentity) -> u32 {
        self.frame.next_occurrence(identity)
    }

    // ---- cross-reference dump -------------------------------------------

    /// Records "this index buffer was drawn together with this pixel shader";
    /// called per draw while hunting.
    pub(crate) fn record_crossref(&mut self) {
        let (Some(ib), Some(ps)) = (self.bindings.index_buffer, self.bindings.pixel_shader)
        else {
            return;
        };
        self.crossref_ib_ps
            .entry(ib.identity.raw())
            .or_default()
            .insert(ps.identity.raw());
        self.crossref_ps_ib
            .entry(ps.identity.raw())
            .or_default()
            .insert(ib.identity.raw());
    }

    pub fn crossref_dump(&self) -> String {
        let mut out = String::new();
        for (ib, shaders) in &self.crossref_ib_ps {
            let _ = write!(out, "ib {ib:016x}: ps");
            for ps in shaders {
                let _ = write!(out, " {ps:016x}");
            }
            out.push('\n');
        }
        for (ps, buffers) in &self.crossref_ps_ib {
            let _ = write!(out, "ps {ps:016x}: ib");
            for ib in buffers {
                let _ = write!(out, " {ib:016x}");
            }
            out.push('\n');
        }
        out
    }

    // ---- replacement records --------------------------------------------

    /// Publishes a replacement record as a single map swap; the caller releases
    /// any returned superseded record's object.
    pub(crate) fn publish_replacement(
        &mut self,
        identity: ShaderIdentity,
        record: ReplacementRecord,
    ) -> Option<ReplacementRecord> {
        self.replacements.insert(identity, record)
    }

    pub fn replacement_active(&self, identity: ShaderIdentity) -> bool {
        self.replacements.contains_key(&identity)
    }

    pub(crate) fn replacement_mtime(
        &self,
        identity: ShaderIdentity,
    ) -> Option<std::time::SystemTime> {
        self.replacements.get(&identity).map(|r| r.source_mtime)
    }

    /// Removes every record whose identity is absent from `on_disk`; the caller
    /// releases the returned objects and the identities revert to their pristine
    /// originals on the application's next bind.
    pub(crate) fn take_replacements_not_on_disk(
        &mut self,
        on_disk: &BTreeSet<ShaderIdentity>,
    ) -> Vec<(ShaderIdentity, ReplacementRecord)> {
        let gone: Vec<ShaderIdentity> = self
            .replacements
            .keys()
            .filter(|id| !on_disk.contains(id))
            .copied()
            .collect();
        gone.into_iter()
            .filter_map(|id| self.replacements.remove(&id).map(|r| (id, r)))
            .collect()
    }

    pub(crate) fn drain_replacements(&mut self) -> Vec<ReplacementRecord> {
        self.replacements.drain().map(|(_, r)| r).collect()
    }

    // ---- override rules --------------------------------------------------

    pub fn set_override_rule(&mut self, identity: ShaderIdentity, rule: OverrideRule) {
        self.rules.insert(identity, rule);
    }

    pub fn clear_override_rule(&mut self, identity: ShaderIdentity) {
        self.rules.remove(&identity);
    }
}
