//! Draw Gate: the per-draw decision point.
//!
//! Evaluated exactly once immediately before each draw submission (not per
//! bind call), under the tracker lock. Combines the current bindings, the
//! hunting cursors, and per-shader override rules into one tagged decision the
//! controller then applies and reverts symmetrically around the real call.

use std::collections::BTreeSet;

use tracing::debug;

use crate::identity::{ResourceClass, ResourceIdentity, ShaderIdentity, ShaderStage};
use crate::track::Tracker;

/// What to do with the draw itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawAction {
    /// Submit unchanged.
    Proceed,
    /// Omit the draw entirely; bind calls already happened normally.
    Skip,
    /// Bind `handle` for this stage for the duration of this draw only, then
    /// restore whatever was bound.
    SubstituteShader { stage: ShaderStage, handle: usize },
}

/// Temporary stereo parameter change applied around one draw.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StereoOverride {
    pub separation: Option<f32>,
    pub convergence: Option<f32>,
}

/// One Draw Gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawDecision {
    pub action: DrawAction,
    pub stereo: Option<StereoOverride>,
}

/// What to do with a draw that is under the hunting cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingMode {
    /// Omit the draw. Cheapest, and the default.
    #[default]
    Skip,
    /// Zero the stereo separation for this draw only.
    Mono,
    /// Substitute the pristine original shader (visible effect only while a
    /// replacement is active).
    Original,
    /// Substitute the registered zeroed variant; falls back to skipping when
    /// none was registered.
    Zero,
}

/// Per-shader numeric override, applied independently of the hunting cursor.
#[derive(Debug, Clone, Default)]
pub struct OverrideRule {
    pub separation: Option<f32>,
    pub convergence: Option<f32>,
    /// Restrict to the Nth draw (1-based) of this shader within the frame.
    pub iteration: Option<u32>,
    /// Restrict to draws using one of these index buffers.
    pub index_buffers: Option<BTreeSet<ResourceIdentity>>,
}

impl Tracker {
    /// Which resource class, if any, puts the current draw under the cursor.
    fn class_under_cursor(&self) -> Option<ResourceClass> {
        for class in ResourceClass::ALL {
            let Some(selected) = self.selection(class).id() else {
                continue;
            };
            let hit = match class {
                ResourceClass::VertexShader => self
                    .bindings
                    .vertex_shader
                    .is_some_and(|b| b.identity.raw() == selected),
                ResourceClass::PixelShader => self
                    .bindings
                    .pixel_shader
                    .is_some_and(|b| b.identity.raw() == selected),
                ResourceClass::IndexBuffer => self
                    .bindings
                    .index_buffer
                    .is_some_and(|b| b.identity.raw() == selected),
                ResourceClass::RenderTarget => self
                    .bindings
                    .render_targets
                    .iter()
                    .flatten()
                    .any(|b| b.identity.raw() == selected),
            };
            if hit {
                return Some(class);
            }
        }
        None
    }

    /// The selection-derived action for a draw under the cursor of `class`.
    fn cursor_action(&self, class: ResourceClass) -> CursorOutcome {
        match self.marking_mode {
            MarkingMode::Skip => CursorOutcome::Action(DrawAction::Skip),
            MarkingMode::Mono => CursorOutcome::ZeroSeparation,
            MarkingMode::Original => {
                let Some(stage) = class.shader_stage() else {
                    // No "original" variant exists for buffers/targets.
                    return CursorOutcome::Action(DrawAction::Skip);
                };
                let Some(selected) = self.selection(class).id() else {
                    return CursorOutcome::Action(DrawAction::Skip);
                };
                let identity = ShaderIdentity::from_raw(selected);
                if !self.replacement_active(identity) {
                    // Already running the original; nothing to substitute.
                    return CursorOutcome::None;
                }
                match self
                    .shaders
                    .get(&identity)
                    .and_then(|r| r.handles.first().copied())
                {
                    Some(handle) => {
                        CursorOutcome::Action(DrawAction::SubstituteShader { stage, handle })
                    }
                    None => CursorOutcome::Action(DrawAction::Skip),
                }
            }
            MarkingMode::Zero => {
                let outcome = class
                    .shader_stage()
                    .zip(self.selection(class).id())
                    .and_then(|(stage, selected)| {
                        let identity = ShaderIdentity::from_raw(selected);
                        self.shaders
                            .get(&identity)
                            .and_then(|r| r.zero_variant)
                            .map(|handle| DrawAction::SubstituteShader { stage, handle })
                    });
                match outcome {
                    Some(action) => CursorOutcome::Action(action),
                    None => {
                        debug!("no zeroed variant registered; skipping draw instead");
                        CursorOutcome::Action(DrawAction::Skip)
                    }
                }
            }
        }
    }

    /// Evaluates the Draw Gate for the draw about to be submitted.
    ///
    /// Also advances the per-shader occurrence counters, which is why this
    /// takes `&mut self` and must be called exactly once per draw.
    pub fn decide_draw(&mut self) -> DrawDecision {
        let vs_occurrence = self
            .bindings
            .vertex_shader
            .map(|b| (b.identity, self.next_occurrence(b.identity)));
        let ps_occurrence = self
            .bindings
            .pixel_shader
            .map(|b| (b.identity, self.next_occurrence(b.identity)));

        if self.hunting {
            self.record_crossref();
        }

        let mut action = if self.blocking_mode {
            DrawAction::Skip
        } else {
            DrawAction::Proceed
        };
        let mut stereo: Option<StereoOverride> = None;

        if self.hunting {
            if let Some(class) = self.class_under_cursor() {
                match self.cursor_action(class) {
                    CursorOutcome::Action(a) => action = a,
                    CursorOutcome::ZeroSeparation => {
                        stereo.get_or_insert_with(Default::default).separation = Some(0.0);
                    }
                    CursorOutcome::None => {}
                }
            }
        }

        // Per-shader override rules apply independently of the cursor.
        for occurrence in [vs_occurrence, ps_occurrence] {
            let Some((identity, nth)) = occurrence else {
                continue;
            };
            let Some(rule) = self.rules.get(&identity) else {
                continue;
            };
            if rule.iteration.is_some_and(|n| n != nth) {
                continue;
            }
            if let Some(allowed) = &rule.index_buffers {
                let on_allowed_buffer = self
                    .bindings
                    .index_buffer
                    .is_some_and(|ib| allowed.contains(&ib.identity));
                if !on_allowed_buffer {
                    continue;
                }
            }
            if rule.separation.is_some() || rule.convergence.is_some() {
                let s = stereo.get_or_insert_with(Default::default);
                if rule.separation.is_some() {
                    s.separation = rule.separation;
                }
                if rule.convergence.is_some() {
                    s.convergence = rule.convergence;
                }
            }
        }

        DrawDecision { action, stereo }
    }
}

enum CursorOutcome {
    Action(DrawAction),
    ZeroSeparation,
    /// Cursor hit, but nothing to change for this draw.
    None,
}
