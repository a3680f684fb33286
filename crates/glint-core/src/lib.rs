//! Runtime shader identification, hunting, and hot-reload over an intercepted
//! graphics device.
//!
//! The workspace attaches to a foreign COM-style device by patching its method
//! table (see `glint-vtbl`), identifies every shader the application creates by
//! a 64-bit content hash, and from there offers:
//!
//! - **hunting**: cycling a per-class cursor through everything seen this
//!   session, with draws under the cursor skipped, flattened, or substituted so
//!   the operator can see which shader draws what;
//! - **draw gating**: per-draw skip/substitute decisions and temporary stereo
//!   parameter overrides, driven by marking modes and per-shader rules;
//! - **hot reload**: exporting a selected shader's source next to the running
//!   application, then compiling the edited file and swapping the replacement
//!   in without a restart.
//!
//! Entry point: [`device::attach`]. Everything the attached controller does
//! happens inside the application's own calls; there are no threads of our own.

pub mod abi;
pub mod compile;
pub mod device;
pub mod gate;
pub mod hunt;
pub mod identity;
pub mod reload;
pub mod router;
pub mod stereo;
pub mod track;

pub use compile::{CompileError, ShaderCompiler};
pub use device::{
    attach, install_patch_backend, interceptor, AttachError, DeviceController, HuntConfig,
    Services,
};
pub use gate::{DrawAction, DrawDecision, MarkingMode, OverrideRule, StereoOverride};
pub use hunt::{Direction, HuntCommand, Selection, IDLE_RESET};
pub use identity::{
    IndexBufferDesc, RenderTargetDesc, ResourceClass, ResourceIdentity, ShaderIdentity,
    ShaderStage,
};
pub use reload::{ReloadError, SweepOutcome};
pub use stereo::{NoStereo, StereoBridge, StereoError};
pub use track::{SetShaderOutcome, Tracker};
