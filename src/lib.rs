//! Facade crate: re-exports the interception layer and the runtime core under
//! one name. Embedders (injected loaders, test harnesses) depend on this crate
//! and call [`attach`] with a live device.

pub use glint_core::*;
pub use glint_vtbl::{
    DirectWrite, ForeignObject, InstallError, Interceptor, PatchError, PatchSlots, TableShape,
    TableSnapshot, Trampoline,
};
