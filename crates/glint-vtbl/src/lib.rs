//! Method-table interception for foreign COM-style objects.
//!
//! A foreign runtime hands the application objects whose first field points at a
//! virtual method table we do not compile and whose layout we do not control. This
//! crate patches a fixed set of slots in that table with replacement functions
//! while keeping a pre-patch snapshot of *every* slot, so unmodified behavior
//! remains callable for the slots we override and for the ones we never touch.
//!
//! This is the only crate in the workspace that manipulates raw tables. Everything
//! above it works with three opaque handles:
//!
//! - [`TableSnapshot`]: the pre-patch entries of one table, used to invoke
//!   original behavior.
//! - [`Trampoline`]: a proxy object carrying its own private table in which every
//!   slot forwards to the pre-patch entry with a stored real receiver. Code
//!   holding a trampoline can treat it exactly like the foreign object, including
//!   passing it back into intercepted calls, without ever re-entering a
//!   replacement function.
//! - [`Interceptor`]: the process-wide installer. Patching is shape-scoped, not
//!   per-instance: a table's storage is shared by every object of that shape, so
//!   the first install for a given table does all the work and later installs
//!   return the existing snapshot.
//!
//! The actual "overwrite this function pointer in possibly-protected memory"
//! primitive is consumed through the [`PatchSlots`] trait; the OS-specific
//! page-protection dance lives outside this workspace. [`DirectWrite`] covers
//! tables that are already writable (own allocations, tests).

use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

/// A foreign virtual-dispatch object: the first field is the table pointer.
///
/// The layout past the table pointer is owned by the foreign runtime and never
/// inspected here.
#[repr(C)]
pub struct ForeignObject {
    /// Pointer to the method-table storage (an array of function addresses).
    pub vtbl: *mut usize,
}

/// Describes one method-table layout to intercept.
pub struct TableShape {
    /// Human-readable tag used in logs ("device", "swapchain", ...).
    pub tag: &'static str,
    /// Total number of slots to snapshot.
    pub slot_count: usize,
    /// `(slot index, replacement function address)` pairs. Slots not listed here
    /// are left untouched; the snapshot still covers them.
    pub overrides: Vec<(usize, usize)>,
}

/// Pre-patch copy of every entry of one method table.
#[derive(Debug)]
pub struct TableSnapshot {
    tag: &'static str,
    table: usize,
    originals: Vec<usize>,
}

// Entries are code addresses; they carry no thread affinity.
unsafe impl Send for TableSnapshot {}
unsafe impl Sync for TableSnapshot {}

impl TableSnapshot {
    /// The shape tag this snapshot was taken for.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Address of the live (patched) table storage.
    pub fn table_addr(&self) -> usize {
        self.table
    }

    /// The pre-patch function address stored at `slot`.
    ///
    /// Panics if `slot` is outside the snapshotted shape; callers derive slot
    /// indices and the shape's `slot_count` from the same interface declaration.
    pub fn original(&self, slot: usize) -> usize {
        assert!(
            slot < self.originals.len(),
            "slot {slot} out of range for {} table snapshot ({} slots)",
            self.tag,
            self.originals.len()
        );
        self.originals[slot]
    }

    /// Number of snapshotted slots.
    pub fn slot_count(&self) -> usize {
        self.originals.len()
    }
}

/// Errors from the slot patch primitive.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The table's backing memory could not be made writable.
    #[error("table memory is not writable")]
    NotWritable,
    /// The underlying OS primitive reported an error.
    #[error("patch primitive failed: {0}")]
    Backend(String),
}

/// Errors from [`Interceptor::install`].
#[derive(Debug, Error)]
pub enum InstallError {
    /// A slot overwrite failed; any slots already patched for this shape were
    /// rolled back and the shape was marked passthrough-only.
    #[error("patching slot {slot} of {tag} table failed: {source}")]
    PatchFailed {
        tag: &'static str,
        slot: usize,
        source: PatchError,
    },
    /// An earlier install attempt for this table failed; it stays unpatched.
    #[error("{tag} table previously failed to patch; passthrough only")]
    ShapeDisabled { tag: &'static str },
}

/// The "overwrite one function pointer in a live method table" primitive.
///
/// Production backends handle page protection and instruction-cache concerns;
/// those are external collaborators. This crate only relies on the contract:
/// after a successful call, `table[slot]` reads back as `replacement`.
pub trait PatchSlots: Send + Sync {
    /// Replaces the entry at `table[slot]` with `replacement`.
    ///
    /// # Safety
    ///
    /// `table` must point at live method-table storage of at least `slot + 1`
    /// entries, and no other thread may be concurrently patching the same slot.
    unsafe fn patch(&self, table: *mut usize, slot: usize, replacement: usize)
        -> Result<(), PatchError>;
}

/// Backend for tables that live in writable memory.
pub struct DirectWrite;

impl PatchSlots for DirectWrite {
    unsafe fn patch(
        &self,
        table: *mut usize,
        slot: usize,
        replacement: usize,
    ) -> Result<(), PatchError> {
        // Volatile: the foreign runtime reads this storage from other threads.
        ptr::write_volatile(table.add(slot), replacement);
        Ok(())
    }
}

enum ShapeState {
    Hooked(Arc<TableSnapshot>),
    Failed(&'static str),
}

/// Process-wide installer. Keyed by table storage address: two objects sharing
/// one table share one installation.
pub struct Interceptor {
    backend: Box<dyn PatchSlots>,
    shapes: Mutex<HashMap<usize, ShapeState>>,
}

impl Interceptor {
    pub fn new(backend: Box<dyn PatchSlots>) -> Self {
        Self {
            backend,
            shapes: Mutex::new(HashMap::new()),
        }
    }

    /// Installs `shape`'s overrides on the table `object` dispatches through.
    ///
    /// First call for a table snapshots all `slot_count` entries, then patches the
    /// override slots. Subsequent calls for the same table return the existing
    /// snapshot without touching memory. If any single patch fails, slots already
    /// patched are restored, the shape is remembered as failed, and every later
    /// install for this table reports [`InstallError::ShapeDisabled`] — the
    /// application keeps running on the unmodified table.
    ///
    /// # Safety
    ///
    /// `object` must be a live foreign object whose table has at least
    /// `shape.slot_count` entries, and the replacement addresses in
    /// `shape.overrides` must be functions with the slot's exact foreign
    /// signature and calling convention.
    pub unsafe fn install(
        &self,
        object: *mut ForeignObject,
        shape: &TableShape,
    ) -> Result<Arc<TableSnapshot>, InstallError> {
        let table = (*object).vtbl;
        let key = table as usize;

        let mut shapes = self.shapes.lock().unwrap_or_else(|e| e.into_inner());
        match shapes.get(&key) {
            Some(ShapeState::Hooked(snapshot)) => return Ok(snapshot.clone()),
            Some(ShapeState::Failed(tag)) => {
                return Err(InstallError::ShapeDisabled { tag });
            }
            None => {}
        }

        let mut originals = Vec::with_capacity(shape.slot_count);
        for slot in 0..shape.slot_count {
            originals.push(ptr::read(table.add(slot)));
        }

        for (i, &(slot, replacement)) in shape.overrides.iter().enumerate() {
            if let Err(source) = self.backend.patch(table, slot, replacement) {
                // Restore what we already changed so the table is byte-identical
                // to its pre-install state. A rollback failure leaves a slot
                // pointing at our replacement, which still forwards correctly;
                // it is logged and otherwise ignored.
                for &(patched_slot, _) in &shape.overrides[..i] {
                    if let Err(e) = self.backend.patch(table, patched_slot, originals[patched_slot])
                    {
                        warn!(
                            tag = shape.tag,
                            slot = patched_slot,
                            error = %e,
                            "rollback of patched slot failed"
                        );
                    }
                }
                warn!(
                    tag = shape.tag,
                    slot,
                    error = %source,
                    "table patch failed; shape falls back to passthrough"
                );
                shapes.insert(key, ShapeState::Failed(shape.tag));
                return Err(InstallError::PatchFailed {
                    tag: shape.tag,
                    slot,
                    source,
                });
            }
        }

        let snapshot = Arc::new(TableSnapshot {
            tag: shape.tag,
            table: key,
            originals,
        });
        shapes.insert(key, ShapeState::Hooked(snapshot.clone()));
        Ok(snapshot)
    }

    /// Whether the table `object` dispatches through is currently hooked.
    ///
    /// # Safety
    ///
    /// `object` must be a live foreign object.
    pub unsafe fn is_hooked(&self, object: *mut ForeignObject) -> bool {
        let key = (*object).vtbl as usize;
        let shapes = self.shapes.lock().unwrap_or_else(|e| e.into_inner());
        matches!(shapes.get(&key), Some(ShapeState::Hooked(_)))
    }

    /// The snapshot installed for the table `object` dispatches through, if any.
    ///
    /// Replacement functions use this to fall back to transparent passthrough
    /// when no controller claims the receiver.
    ///
    /// # Safety
    ///
    /// `object` must be a live foreign object.
    pub unsafe fn snapshot_for(&self, object: *mut ForeignObject) -> Option<Arc<TableSnapshot>> {
        let key = (*object).vtbl as usize;
        let shapes = self.shapes.lock().unwrap_or_else(|e| e.into_inner());
        match shapes.get(&key) {
            Some(ShapeState::Hooked(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }
}

/// Proxy object whose private table forwards every slot to the pre-patch entry,
/// substituting the stored real receiver.
///
/// The layout mirrors [`ForeignObject`]: the table pointer comes first, so a
/// `*mut Trampoline` can be handed to any code expecting the foreign object.
/// Virtual calls on it dispatch through the private (never patched) table and
/// therefore cannot re-enter a replacement function, no matter how deeply
/// trampolines are nested.
#[repr(C)]
pub struct Trampoline {
    vtbl: *const usize,
    target: *mut ForeignObject,
    snapshot: Arc<TableSnapshot>,
    table: Box<[usize]>,
}

// The target pointer is owned by the foreign runtime, which drives it from
// whatever threads it likes; the trampoline adds no state of its own beyond the
// immutable forwarding table.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// Builds a trampoline from a forwarding `table` (one thunk address per
    /// slot, normally generated by [`foreign_interface!`]).
    pub fn new(
        snapshot: Arc<TableSnapshot>,
        target: *mut ForeignObject,
        table: Box<[usize]>,
    ) -> Box<Self> {
        let mut t = Box::new(Self {
            vtbl: ptr::null(),
            target,
            snapshot,
            table,
        });
        t.vtbl = t.table.as_ptr();
        t
    }

    /// The private forwarding table this proxy dispatches through.
    pub fn table(&self) -> *const usize {
        self.vtbl
    }

    /// The real receiver forwarded to by every slot.
    pub fn target(&self) -> *mut ForeignObject {
        self.target
    }

    /// The snapshot the forwarding thunks resolve pre-patch entries from.
    pub fn snapshot(&self) -> &Arc<TableSnapshot> {
        &self.snapshot
    }

    /// This trampoline viewed as the foreign object type. Valid for as long as
    /// the owning box is.
    pub fn as_foreign(&self) -> *mut ForeignObject {
        self as *const Self as *mut ForeignObject
    }
}

/// Declares a foreign interface: slot indices, signatures, and calling
/// convention of one method-table shape.
///
/// Generates a module containing:
///
/// - `SLOT_COUNT`: the table size implied by the highest declared slot;
/// - `Original`: typed, `unsafe` wrappers over [`TableSnapshot`] that invoke the
///   pre-patch entry of each slot ("call_original");
/// - `trampoline(snapshot, target)`: builds a [`Trampoline`] whose table
///   forwards every declared slot.
///
/// Every slot of the foreign table must be declared, in particular the ones that
/// are never overridden: the trampoline's private table needs a thunk for each.
#[macro_export]
macro_rules! foreign_interface {
    (
        $(#[$meta:meta])*
        $vis:vis interface $name:ident {
            $(
                slot $idx:literal fn $method:ident(
                    $this:ident $(, $arg:ident : $ty:ty)* $(,)?
                ) -> $ret:ty;
            )+
        }
    ) => {
        $(#[$meta])*
        $vis mod $name {
            #[allow(unused_imports)]
            use super::*;

            use ::std::sync::Arc;
            use $crate::{ForeignObject, TableSnapshot, Trampoline};

            /// Table size implied by the highest declared slot.
            pub const SLOT_COUNT: usize = {
                let mut max = 0usize;
                $( if $idx + 1 > max { max = $idx + 1; } )+
                max
            };

            /// Typed pre-patch callers for this interface.
            #[derive(Clone)]
            pub struct Original(pub Arc<TableSnapshot>);

            impl Original {
                $(
                    /// Invokes the pre-patch entry of this slot.
                    ///
                    /// # Safety
                    ///
                    /// `this` must be a live object of this interface's shape and
                    /// the snapshot must have been taken from its table.
                    pub unsafe fn $method(
                        &self,
                        $this: *mut ForeignObject
                        $(, $arg: $ty)*
                    ) -> $ret {
                        let f: unsafe extern "system" fn(
                            *mut ForeignObject $(, $ty)*
                        ) -> $ret = ::core::mem::transmute(self.0.original($idx));
                        f($this $(, $arg)*)
                    }
                )+
            }

            mod thunks {
                #[allow(unused_imports)]
                use super::super::*;
                use $crate::{ForeignObject, Trampoline};

                $(
                    pub unsafe extern "system" fn $method(
                        $this: *mut ForeignObject
                        $(, $arg: $ty)*
                    ) -> $ret {
                        let t = &*($this as *const Trampoline);
                        let target = t.target();
                        // If the target dispatches through the patched storage,
                        // use the pre-patch entry; any other table (an unpatched
                        // object, or another trampoline's private table) is
                        // already replacement-free, so dispatch through it. The
                        // latter is what makes nested trampolines resolve to the
                        // innermost real receiver.
                        let table = (*target).vtbl;
                        let addr = if table as usize == t.snapshot().table_addr() {
                            t.snapshot().original($idx)
                        } else {
                            ::core::ptr::read(table.add($idx))
                        };
                        let f: unsafe extern "system" fn(
                            *mut ForeignObject $(, $ty)*
                        ) -> $ret = ::core::mem::transmute(addr);
                        f(target $(, $arg)*)
                    }
                )+
            }

            /// Builds a trampoline proxy for `target`: every declared slot
            /// forwards to the pre-patch entry with `target` as the receiver.
            pub fn trampoline(
                snapshot: Arc<TableSnapshot>,
                target: *mut ForeignObject,
            ) -> Box<Trampoline> {
                let mut table = vec![0usize; SLOT_COUNT];
                $(
                    table[$idx] = thunks::$method
                        as unsafe extern "system" fn(*mut ForeignObject $(, $ty)*) -> $ret
                        as usize;
                )+
                Trampoline::new(snapshot, target, table.into_boxed_slice())
            }
        }
    };
}
