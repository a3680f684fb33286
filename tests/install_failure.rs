//! Interception install failure: the application must keep running on the
//! unmodified table. Lives in its own binary because the patch backend is
//! process-global and must be replaced before the first attach.

mod common;

use glint::{
    attach, AttachError, HuntConfig, InstallError, PatchError, PatchSlots, Services,
};
use pretty_assertions::assert_eq;

use common::*;

struct RefusePatch;

impl PatchSlots for RefusePatch {
    unsafe fn patch(&self, _: *mut usize, _: usize, _: usize) -> Result<(), PatchError> {
        Err(PatchError::NotWritable)
    }
}

#[test]
fn failed_install_leaves_device_untouched() {
    init_tracing();
    assert!(glint::install_patch_backend(Box::new(RefusePatch)));

    let device = FakeDevice::new();
    let pristine: Vec<usize> = (0..17).map(|slot| device.table_entry(slot)).collect();

    let services = Services {
        compiler: Box::new(StubCompiler),
        stereo: Box::new(SharedStereo(RecordingStereo::new(0.0, 0.0))),
    };
    let err = unsafe { attach(device.as_foreign(), services, HuntConfig::default()) }
        .unwrap_err();
    assert!(matches!(
        err,
        AttachError::Install(InstallError::PatchFailed { .. })
    ));

    // Table byte-identical to its pre-install state, no controller registered.
    let after: Vec<usize> = (0..17).map(|slot| device.table_entry(slot)).collect();
    assert_eq!(pristine, after);
    assert!(!glint::router::global().is_attached(device.as_foreign() as usize));

    // The device keeps working through its own, unpatched table.
    let dev = device.as_foreign();
    unsafe {
        let ps = vcall_create_pixel_shader(dev, &[1, 2, 3]);
        vcall_set_pixel_shader(dev, ps);
        vcall_draw_primitive(dev);
        vcall_present(dev);
    }
    assert_eq!(device.state().draws.len(), 1);
    assert_eq!(device.state().presents, 1);

    // Later attaches report the cached failure without retrying the patch.
    let services = Services {
        compiler: Box::new(StubCompiler),
        stereo: Box::new(SharedStereo(RecordingStereo::new(0.0, 0.0))),
    };
    let err = unsafe { attach(device.as_foreign(), services, HuntConfig::default()) }
        .unwrap_err();
    assert!(matches!(
        err,
        AttachError::Install(InstallError::ShapeDisabled { .. })
    ));
}
