//! Vendor stereoscopic-3D parameter bridge.
//!
//! The actual vendor driver extension is an external service keyed by an opaque
//! per-device handle; this module only fixes the contract the Draw Gate relies
//! on. Failures here are logged by the caller and the draw proceeds unmodified,
//! never skipped or aborted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StereoError {
    /// The vendor driver declined the request (stereo disabled, wrong mode...).
    #[error("stereo service declined: {0}")]
    Declined(String),
    /// No stereo service is available for this device.
    #[error("stereo service unavailable")]
    Unavailable,
}

/// Get/set access to the separation and convergence parameters of one device.
pub trait StereoBridge: Send + Sync {
    fn separation(&self) -> Result<f32, StereoError>;
    fn set_separation(&self, value: f32) -> Result<(), StereoError>;
    fn convergence(&self) -> Result<f32, StereoError>;
    fn set_convergence(&self, value: f32) -> Result<(), StereoError>;
}

/// Bridge for devices without a stereo driver: every call declines.
pub struct NoStereo;

impl StereoBridge for NoStereo {
    fn separation(&self) -> Result<f32, StereoError> {
        Err(StereoError::Unavailable)
    }

    fn set_separation(&self, _value: f32) -> Result<(), StereoError> {
        Err(StereoError::Unavailable)
    }

    fn convergence(&self) -> Result<f32, StereoError> {
        Err(StereoError::Unavailable)
    }

    fn set_convergence(&self, _value: f32) -> Result<(), StereoError> {
        Err(StereoError::Unavailable)
    }
}
