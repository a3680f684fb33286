//! Hot-reload: the on-disk override format and the directory scan feeding the
//! reload sweep.
//!
//! File naming is a contract shared with the operator's editor workflow:
//!
//! ```text
//! <16-hex-identity>-<vs|ps>.txt           assembly listing (export)
//! <16-hex-identity>-<vs|ps>.bin           original bytecode (export)
//! <16-hex-identity>-<vs|ps>_replace.txt   editable source; presence = active
//! ```
//!
//! Presence of a `_replace` file is the signal that a replacement should be
//! live; deleting it reverts the shader on the next sweep. Anything in the
//! directory that does not parse as one of these names is ignored.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::warn;

use crate::abi::Hresult;
use crate::compile::CompileError;
use crate::identity::{ShaderIdentity, ShaderStage};

pub(crate) const REPLACE_SUFFIX: &str = "_replace.txt";

#[derive(Debug, Error)]
pub enum ReloadError {
    /// A `_replace` file names an identity this device has never seen.
    #[error("no shader with identity {identity} is registered")]
    UnknownIdentity { identity: ShaderIdentity },
    /// The file's stage tag disagrees with the stage the identity was created
    /// with; compiling it would substitute a wrong-stage object.
    #[error("{identity} is a {registered} shader; its {requested} replace file was ignored")]
    StageMismatch {
        identity: ShaderIdentity,
        registered: ShaderStage,
        requested: ShaderStage,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The device refused to create the replacement object.
    #[error("shader object creation failed (hresult {hresult:#010x})")]
    CreateFailed { hresult: Hresult },
}

impl ReloadError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

/// A live replacement for one shader identity.
#[derive(Debug, Clone, Copy)]
pub struct ReplacementRecord {
    /// Foreign object handle owned by this record; released exactly once, when
    /// the record is superseded, reverted, or torn down.
    pub object: usize,
    /// Source file mtime at compile time; an unchanged mtime skips recompiling.
    pub source_mtime: SystemTime,
}

/// One parsed `_replace` file found by a directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadCandidate {
    pub path: PathBuf,
    pub identity: ShaderIdentity,
    pub stage: ShaderStage,
    pub mtime: SystemTime,
}

/// Tally of one reload sweep, for the log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub compiled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub reverted: usize,
}

pub(crate) fn replace_file_name(identity: ShaderIdentity, stage: ShaderStage) -> String {
    format!("{identity}-{}{REPLACE_SUFFIX}", stage.tag())
}

pub(crate) fn asm_file_name(identity: ShaderIdentity, stage: ShaderStage) -> String {
    format!("{identity}-{}.txt", stage.tag())
}

pub(crate) fn bytecode_file_name(identity: ShaderIdentity, stage: ShaderStage) -> String {
    format!("{identity}-{}.bin", stage.tag())
}

/// Parses a `_replace` file name back into identity and stage. Returns `None`
/// for anything that is not exactly `<16 hex>-<vs|ps>_replace.txt`.
pub(crate) fn parse_replace_file_name(name: &str) -> Option<(ShaderIdentity, ShaderStage)> {
    let rest = name.strip_suffix(REPLACE_SUFFIX)?;
    let (hex, tag) = rest.split_once('-')?;
    let identity = ShaderIdentity::from_hex(hex)?;
    let stage = ShaderStage::from_tag(tag)?;
    Some((identity, stage))
}

/// Scans the override directory for `_replace` files.
///
/// A missing directory is not an error (the operator simply has not exported
/// anything yet); it scans as empty, which also reverts every live replacement.
pub(crate) fn scan_override_dir(dir: &Path) -> Result<Vec<ReloadCandidate>, ReloadError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ReloadError::io(dir, err)),
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ReloadError::io(dir, err))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((identity, stage)) = parse_replace_file_name(name) else {
            continue;
        };
        let mtime = match entry.metadata().and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot stat override file");
                continue;
            }
        };
        candidates.push(ReloadCandidate { path, identity, stage, mtime });
    }
    // Deterministic sweep order.
    candidates.sort_by_key(|c| (c.identity, c.stage.tag()));
    Ok(candidates)
}

/// The identities present on disk, for the revert pass.
pub(crate) fn identities_on_disk(candidates: &[ReloadCandidate]) -> BTreeSet<ShaderIdentity> {
    candidates.iter().map(|c| c.identity).collect()
}
