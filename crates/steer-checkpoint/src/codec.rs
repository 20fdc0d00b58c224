//! Socket image codec seam.
//!
//! CRIU stores socket state in protobuf images. Decoding and encoding is
//! delegated to the `crit` tool; the patcher only sees the JSON form.

use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tracing::debug;

use crate::error::{PatchError, PatchResult};

/// Converts a checkpoint image to JSON and back.
pub trait SocketImageCodec {
    fn decode(&self, image: &Path) -> PatchResult<Value>;

    /// Encode `value` into a fresh image at `out`.
    fn encode(&self, value: &Value, out: &Path) -> PatchResult<()>;
}

/// `crit decode` / `crit encode` from the CRIU tool set.
#[derive(Debug, Clone)]
pub struct CritCodec {
    program: PathBuf,
}

impl CritCodec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate `crit`.
    ///
    /// Search order:
    /// 1. `$STEER_CRIT_PATH`
    /// 2. `crit` on `$PATH`
    pub fn discover() -> PatchResult<Self> {
        if let Ok(path) = std::env::var("STEER_CRIT_PATH") {
            let crit = PathBuf::from(&path);
            if crit.is_file() {
                debug!(path = %crit.display(), "found crit (from STEER_CRIT_PATH)");
                return Ok(Self::new(crit));
            }
            return Err(PatchError::Precondition(format!(
                "STEER_CRIT_PATH is set to '{path}' but the file does not exist"
            )));
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let crit = dir.join("crit");
                if crit.is_file() {
                    debug!(path = %crit.display(), "found crit on PATH");
                    return Ok(Self::new(crit));
                }
            }
        }

        Err(PatchError::Precondition(
            "'crit' command not found. Install CRIU and make sure 'crit' is on PATH, \
             or set STEER_CRIT_PATH"
                .to_string(),
        ))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, image: &Path, args: &[&OsStr]) -> PatchResult<Vec<u8>> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| PatchError::Codec {
                path: image.to_path_buf(),
                reason: format!("failed to run {}: {e}", self.program.display()),
            })?;
        if !output.status.success() {
            return Err(PatchError::Codec {
                path: image.to_path_buf(),
                reason: format!(
                    "crit exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }
}

impl SocketImageCodec for CritCodec {
    fn decode(&self, image: &Path) -> PatchResult<Value> {
        let stdout = self.run(
            image,
            &[OsStr::new("decode"), OsStr::new("-i"), image.as_os_str(), OsStr::new("--pretty")],
        )?;
        serde_json::from_slice(&stdout).map_err(|source| PatchError::Json {
            path: image.to_path_buf(),
            source,
        })
    }

    fn encode(&self, value: &Value, out: &Path) -> PatchResult<()> {
        let dir = out.parent().unwrap_or(Path::new("."));
        let mut input = tempfile::Builder::new()
            .prefix(".steer-crit-")
            .suffix(".json")
            .tempfile_in(dir)
            .map_err(PatchError::io(dir))?;
        serde_json::to_writer_pretty(&mut input, value).map_err(|source| PatchError::Json {
            path: input.path().to_path_buf(),
            source,
        })?;
        input.flush().map_err(PatchError::io(input.path()))?;

        self.run(
            out,
            &[
                OsStr::new("encode"),
                OsStr::new("-i"),
                input.path().as_os_str(),
                OsStr::new("-o"),
                out.as_os_str(),
            ],
        )?;
        Ok(())
    }
}

/// Images stored as plain JSON. Useful for fixtures and for checkpoints
/// that were already decoded by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl SocketImageCodec for JsonCodec {
    fn decode(&self, image: &Path) -> PatchResult<Value> {
        let raw = std::fs::read(image).map_err(PatchError::io(image))?;
        serde_json::from_slice(&raw).map_err(|source| PatchError::Json {
            path: image.to_path_buf(),
            source,
        })
    }

    fn encode(&self, value: &Value, out: &Path) -> PatchResult<()> {
        let raw = serde_json::to_vec_pretty(value).map_err(|source| PatchError::Json {
            path: out.to_path_buf(),
            source,
        })?;
        std::fs::write(out, raw).map_err(PatchError::io(out))
    }
}
