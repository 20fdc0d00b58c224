//! Directory and tar checkpoint patching.
//!
//! Every change is staged first: the socket image is re-encoded into a
//! temporary file and rewritten records are held in memory. Nothing in
//! the checkpoint is replaced until every step has succeeded, and each
//! replacement is a rename over the original.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::codec::SocketImageCodec;
use crate::error::{PatchError, PatchResult};
use crate::image_ref;
use crate::records::{self, CONFIG_DUMP, NETWORK_STATUS};
use crate::sockets;

/// Location of the socket image inside a checkpoint.
pub const SOCKET_IMAGE: &str = "checkpoint/files.img";

/// What to rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    pub old_addr: Ipv4Addr,
    pub new_addr: Ipv4Addr,
    /// Replaces image ids in container metadata when set.
    pub image_name: Option<String>,
}

impl PatchRequest {
    /// Validate operator input.
    pub fn parse(old_addr: &str, new_addr: &str, image_name: Option<&str>) -> PatchResult<Self> {
        let (old_addr, new_addr) = (old_addr.trim(), new_addr.trim());
        if old_addr.is_empty() || new_addr.is_empty() {
            return Err(PatchError::Precondition(
                "old_addr and new_addr must not be empty".to_string(),
            ));
        }
        if old_addr == new_addr {
            return Err(PatchError::Precondition(
                "old_addr and new_addr must be different".to_string(),
            ));
        }
        let parse = |addr: &str| {
            addr.parse::<Ipv4Addr>()
                .map_err(|_| PatchError::Precondition(format!("'{addr}' is not an IPv4 address")))
        };
        Ok(Self {
            old_addr: parse(old_addr)?,
            new_addr: parse(new_addr)?,
            image_name: image_name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
        })
    }
}

/// What a successful patch changed. Paths are relative to the checkpoint
/// root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub sockets_rewritten: usize,
    pub network_status: bool,
    pub config_dump: bool,
    pub image_refs: Vec<PathBuf>,
}

/// Pending replacements for one checkpoint directory.
#[derive(Default)]
struct Staged {
    image: Option<(NamedTempFile, PathBuf)>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl Staged {
    fn commit(self) -> PatchResult<()> {
        if let Some((encoded, target)) = self.image {
            copy_permissions(&target, &encoded);
            encoded.persist(&target).map_err(|e| PatchError::Io {
                path: target.clone(),
                source: e.error,
            })?;
        }
        for (path, contents) in self.files {
            replace_file(&path, &contents)?;
        }
        Ok(())
    }

    fn current(&self, path: &Path) -> PatchResult<Vec<u8>> {
        match self.files.get(path) {
            Some(contents) => Ok(contents.clone()),
            None => std::fs::read(path).map_err(PatchError::io(path)),
        }
    }
}

fn copy_permissions(from: &Path, to: &NamedTempFile) {
    if let Ok(meta) = std::fs::metadata(from) {
        if let Err(e) = to.as_file().set_permissions(meta.permissions()) {
            debug!(path = %from.display(), error = %e, "could not copy permissions");
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Write `contents` beside `path` and rename it into place.
fn replace_file(path: &Path, contents: &[u8]) -> PatchResult<()> {
    let dir = parent_dir(path);
    let mut tmp = NamedTempFile::new_in(dir).map_err(PatchError::io(dir))?;
    tmp.write_all(contents).map_err(PatchError::io(tmp.path()))?;
    copy_permissions(path, &tmp);
    tmp.persist(path).map_err(|e| PatchError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn read_json(path: &Path) -> PatchResult<Value> {
    let raw = std::fs::read(path).map_err(PatchError::io(path))?;
    serde_json::from_slice(&raw).map_err(|source| PatchError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn to_json(path: &Path, value: &Value, pretty: bool) -> PatchResult<Vec<u8>> {
    let out = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    };
    out.map_err(|source| PatchError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Rewrites a checkpoint so the process inside it can be restored under a
/// new address.
pub struct CheckpointPatcher<C> {
    codec: C,
    dump_dir: PathBuf,
}

impl<C: SocketImageCodec> CheckpointPatcher<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            dump_dir: std::env::temp_dir(),
        }
    }

    /// Where the decoded socket image is dumped when no socket matches.
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }

    /// Patch a checkpoint directory or `.tar` archive in place.
    pub fn patch(&self, archive: &Path, request: &PatchRequest) -> PatchResult<PatchReport> {
        if !archive.exists() {
            return Err(PatchError::Precondition(format!(
                "{} does not exist",
                archive.display()
            )));
        }
        if archive.is_dir() {
            self.patch_directory(archive, request)
        } else if archive.extension().is_some_and(|ext| ext == "tar") {
            self.patch_tar(archive, request)
        } else {
            Err(PatchError::Precondition(format!(
                "{}: input must be a directory or a .tar file",
                archive.display()
            )))
        }
    }

    pub fn patch_directory(&self, dir: &Path, request: &PatchRequest) -> PatchResult<PatchReport> {
        info!(
            checkpoint = %dir.display(),
            old = %request.old_addr,
            new = %request.new_addr,
            "patching checkpoint"
        );
        let mut staged = Staged::default();
        let mut report = PatchReport::default();

        self.stage_socket_image(dir, request, &mut staged, &mut report)?;
        stage_records(dir, request.new_addr, &mut staged, &mut report)?;
        if let Some(name) = &request.image_name {
            let skip = staged.image.as_ref().map(|(tmp, _)| tmp.path().to_path_buf());
            stage_image_refs(dir, name, skip.as_deref(), &mut staged, &mut report)?;
        }

        staged.commit()?;
        info!(
            checkpoint = %dir.display(),
            sockets = report.sockets_rewritten,
            image_refs = report.image_refs.len(),
            "checkpoint patched"
        );
        Ok(report)
    }

    /// Extract to scratch, patch, repack with the original entry names and
    /// rename the new archive over the old one.
    pub fn patch_tar(&self, archive: &Path, request: &PatchRequest) -> PatchResult<PatchReport> {
        let scratch = tempfile::tempdir().map_err(PatchError::io(std::env::temp_dir()))?;
        let names = unpack(archive, scratch.path())?;
        debug!(archive = %archive.display(), entries = names.len(), "extracted checkpoint archive");

        let report = self.patch_directory(scratch.path(), request)?;
        repack(archive, scratch.path(), &names)?;
        info!(archive = %archive.display(), "replaced checkpoint archive");
        Ok(report)
    }

    fn stage_socket_image(
        &self,
        dir: &Path,
        request: &PatchRequest,
        staged: &mut Staged,
        report: &mut PatchReport,
    ) -> PatchResult<()> {
        let image = dir.join(SOCKET_IMAGE);
        if !image.is_file() {
            return Err(PatchError::MissingSocketImage { path: image });
        }

        let mut decoded = self.codec.decode(&image)?;
        let outcome = sockets::rewrite_bind_addresses(&mut decoded, request.old_addr, request.new_addr);
        if outcome.rewritten == 0 {
            let dump_path = self.dump(&image, &decoded)?;
            return Err(PatchError::AddressNotFound {
                path: image,
                old: request.old_addr.to_string(),
                observed: outcome.observed,
                dump_path,
            });
        }

        let encoded = NamedTempFile::new_in(parent_dir(&image)).map_err(PatchError::io(&image))?;
        self.codec.encode(&decoded, encoded.path())?;
        staged.image = Some((encoded, image));
        report.sockets_rewritten = outcome.rewritten;
        Ok(())
    }

    fn dump(&self, image: &Path, decoded: &Value) -> PatchResult<PathBuf> {
        let contents = to_json(image, decoded, true)?;
        let (mut file, path) = tempfile::Builder::new()
            .prefix("decoded_image-")
            .suffix(".json")
            .tempfile_in(&self.dump_dir)
            .and_then(|tmp| tmp.keep().map_err(|e| e.error))
            .map_err(PatchError::io(&self.dump_dir))?;
        file.write_all(&contents).map_err(PatchError::io(&path))?;
        Ok(path)
    }
}

fn stage_records(dir: &Path, new: Ipv4Addr, staged: &mut Staged, report: &mut PatchReport) -> PatchResult<()> {
    let status_path = dir.join(NETWORK_STATUS);
    if status_path.is_file() {
        let mut status = read_json(&status_path)?;
        if records::patch_network_status(&mut status, new) {
            staged.files.insert(status_path.clone(), to_json(&status_path, &status, true)?);
            report.network_status = true;
            info!(path = %status_path.display(), addr = %new, "patched network.status");
        }
    }

    let config_path = dir.join(CONFIG_DUMP);
    if config_path.is_file() {
        let mut config = read_json(&config_path)?;
        if records::patch_config_dump(&mut config, new) {
            staged.files.insert(config_path.clone(), to_json(&config_path, &config, false)?);
            report.config_dump = true;
            info!(path = %config_path.display(), addr = %new, "patched config.dump");
        }
    }
    Ok(())
}

fn stage_image_refs(
    dir: &Path,
    name: &str,
    skip: Option<&Path>,
    staged: &mut Staged,
    report: &mut PatchReport,
) -> PatchResult<()> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            PatchError::Io {
                path,
                source: e.into(),
            }
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || image_ref::is_image_file(path) || Some(path) == skip {
            continue;
        }
        if !staged.files.contains_key(path) && !image_ref::is_structured(path) {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            if len > image_ref::TEXT_LIMIT {
                continue;
            }
        }

        let current = staged.current(path)?;
        if let Some(next) = image_ref::rewrite(path, &current, name) {
            let relative = path.strip_prefix(dir).unwrap_or(path).to_path_buf();
            info!(path = %relative.display(), image = name, "patched image reference");
            staged.files.insert(path.to_path_buf(), next);
            report.image_refs.push(relative);
        }
    }
    Ok(())
}

/// Unpack `archive` under `into`, returning entry names in archive order.
fn unpack(archive: &Path, into: &Path) -> PatchResult<Vec<PathBuf>> {
    let file = File::open(archive).map_err(PatchError::io(archive))?;
    let mut tar = tar::Archive::new(file);
    tar.set_preserve_permissions(true);
    let mut names = Vec::new();
    for entry in tar.entries().map_err(PatchError::tar(archive))? {
        let mut entry = entry.map_err(PatchError::tar(archive))?;
        let name = entry.path().map_err(PatchError::tar(archive))?.into_owned();
        if entry.unpack_in(into).map_err(PatchError::tar(archive))? {
            names.push(name);
        } else {
            debug!(entry = %name.display(), "skipped archive entry outside the checkpoint root");
        }
    }
    Ok(names)
}

fn repack(archive: &Path, root: &Path, names: &[PathBuf]) -> PatchResult<()> {
    let tmp = NamedTempFile::new_in(parent_dir(archive)).map_err(PatchError::io(archive))?;
    let mut builder = tar::Builder::new(tmp);
    builder.follow_symlinks(false);

    let mut seen = HashSet::new();
    for name in names {
        let relative: PathBuf = name
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        if relative.as_os_str().is_empty() || !seen.insert(relative.clone()) {
            continue;
        }
        builder
            .append_path_with_name(root.join(&relative), &relative)
            .map_err(PatchError::tar(archive))?;
    }

    let tmp = builder.into_inner().map_err(PatchError::tar(archive))?;
    copy_permissions(archive, &tmp);
    tmp.persist(archive).map_err(|e| PatchError::Tar {
        path: archive.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
