use std::path::{Path, PathBuf};

use anyhow::bail;
use steer_checkpoint::{CheckpointPatcher, CritCodec, PatchRequest};

/// Check everything that does not need `crit`.
fn validate(archive: &Path, old_addr: &str, new_addr: &str, image_name: Option<&str>) -> anyhow::Result<PatchRequest> {
    let request = PatchRequest::parse(old_addr, new_addr, image_name)?;
    if !archive.exists() {
        bail!("{} does not exist", archive.display());
    }
    Ok(request)
}

pub fn patch(
    archive: &Path,
    old_addr: &str,
    new_addr: &str,
    image_name: Option<&str>,
    dump_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let request = match validate(archive, old_addr, new_addr, image_name) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {e}");
            return Err(e);
        }
    };
    let codec = CritCodec::discover()?;

    let mut patcher = CheckpointPatcher::new(codec);
    if let Some(dir) = dump_dir {
        patcher = patcher.with_dump_dir(dir);
    }

    match patcher.patch(archive, &request) {
        Ok(report) => {
            println!(
                "✓ Patched {} ({} socket{} → {})",
                archive.display(),
                report.sockets_rewritten,
                if report.sockets_rewritten == 1 { "" } else { "s" },
                request.new_addr
            );
            if report.network_status {
                println!("  network.status → {}", request.new_addr);
            }
            if report.config_dump {
                println!("  config.dump → {}", request.new_addr);
            }
            for path in &report.image_refs {
                println!("  image ref → {} in {}", image_name.unwrap_or_default(), path.display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Patch failed: {e}");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_equal_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(dir.path(), "10.0.0.1", "10.0.0.1", None).unwrap_err();
        assert!(err.to_string().contains("must be different"));
    }

    #[test]
    fn rejects_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(&dir.path().join("gone.tar"), "10.0.0.1", "10.0.0.5", None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let request = validate(dir.path(), "10.0.0.1", "10.0.0.5", Some("nginx")).unwrap();
        assert_eq!(request.image_name.as_deref(), Some("nginx"));
    }
}
