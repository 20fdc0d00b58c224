//! Image-reference rewriting.
//!
//! Podman records the container image by its 64-hex id. Restoring on a
//! host where that id is unknown fails, so the id is swapped for an image
//! name the target can resolve.

use std::borrow::Cow;
use std::path::Path;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use serde_json::Value;

static IMAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{64}\b").expect("image id pattern compiles"));

static WHOLE_IMAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("image id pattern compiles"));

/// Text files larger than this are never rewritten.
pub(crate) const TEXT_LIMIT: u64 = 100 * 1024;

const STRUCTURED_NAMES: [&str; 3] = ["container", "config", "manifest"];

/// Checkpoint page and state images. Never touched by this pass.
pub(crate) fn is_image_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "img")
}

pub(crate) fn is_structured(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        || path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| STRUCTURED_NAMES.contains(&n))
}

/// Replace every string leaf that is exactly an image id. Returns the
/// number of leaves replaced.
pub(crate) fn replace_in_tree(value: &mut Value, name: &str) -> usize {
    match value {
        Value::String(s) if WHOLE_IMAGE_ID.is_match(s.as_str()) => {
            *s = name.to_string();
            1
        }
        Value::Array(items) => items.iter_mut().map(|v| replace_in_tree(v, name)).sum(),
        Value::Object(map) => map.values_mut().map(|v| replace_in_tree(v, name)).sum(),
        _ => 0,
    }
}

fn rewrite_structured(raw: &[u8], name: &str) -> Option<Vec<u8>> {
    let mut tree: Value = serde_json::from_slice(raw).ok()?;
    if replace_in_tree(&mut tree, name) == 0 {
        return None;
    }
    serde_json::to_vec_pretty(&tree).ok()
}

fn rewrite_text(raw: &[u8], name: &str) -> Option<Vec<u8>> {
    if raw.len() as u64 > TEXT_LIMIT {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?;
    if !text.to_lowercase().contains("image") {
        return None;
    }
    match IMAGE_ID.replace_all(text, NoExpand(name)) {
        Cow::Borrowed(_) => None,
        Cow::Owned(next) => Some(next.into_bytes()),
    }
}

/// New contents for `path` with image ids replaced by `name`, or `None`
/// when the file has nothing to rewrite.
pub(crate) fn rewrite(path: &Path, raw: &[u8], name: &str) -> Option<Vec<u8>> {
    if is_structured(path) {
        if let Some(next) = rewrite_structured(raw, name) {
            return Some(next);
        }
    }
    rewrite_text(raw, name)
}
