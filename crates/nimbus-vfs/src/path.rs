//! Virtual path handling.
//!
//! Every path entering the tree goes through [`normalize`] so that reads and
//! writes agree on a single canonical form: a leading `/`, no trailing `/`,
//! no empty, `.` or `..` segments.

use crate::{Result, VfsError};

pub const ROOT: &str = "/";

/// Canonicalize a virtual path lexically.
///
/// `..` above the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        ROOT.to_string()
    } else {
        let mut out = String::with_capacity(path.len() + 1);
        for part in parts {
            out.push('/');
            out.push_str(part);
        }
        out
    }
}

/// Parent of a normalized path, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&path[..i]),
        None => Some(ROOT),
    }
}

/// Last segment of a normalized path; empty for the root.
pub fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Prefix shared by every strict descendant of `path`.
pub fn child_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", path)
    }
}

/// True if `path` is `ancestor` or lies beneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor || path.starts_with(&child_prefix(ancestor))
}

/// A leaf name must be non-empty, not `.`/`..`, and contain no separator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(VfsError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `"report.pdf"` -> `("report", ".pdf")`; dotfiles keep their leading dot
/// in the stem.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    }
}

/// `n`-th alternative name used by the rename conflict policy.
pub fn numbered_name(name: &str, n: u32) -> String {
    let (stem, ext) = split_extension(name);
    format!("{} ({}){}", stem, n, ext)
}
