use std::fmt;

use thiserror::Error;

use crate::exec::shell_quote;

/// System directories that destructive remote operations must never touch.
pub const PROTECTED_DIRS: [&str; 13] = [
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin", "/sys",
    "/usr", "/var",
];

/// Characters that could smuggle extra shell syntax into a command string.
/// Checked against the raw input, before normalization.
const DANGEROUS_CHARS: [char; 7] = [';', '|', '&', '$', '`', '\n', '\r'];

/// Why a path was refused. The `Display` form is shown to users verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathRejection {
    #[error("empty path")]
    Empty,
    #[error("path traversal detected (..)")]
    Traversal,
    #[error("protected directory: {dir}")]
    Protected { dir: &'static str },
    #[error("dangerous character: {ch:?}")]
    DangerousChar { ch: char },
    #[error("deleting {dir} is not allowed")]
    NotDeletable { dir: String },
}

/// Lexical normalization: drops `.` segments and redundant separators while
/// keeping `..` visible for the traversal check. Never touches the
/// filesystem.
fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Validate a remote path before it is embedded in any shell command.
///
/// Checks, in order: non-empty, no `..` after normalization, not inside a
/// protected system directory (the `/home/` and `/tmp/` subtrees are always
/// permitted), no shell metacharacters anywhere in the raw input.
pub fn validate_remote_path(path: &str) -> Result<(), PathRejection> {
    if path.is_empty() {
        return Err(PathRejection::Empty);
    }

    let normalized = normalize(path);

    if normalized.contains("..") {
        return Err(PathRejection::Traversal);
    }

    for dir in PROTECTED_DIRS {
        let inside = normalized == dir || normalized.starts_with(&format!("{dir}/"));
        if inside && !(normalized.starts_with("/home/") || normalized.starts_with("/tmp/")) {
            return Err(PathRejection::Protected { dir });
        }
    }

    if let Some(ch) = path.chars().find(|ch| DANGEROUS_CHARS.contains(ch)) {
        return Err(PathRejection::DangerousChar { ch });
    }

    Ok(())
}

/// Stricter check for deletion: the roots of the writable allow-list
/// (`/home`, `/tmp`) are themselves off limits even though their children
/// are deletable.
pub fn is_safe_for_deletion(path: &str) -> Result<(), PathRejection> {
    validate_remote_path(path)?;

    let trimmed = path.trim_end_matches('/');
    if trimmed == "/home" || trimmed == "/tmp" {
        return Err(PathRejection::NotDeletable {
            dir: trimmed.to_string(),
        });
    }

    Ok(())
}

/// A remote path that has passed validation.
///
/// The only way to construct one is through the validator, so command
/// builders can require `&ValidatedPath` instead of trusting raw strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath(String);

impl ValidatedPath {
    pub fn new(path: &str) -> Result<Self, PathRejection> {
        validate_remote_path(path)?;
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// POSIX-quoted form, safe to embed in a remote shell command.
    pub fn quoted(&self) -> String {
        shell_quote(&self.0)
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
