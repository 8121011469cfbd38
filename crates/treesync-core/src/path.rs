//! Conversion between native paths and the wire form.
//!
//! The wire form is relative, `/`-separated and UTF-8. Paths are converted
//! exactly once per entry: right before a STAT is sent and right after one is
//! received. A wire path that does not survive the round trip on the local
//! platform is rejected rather than silently altered.

use std::path::{Component, Path, PathBuf};

/// Separator used on the wire, independent of either peer's platform.
pub const WIRE_SEPARATOR: char = '/';

/// Path syntax of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Unix,
    Windows,
}

impl PathStyle {
    #[cfg(windows)]
    pub const NATIVE: PathStyle = PathStyle::Windows;
    #[cfg(not(windows))]
    pub const NATIVE: PathStyle = PathStyle::Unix;

    pub fn separator(self) -> char {
        match self {
            Self::Unix => '/',
            Self::Windows => '\\',
        }
    }

    /// Wire form to this platform's string form.
    ///
    /// Fails when the result would not convert back to the same wire path,
    /// e.g. `foo/bar\baz` on Windows where `\` is a separator.
    pub fn from_wire(self, wire: &str) -> Result<String, PathError> {
        if wire.contains('\0') {
            return Err(PathError::Unrepresentable { path: wire.to_string() });
        }
        let native = match self {
            Self::Unix => wire.to_string(),
            Self::Windows => wire.replace(WIRE_SEPARATOR, "\\"),
        };
        if self.to_wire(&native) != wire {
            return Err(PathError::Unrepresentable { path: wire.to_string() });
        }
        Ok(native)
    }

    /// This platform's string form to wire form.
    pub fn to_wire(self, native: &str) -> String {
        match self {
            Self::Unix => native.to_string(),
            Self::Windows => native.replace('\\', "/"),
        }
    }
}

// ── Entry paths ───────────────────────────────────────────────────────────────

/// Convert a relative native entry path to wire form.
pub fn to_wire(native: &Path) -> Result<String, PathError> {
    let mut out = String::new();
    for component in native.components() {
        match component {
            Component::Normal(name) => {
                let name = name.to_str().ok_or_else(|| PathError::NotUtf8 {
                    path: native.to_path_buf(),
                })?;
                if !out.is_empty() {
                    out.push(WIRE_SEPARATOR);
                }
                out.push_str(name);
            }
            other => {
                return Err(PathError::DisallowedComponent {
                    path: native.display().to_string(),
                    component: format!("{other:?}"),
                })
            }
        }
    }
    if out.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Convert a wire entry path to a native path for the local platform.
pub fn from_wire(wire: &str) -> Result<PathBuf, PathError> {
    PathStyle::NATIVE.from_wire(wire).map(PathBuf::from)
}

// ── Link targets ──────────────────────────────────────────────────────────────

/// Convert a link target to wire form. Targets may be absolute or contain
/// `..`, so only the separators change.
pub fn link_to_wire(native: &str) -> String {
    PathStyle::NATIVE.to_wire(native)
}

/// Convert a wire link target to native form, with the same round-trip rule
/// as entry paths.
pub fn link_from_wire(wire: &str) -> Result<String, PathError> {
    if wire.is_empty() {
        return Ok(String::new());
    }
    PathStyle::NATIVE.from_wire(wire)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("unrepresentable path {path:?}")]
    Unrepresentable { path: String },

    #[error("path is not valid UTF-8: {}", path.display())]
    NotUtf8 { path: PathBuf },

    #[error("path {path:?} contains disallowed component {component}")]
    DisallowedComponent { path: String, component: String },

    #[error("empty path")]
    Empty,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
