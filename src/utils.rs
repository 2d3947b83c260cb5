//! Small helpers shared across modules.

use crate::error::Error;
use crate::error::Result;

/// Quotes a string for safe interpolation into a shell command line.
pub fn quote(s: &str) -> Result<String> {
    shlex::try_quote(s)
        .map(|cow| cow.into_owned())
        .map_err(|_| Error::config(format!("value contains a NUL byte: {s:?}")))
}

/// Joins path segments with a `/`, without introducing doubled separators.
///
/// Transports speak POSIX paths regardless of the invoking platform, so this
/// is deliberately not `std::path` based.
pub fn join(base: &str, segment: &str) -> String {
    if base.is_empty() || base.ends_with('/') {
        format!("{base}{segment}")
    } else {
        format!("{base}/{segment}")
    }
}

/// Returns the final path segment of a POSIX path or URI.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Splits a filename into a stem and its (possibly empty) extension suffix.
///
/// The extension includes the leading dot; dotfiles keep their leading dot in
/// the stem, matching `os.path.splitext` semantics.
pub fn splitext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Determines whether a value looks like a cloud object URI.
pub fn is_gs_uri(value: &str) -> bool {
    value.starts_with("gs://")
}
