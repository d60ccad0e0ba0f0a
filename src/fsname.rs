//! Filename derivation and sanitization for cached files.

use url::Url;

/// Maps a free-form identifier into a safe filename component.
///
/// Collapses runs of separators and strips leading/trailing underscores so
/// ids like `group/item v2` become `group_item_v2`.
#[must_use]
pub(crate) fn sanitize_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\'' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

/// Extracts a lowercase extension (with leading dot) from a URL path.
///
/// Rejects degenerate extensions (empty or implausibly long).
#[must_use]
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Builds the cache filename for a resource: `<resource_id>.<ext>` when the
/// source location carries an extension, else `<resource_id>`.
#[must_use]
pub(crate) fn cache_file_name(resource_id: &str, location: &str) -> String {
    let stem = sanitize_component(resource_id);
    match extension_from_url(location) {
        Some(ext) => format!("{stem}{ext}"),
        None => stem,
    }
}

/// The `copy-N.` prefixed variant used to resolve collisions.
#[must_use]
pub(crate) fn collision_file_name(name: &str, attempt: u32) -> String {
    format!("copy-{attempt}.{name}")
}
