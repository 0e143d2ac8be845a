//! Domain-specific shared validations and source classification

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::AppError;

pub const MAX_PROMPT_CHARS: usize = 4_000;
pub const MAX_SPEECH_CHARS: usize = 5_000;
pub const VALID_ASPECT_RATIOS: [&str; 5] = ["1:1", "16:9", "9:16", "4:3", "3:4"];
pub const VALID_DETAIL_LEVELS: [&str; 3] = ["quick", "detailed", "technical"];

static VIRTUAL_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/mnt/(user-data|data)/").expect("virtual path pattern"));

/// Where a media source argument points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Url,
    DataUri,
    /// A sandboxed client path the server cannot read directly.
    VirtualPath,
    LocalPath,
}

pub fn classify_source(value: &str) -> SourceKind {
    let trimmed = value.trim();
    let lowered = trimmed.to_ascii_lowercase();

    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        SourceKind::Url
    } else if lowered.starts_with("data:") {
        SourceKind::DataUri
    } else if VIRTUAL_PATH.is_match(trimmed) {
        SourceKind::VirtualPath
    } else {
        SourceKind::LocalPath
    }
}

pub fn require_text(field: &'static str, value: &str, max_chars: usize) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request(
            "missing_field",
            format!("{field} must not be empty"),
        ));
    }

    if trimmed.chars().count() > max_chars {
        return Err(AppError::bad_request(
            "field_too_long",
            format!("{field} must not exceed {max_chars} characters"),
        ));
    }

    Ok(trimmed.to_string())
}

pub fn normalize_choice(
    field: &'static str,
    value: Option<String>,
    allowed: &[&str],
) -> Result<Option<String>, AppError> {
    let Some(value) = value
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };

    if !allowed.contains(&value.as_str()) {
        return Err(AppError::bad_request(
            "invalid_choice",
            format!("{field} must be one of: {}", allowed.join(", ")),
        ));
    }

    Ok(Some(value))
}

pub fn require_source(field: &'static str, value: &str) -> Result<String, AppError> {
    let source = require_text(field, value, usize::MAX)?;

    if classify_source(&source) == SourceKind::VirtualPath {
        return Err(AppError::bad_request(
            "unresolved_virtual_path",
            format!("{field} points to a client sandbox path that was not uploaded"),
        ));
    }

    Ok(source)
}
