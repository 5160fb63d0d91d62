//! Format policy — which uploads Kindle accepts as-is.

use std::path::Path;

/// Formats the Send-to-Kindle service accepts without conversion.
///
/// MOBI is not listed: Send to Kindle stopped accepting it.
pub const NATIVE_FORMATS: &[&str] = &["epub", "doc", "docx", "rtf", "htm", "html", "txt", "pdf"];

/// Extension produced by the converter.
pub const TARGET_FORMAT: &str = "epub";

/// Whether a lower-cased extension (no leading dot) must be converted first.
pub fn needs_conversion(extension: &str) -> bool {
    !NATIVE_FORMATS.contains(&extension)
}

/// Lower-cased extension of `file_name`, or an empty string when it has none.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// Name of the converted artifact for `file_name`: same stem, target extension.
pub fn converted_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    format!("{stem}.{TARGET_FORMAT}")
}
