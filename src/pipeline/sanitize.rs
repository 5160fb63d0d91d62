//! Upload file-name sanitizer.

use crate::error::PipelineError;

/// Longest declared file name accepted, in bytes.
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Characters that are invalid in file names on common filesystems.
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Reduce a client-declared name to a safe single path component.
///
/// Directory components (either separator style) are stripped, control and
/// reserved characters are dropped. Names that end up empty, `.` or `..` are
/// rejected.
pub fn sanitize_file_name(name: &str) -> Result<String, PipelineError> {
    if name.is_empty() {
        return Err(PipelineError::InvalidInput("empty file name".into()));
    }
    if name.len() > MAX_FILE_NAME_LENGTH {
        return Err(PipelineError::InvalidInput(format!(
            "file name longer than {MAX_FILE_NAME_LENGTH} bytes"
        )));
    }

    let base = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN_CHARS.contains(c))
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => Err(PipelineError::InvalidInput(format!(
            "file name {name:?} has no usable characters"
        ))),
        _ => Ok(cleaned),
    }
}
