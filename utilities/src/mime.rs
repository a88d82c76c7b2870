use std::path::Path;

const DEFAULT_MIME: &str = "application/octet-stream";

/// Infer a MIME type from the file extension.
pub fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}
