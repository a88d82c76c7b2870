use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An indexed file under the shared root.
///
/// `file_id` is derived from `relative_path` alone so IDs stay stable
/// across restarts for an unchanged layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub file_id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub relative_path: String,
    pub last_modified: i64, // ms since epoch
}

impl SharedFile {
    /// Deterministic identifier for a file, name-based on its
    /// `/`-separated path relative to the shared root.
    pub fn id_for(relative_path: &str) -> Uuid {
        Uuid::new_v5(&Uuid::nil(), relative_path.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::SharedFile;

    #[test]
    fn file_id_is_stable_for_same_relative_path() {
        let a = SharedFile::id_for("docs/report.pdf");
        let b = SharedFile::id_for("docs/report.pdf");
        assert_eq!(a, b);
        assert_ne!(a, SharedFile::id_for("docs/report2.pdf"));
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let f = SharedFile {
            file_id: SharedFile::id_for("a.txt"),
            name: "a.txt".to_string(),
            size: 3,
            mime_type: "text/plain".to_string(),
            relative_path: "a.txt".to_string(),
            last_modified: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"fileId\""));
        assert!(json.contains("\"mimeType\""));
        assert!(json.contains("\"relativePath\""));
        assert!(json.contains("\"lastModified\""));
    }
}
