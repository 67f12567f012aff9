//! Shared items: the files and text snippets one profile offers to another.
//!
//! Items are serialized on the wire as flat JSON objects where every field is
//! present and absent values are `null`:
//!
//! ```text
//! {"type":"FILE","timestamp":1700000000000,"locator":"/tmp/a.png","name":"a.png",
//!  "size":1024,"mimeType":"image/png","text":null}
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// What a shared item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    /// A file, fetched separately by locator
    File,
    /// A UTF-8 text snippet, delivered inline
    Text,
}

/// A single shared item.
///
/// Identity is `(kind, locator)` for files and `(kind, text)` for texts. The
/// timestamp is assigned by the registry when the item is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Milliseconds since the Unix epoch, strictly increasing per registry
    pub timestamp: i64,
    #[serde(default)]
    pub locator: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Size in bytes, if known
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Identity key used for deduplication inside a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    File(String),
    Text(String),
}

impl SharedItem {
    /// Create an unstamped file item.
    pub fn file(
        locator: impl Into<String>,
        name: impl Into<String>,
        size: Option<u64>,
        mime_type: Option<String>,
    ) -> Self {
        Self {
            kind: ItemKind::File,
            timestamp: 0,
            locator: Some(locator.into()),
            name: Some(name.into()),
            size,
            mime_type,
            text: None,
        }
    }

    /// Create an unstamped text item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Text,
            timestamp: 0,
            locator: None,
            name: None,
            size: None,
            mime_type: None,
            text: Some(text.into()),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    /// The deduplication key for this item.
    pub fn key(&self) -> ItemKey {
        match self.kind {
            ItemKind::File => ItemKey::File(self.locator.clone().unwrap_or_default()),
            ItemKind::Text => ItemKey::Text(self.text.clone().unwrap_or_default()),
        }
    }

    /// Whether this item is of `kind` and offered under `locator`.
    pub fn is_at(&self, kind: ItemKind, locator: &str) -> bool {
        self.kind == kind && self.locator.as_deref() == Some(locator)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_item_wire_format() {
        let item = SharedItem::file("/tmp/a.png", "a.png", Some(1024), Some("image/png".into()));
        let json = serde_json::to_string(&item).unwrap();

        assert!(json.contains("\"type\":\"FILE\""));
        assert!(json.contains("\"mimeType\":\"image/png\""));
        assert!(json.contains("\"text\":null"));
    }

    #[test]
    fn test_text_item_nulls_file_fields() {
        let json = serde_json::to_string(&SharedItem::text("hello")).unwrap();

        assert!(json.contains("\"type\":\"TEXT\""));
        assert!(json.contains("\"locator\":null"));
        assert!(json.contains("\"size\":null"));
    }

    #[test]
    fn test_parse_with_missing_optional_fields() {
        let json = r#"{"type":"TEXT","timestamp":42,"text":"hi"}"#;
        let item: SharedItem = serde_json::from_str(json).unwrap();

        assert_eq!(item.kind, ItemKind::Text);
        assert_eq!(item.timestamp, 42);
        assert_eq!(item.text.as_deref(), Some("hi"));
        assert!(item.locator.is_none());
    }

    #[test]
    fn test_key_distinguishes_kinds() {
        let file = SharedItem::file("same", "same", None, None);
        let text = SharedItem::text("same");
        assert_ne!(file.key(), text.key());
    }

    #[test]
    fn test_is_at_matches_kind_and_locator() {
        let file = SharedItem::file("/a.txt", "a.txt", None, None);
        let text = SharedItem::text("/a.txt");

        assert!(file.is_at(ItemKind::File, "/a.txt"));
        assert!(!file.is_at(ItemKind::File, "/b.txt"));
        assert!(!file.is_at(ItemKind::Text, "/a.txt"));
        assert!(!text.is_at(ItemKind::File, "/a.txt"));
    }
}
