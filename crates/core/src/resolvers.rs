//! Built-in change resolvers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::resolver::ChangeResolver;

/// Appends each change to the end of the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppendBytes;

impl AppendBytes {
    pub const NAME: &'static str = "AppendBytes";
}

impl ChangeResolver for AppendBytes {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn merge(&self, current: &[u8], changes: &[&[u8]]) -> Result<Vec<u8>, CoreError> {
        let extra: usize = changes.iter().map(|c| c.len()).sum();
        let mut merged = Vec::with_capacity(current.len() + extra);
        merged.extend_from_slice(current);
        for change in changes {
            merged.extend_from_slice(change);
        }
        Ok(merged)
    }
}

/// A JSON document of uniquely-identified records, e.g. a comment thread.
///
/// Each change is a JSON object with a string `id`. A change whose id is
/// already present is skipped, so replaying a change is harmless.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommentFile;

impl CommentFile {
    pub const NAME: &'static str = "CommentFile";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommentDocument {
    elements: Vec<Map<String, Value>>,
}

impl CommentFile {
    fn error(reason: impl Into<String>) -> CoreError {
        CoreError::Resolver {
            resolver: Self::NAME.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_record(change: &[u8]) -> Result<(String, Map<String, Value>), CoreError> {
        let value: Value =
            serde_json::from_slice(change).map_err(|e| Self::error(format!("change: {e}")))?;
        let Value::Object(record) = value else {
            return Err(Self::error("change is not a JSON object"));
        };
        let id = match record.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(Self::error("change has no string id")),
        };
        Ok((id, record))
    }

    fn record_id(record: &Map<String, Value>) -> Option<&str> {
        record.get("id").and_then(Value::as_str)
    }
}

impl ChangeResolver for CommentFile {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn validate(&self, change: &[u8]) -> Result<(), CoreError> {
        Self::parse_record(change).map(|_| ())
    }

    fn validate_v0(&self, content: &[u8]) -> Result<(), CoreError> {
        if content.is_empty() {
            return Ok(());
        }
        serde_json::from_slice::<CommentDocument>(content)
            .map(|_| ())
            .map_err(|e| Self::error(format!("initial document: {e}")))
    }

    fn merge(&self, current: &[u8], changes: &[&[u8]]) -> Result<Vec<u8>, CoreError> {
        let mut document = if current.is_empty() {
            CommentDocument::default()
        } else {
            serde_json::from_slice::<CommentDocument>(current)
                .map_err(|e| Self::error(format!("stored document: {e}")))?
        };

        for change in changes {
            let (id, record) = Self::parse_record(change)?;
            let present = document
                .elements
                .iter()
                .any(|existing| Self::record_id(existing) == Some(id.as_str()));
            if !present {
                document.elements.push(record);
            }
        }

        serde_json::to_vec(&document).map_err(|e| Self::error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_concatenates_in_order() {
        let merged = AppendBytes
            .merge(b"Hello", &[b", ".as_slice(), b"World".as_slice()])
            .unwrap();
        assert_eq!(merged, b"Hello, World");
    }

    #[test]
    fn comment_file_starts_from_empty_content() {
        let merged = CommentFile
            .merge(b"", &[br#"{"id":"a","text":"first"}"#.as_slice()])
            .unwrap();
        let doc: Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(doc["elements"][0]["text"], "first");
    }

    #[test]
    fn comment_file_skips_known_ids() {
        let first = CommentFile
            .merge(b"", &[br#"{"id":"a","text":"first"}"#.as_slice()])
            .unwrap();
        let second = CommentFile
            .merge(
                &first,
                &[
                    br#"{"id":"a","text":"replayed"}"#.as_slice(),
                    br#"{"id":"b","text":"second"}"#.as_slice(),
                ],
            )
            .unwrap();
        let doc: Value = serde_json::from_slice(&second).unwrap();
        let elements = doc["elements"].as_array().unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0]["text"], "first");
        assert_eq!(elements[1]["id"], "b");
    }

    #[test]
    fn comment_file_rejects_records_without_id() {
        assert!(CommentFile.validate(br#"{"text":"orphan"}"#).is_err());
        assert!(CommentFile.validate(b"[1,2,3]").is_err());
        assert!(CommentFile.validate(br#"{"id":"x"}"#).is_ok());
    }

    #[test]
    fn comment_file_initial_content_must_be_a_document() {
        assert!(CommentFile.validate_v0(b"").is_ok());
        assert!(CommentFile.validate_v0(br#"{"elements":[{"id":"a"}]}"#).is_ok());
        assert!(CommentFile.validate_v0(b"not json").is_err());
        assert!(CommentFile.validate_v0(br#"{"id":"a"}"#).is_err());
        // Anything goes for plain bytes.
        assert!(AppendBytes.validate_v0(b"not json").is_ok());
    }

    #[test]
    fn comment_file_rejects_corrupt_document() {
        let err = CommentFile
            .merge(b"not json", &[br#"{"id":"a"}"#.as_slice()])
            .unwrap_err();
        assert!(matches!(err, CoreError::Resolver { .. }));
    }
}
