//! Frontmatter store: YAML between `---` markers at the top of a markdown file.
//!
//! The core only ever rewrites single frontmatter fields; the markdown body
//! and every other field pass through byte-for-byte as far as the YAML
//! library permits (mapping key order is preserved).

use crate::error::{Result, VeError};
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// A parsed markdown document: frontmatter mapping plus raw body.
#[derive(Debug, Clone)]
pub struct Document {
    pub frontmatter: Mapping,
    pub body: String,
}

/// Split a document into frontmatter text and body.
///
/// The file must start with a `---` line; the frontmatter runs to the next
/// `---` line.
fn split(content: &str, path: &Path) -> Result<(String, String)> {
    let mut lines = content.lines();
    match lines.next() {
        Some(first) if first.trim_end() == "---" => {}
        _ => {
            return Err(VeError::Frontmatter {
                path: path.display().to_string(),
                reason: "file does not start with a '---' frontmatter marker".to_string(),
            })
        }
    }

    let mut frontmatter = String::new();
    let mut rest_offset = None;
    // Track byte offset so the body survives untouched, including blank lines.
    let mut offset = content.lines().next().map_or(0, str::len) + 1;
    for line in content[offset.min(content.len())..].split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == "---" {
            rest_offset = Some(offset + line.len());
            break;
        }
        frontmatter.push_str(line);
        offset += line.len();
    }

    let Some(rest_offset) = rest_offset else {
        return Err(VeError::Frontmatter {
            path: path.display().to_string(),
            reason: "unterminated frontmatter (missing closing '---')".to_string(),
        });
    };

    let body = content[rest_offset.min(content.len())..].to_string();
    Ok((frontmatter, body))
}

/// Read and parse a document's frontmatter.
pub fn read_document(path: &Path) -> Result<Document> {
    let content =
        std::fs::read_to_string(path).map_err(|e| VeError::io(path.display().to_string(), e))?;
    let (frontmatter_text, body) = split(&content, path)?;

    let value: Value = serde_yaml::from_str(&frontmatter_text).map_err(|e| VeError::Frontmatter {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let frontmatter = match value {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        _ => {
            return Err(VeError::Frontmatter {
                path: path.display().to_string(),
                reason: "frontmatter is not a mapping".to_string(),
            })
        }
    };

    Ok(Document { frontmatter, body })
}

/// Parse the frontmatter into a typed record.
pub fn read_typed<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let doc = read_document(path)?;
    serde_yaml::from_value(Value::Mapping(doc.frontmatter)).map_err(|e| VeError::Frontmatter {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Write a document back: serialized frontmatter between `---` markers,
/// body unchanged.
pub fn write_document(path: &Path, doc: &Document) -> Result<()> {
    let frontmatter_text = serde_yaml::to_string(&Value::Mapping(doc.frontmatter.clone()))?;
    let content = format!("---\n{frontmatter_text}---\n{}", doc.body);
    std::fs::write(path, content).map_err(|e| VeError::io(path.display().to_string(), e))
}

/// Update a single frontmatter field in place, preserving everything else.
///
/// Idempotent: applying the same update twice yields byte-identical files.
pub fn update_field(path: &Path, field: &str, value: Value) -> Result<()> {
    let mut doc = read_document(path)?;
    doc.frontmatter
        .insert(Value::String(field.to_string()), value);
    write_document(path, &doc)
}

/// Create a new document file with the given frontmatter and body.
pub fn create_document(path: &Path, frontmatter: &Mapping, body: &str) -> Result<()> {
    let doc = Document {
        frontmatter: frontmatter.clone(),
        body: body.to_string(),
    };
    write_document(path, &doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sample(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("GOAL.md");
        std::fs::write(
            &path,
            "---\nstatus: FUTURE\ncreated_after: []\nticket: null\n---\n\n# Goal\n\nBody text.\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn read_parses_mapping_and_body() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let doc = read_document(&path).unwrap();
        assert_eq!(
            doc.frontmatter.get(Value::String("status".to_string())),
            Some(&Value::String("FUTURE".to_string()))
        );
        assert!(doc.body.contains("# Goal"));
    }

    #[test]
    fn update_preserves_other_fields_and_body() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        update_field(&path, "status", Value::String("IMPLEMENTING".to_string())).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("status: IMPLEMENTING"));
        assert!(content.contains("ticket: null"));
        assert!(content.contains("Body text."));
    }

    #[test]
    fn update_preserves_key_order() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        update_field(&path, "status", Value::String("IMPLEMENTING".to_string())).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let status_pos = content.find("status:").unwrap();
        let ticket_pos = content.find("ticket:").unwrap();
        assert!(status_pos < ticket_pos, "status stays before ticket");
    }

    #[test]
    fn update_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        update_field(&path, "status", Value::String("IMPLEMENTING".to_string())).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        update_field(&path, "status", Value::String("IMPLEMENTING".to_string())).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_markers_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.md");
        std::fs::write(&path, "# No frontmatter here\n").unwrap();
        assert!(matches!(
            read_document(&path),
            Err(VeError::Frontmatter { .. })
        ));
    }

    #[test]
    fn unterminated_frontmatter_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.md");
        std::fs::write(&path, "---\nstatus: FUTURE\n").unwrap();
        assert!(matches!(
            read_document(&path),
            Err(VeError::Frontmatter { .. })
        ));
    }
}
