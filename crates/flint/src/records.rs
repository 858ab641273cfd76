//! Records collaborator
//!
//! CRUD over the document database's collections, plus validation of the
//! JSON payloads users hand to `create` and `update`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::identity::{CollaboratorError, HttpBackend};

/// Largest page the backend will serve
pub const MAX_PER_PAGE: u32 = 500;

/// Fields the backend manages itself
pub const RESTRICTED_FIELDS: &[&str] = &["id", "created", "updated"];

/// Problems with user-supplied record input
#[derive(Error, Debug)]
pub enum InputError {
    #[error("either JSON data or --file is required")]
    Missing,

    #[error("cannot specify both JSON data and --file")]
    Conflict,

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("field '{0}' is managed by the server and cannot be set")]
    RestrictedField(String),

    #[error("file path cannot contain '..'")]
    UnsafePath,

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Pagination(String),
}

/// Query options for `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub page: u32,
    pub per_page: u32,
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub fields: Vec<String>,
    pub expand: Vec<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 30,
            filter: None,
            sort: None,
            fields: Vec::new(),
            expand: Vec::new(),
        }
    }
}

impl ListOptions {
    pub fn with_per_page(per_page: u32) -> Self {
        Self {
            per_page,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.page < 1 {
            return Err(InputError::Pagination("page must be at least 1".into()));
        }
        if self.per_page < 1 {
            return Err(InputError::Pagination("per-page must be at least 1".into()));
        }
        if self.per_page > MAX_PER_PAGE {
            return Err(InputError::Pagination(format!(
                "per-page cannot exceed {} records",
                MAX_PER_PAGE
            )));
        }
        Ok(())
    }

    /// Query string pairs in the backend's parameter names
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("page", self.page.to_string()),
            ("perPage", self.per_page.to_string()),
        ];
        if let Some(filter) = self.filter.as_ref().filter(|f| !f.is_empty()) {
            query.push(("filter", filter.clone()));
        }
        if let Some(sort) = self.sort.as_ref().filter(|s| !s.is_empty()) {
            query.push(("sort", sort.clone()));
        }
        if !self.fields.is_empty() {
            query.push(("fields", self.fields.join(",")));
        }
        if !self.expand.is_empty() {
            query.push(("expand", self.expand.join(",")));
        }
        query
    }
}

/// One page of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u32,
    #[serde(default)]
    pub items: Vec<Map<String, Value>>,
}

/// Record CRUD against one collection at a time
pub trait RecordService {
    fn list(&self, collection: &str, options: &ListOptions) -> Result<RecordList, CollaboratorError>;

    fn get(
        &self,
        collection: &str,
        id: &str,
        expand: &[String],
    ) -> Result<Map<String, Value>, CollaboratorError>;

    fn create(
        &self,
        collection: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CollaboratorError>;

    fn update(
        &self,
        collection: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CollaboratorError>;

    fn delete(&self, collection: &str, id: &str) -> Result<(), CollaboratorError>;
}

fn into_record(value: Value) -> Result<Map<String, Value>, CollaboratorError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CollaboratorError::Decode(format!(
            "expected a record object, got {}",
            other
        ))),
    }
}

impl RecordService for HttpBackend {
    fn list(&self, collection: &str, options: &ListOptions) -> Result<RecordList, CollaboratorError> {
        debug!(collection, page = options.page, per_page = options.per_page, "listing records");
        let path = format!("collections/{}/records", collection);
        let body = self.send_json(self.get_request(&path).query(&options.query()))?;
        serde_json::from_value(body).map_err(|e| CollaboratorError::Decode(e.to_string()))
    }

    fn get(
        &self,
        collection: &str,
        id: &str,
        expand: &[String],
    ) -> Result<Map<String, Value>, CollaboratorError> {
        debug!(collection, id, "fetching record");
        let path = format!("collections/{}/records/{}", collection, id);
        let mut request = self.get_request(&path);
        if !expand.is_empty() {
            request = request.query(&[("expand", expand.join(","))]);
        }
        into_record(self.send_json(request)?)
    }

    fn create(
        &self,
        collection: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CollaboratorError> {
        debug!(collection, fields = data.len(), "creating record");
        let path = format!("collections/{}/records", collection);
        into_record(self.send_json(self.post_request(&path).json(data))?)
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CollaboratorError> {
        debug!(collection, id, fields = data.len(), "updating record");
        let path = format!("collections/{}/records/{}", collection, id);
        into_record(self.send_json(self.patch_request(&path).json(data))?)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), CollaboratorError> {
        debug!(collection, id, "deleting record");
        let path = format!("collections/{}/records/{}", collection, id);
        self.send_json(self.delete_request(&path)).map(|_| ())
    }
}

/// JSON object from an inline argument or a file, but not both
pub fn parse_record_input(
    inline: Option<&str>,
    file: Option<&Path>,
) -> Result<Map<String, Value>, InputError> {
    let inline = inline.filter(|s| !s.trim().is_empty());
    let text = match (inline, file) {
        (Some(_), Some(_)) => return Err(InputError::Conflict),
        (None, None) => return Err(InputError::Missing),
        (Some(json), None) => json.to_string(),
        (None, Some(path)) => {
            if path.components().any(|c| c == Component::ParentDir) {
                return Err(InputError::UnsafePath);
            }
            fs::read_to_string(path).map_err(|source| InputError::Read {
                path: path.to_path_buf(),
                source,
            })?
        }
    };

    match serde_json::from_str(&text).map_err(|e| InputError::Json(e.to_string()))? {
        Value::Object(map) => Ok(map),
        _ => Err(InputError::Json("expected a JSON object".into())),
    }
}

/// Reject server-managed fields in create and update payloads
pub fn validate_record_data(data: &Map<String, Value>) -> Result<(), InputError> {
    match RESTRICTED_FIELDS.iter().find(|f| data.contains_key(**f)) {
        Some(field) => Err(InputError::RestrictedField(field.to_string())),
        None => Ok(()),
    }
}

/// Comma-separated flag value into trimmed, non-empty parts
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_list_query() {
        let options = ListOptions {
            page: 2,
            per_page: 50,
            filter: Some("active=true".into()),
            sort: Some("-created".into()),
            fields: vec!["id".into(), "name".into()],
            expand: vec![],
        };
        let query = options.query();
        assert_eq!(query[0], ("page", "2".to_string()));
        assert_eq!(query[1], ("perPage", "50".to_string()));
        assert!(query.contains(&("filter", "active=true".to_string())));
        assert!(query.contains(&("fields", "id,name".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "expand"));
    }

    #[test]
    fn test_pagination_bounds() {
        assert!(ListOptions::default().validate().is_ok());
        assert!(ListOptions::with_per_page(500).validate().is_ok());
        assert!(ListOptions::with_per_page(501).validate().is_err());
        assert!(ListOptions::with_per_page(0).validate().is_err());
        let zero_page = ListOptions {
            page: 0,
            ..Default::default()
        };
        assert!(zero_page.validate().is_err());
    }

    #[test]
    fn test_record_list_decodes_backend_shape() {
        let list: RecordList = serde_json::from_value(json!({
            "page": 1,
            "perPage": 30,
            "totalItems": 2,
            "totalPages": 1,
            "items": [{"id": "a"}, {"id": "b"}]
        }))
        .unwrap();
        assert_eq!(list.per_page, 30);
        assert_eq!(list.items.len(), 2);
    }

    #[test]
    fn test_parse_inline_and_file() {
        let data = parse_record_input(Some(r#"{"name": "edge-1"}"#), None).unwrap();
        assert_eq!(data["name"], "edge-1");

        let dir = tempdir().unwrap();
        let path = dir.path().join("edge.json");
        fs::write(&path, r#"{"name": "edge-2", "active": true}"#).unwrap();
        let data = parse_record_input(None, Some(&path)).unwrap();
        assert_eq!(data["active"], true);
    }

    #[test]
    fn test_parse_input_errors() {
        assert!(matches!(parse_record_input(None, None), Err(InputError::Missing)));
        assert!(matches!(
            parse_record_input(Some("{}"), Some(Path::new("x.json"))),
            Err(InputError::Conflict)
        ));
        assert!(matches!(
            parse_record_input(None, Some(Path::new("../secret.json"))),
            Err(InputError::UnsafePath)
        ));
        assert!(matches!(parse_record_input(Some("[1,2]"), None), Err(InputError::Json(_))));
        assert!(matches!(parse_record_input(Some("{nope"), None), Err(InputError::Json(_))));
    }

    #[test]
    fn test_restricted_fields() {
        let ok = json!({"name": "x"});
        assert!(validate_record_data(ok.as_object().unwrap()).is_ok());

        let bad = json!({"name": "x", "created": "2024-01-01"});
        match validate_record_data(bad.as_object().unwrap()) {
            Err(InputError::RestrictedField(field)) => assert_eq!(field, "created"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(Some("name, code,,region ")), vec!["name", "code", "region"]);
        assert!(split_list(None).is_empty());
    }
}
