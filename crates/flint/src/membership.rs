//! Organization membership
//!
//! The backend reports membership in several shapes depending on whether the
//! relation was expanded. The raw value is parsed once into [`RawMembership`]
//! and then normalized into an ordered list of organizations.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::session::SessionError;

/// One organization an identity belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Organization {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Organization {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// `name (id)` when the name is known, otherwise the id
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.id),
            None => self.id.clone(),
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let id = obj.get("id")?.as_str()?;
        if id.is_empty() {
            return None;
        }
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Some(Self {
            id: id.to_string(),
            name,
        })
    }
}

/// Membership as it arrived from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMembership {
    /// A bare relation id
    SingleId(String),
    /// Unexpanded relation ids
    IdList(Vec<String>),
    /// Expanded relation records, possibly mixed with bare ids
    ExpandedList(Vec<Organization>),
}

impl RawMembership {
    /// Classify a raw JSON value. `null` and `""` mean no membership.
    pub fn parse(value: &Value) -> Result<Self, SessionError> {
        match value {
            Value::Null => Ok(Self::IdList(Vec::new())),
            Value::String(id) if id.is_empty() => Ok(Self::IdList(Vec::new())),
            Value::String(id) => Ok(Self::SingleId(id.clone())),
            Value::Object(obj) => Organization::from_object(obj)
                .map(|org| Self::ExpandedList(vec![org]))
                .ok_or_else(|| unrecognized(value)),
            Value::Array(items) => {
                if items.iter().all(Value::is_string) {
                    let ids = items
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect();
                    return Ok(Self::IdList(ids));
                }

                let mut orgs = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(id) if id.is_empty() => {}
                        Value::String(id) => orgs.push(Organization::new(id.clone())),
                        Value::Object(obj) => {
                            orgs.push(Organization::from_object(obj).ok_or_else(|| unrecognized(item))?)
                        }
                        _ => return Err(unrecognized(item)),
                    }
                }
                Ok(Self::ExpandedList(orgs))
            }
            _ => Err(unrecognized(value)),
        }
    }

    pub fn normalize(self) -> OrganizationMembership {
        let orgs = match self {
            Self::SingleId(id) => vec![Organization::new(id)],
            Self::IdList(ids) => ids.into_iter().map(Organization::new).collect(),
            Self::ExpandedList(orgs) => orgs,
        };
        OrganizationMembership::from_organizations(orgs)
    }
}

fn unrecognized(value: &Value) -> SessionError {
    let shape = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object without an id",
    };
    SessionError::UnrecognizedMembershipShape(shape.to_string())
}

/// Normalized membership: unique ids in backend order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OrganizationMembership {
    organizations: Vec<Organization>,
}

impl OrganizationMembership {
    pub fn from_organizations(orgs: Vec<Organization>) -> Self {
        let mut organizations: Vec<Organization> = Vec::with_capacity(orgs.len());
        for org in orgs {
            match organizations.iter_mut().find(|o| o.id == org.id) {
                Some(existing) => {
                    if existing.name.is_none() {
                        existing.name = org.name;
                    }
                }
                None => organizations.push(org),
            }
        }
        Self { organizations }
    }

    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.organizations.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.organizations.iter().any(|o| o.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Organization> {
        self.organizations.iter().find(|o| o.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.organizations.iter().map(|o| o.id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Organization> {
        self.organizations.iter()
    }

    /// True when at least one entry carries a display name
    pub fn has_names(&self) -> bool {
        self.organizations.iter().any(|o| o.name.is_some())
    }

    /// Fill missing names from another membership listing. Ids not already
    /// present are ignored.
    pub fn merge_names(&mut self, other: &OrganizationMembership) {
        for org in &mut self.organizations {
            if org.name.is_none() {
                if let Some(named) = other.get(&org.id) {
                    org.name = named.name.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(value: Value) -> Vec<String> {
        RawMembership::parse(&value)
            .unwrap()
            .normalize()
            .ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_shapes_yield_same_ids() {
        let expected = vec!["o1".to_string(), "o2".to_string()];
        assert_eq!(ids(json!(["o1", "o2"])), expected);
        assert_eq!(ids(json!([{"id": "o1"}, {"id": "o2"}])), expected);
        assert_eq!(
            ids(json!([{"id": "o1", "name": "Acme"}, {"id": "o2", "name": "Globex"}])),
            expected
        );
        assert_eq!(ids(json!(["o1", {"id": "o2", "name": "Globex"}])), expected);

        let single = vec!["o1".to_string()];
        assert_eq!(ids(json!("o1")), single);
        assert_eq!(ids(json!(["o1"])), single);
        assert_eq!(ids(json!([{"id": "o1", "name": "Acme"}])), single);
        assert_eq!(ids(json!({"id": "o1", "name": "Acme"})), single);
    }

    #[test]
    fn test_single_values() {
        assert_eq!(
            RawMembership::parse(&json!("o1")).unwrap(),
            RawMembership::SingleId("o1".into())
        );
        let single = RawMembership::parse(&json!({"id": "o9", "name": "Initech"}))
            .unwrap()
            .normalize();
        assert_eq!(single.get("o9").unwrap().name.as_deref(), Some("Initech"));
    }

    #[test]
    fn test_empty_membership() {
        assert!(ids(json!(null)).is_empty());
        assert!(ids(json!("")).is_empty());
        assert!(ids(json!([])).is_empty());
    }

    #[test]
    fn test_unrecognized_shapes() {
        for value in [json!(42), json!(true), json!([1, 2]), json!({"name": "x"}), json!([{"id": 3}])] {
            assert!(matches!(
                RawMembership::parse(&value),
                Err(SessionError::UnrecognizedMembershipShape(_))
            ));
        }
    }

    #[test]
    fn test_duplicates_collapse_keeping_order_and_names() {
        let membership = RawMembership::parse(&json!(["o2", {"id": "o1"}, {"id": "o2", "name": "Globex"}]))
            .unwrap()
            .normalize();
        assert_eq!(membership.ids(), vec!["o2", "o1"]);
        assert_eq!(membership.get("o2").unwrap().name.as_deref(), Some("Globex"));
    }

    #[test]
    fn test_merge_names() {
        let mut bare = RawMembership::parse(&json!(["o1", "o2"])).unwrap().normalize();
        assert!(!bare.has_names());

        let named = OrganizationMembership::from_organizations(vec![
            Organization::named("o2", "Globex"),
            Organization::named("o3", "Umbrella"),
        ]);
        bare.merge_names(&named);

        assert_eq!(bare.len(), 2);
        assert_eq!(bare.get("o2").unwrap().label(), "Globex (o2)");
        assert_eq!(bare.get("o1").unwrap().label(), "o1");
        assert!(!bare.contains("o3"));
    }
}
