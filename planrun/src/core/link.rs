//! Cross-references between metadata nodes.
//!
//! Raw link data accepts several shapes (a bare string, a bare fmf id
//! mapping, a one-relation mapping, or a list of any of these). Everything
//! is canonicalized into [`Link`] instances on entry; [`Link::to_raw`]
//! always emits the `relation: target` form, which parses back into an
//! equal link.

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::fmf::{FmfId, FMF_ID_KEYS};
use crate::errors::SpecificationError;

/// Fixed enumeration of supported link relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Verifies,
    VerifiedBy,
    Implements,
    ImplementedBy,
    Documents,
    DocumentedBy,
    Blocks,
    BlockedBy,
    Duplicates,
    DuplicatedBy,
    Parent,
    Child,
    Relates,
}

/// All supported relations in specification order.
pub const RELATIONS: [Relation; 13] = [
    Relation::Verifies,
    Relation::VerifiedBy,
    Relation::Implements,
    Relation::ImplementedBy,
    Relation::Documents,
    Relation::DocumentedBy,
    Relation::Blocks,
    Relation::BlockedBy,
    Relation::Duplicates,
    Relation::DuplicatedBy,
    Relation::Parent,
    Relation::Child,
    Relation::Relates,
];

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Verifies => "verifies",
            Relation::VerifiedBy => "verified-by",
            Relation::Implements => "implements",
            Relation::ImplementedBy => "implemented-by",
            Relation::Documents => "documents",
            Relation::DocumentedBy => "documented-by",
            Relation::Blocks => "blocks",
            Relation::BlockedBy => "blocked-by",
            Relation::Duplicates => "duplicates",
            Relation::DuplicatedBy => "duplicated-by",
            Relation::Parent => "parent",
            Relation::Child => "child",
            Relation::Relates => "relates",
        }
    }

    pub fn from_str(value: &str) -> Option<Relation> {
        RELATIONS
            .into_iter()
            .find(|relation| relation.as_str() == value)
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link target, either free text or an fmf id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Text(String),
    Id(FmfId),
}

/// A single canonical link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub relation: Relation,
    pub target: LinkTarget,
    pub note: Option<String>,
}

/// Relation used when raw data specifies only a target.
pub const DEFAULT_RELATION: Relation = Relation::Relates;

impl Link {
    /// Canonicalize a single raw link specification.
    pub fn from_raw(spec: &Value) -> Result<Link, SpecificationError> {
        // A bare string is a target with the default relation.
        if let Value::String(target) = spec {
            return Ok(Link {
                relation: DEFAULT_RELATION,
                target: LinkTarget::Text(target.clone()),
                note: None,
            });
        }

        let Value::Object(mapping) = spec else {
            return Err(SpecificationError::new(format!(
                "Invalid link specification \
                 (should be a string, fmf id or relation mapping), got '{spec}'."
            )));
        };

        let note = match mapping.get("note") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => {
                return Err(SpecificationError::new(format!(
                    "Link note must be a string, got '{other}'."
                )));
            }
        };

        // Keys that are neither fmf id fields nor the note are relations.
        let relation_keys: Vec<&String> = mapping
            .keys()
            .filter(|key| !FMF_ID_KEYS.contains(&key.as_str()) && key.as_str() != "note")
            .collect();

        // No relation key: the mapping itself is an fmf id target.
        if relation_keys.is_empty() {
            return Ok(Link {
                relation: DEFAULT_RELATION,
                target: LinkTarget::Id(FmfId::from_raw(mapping)?),
                note,
            });
        }

        if relation_keys.len() > 1 {
            let listed = relation_keys
                .iter()
                .map(|key| format!("'{key}'"))
                .collect::<Vec<_>>()
                .join(" and ");
            return Err(SpecificationError::new(format!(
                "Multiple relations specified for the link ({listed})."
            )));
        }

        let relation_key = relation_keys[0];
        let relation = Relation::from_str(relation_key).ok_or_else(|| {
            SpecificationError::new(format!(
                "Invalid link relation '{relation_key}'."
            ))
        })?;

        let target = match &mapping[relation_key] {
            Value::String(text) => LinkTarget::Text(text.clone()),
            Value::Object(id) => LinkTarget::Id(FmfId::from_raw(id)?),
            other => {
                return Err(SpecificationError::new(format!(
                    "Invalid link target for relation '{relation_key}', got '{other}'."
                )));
            }
        };

        Ok(Link {
            relation,
            target,
            note,
        })
    }

    /// Emit the canonical `relation: target` specification.
    pub fn to_raw(&self) -> Value {
        let mut mapping = Map::new();
        let target = match &self.target {
            LinkTarget::Text(text) => Value::String(text.clone()),
            LinkTarget::Id(id) => id.to_raw(),
        };
        mapping.insert(self.relation.as_str().to_string(), target);
        if let Some(note) = &self.note {
            mapping.insert("note".to_string(), Value::String(note.clone()));
        }
        Value::Object(mapping)
    }
}

/// Ordered collection of links, insertion order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
    links: Vec<Link>,
}

impl Links {
    /// Canonicalize raw link data: nothing, a single link, or a list.
    pub fn from_raw(data: Option<&Value>) -> Result<Links, SpecificationError> {
        let data = match data {
            None | Some(Value::Null) => return Ok(Links::default()),
            Some(value) => value,
        };

        let specs: Vec<&Value> = match data {
            Value::Array(items) => items.iter().collect(),
            Value::String(_) | Value::Object(_) => vec![data],
            other => {
                return Err(SpecificationError::new(format!(
                    "Invalid link specification \
                     (should be a string, fmf id or list of their combinations), got '{other}'."
                )));
            }
        };

        let links = specs
            .into_iter()
            .map(Link::from_raw)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Links { links })
    }

    /// Emit the canonical list-of-mappings specification.
    pub fn to_raw(&self) -> Value {
        Value::Array(self.links.iter().map(Link::to_raw).collect())
    }

    /// Links with the given relation, all when `None`.
    pub fn get(&self, relation: Option<Relation>) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|link| relation.is_none() || Some(link.relation) == relation)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Whether any contained link matches the needle.
    pub fn has_link(&self, needle: &LinkNeedle) -> bool {
        self.links.iter().any(|link| needle.matches(link))
    }
}

/// A matcher used when searching links.
///
/// Both fields hold regular expressions which are searched (not anchored)
/// in the corresponding fields of [`Link`] instances.
#[derive(Debug, Clone)]
pub struct LinkNeedle {
    relation: Regex,
    target: Regex,
    relation_pattern: String,
    target_pattern: String,
}

impl LinkNeedle {
    /// Parse a needle from its `relation:target` specification.
    ///
    /// Without a colon the whole string is the target pattern and any
    /// relation matches.
    pub fn from_raw(value: &str) -> Result<LinkNeedle, SpecificationError> {
        let (relation, target) = match value.split_once(':') {
            Some((relation, target)) => (relation, target),
            None => (".*", value),
        };
        Self::new(relation, target)
    }

    pub fn new(relation: &str, target: &str) -> Result<LinkNeedle, SpecificationError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|error| {
                SpecificationError::new(format!(
                    "Invalid link needle pattern '{pattern}': {error}."
                ))
            })
        };
        Ok(LinkNeedle {
            relation: compile(relation)?,
            target: compile(target)?,
            relation_pattern: relation.to_string(),
            target_pattern: target.to_string(),
        })
    }

    /// Find out whether a given link matches this needle.
    pub fn matches(&self, link: &Link) -> bool {
        if !self.relation.is_match(link.relation.as_str()) {
            return false;
        }
        match &link.target {
            LinkTarget::Text(text) => self.target.is_match(text),
            // For an fmf id target only the name is searched. An id without
            // a name never matches.
            LinkTarget::Id(id) => match &id.name {
                Some(name) => self.target.is_match(name),
                None => false,
            },
        }
    }
}

impl std::fmt::Display for LinkNeedle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.relation_pattern, self.target_pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_string_uses_default_relation() {
        let link = Link::from_raw(&json!("/stories/select")).expect("link");
        assert_eq!(link.relation, Relation::Relates);
        assert_eq!(link.target, LinkTarget::Text("/stories/select".to_string()));
        assert_eq!(link.note, None);
    }

    #[test]
    fn bare_fmf_id_uses_default_relation() {
        let link = Link::from_raw(&json!({
            "url": "https://example.com/tests.git",
            "name": "/smoke",
        }))
        .expect("link");
        assert_eq!(link.relation, Relation::Relates);
        match link.target {
            LinkTarget::Id(id) => assert_eq!(id.name.as_deref(), Some("/smoke")),
            LinkTarget::Text(_) => panic!("expected fmf id target"),
        }
    }

    #[test]
    fn relation_mapping_with_note() {
        let link = Link::from_raw(&json!({
            "verifies": "/stories/select",
            "note": "covers the basics",
        }))
        .expect("link");
        assert_eq!(link.relation, Relation::Verifies);
        assert_eq!(link.note.as_deref(), Some("covers the basics"));
    }

    #[test]
    fn multiple_relations_are_rejected() {
        let err = Link::from_raw(&json!({
            "verifies": "/a",
            "blocks": "/b",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Multiple relations"));
    }

    #[test]
    fn unknown_relation_is_rejected() {
        let err = Link::from_raw(&json!({"connects": "/a"})).unwrap_err();
        assert!(err.to_string().contains("Invalid link relation"));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let specs = [
            json!("/stories/one"),
            json!({"name": "/tests/two"}),
            json!({"verified-by": {"url": "https://example.com/x.git", "name": "/t"}}),
            json!({"blocks": "/tests/three", "note": "flaky"}),
        ];
        for spec in specs {
            let link = Link::from_raw(&spec).expect("first parse");
            let reparsed = Link::from_raw(&link.to_raw()).expect("second parse");
            assert_eq!(reparsed, link);
        }
    }

    #[test]
    fn links_accepts_all_raw_shapes() {
        assert!(Links::from_raw(None).expect("none").is_empty());
        let single = Links::from_raw(Some(&json!("/a"))).expect("single");
        assert_eq!(single.get(None).len(), 1);
        let listed = Links::from_raw(Some(&json!(["/a", {"verifies": "/b"}]))).expect("list");
        assert_eq!(listed.get(None).len(), 2);
        assert_eq!(listed.get(Some(Relation::Verifies)).len(), 1);
    }

    #[test]
    fn links_rejects_scalars() {
        let err = Links::from_raw(Some(&json!(42))).unwrap_err();
        assert!(err.to_string().contains("Invalid link specification"));
    }

    #[test]
    fn needle_round_trips_through_display() {
        for raw in ["docs", "verifies:/stories/.*"] {
            let needle = LinkNeedle::from_raw(raw).expect("needle");
            let again = LinkNeedle::from_raw(&needle.to_string()).expect("reparse");
            assert_eq!(again.to_string(), needle.to_string());
        }
        assert_eq!(LinkNeedle::from_raw("docs").expect("needle").to_string(), ".*:docs");
    }

    #[test]
    fn needle_matches_text_and_named_id_targets() {
        let needle = LinkNeedle::from_raw("verifies:/stories").expect("needle");
        let text_link = Link::from_raw(&json!({"verifies": "/stories/select"})).expect("link");
        assert!(needle.matches(&text_link));

        let id_link = Link::from_raw(&json!({
            "verifies": {"name": "/stories/select"},
        }))
        .expect("link");
        assert!(needle.matches(&id_link));

        // Wrong relation.
        let blocked = Link::from_raw(&json!({"blocks": "/stories/select"})).expect("link");
        assert!(!needle.matches(&blocked));
    }

    #[test]
    fn nameless_id_target_never_matches() {
        let needle = LinkNeedle::from_raw(".*").expect("needle");
        let link = Link::from_raw(&json!({
            "verifies": {"url": "https://example.com/x.git"},
        }))
        .expect("link");
        assert!(!needle.matches(&link));
    }
}
