//! Identifiers addressing a remote or local metadata subtree.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::SpecificationError;

/// The list of valid identifier keys.
pub const FMF_ID_KEYS: [&str; 4] = ["url", "ref", "path", "name"];

/// Identifier of a metadata node, local or remote.
///
/// All fields are optional; which combinations make sense is checked by
/// [`crate::io::tree_store::validate_id`], which attempts to actually
/// resolve the identifier and maps failures to human readable errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmfId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl FmfId {
    /// Construct from a raw mapping, picking only the identifier keys.
    ///
    /// Values must be strings (or null); anything else is a specification
    /// error naming the offending key.
    pub fn from_raw(raw: &Map<String, Value>) -> Result<Self, SpecificationError> {
        let mut id = FmfId::default();
        for key in FMF_ID_KEYS {
            let value = match raw.get(key) {
                None | Some(Value::Null) => continue,
                Some(Value::String(text)) => Some(text.clone()),
                Some(other) => {
                    return Err(SpecificationError::new(format!(
                        "Invalid '{key}' in fmf id, expected a string, got '{other}'."
                    )));
                }
            };
            match key {
                "url" => id.url = value,
                "ref" => id.git_ref = value,
                "path" => id.path = value,
                _ => id.name = value,
            }
        }
        Ok(id)
    }

    /// Serialize to the raw mapping form, omitting unset keys.
    pub fn to_raw(&self) -> Value {
        let mut mapping = Map::new();
        let pairs = [
            ("url", &self.url),
            ("ref", &self.git_ref),
            ("path", &self.path),
            ("name", &self.name),
        ];
        for (key, value) in pairs {
            if let Some(text) = value {
                mapping.insert(key.to_string(), Value::String(text.clone()));
            }
        }
        Value::Object(mapping)
    }
}

impl std::fmt::Display for FmfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(url) = &self.url {
            parts.push(format!("url: {url}"));
        }
        if let Some(git_ref) = &self.git_ref {
            parts.push(format!("ref: {git_ref}"));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path: {path}"));
        }
        if let Some(name) = &self.name {
            parts.push(format!("name: {name}"));
        }
        write!(f, "{}", parts.join(", "))
    }
}
