//! Typed views over raw metadata nodes: Test (L1), Plan (L2), Story (L3).
//!
//! Construction is a two-phase pipeline: raw key/value data is decoded
//! through the normalization helpers below (one call per schema key, each
//! failure naming the offending node and key), then entity level invariants
//! are checked. No attribute is read from raw data after construction.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};

use crate::core::fmf::FmfId;
use crate::core::link::{Link, Links, Relation};
use crate::core::result::Outcome;
use crate::errors::SpecificationError;
use crate::tree::RawNode;

/// Default `order` attribute value.
pub const DEFAULT_ORDER: i64 = 50;

/// Default duration for tests discovered from L1 metadata.
pub const DEFAULT_TEST_DURATION_L1: &str = "5m";
/// Default duration for scripts defined directly in plans (L2 metadata).
pub const DEFAULT_TEST_DURATION_L2: &str = "1h";

/// Prefix of unofficial identification keys captured into results.
const EXTRA_ID_PREFIX: &str = "extra-";

/// Attributes common to all metadata levels.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreMeta {
    pub name: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub order: i64,
    pub link: Links,
    pub id: Option<String>,
    pub tag: Vec<String>,
    pub tier: Option<String>,
    pub adjust: Vec<Value>,
}

impl CoreMeta {
    pub fn from_node(node: &RawNode) -> Result<CoreMeta, SpecificationError> {
        let decode = Decoder::new(&node.name, &node.data);

        let meta = CoreMeta {
            name: node.name.clone(),
            summary: decode.optional_string("summary")?,
            description: decode.optional_string("description")?,
            enabled: decode.bool_or("enabled", true)?,
            order: decode.order()?,
            link: Links::from_raw(node.get("link"))?,
            id: decode.optional_string("id")?,
            tag: decode.string_list("tag")?,
            tier: decode.optional_stringified("tier")?,
            adjust: decode.raw_list("adjust"),
        };

        // The id must be declared on the very node, never inherited.
        if let Some(id) = &meta.id {
            if !node.defined_in_leaf("id") {
                return Err(SpecificationError::new(format!(
                    "The 'id' key '{id}' in '{}' is inherited from parent, \
                     should be defined in a leaf.",
                    node.name
                )));
            }
        }

        Ok(meta)
    }

    fn export_into(&self, data: &mut Map<String, Value>) {
        data.insert("name".to_string(), Value::String(self.name.clone()));
        data.insert("summary".to_string(), optional(&self.summary));
        data.insert("description".to_string(), optional(&self.description));
        data.insert("enabled".to_string(), Value::Bool(self.enabled));
        data.insert("order".to_string(), Value::Number(self.order.into()));
        data.insert("id".to_string(), optional(&self.id));
        data.insert("tag".to_string(), string_array(&self.tag));
        data.insert("tier".to_string(), optional(&self.tier));
        data.insert("link".to_string(), self.link.to_raw());
        // The adjust rules are intentionally not exported.
    }
}

/// A test requirement: a plain package/library name or an fmf id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Name(String),
    Id(FmfId),
}

impl Requirement {
    pub fn to_raw(&self) -> Value {
        match self {
            Requirement::Name(name) => Value::String(name.clone()),
            Requirement::Id(id) => id.to_raw(),
        }
    }
}

/// How a raw test outcome is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpret {
    Respect,
    Custom,
    Xfail,
    Fixed(Outcome),
}

impl Interpret {
    pub fn as_str(self) -> &'static str {
        match self {
            Interpret::Respect => "respect",
            Interpret::Custom => "custom",
            Interpret::Xfail => "xfail",
            Interpret::Fixed(outcome) => outcome.as_str(),
        }
    }
}

/// Test object (L1 metadata).
#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub core: CoreMeta,
    /// Execution command, required and non-empty.
    pub test: String,
    /// Working directory within the tree, absolute path-like.
    pub path: String,
    pub framework: Option<String>,
    pub manual: bool,
    pub require: Vec<Requirement>,
    pub recommend: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub duration: String,
    pub result: Interpret,
    /// Unofficial identification keys (`extra-*`) captured into results.
    pub extra_ids: BTreeMap<String, String>,
}

impl Test {
    pub fn from_node(node: &RawNode, root: &Path) -> Result<Test, SpecificationError> {
        let core = CoreMeta::from_node(node)?;
        let decode = Decoder::new(&node.name, &node.data);

        let test = match decode.optional_string("test")? {
            Some(command) if !command.trim().is_empty() => command,
            _ => {
                return Err(SpecificationError::new(format!(
                    "The 'test' attribute in '{}' must be defined.",
                    node.name
                )));
            }
        };

        // Path defaults to the directory where metadata are stored, or to
        // the root '/' when the node has no file backing.
        let path = match decode.optional_string("path")? {
            Some(path) => path,
            None => default_path(node, root),
        };

        let framework = decode.optional_string("framework")?;
        let mut require = decode.requirements("require")?;
        if framework.as_deref() == Some("beakerlib") {
            require.push(Requirement::Name("beakerlib".to_string()));
        }

        let result_raw = decode
            .optional_string("result")?
            .unwrap_or_else(|| "respect".to_string());
        let result = match result_raw.as_str() {
            "respect" => Interpret::Respect,
            "custom" => Interpret::Custom,
            "xfail" => Interpret::Xfail,
            other => match Outcome::from_str(other) {
                Ok(outcome) => Interpret::Fixed(outcome),
                Err(_) => {
                    return Err(SpecificationError::new(format!(
                        "Invalid result '{other}' in test '{}'.",
                        node.name
                    )));
                }
            },
        };

        let mut extra_ids = BTreeMap::new();
        for (key, value) in &node.data {
            if key.starts_with(EXTRA_ID_PREFIX) {
                if let Value::String(text) = value {
                    extra_ids.insert(key.clone(), text.clone());
                }
            }
        }

        Ok(Test {
            core,
            test,
            path,
            framework,
            manual: decode.bool_or("manual", false)?,
            require,
            recommend: decode.string_list("recommend")?,
            environment: decode.string_map("environment")?,
            duration: decode
                .optional_string("duration")?
                .unwrap_or_else(|| DEFAULT_TEST_DURATION_L1.to_string()),
            result,
            extra_ids,
        })
    }

    /// Initialize test data from a plain mapping instead of a tree node.
    ///
    /// Used for tests defined inline in plans and for reloading discovered
    /// tests from the step workdir. Every present key counts as declared on
    /// the leaf.
    pub fn from_mapping(name: &str, data: Map<String, Value>) -> Result<Test, SpecificationError> {
        if !name.starts_with('/') {
            return Err(SpecificationError::new(format!(
                "Test name '{name}' should start with a '/'."
            )));
        }
        let defined = data.keys().cloned().collect();
        let node = RawNode {
            name: name.to_string(),
            data,
            defined,
            sources: Vec::new(),
        };
        Test::from_node(&node, Path::new("/"))
    }

    /// Export name and all schema keys as a mapping.
    pub fn export_dict(&self) -> Map<String, Value> {
        let mut data = Map::new();
        self.core.export_into(&mut data);
        data.insert("test".to_string(), Value::String(self.test.clone()));
        data.insert("path".to_string(), Value::String(self.path.clone()));
        data.insert("framework".to_string(), optional(&self.framework));
        data.insert("manual".to_string(), Value::Bool(self.manual));
        data.insert(
            "require".to_string(),
            Value::Array(self.require.iter().map(Requirement::to_raw).collect()),
        );
        data.insert("recommend".to_string(), string_array(&self.recommend));
        data.insert(
            "environment".to_string(),
            Value::Object(
                self.environment
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect(),
            ),
        );
        data.insert("duration".to_string(), Value::String(self.duration.clone()));
        data.insert(
            "result".to_string(),
            Value::String(self.result.as_str().to_string()),
        );
        for (key, value) in &self.extra_ids {
            data.insert(key.clone(), Value::String(value.clone()));
        }
        data
    }

    /// Export serialized text form.
    pub fn export_text(&self) -> String {
        pretty(&Value::Object(self.export_dict()))
    }

    /// Attribute display order for `show`.
    pub const KEYS_SHOW_ORDER: [&'static str; 17] = [
        // Basic test information
        "summary",
        "description",
        "id",
        // Test execution data
        "test",
        "path",
        "framework",
        "manual",
        "require",
        "recommend",
        "environment",
        "duration",
        "enabled",
        "order",
        "result",
        // Filtering attributes
        "tag",
        "tier",
        "link",
    ];

    /// Human readable details, attributes in display order.
    pub fn show(&self) -> String {
        render_show(&self.core.name, &self.export_dict(), &Self::KEYS_SHOW_ORDER)
    }

    /// Identifier-only export: the fmf id addressing this test.
    pub fn export_id(&self) -> FmfId {
        FmfId {
            name: Some(self.core.name.clone()),
            path: if self.path == "/" {
                None
            } else {
                Some(self.path.clone())
            },
            ..FmfId::default()
        }
    }
}

fn default_path(node: &RawNode, root: &Path) -> String {
    let Some(source) = node.sources.last() else {
        return "/".to_string();
    };
    let directory = match source.parent() {
        Some(parent) => parent,
        None => return "/".to_string(),
    };
    let relative = directory.strip_prefix(root).unwrap_or(directory);
    if relative.as_os_str().is_empty() {
        return "/".to_string();
    }
    format!("/{}", relative.display())
}

/// Plan object (L2 metadata).
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub core: CoreMeta,
    pub context: BTreeMap<String, String>,
    pub gate: Vec<String>,
    /// Inline `environment` key content.
    pub environment: BTreeMap<String, String>,
    /// Paths listed under `environment-file`, relative to the tree root.
    pub environment_files: Vec<String>,
    /// Raw, unparsed per-stage configuration, keyed by step name.
    step_configs: BTreeMap<String, Value>,
}

/// The six pipeline stages in their fixed execution order.
pub const STEP_KEYS: [&str; 6] = [
    "discover",
    "provision",
    "prepare",
    "execute",
    "report",
    "finish",
];

impl Plan {
    pub fn from_node(node: &RawNode) -> Result<Plan, SpecificationError> {
        let core = CoreMeta::from_node(node)?;
        let decode = Decoder::new(&node.name, &node.data);

        let environment_files = match node.get("environment-file") {
            None => Vec::new(),
            Some(Value::Array(_)) => decode.string_list("environment-file")?,
            Some(other) => {
                return Err(SpecificationError::new(format!(
                    "The 'environment-file' in '{}' should be a list, got '{other}'.",
                    node.name
                )));
            }
        };

        let mut step_configs = BTreeMap::new();
        for key in STEP_KEYS {
            if let Some(value) = node.get(key) {
                step_configs.insert(key.to_string(), value.clone());
            }
        }

        Ok(Plan {
            core,
            context: decode.string_map("context")?,
            gate: decode.string_list("gate")?,
            environment: decode.string_map("environment")?,
            environment_files,
            step_configs,
        })
    }

    /// Raw configuration of one stage, `None` when the plan does not
    /// mention it.
    pub fn step_raw(&self, step: &str) -> Option<&Value> {
        self.step_configs.get(step)
    }

    /// Expand `$VAR` references in all step configurations.
    pub fn expand_environment(&mut self, environment: &BTreeMap<String, String>) {
        for value in self.step_configs.values_mut() {
            expand_value(value, environment);
        }
    }

    pub fn export_dict(&self) -> Map<String, Value> {
        let mut data = Map::new();
        self.core.export_into(&mut data);
        data.insert(
            "context".to_string(),
            Value::Object(
                self.context
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect(),
            ),
        );
        data.insert("gate".to_string(), string_array(&self.gate));
        for (step, raw) in &self.step_configs {
            data.insert(step.clone(), raw.clone());
        }
        data
    }

    pub fn export_text(&self) -> String {
        pretty(&Value::Object(self.export_dict()))
    }

    /// Attribute display order for `show`.
    pub const KEYS_SHOW_ORDER: [&'static str; 14] = [
        "summary",
        "description",
        "context",
        "gate",
        "discover",
        "provision",
        "prepare",
        "execute",
        "report",
        "finish",
        "enabled",
        "order",
        "tag",
        "link",
    ];

    /// Human readable details, attributes in display order.
    pub fn show(&self) -> String {
        render_show(&self.core.name, &self.export_dict(), &Self::KEYS_SHOW_ORDER)
    }
}

fn expand_value(value: &mut Value, environment: &BTreeMap<String, String>) {
    match value {
        Value::String(text) => *text = expand_variables(text, environment),
        Value::Array(items) => {
            for item in items {
                expand_value(item, environment);
            }
        }
        Value::Object(mapping) => {
            for item in mapping.values_mut() {
                expand_value(item, environment);
            }
        }
        _ => {}
    }
}

/// Expand `$NAME` and `${NAME}` references; unknown variables stay as-is.
fn expand_variables(text: &str, environment: &BTreeMap<String, String>) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(position) = rest.find('$') {
        result.push_str(&rest[..position]);
        let after = &rest[position + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match environment.get(name) {
            Some(replacement) if !name.is_empty() => {
                result.push_str(replacement);
                rest = &after[consumed..];
            }
            _ => {
                result.push('$');
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

/// Story priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    MustHave,
    ShouldHave,
    CouldHave,
    WillNotHave,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::MustHave => "must have",
            Priority::ShouldHave => "should have",
            Priority::CouldHave => "could have",
            Priority::WillNotHave => "will not have",
        }
    }

    fn from_str(value: &str) -> Option<Priority> {
        match value {
            "must have" => Some(Priority::MustHave),
            "should have" => Some(Priority::ShouldHave),
            "could have" => Some(Priority::CouldHave),
            "will not have" => Some(Priority::WillNotHave),
            _ => None,
        }
    }
}

/// Story object (L3 metadata).
#[derive(Debug, Clone, PartialEq)]
pub struct Story {
    pub core: CoreMeta,
    pub story: String,
    pub title: Option<String>,
    pub example: Vec<String>,
    pub priority: Option<Priority>,
}

impl Story {
    pub fn from_node(node: &RawNode) -> Result<Story, SpecificationError> {
        let core = CoreMeta::from_node(node)?;
        let decode = Decoder::new(&node.name, &node.data);

        let story = match decode.optional_string("story")? {
            Some(story) if !story.trim().is_empty() => story,
            _ => {
                return Err(SpecificationError::new(format!(
                    "The 'story' attribute in '{}' must be defined.",
                    node.name
                )));
            }
        };

        let priority = match decode.optional_string("priority")? {
            None => None,
            Some(value) => Some(Priority::from_str(&value).ok_or_else(|| {
                SpecificationError::new(format!(
                    "Invalid priority '{value}' in story '{}'.",
                    node.name
                ))
            })?),
        };

        Ok(Story {
            core,
            story,
            title: decode.optional_string("title")?,
            example: decode.string_list("example")?,
            priority,
        })
    }

    /// Links to relevant documentation.
    pub fn documented(&self) -> Vec<&Link> {
        self.core.link.get(Some(Relation::DocumentedBy))
    }

    /// Links to relevant test coverage.
    pub fn verified(&self) -> Vec<&Link> {
        self.core.link.get(Some(Relation::VerifiedBy))
    }

    /// Links to relevant source code.
    pub fn implemented(&self) -> Vec<&Link> {
        self.core.link.get(Some(Relation::ImplementedBy))
    }

    pub fn export_dict(&self) -> Map<String, Value> {
        let mut data = Map::new();
        self.core.export_into(&mut data);
        data.insert("story".to_string(), Value::String(self.story.clone()));
        data.insert("title".to_string(), optional(&self.title));
        data.insert("example".to_string(), string_array(&self.example));
        data.insert(
            "priority".to_string(),
            match self.priority {
                Some(priority) => Value::String(priority.as_str().to_string()),
                None => Value::Null,
            },
        );
        data
    }

    /// Attribute display order for `show`.
    pub const KEYS_SHOW_ORDER: [&'static str; 12] = [
        "summary",
        "title",
        "story",
        "id",
        "priority",
        "description",
        "example",
        "enabled",
        "order",
        "tag",
        "tier",
        "link",
    ];

    /// Human readable details, attributes in display order.
    pub fn show(&self) -> String {
        render_show(&self.core.name, &self.export_dict(), &Self::KEYS_SHOW_ORDER)
    }

    /// Narrative document export (markdown).
    pub fn export_story(&self) -> String {
        let mut output = String::new();
        let title = self
            .title
            .clone()
            .unwrap_or_else(|| self.core.name.rsplit('/').next().unwrap_or("").to_string());
        output.push_str(&format!("# {title}\n"));
        if let Some(summary) = &self.core.summary {
            output.push_str(&format!("\n{summary}\n"));
        }
        output.push_str(&format!("\n*{}*\n", self.story.trim()));
        if let Some(description) = &self.core.description {
            output.push_str(&format!("\n{description}\n"));
        }
        for example in &self.example {
            output.push_str(&format!("\nExample:\n\n```\n{}\n```\n", example.trim_end()));
        }
        let mut status = Vec::new();
        if !self.implemented().is_empty() {
            status.push("implemented");
        }
        if !self.verified().is_empty() {
            status.push("verified");
        }
        if !self.documented().is_empty() {
            status.push("documented");
        }
        output.push_str(&format!(
            "\nStatus: {}\n",
            if status.is_empty() {
                "idea".to_string()
            } else {
                status.join(", ")
            }
        ));
        output
    }
}

/// Per-key decoding of raw node data.
///
/// Each helper is invoked once during entity construction; failures name
/// the node and the offending key.
struct Decoder<'a> {
    name: &'a str,
    data: &'a Map<String, Value>,
}

impl<'a> Decoder<'a> {
    fn new(name: &'a str, data: &'a Map<String, Value>) -> Decoder<'a> {
        Decoder { name, data }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|value| !value.is_null())
    }

    fn error(&self, key: &str, expected: &str, got: &Value) -> SpecificationError {
        SpecificationError::new(format!(
            "The '{key}' attribute in '{}' should be {expected}, got '{got}'.",
            self.name
        ))
    }

    fn optional_string(&self, key: &str) -> Result<Option<String>, SpecificationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(other) => Err(self.error(key, "a string", other)),
        }
    }

    /// String or number coerced to its string form (used by `tier`).
    fn optional_stringified(&self, key: &str) -> Result<Option<String>, SpecificationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(number)) => Ok(Some(number.to_string())),
            Some(other) => Err(self.error(key, "a string or a number", other)),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, SpecificationError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(other) => Err(self.error(key, "a boolean", other)),
        }
    }

    /// Coerce `order`: absent or null falls back to the default, anything
    /// else must convert to an integer.
    fn order(&self) -> Result<i64, SpecificationError> {
        match self.get("order") {
            None => Ok(DEFAULT_ORDER),
            Some(Value::Number(number)) => number
                .as_i64()
                .ok_or_else(|| self.error("order", "an integer", &Value::Number(number.clone()))),
            Some(Value::String(text)) => text
                .parse()
                .map_err(|_| self.error("order", "an integer", &Value::String(text.clone()))),
            Some(other) => Err(self.error("order", "an integer", other)),
        }
    }

    /// A bare string becomes a singleton list; absent means empty.
    fn string_list(&self, key: &str) -> Result<Vec<String>, SpecificationError> {
        match self.get(key) {
            None => Ok(Vec::new()),
            Some(Value::String(text)) => Ok(vec![text.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => Ok(text.clone()),
                    Value::Number(number) => Ok(number.to_string()),
                    other => Err(self.error(key, "a list of strings", other)),
                })
                .collect(),
            Some(other) => Err(self.error(key, "a string or a list of strings", other)),
        }
    }

    /// Mapping with values coerced to strings; absent means empty.
    fn string_map(&self, key: &str) -> Result<BTreeMap<String, String>, SpecificationError> {
        match self.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Value::Object(mapping)) => {
                let mut result = BTreeMap::new();
                for (name, value) in mapping {
                    let text = match value {
                        Value::String(text) => text.clone(),
                        Value::Number(number) => number.to_string(),
                        Value::Bool(flag) => flag.to_string(),
                        other => return Err(self.error(key, "a mapping of scalars", other)),
                    };
                    result.insert(name.clone(), text);
                }
                Ok(result)
            }
            Some(other) => Err(self.error(key, "a mapping", other)),
        }
    }

    /// A bare mapping becomes a singleton list; absent means empty.
    fn raw_list(&self, key: &str) -> Vec<Value> {
        match self.get(key) {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
        }
    }

    /// Require-like content: a string, an fmf id, or a list of both.
    fn requirements(&self, key: &str) -> Result<Vec<Requirement>, SpecificationError> {
        let items: Vec<&Value> = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(single) => vec![single],
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => Ok(Requirement::Name(text.clone())),
                Value::Object(mapping) => Ok(Requirement::Id(FmfId::from_raw(mapping)?)),
                other => Err(self.error(key, "a string or an fmf id", other)),
            })
            .collect()
    }
}

/// Render name and attributes in display order, skipping empty values and
/// the default order.
fn render_show(name: &str, data: &Map<String, Value>, order: &[&str]) -> String {
    let mut output = format!("{name}\n");
    for key in order {
        let Some(value) = data.get(*key) else { continue };
        if value.is_null() {
            continue;
        }
        if *key == "order" && value.as_i64() == Some(DEFAULT_ORDER) {
            continue;
        }
        let rendered = match value {
            Value::String(text) => text.clone(),
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::Array(items) if items.is_empty() => continue,
            Value::Object(mapping) if mapping.is_empty() => continue,
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        output.push_str(&format!("    {key}: {rendered}\n"));
    }
    output
}

fn optional(value: &Option<String>) -> Value {
    match value {
        Some(text) => Value::String(text.clone()),
        None => Value::Null,
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| Value::String(item.clone()))
            .collect(),
    )
}

fn pretty(value: &Value) -> String {
    let mut text = serde_json::to_string_pretty(value).expect("json serialization");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::{ResultData, TestResult};
    use serde_json::json;
    use std::path::PathBuf;

    fn raw_node(name: &str, data: Value, defined: &[&str]) -> RawNode {
        RawNode {
            name: name.to_string(),
            data: data.as_object().expect("object").clone(),
            defined: defined.iter().map(|key| key.to_string()).collect(),
            sources: Vec::new(),
        }
    }

    #[test]
    fn core_defaults_are_applied() {
        let node = raw_node("/tests/min", json!({"test": "true"}), &["test"]);
        let meta = CoreMeta::from_node(&node).expect("core");
        assert!(meta.enabled);
        assert_eq!(meta.order, DEFAULT_ORDER);
        assert!(meta.tag.is_empty());
        assert_eq!(meta.tier, None);
        assert!(meta.link.is_empty());
    }

    #[test]
    fn order_null_falls_back_and_string_coerces() {
        let node = raw_node("/t", json!({"order": null}), &[]);
        assert_eq!(CoreMeta::from_node(&node).expect("core").order, 50);
        let node = raw_node("/t", json!({"order": "30"}), &[]);
        assert_eq!(CoreMeta::from_node(&node).expect("core").order, 30);
        let node = raw_node("/t", json!({"order": []}), &[]);
        assert!(CoreMeta::from_node(&node).is_err());
    }

    #[test]
    fn tier_coerces_to_string() {
        let node = raw_node("/t", json!({"tier": 1}), &[]);
        assert_eq!(
            CoreMeta::from_node(&node).expect("core").tier.as_deref(),
            Some("1")
        );
    }

    #[test]
    fn adjust_is_always_a_list() {
        let node = raw_node("/t", json!({"adjust": {"when": "x == 1"}}), &[]);
        assert_eq!(CoreMeta::from_node(&node).expect("core").adjust.len(), 1);
        let node = raw_node("/t", json!({"adjust": [{}, {}]}), &[]);
        assert_eq!(CoreMeta::from_node(&node).expect("core").adjust.len(), 2);
    }

    #[test]
    fn inherited_id_is_rejected_leaf_id_accepted() {
        let inherited = raw_node("/tests/x", json!({"id": "abc", "test": "true"}), &["test"]);
        let err = CoreMeta::from_node(&inherited).unwrap_err();
        assert!(err.to_string().contains("inherited from parent"));

        let leaf = raw_node(
            "/tests/x",
            json!({"id": "abc", "test": "true"}),
            &["id", "test"],
        );
        let meta = CoreMeta::from_node(&leaf).expect("core");
        assert_eq!(meta.id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_requires_non_empty_command() {
        let node = raw_node("/tests/empty", json!({"summary": "no test"}), &[]);
        let err = Test::from_node(&node, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("'test' attribute"));

        let node = raw_node("/tests/blank", json!({"test": "  "}), &["test"]);
        assert!(Test::from_node(&node, Path::new("/")).is_err());
    }

    #[test]
    fn test_path_defaults_from_sources() {
        let mut node = raw_node("/tests/one", json!({"test": "true"}), &["test"]);
        node.sources = vec![PathBuf::from("/root/tree/tests/one/main.fmf")];
        let test = Test::from_node(&node, Path::new("/root/tree")).expect("test");
        assert_eq!(test.path, "/tests/one");

        let bare = raw_node("/tests/two", json!({"test": "true"}), &["test"]);
        let test = Test::from_node(&bare, Path::new("/root/tree")).expect("test");
        assert_eq!(test.path, "/");
    }

    #[test]
    fn beakerlib_framework_implies_requirement() {
        let node = raw_node(
            "/tests/bl",
            json!({"test": "./runtest.sh", "framework": "beakerlib", "require": "grep"}),
            &["test"],
        );
        let test = Test::from_node(&node, Path::new("/")).expect("test");
        assert_eq!(
            test.require,
            vec![
                Requirement::Name("grep".to_string()),
                Requirement::Name("beakerlib".to_string()),
            ]
        );
    }

    #[test]
    fn require_accepts_string_and_id_forms() {
        let node = raw_node(
            "/tests/req",
            json!({"test": "true", "require": [{"url": "https://example.com/lib.git", "name": "/lib"}, "wget"]}),
            &["test"],
        );
        let test = Test::from_node(&node, Path::new("/")).expect("test");
        assert_eq!(test.require.len(), 2);
        assert!(matches!(test.require[0], Requirement::Id(_)));
    }

    #[test]
    fn invalid_result_interpretation_is_rejected() {
        let node = raw_node(
            "/tests/x",
            json!({"test": "true", "result": "sometimes"}),
            &["test"],
        );
        let err = Test::from_node(&node, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("Invalid result 'sometimes'"));
    }

    #[test]
    fn xfail_swaps_pass_and_fail_only() {
        let test = Test::from_mapping(
            "/tests/xfail",
            json!({"test": "false", "result": "xfail"})
                .as_object()
                .expect("object")
                .clone(),
        )
        .expect("test");

        let failed = TestResult::from_test(&test, Outcome::Fail, ResultData::default());
        assert_eq!(failed.result, Outcome::Pass);
        assert!(failed.note.as_deref().expect("note").contains("fail"));

        let warned = TestResult::from_test(&test, Outcome::Warn, ResultData::default());
        assert_eq!(warned.result, Outcome::Warn);
    }

    #[test]
    fn fixed_interpretation_replaces_outcome() {
        let test = Test::from_mapping(
            "/tests/always-info",
            json!({"test": "false", "result": "info"})
                .as_object()
                .expect("object")
                .clone(),
        )
        .expect("test");
        let result = TestResult::from_test(&test, Outcome::Fail, ResultData::default());
        assert_eq!(result.result, Outcome::Info);
        assert_eq!(result.note.as_deref(), Some("original result: fail"));
    }

    #[test]
    fn result_captures_identification_keys() {
        let test = Test::from_mapping(
            "/tests/ids",
            json!({"test": "true", "id": "deadbeef", "extra-task": "TASK-1"})
                .as_object()
                .expect("object")
                .clone(),
        )
        .expect("test");
        let result = TestResult::from_test(&test, Outcome::Pass, ResultData::default());
        assert_eq!(result.ids.get("id").map(String::as_str), Some("deadbeef"));
        assert_eq!(
            result.ids.get("extra-task").map(String::as_str),
            Some("TASK-1")
        );
    }

    #[test]
    fn test_export_round_trips_through_from_mapping() {
        let test = Test::from_mapping(
            "/tests/full",
            json!({
                "test": "./check.sh",
                "summary": "full test",
                "duration": "10m",
                "environment": {"DEBUG": "1"},
                "link": [{"verifies": "/stories/a"}],
                "tag": ["fast"],
            })
            .as_object()
            .expect("object")
            .clone(),
        )
        .expect("test");
        let mut exported = test.export_dict();
        let name = exported
            .remove("name")
            .and_then(|value| value.as_str().map(str::to_string))
            .expect("name");
        let again = Test::from_mapping(&name, exported).expect("reparse");
        assert_eq!(again, test);
    }

    #[test]
    fn test_show_follows_display_order_and_skips_defaults() {
        let test = Test::from_mapping(
            "/tests/show",
            json!({"test": "true", "summary": "short one", "tier": "2"})
                .as_object()
                .expect("object")
                .clone(),
        )
        .expect("test");
        let shown = test.show();
        let lines: Vec<&str> = shown.lines().collect();
        assert_eq!(lines[0], "/tests/show");
        assert_eq!(lines[1], "    summary: short one");
        // The summary comes before the test command, default order is hidden.
        assert!(shown.find("summary").expect("summary") < shown.find("test:").expect("test"));
        assert!(!shown.contains("order"));
        assert!(shown.contains("tier: 2"));
    }

    #[test]
    fn test_export_id_addresses_the_test() {
        let test = Test::from_mapping(
            "/tests/addressable",
            json!({"test": "true", "path": "/tests/addressable"})
                .as_object()
                .expect("object")
                .clone(),
        )
        .expect("test");
        let id = test.export_id();
        assert_eq!(id.name.as_deref(), Some("/tests/addressable"));
        assert_eq!(id.path.as_deref(), Some("/tests/addressable"));
    }

    #[test]
    fn plan_collects_step_configs_and_environment() {
        let node = raw_node(
            "/plans/smoke",
            json!({
                "execute": {"how": "shell"},
                "discover": [{"how": "tree"}],
                "environment": {"STAGE": "ci", "RETRIES": 3},
                "context": {"distro": "fedora"},
                "gate": "merge-pull-request",
            }),
            &[],
        );
        let plan = Plan::from_node(&node).expect("plan");
        assert!(plan.step_raw("execute").is_some());
        assert!(plan.step_raw("discover").is_some());
        assert!(plan.step_raw("finish").is_none());
        assert_eq!(plan.environment.get("RETRIES").map(String::as_str), Some("3"));
        assert_eq!(plan.gate, vec!["merge-pull-request".to_string()]);
        assert_eq!(
            plan.context.get("distro").map(String::as_str),
            Some("fedora")
        );
    }

    #[test]
    fn plan_environment_file_must_be_a_list() {
        let node = raw_node("/plans/x", json!({"environment-file": "env"}), &[]);
        let err = Plan::from_node(&node).unwrap_err();
        assert!(err.to_string().contains("should be a list"));
    }

    #[test]
    fn plan_expands_variables_in_step_data() {
        let node = raw_node(
            "/plans/x",
            json!({"execute": {"how": "shell", "script": "echo $STAGE in ${MODE}"}}),
            &[],
        );
        let mut plan = Plan::from_node(&node).expect("plan");
        let environment = BTreeMap::from([
            ("STAGE".to_string(), "ci".to_string()),
            ("MODE".to_string(), "full".to_string()),
        ]);
        plan.expand_environment(&environment);
        assert_eq!(
            plan.step_raw("execute").expect("execute")["script"],
            json!("echo ci in full")
        );
    }

    #[test]
    fn story_requires_narrative() {
        let node = raw_node("/stories/empty", json!({"title": "no story"}), &[]);
        assert!(Story::from_node(&node).is_err());
    }

    #[test]
    fn story_priority_and_coverage_predicates() {
        let node = raw_node(
            "/stories/select",
            json!({
                "story": "As a user I want to select tests.",
                "priority": "must have",
                "link": [
                    {"documented-by": "/docs/select"},
                    {"verified-by": "/tests/select"},
                ],
            }),
            &[],
        );
        let story = Story::from_node(&node).expect("story");
        assert_eq!(story.priority, Some(Priority::MustHave));
        assert_eq!(story.documented().len(), 1);
        assert_eq!(story.verified().len(), 1);
        assert!(story.implemented().is_empty());

        let doc = story.export_story();
        assert!(doc.contains("As a user"));
        assert!(doc.contains("Status: verified, documented"));
    }

    #[test]
    fn story_rejects_unknown_priority() {
        let node = raw_node(
            "/stories/x",
            json!({"story": "text", "priority": "someday"}),
            &[],
        );
        assert!(Story::from_node(&node).is_err());
    }
}
