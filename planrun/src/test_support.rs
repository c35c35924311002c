//! Test-only helpers for constructing metadata trees on disk.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;

use crate::tree::{RawNode, TreeDocument};

/// Create a merged node with every present key counted as leaf-defined.
pub fn node(name: &str, data: Value) -> RawNode {
    let data = data.as_object().expect("node data must be a mapping").clone();
    let defined: BTreeSet<String> = data.keys().cloned().collect();
    RawNode {
        name: name.to_string(),
        data,
        defined,
        sources: Vec::new(),
    }
}

/// Write a `metadata.json` tree document under the given root directory.
pub fn write_tree(root: &Path, nodes: Vec<RawNode>) {
    std::fs::create_dir_all(root).expect("create tree root");
    let document = TreeDocument { nodes };
    let mut contents =
        serde_json::to_string_pretty(&document).expect("serialize tree document");
    contents.push('\n');
    std::fs::write(root.join("metadata.json"), contents).expect("write metadata.json");
}
