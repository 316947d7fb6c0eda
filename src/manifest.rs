//! Module manifest parsing.
//!
//! A manifest is a small XML descriptor (`*.s3mod`) sitting at the root of a
//! module directory. Root element `ui_module` or `bl_module`, identity and
//! metadata as attributes, plus optional child blocks: `depends`,
//! `features_provided`, `features_required`, `load_after`, and a
//! `test`/`unit_test` marker.

use std::fs;
use std::path::Path;

use roxmltree::{Document, Node};

use crate::error::{Error, Result};

/// File extension that marks a module manifest.
pub const MANIFEST_EXTENSION: &str = "s3mod";

/// Which root element the manifest carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestRoot {
    UiModule,
    BlModule,
}

/// A test declaration block (`<test>` or `<unit_test>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSection {
    pub environment: Option<String>,
}

/// Parsed manifest contents.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub root: ManifestRoot,
    pub name: String,
    pub id: Option<String>,
    pub for_cdn: bool,
    pub required: bool,
    pub is_react: bool,
    pub kaizen_zone: Option<String>,
    pub kaizen_zone_uuid: Option<String>,
    pub responsible: Option<String>,
    pub responsible_uuid: Option<String>,
    pub package: Option<String>,
    pub depends: Vec<String>,
    pub features_provided: Vec<String>,
    pub features_required: Vec<String>,
    pub load_after: Vec<String>,
    pub test: Option<TestSection>,
}

impl Manifest {
    /// Read and parse a manifest file. Parse problems are reported with the
    /// file path attached.
    pub fn from_file(path: &Path) -> Result<Manifest> {
        let text = fs::read_to_string(path).map_err(|e| Error::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&text).map_err(|message| Error::ManifestParse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse manifest XML.
    pub fn parse(text: &str) -> std::result::Result<Manifest, String> {
        let doc = Document::parse(text).map_err(|e| e.to_string())?;
        let root = doc.root_element();

        let root_kind = match root.tag_name().name() {
            "ui_module" => ManifestRoot::UiModule,
            "bl_module" => ManifestRoot::BlModule,
            other => return Err(format!("unexpected root element <{}>", other)),
        };

        let name = root
            .attribute("name")
            .ok_or_else(|| "missing name attribute".to_string())?
            .to_string();

        let test = root
            .children()
            .find(|c| c.has_tag_name("test") || c.has_tag_name("unit_test"))
            .map(|t| TestSection {
                environment: t.attribute("environment").map(str::to_string),
            });

        Ok(Manifest {
            root: root_kind,
            name,
            id: attr(&root, "id"),
            for_cdn: flag(&root, "for_cdn"),
            required: flag(&root, "required"),
            is_react: flag(&root, "is_react"),
            kaizen_zone: attr(&root, "kaizen_zone"),
            kaizen_zone_uuid: attr(&root, "kaizen_zone_uuid"),
            responsible: attr(&root, "responsible"),
            responsible_uuid: attr(&root, "responsible_uuid"),
            package: attr(&root, "package"),
            depends: names_in(&root, "depends", &["ui_module", "module"]),
            features_provided: names_in(&root, "features_provided", &["feature"]),
            features_required: names_in(&root, "features_required", &["feature"]),
            load_after: names_in(&root, "load_after", &["module", "bl_module"]),
            test,
        })
    }
}

fn attr(node: &Node, name: &str) -> Option<String> {
    node.attribute(name).map(str::to_string)
}

/// Boolean attributes are written `true` or `1`.
fn flag(node: &Node, name: &str) -> bool {
    matches!(node.attribute(name), Some("true") | Some("1"))
}

/// Collect `name` attributes of the given element kinds inside a child block.
fn names_in(root: &Node, block: &str, elements: &[&str]) -> Vec<String> {
    root.children()
        .filter(|c| c.has_tag_name(block))
        .flat_map(|b| {
            b.children()
                .filter(Node::is_element)
                .filter(|e| elements.contains(&e.tag_name().name()))
                .filter_map(|e| e.attribute("name"))
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}
