use crate::config::SCHEMA_FILE_NAME;
use crate::element::{GraphElementType, PropertyMap};
use crate::label::Label;
use crate::schema::LabelSchema;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Canonical schemas of every label of one element kind, ordered by label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphElementSchemas {
    schemas: BTreeMap<Label, LabelSchema>,
}

impl GraphElementSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &Label) -> Option<&LabelSchema> {
        self.schemas.get(label)
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.schemas.contains_key(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.schemas.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelSchema> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn update(&mut self, label: &Label, properties: &PropertyMap, allow_tokens: bool) {
        self.schemas
            .entry(label.clone())
            .or_insert_with(|| LabelSchema::new(label.clone()))
            .update(properties, allow_tokens);
    }

    /// Widens the entry for `schema.label()` (creating it if needed).
    pub fn add(&mut self, schema: &LabelSchema) {
        match self.schemas.get_mut(schema.label()) {
            Some(existing) => existing.union(schema),
            None => {
                self.schemas.insert(schema.label().clone(), schema.clone());
            }
        }
    }

    pub fn union(&mut self, other: &GraphElementSchemas) {
        for schema in other.iter() {
            self.add(schema);
        }
    }
}

impl Serialize for GraphElementSchemas {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.schemas.values())
    }
}

impl<'de> Deserialize<'de> for GraphElementSchemas {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = Vec::<LabelSchema>::deserialize(deserializer)?;
        let mut schemas = GraphElementSchemas::new();
        for schema in &list {
            schemas.add(schema);
        }
        Ok(schemas)
    }
}

/// Persisted schema artifact for a whole export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema {
    #[serde(default)]
    pub nodes: GraphElementSchemas,
    #[serde(default)]
    pub edges: GraphElementSchemas,
    /// Unstructured named-query results, keyed by query name
    #[serde(default, skip_serializing_if = "GraphElementSchemas::is_empty")]
    pub results: GraphElementSchemas,
}

impl GraphSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_kind(&self, kind: GraphElementType) -> &GraphElementSchemas {
        match kind {
            GraphElementType::Nodes => &self.nodes,
            GraphElementType::Edges => &self.edges,
        }
    }

    pub fn for_kind_mut(&mut self, kind: GraphElementType) -> &mut GraphElementSchemas {
        match kind {
            GraphElementType::Nodes => &mut self.nodes,
            GraphElementType::Edges => &mut self.edges,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).context("Failed to serialize schema")
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).context("Failed to parse schema")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open schema file: {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse schema file: {}", path.display()))
    }

    /// Writes `schema.json` into `output_dir` via temp file + rename.
    pub fn write_to(&self, output_dir: &Path) -> Result<()> {
        let path = output_dir.join(SCHEMA_FILE_NAME);
        write_json_atomically(&path, self)?;
        info!(
            path = %path.display(),
            node_labels = self.nodes.len(),
            edge_labels = self.edges.len(),
            "Schema written"
        );
        Ok(())
    }
}

pub(crate) fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        writer.flush()?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn props(value: serde_json::Value) -> PropertyMap {
        value.as_object().unwrap().clone()
    }

    fn modern_schema() -> GraphSchema {
        let mut schema = GraphSchema::new();
        let person = Label::new("person");
        schema
            .nodes
            .update(&person, &props(json!({"name": "marko", "age": 29})), false);
        schema
            .nodes
            .update(&Label::new("software"), &props(json!({"name": "lop", "lang": "java"})), false);
        schema
            .edges
            .update(&Label::new("knows"), &props(json!({"weight": 0.5})), false);
        schema
    }

    #[test]
    fn serializes_labels_in_order() {
        let value = modern_schema().to_json().unwrap();
        let nodes = value["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["label"], "person");
        assert_eq!(nodes[1]["label"], "software");
        assert_eq!(value["edges"][0]["properties"][0]["dataType"], "Double");
        assert!(value.get("results").is_none());
    }

    #[test]
    fn written_schema_reads_back() -> Result<()> {
        let dir = TempDir::new()?;
        let schema = modern_schema();
        schema.write_to(dir.path())?;

        let back = GraphSchema::from_file(&dir.path().join(SCHEMA_FILE_NAME))?;
        assert_eq!(back.nodes.len(), 2);
        let person = back.nodes.get(&Label::new("person")).unwrap();
        assert!(person.same_columns(schema.nodes.get(&Label::new("person")).unwrap()));
        assert!(!dir.path().join("schema.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn add_unions_same_label() {
        let mut a = GraphElementSchemas::new();
        a.update(&Label::new("person"), &props(json!({"name": "marko"})), false);
        let mut b = GraphElementSchemas::new();
        b.update(&Label::new("person"), &props(json!({"age": 27})), false);
        a.union(&b);
        let person = a.get(&Label::new("person")).unwrap();
        assert_eq!(person.len(), 2);
        assert_eq!(person.element_count(), 2);
    }
}
