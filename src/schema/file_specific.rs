use crate::config::OutputFormat;
use crate::label::Label;
use crate::schema::{GraphElementSchemas, LabelSchema};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Schema of the rows in one physical output file
#[derive(Debug, Clone, PartialEq)]
pub struct FileSchema {
    pub output_id: String,
    pub path: PathBuf,
    pub format: OutputFormat,
    pub schema: LabelSchema,
}

/// Per-task record of which files hold which label, and what each file's rows look like.
#[derive(Debug, Clone, Default)]
pub struct FileSpecificLabelSchemas {
    entries: BTreeMap<Label, Vec<FileSchema>>,
}

impl FileSpecificLabelSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file's schema. A second registration of the same output id
    /// (a writer that was evicted and reopened) widens the existing entry.
    pub fn add(&mut self, file: FileSchema) {
        let files = self.entries.entry(file.schema.label().clone()).or_default();
        match files.iter_mut().find(|f| f.output_id == file.output_id) {
            Some(existing) => existing.schema.union(&file.schema),
            None => files.push(file),
        }
    }

    pub fn extend(&mut self, other: FileSpecificLabelSchemas) {
        for file in other.entries.into_values().flatten() {
            self.add(file);
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.entries.keys()
    }

    pub fn files_for(&self, label: &Label) -> &[FileSchema] {
        self.entries.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical schema of one label together with every file that holds it
#[derive(Debug, Clone, PartialEq)]
pub struct MasterLabelSchema {
    pub schema: LabelSchema,
    pub files: Vec<FileSchema>,
}

/// Union of all tasks' file schemas for one output kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterLabelSchemas {
    entries: BTreeMap<Label, MasterLabelSchema>,
}

impl MasterLabelSchemas {
    /// Files are ordered by output id before their schemas are unioned, so the
    /// canonical column order does not depend on task completion order.
    pub fn from_fragments<I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = FileSpecificLabelSchemas>,
    {
        let mut all = FileSpecificLabelSchemas::new();
        for fragment in fragments {
            all.extend(fragment);
        }

        let entries = all
            .entries
            .into_iter()
            .map(|(label, mut files)| {
                files.sort_by(|a, b| a.output_id.cmp(&b.output_id));
                let mut schema = LabelSchema::new(label.clone());
                for file in &files {
                    schema.union(&file.schema);
                }
                (label, MasterLabelSchema { schema, files })
            })
            .collect();

        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Label, &MasterLabelSchema)> {
        self.entries.iter()
    }

    pub fn get(&self, label: &Label) -> Option<&MasterLabelSchema> {
        self.entries.get(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_graph_element_schemas(&self) -> GraphElementSchemas {
        let mut schemas = GraphElementSchemas::new();
        for master in self.entries.values() {
            schemas.add(&master.schema);
        }
        schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::PropertyMap;
    use serde_json::json;

    fn file(id: &str, properties: serde_json::Value) -> FileSchema {
        let mut schema = LabelSchema::new(Label::new("person"));
        let map: PropertyMap = properties.as_object().unwrap().clone();
        schema.update(&map, false);
        FileSchema {
            output_id: id.to_string(),
            path: PathBuf::from(id),
            format: OutputFormat::Csv,
            schema,
        }
    }

    #[test]
    fn same_output_id_is_widened_not_duplicated() {
        let mut fragment = FileSpecificLabelSchemas::new();
        fragment.add(file("nodes/person-1.csv", json!({"name": "marko"})));
        fragment.add(file("nodes/person-1.csv", json!({"age": 29})));
        let files = fragment.files_for(&Label::new("person"));
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].schema.len(), 2);
        assert_eq!(files[0].schema.element_count(), 2);
    }

    #[test]
    fn master_unions_all_files() {
        let mut first = FileSpecificLabelSchemas::new();
        first.add(file("nodes/person-2.csv", json!({"name": "marko"})));
        let mut second = FileSpecificLabelSchemas::new();
        second.add(file("nodes/person-1.csv", json!({"name": "vadas", "age": 27})));

        let master = MasterLabelSchemas::from_fragments([first, second]);
        let person = master.get(&Label::new("person")).unwrap();
        assert_eq!(person.files.len(), 2);
        assert_eq!(person.files[0].output_id, "nodes/person-1.csv");
        assert_eq!(person.schema.element_count(), 2);
        assert!(person.schema.has_property("age"));
    }

    #[test]
    fn merge_is_order_independent_and_repeatable() {
        let a = || {
            let mut f = FileSpecificLabelSchemas::new();
            f.add(file("nodes/person-1.csv", json!({"name": "marko"})));
            f
        };
        let b = || {
            let mut f = FileSpecificLabelSchemas::new();
            f.add(file("nodes/person-2.csv", json!({"age": 27, "city": "x"})));
            f
        };
        let forward = MasterLabelSchemas::from_fragments([a(), b()]);
        let backward = MasterLabelSchemas::from_fragments([b(), a()]);
        assert_eq!(forward, backward);
        assert_eq!(
            forward.to_graph_element_schemas(),
            MasterLabelSchemas::from_fragments([a(), b()]).to_graph_element_schemas()
        );
    }
}
