//! Per-label output files
//!
//! Each `LabelWriter` owns one physical file for one label. The file's column
//! set is the writer's own schema fragment; a property seen for the first time
//! adds a column for the rows that follow, and the header is reconciled after
//! the job by `schema::rewrite`.

use crate::config::{OutputFormat, RESULTS_DIR, WRITER_BUFFER_SIZE};
use crate::element::{value_to_text, GraphElementType, PgResult, PropertyMap};
use crate::label::Label;
use crate::schema::{FileSchema, LabelSchema};
use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

static UNSAFE_FILE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_\-]+").unwrap());

const MULTI_VALUE_SEPARATOR: char = ';';

/// Which directory and row layout a writer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Nodes,
    Edges,
    /// Unstructured named-query results
    Results,
}

impl OutputKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            OutputKind::Nodes => GraphElementType::Nodes.dir_name(),
            OutputKind::Edges => GraphElementType::Edges.dir_name(),
            OutputKind::Results => RESULTS_DIR,
        }
    }
}

impl From<GraphElementType> for OutputKind {
    fn from(kind: GraphElementType) -> Self {
        match kind {
            GraphElementType::Nodes => OutputKind::Nodes,
            GraphElementType::Edges => OutputKind::Edges,
        }
    }
}

/// Number of leading structural columns in a CSV row.
pub fn token_column_count(kind: OutputKind, label: &Label) -> usize {
    match kind {
        OutputKind::Nodes => 2,
        OutputKind::Edges if label.has_from_and_to_labels() => 6,
        OutputKind::Edges => 4,
        OutputKind::Results => 0,
    }
}

pub fn csv_header(kind: OutputKind, label: &Label, schema: &LabelSchema) -> Vec<String> {
    let tokens: &[&str] = match kind {
        OutputKind::Nodes => &["~id", "~label"],
        OutputKind::Edges if label.has_from_and_to_labels() => {
            &["~id", "~label", "~from", "~to", "~fromLabels", "~toLabels"]
        }
        OutputKind::Edges => &["~id", "~label", "~from", "~to"],
        OutputKind::Results => &[],
    };
    let mut header: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    header.extend(schema.properties().map(|p| match kind {
        OutputKind::Results => p.name().to_string(),
        _ => format!(
            "{}:{}{}",
            p.name(),
            p.data_type().csv_name(),
            if p.is_multi_value() { "[]" } else { "" }
        ),
    }));
    header
}

/// Renders one property value as a CSV cell; list items are `;`-joined.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Array(items) => join_escaped(items.iter().map(value_to_text)),
        Value::Object(_) => value.to_string(),
        other => value_to_text(other).into_owned(),
    }
}

fn join_escaped<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(MULTI_VALUE_SEPARATOR);
        }
        for c in item.as_ref().chars() {
            if c == MULTI_VALUE_SEPARATOR {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Row serializer for one open file
pub trait PropertyGraphPrinter: Send {
    fn print_element(&mut self, element: &PgResult, label: &Label, schema: &LabelSchema)
        -> Result<()>;

    fn print_columns(&mut self, columns: &PropertyMap, schema: &LabelSchema) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

pub struct CsvPrinter {
    kind: OutputKind,
    writer: csv::Writer<BufWriter<File>>,
}

impl CsvPrinter {
    pub fn new(file: File, kind: OutputKind) -> Self {
        let writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(BufWriter::with_capacity(WRITER_BUFFER_SIZE, file));
        Self { kind, writer }
    }

    pub fn print_header(&mut self, label: &Label, schema: &LabelSchema) -> Result<()> {
        self.writer.write_record(csv_header(self.kind, label, schema))?;
        Ok(())
    }
}

fn property_cells<'a>(
    properties: &'a PropertyMap,
    schema: &'a LabelSchema,
) -> impl Iterator<Item = String> + 'a {
    schema.properties().map(move |p| {
        properties
            .get(p.name())
            .map(format_cell)
            .unwrap_or_default()
    })
}

impl PropertyGraphPrinter for CsvPrinter {
    fn print_element(
        &mut self,
        element: &PgResult,
        label: &Label,
        schema: &LabelSchema,
    ) -> Result<()> {
        let mut record = vec![element.id()?.into_owned(), label.label_text()];
        if self.kind == OutputKind::Edges {
            record.push(element.from()?.into_owned());
            record.push(element.to()?.into_owned());
            if label.has_from_and_to_labels() {
                record.push(join_escaped(label.from_labels()));
                record.push(join_escaped(label.to_labels()));
            }
        }
        let properties = element.properties()?;
        record.extend(property_cells(&properties, schema));
        self.writer.write_record(&record)?;
        Ok(())
    }

    fn print_columns(&mut self, columns: &PropertyMap, schema: &LabelSchema) -> Result<()> {
        let record: Vec<String> = property_cells(columns, schema).collect();
        self.writer.write_record(&record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One JSON object per line
pub struct JsonPrinter {
    kind: OutputKind,
    writer: BufWriter<File>,
}

impl JsonPrinter {
    pub fn new(file: File, kind: OutputKind) -> Self {
        Self {
            kind,
            writer: BufWriter::with_capacity(WRITER_BUFFER_SIZE, file),
        }
    }

    fn write_line(&mut self, value: &Map<String, Value>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl PropertyGraphPrinter for JsonPrinter {
    fn print_element(
        &mut self,
        element: &PgResult,
        label: &Label,
        _schema: &LabelSchema,
    ) -> Result<()> {
        let mut row = Map::new();
        row.insert("~id".into(), Value::String(element.id()?.into_owned()));
        if self.kind == OutputKind::Edges {
            row.insert("~label".into(), Value::String(label.label_text()));
            row.insert("~from".into(), Value::String(element.from()?.into_owned()));
            row.insert("~to".into(), Value::String(element.to()?.into_owned()));
            if label.has_from_and_to_labels() {
                row.insert("~fromLabels".into(), label.from_labels().into());
                row.insert("~toLabels".into(), label.to_labels().into());
            }
        } else {
            row.insert("~label".into(), label.labels().into());
        }
        row.insert(
            "properties".into(),
            Value::Object(element.properties()?.into_owned()),
        );
        self.write_line(&row)
    }

    fn print_columns(&mut self, columns: &PropertyMap, _schema: &LabelSchema) -> Result<()> {
        self.write_line(columns)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writer for one label in one file. While suspended it holds no file handle.
pub struct LabelWriter {
    label: Label,
    kind: OutputKind,
    format: OutputFormat,
    path: PathBuf,
    output_id: String,
    schema: LabelSchema,
    printer: Option<Box<dyn PropertyGraphPrinter>>,
    rows: u64,
    pub(crate) last_used: u64,
}

impl LabelWriter {
    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    pub fn schema(&self) -> &LabelSchema {
        &self.schema
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_open(&self) -> bool {
        self.printer.is_some()
    }

    /// Reopens the file in append mode; existing rows are kept and no header is written.
    pub fn reopen(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to reopen {}", self.path.display()))?;
        self.printer = Some(new_printer(file, self.kind, self.format));
        debug!(label = %self.label, path = %self.path.display(), "Reopened writer");
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub fn suspend(&mut self) -> Result<()> {
        match self.printer.take() {
            Some(mut printer) => printer
                .flush()
                .with_context(|| format!("Failed to flush {}", self.path.display())),
            None => Ok(()),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.suspend()
    }

    pub fn write_element(&mut self, element: &PgResult) -> Result<()> {
        element.id()?;
        if self.kind == OutputKind::Edges {
            element.from()?;
            element.to()?;
        }
        let properties = element.properties()?;
        let printer = self.printer.as_mut().ok_or_else(|| not_open(&self.path))?;
        self.schema.update(&properties, false);
        printer.print_element(element, &self.label, &self.schema)?;
        self.rows += 1;
        Ok(())
    }

    pub fn write_columns(&mut self, columns: &PropertyMap) -> Result<()> {
        let printer = self.printer.as_mut().ok_or_else(|| not_open(&self.path))?;
        self.schema.update(columns, true);
        printer.print_columns(columns, &self.schema)?;
        self.rows += 1;
        Ok(())
    }

    pub fn file_schema(&self) -> FileSchema {
        FileSchema {
            output_id: self.output_id.clone(),
            path: self.path.clone(),
            format: self.format,
            schema: self.schema.clone(),
        }
    }
}

fn not_open(path: &Path) -> anyhow::Error {
    anyhow!("Writer for {} is not open", path.display())
}

fn new_printer(
    file: File,
    kind: OutputKind,
    format: OutputFormat,
) -> Box<dyn PropertyGraphPrinter> {
    match format {
        OutputFormat::Csv => Box::new(CsvPrinter::new(file, kind)),
        OutputFormat::Json => Box::new(JsonPrinter::new(file, kind)),
    }
}

/// File-system name for a label
pub fn file_safe_name(label: &Label) -> String {
    let name = UNSAFE_FILE_CHARS
        .replace_all(&label.fully_qualified_label(), "_")
        .into_owned();
    if name.is_empty() {
        "unlabelled".to_string()
    } else {
        name
    }
}

/// Creates writers for one output kind. The file counter is shared across the
/// whole job so no two writers ever pick the same file.
#[derive(Clone)]
pub struct WriterFactory {
    dir: PathBuf,
    kind: OutputKind,
    format: OutputFormat,
    file_index: Arc<AtomicUsize>,
}

impl WriterFactory {
    pub fn new(
        output_dir: &Path,
        kind: OutputKind,
        format: OutputFormat,
        file_index: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            dir: output_dir.join(kind.dir_name()),
            kind,
            format,
            file_index,
        }
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Opens a new file for `label`, writing a CSV header from `seed` when given.
    pub fn create(&self, label: &Label, seed: Option<&LabelSchema>) -> Result<LabelWriter> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;

        let n = self.file_index.fetch_add(1, Ordering::Relaxed) + 1;
        let path = self.dir.join(format!(
            "{}-{}.{}",
            file_safe_name(label),
            n,
            self.format.extension()
        ));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let schema = seed
            .map(LabelSchema::columns_of)
            .unwrap_or_else(|| LabelSchema::new(label.clone()));

        let printer: Box<dyn PropertyGraphPrinter> = match self.format {
            OutputFormat::Csv => {
                let mut printer = CsvPrinter::new(file, self.kind);
                printer.print_header(label, &schema)?;
                Box::new(printer)
            }
            OutputFormat::Json => Box::new(JsonPrinter::new(file, self.kind)),
        };

        debug!(label = %label, path = %path.display(), "Created writer");

        Ok(LabelWriter {
            label: label.clone(),
            kind: self.kind,
            format: self.format,
            output_id: path.display().to_string(),
            path,
            schema,
            printer: Some(printer),
            rows: 0,
            last_used: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{EdgeResult, NodeResult};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn node(id: &str, properties: Value) -> PgResult {
        PgResult::Node(NodeResult {
            id: id.into(),
            labels: vec!["person".into()],
            properties: properties.as_object().unwrap().clone(),
        })
    }

    fn factory(dir: &Path, kind: OutputKind, format: OutputFormat) -> WriterFactory {
        WriterFactory::new(dir, kind, format, Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn header_layouts() {
        let mut schema = LabelSchema::new(Label::new("person"));
        let mut props = PropertyMap::new();
        props.insert("age".into(), json!(29));
        props.insert("tags".into(), json!(["a"]));
        schema.update(&props, false);

        assert_eq!(
            csv_header(OutputKind::Nodes, &Label::new("person"), &schema),
            vec!["~id", "~label", "age:Int", "tags:String[]"]
        );
        let knows = Label::with_endpoints("knows", ["person"], ["person"]);
        assert_eq!(csv_header(OutputKind::Edges, &knows, &schema).len(), 8);
        assert_eq!(
            csv_header(OutputKind::Results, &Label::new("q"), &schema),
            vec!["age", "tags"]
        );
    }

    #[test]
    fn list_cells_escape_separator() {
        assert_eq!(format_cell(&json!(["a", "b;c", 3])), r"a;b\;c;3");
        assert_eq!(format_cell(&json!(null)), "");
        assert_eq!(format_cell(&json!(true)), "true");
    }

    #[test]
    fn file_names_are_safe() {
        let label = Label::parse("(person)-knows-(person)");
        assert_eq!(file_safe_name(&label), "_person_-knows-_person_");
        assert_eq!(file_safe_name(&Label::from_tags(["a", "b"])), "a_b");
    }

    #[test]
    fn csv_rows_grow_with_new_columns() -> Result<()> {
        let dir = TempDir::new()?;
        let f = factory(dir.path(), OutputKind::Nodes, OutputFormat::Csv);
        let mut writer = f.create(&Label::new("person"), None)?;
        writer.write_element(&node("1", json!({"name": "marko"})))?;
        writer.write_element(&node("2", json!({"name": "vadas", "age": 27})))?;
        writer.close()?;

        let content = fs::read_to_string(writer.path())?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["~id,~label", "1,person,marko", "2,person,vadas,27"]);
        assert_eq!(writer.schema().len(), 2);
        assert_eq!(writer.rows(), 2);
        Ok(())
    }

    #[test]
    fn seeded_writer_starts_with_full_header() -> Result<()> {
        let dir = TempDir::new()?;
        let mut seed = LabelSchema::new(Label::new("person"));
        seed.update(json!({"name": "x", "age": 1}).as_object().unwrap(), false);

        let f = factory(dir.path(), OutputKind::Nodes, OutputFormat::Csv);
        let mut writer = f.create(&Label::new("person"), Some(&seed))?;
        writer.write_element(&node("1", json!({"name": "marko"})))?;
        writer.close()?;

        let content = fs::read_to_string(writer.path())?;
        assert_eq!(content, "~id,~label,age:Int,name:String\n1,person,,marko\n");
        Ok(())
    }

    #[test]
    fn reopen_appends() -> Result<()> {
        let dir = TempDir::new()?;
        let f = factory(dir.path(), OutputKind::Nodes, OutputFormat::Json);
        let mut writer = f.create(&Label::new("person"), None)?;
        writer.write_element(&node("1", json!({"name": "marko"})))?;
        writer.suspend()?;
        assert!(!writer.is_open());
        assert!(writer.write_element(&node("9", json!({}))).is_err());

        writer.reopen()?;
        writer.write_element(&node("2", json!({"name": "vadas"})))?;
        writer.close()?;

        let content = fs::read_to_string(writer.path())?;
        let rows: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["~id"], "1");
        assert_eq!(rows[0]["~label"], json!(["person"]));
        assert_eq!(rows[1]["properties"]["name"], "vadas");
        Ok(())
    }

    #[test]
    fn malformed_edge_writes_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let f = factory(dir.path(), OutputKind::Edges, OutputFormat::Csv);
        let mut writer = f.create(&Label::new("knows"), None)?;
        let broken = PgResult::Projected {
            kind: GraphElementType::Edges,
            map: json!({"~id": "7", "~label": "knows", "~to": "2"})
                .as_object()
                .unwrap()
                .clone(),
        };
        assert!(writer.write_element(&broken).is_err());
        assert_eq!(writer.schema().element_count(), 0);

        let edge = PgResult::Edge(EdgeResult {
            id: "7".into(),
            label: "knows".into(),
            from: "1".into(),
            to: "2".into(),
            from_labels: vec![],
            to_labels: vec![],
            properties: json!({"weight": 0.5}).as_object().unwrap().clone(),
        });
        writer.write_element(&edge)?;
        writer.close()?;
        let content = fs::read_to_string(writer.path())?;
        assert_eq!(content, "~id,~label,~from,~to\n7,knows,1,2,0.5\n");
        Ok(())
    }

    #[test]
    fn factory_numbers_files_uniquely() -> Result<()> {
        let dir = TempDir::new()?;
        let index = Arc::new(AtomicUsize::new(0));
        let nodes =
            WriterFactory::new(dir.path(), OutputKind::Nodes, OutputFormat::Csv, index.clone());
        let a = nodes.create(&Label::new("person"), None)?;
        let b = nodes.create(&Label::new("person"), None)?;
        assert_ne!(a.output_id(), b.output_id());
        assert!(a.path().ends_with("nodes/person-1.csv"));
        assert!(b.path().ends_with("nodes/person-2.csv"));
        Ok(())
    }
}
