use crate::config::{OutputFormat, REWRITE_BUFFER_SIZE};
use crate::label::Label;
use crate::schema::{FileSchema, GraphElementSchemas, LabelSchema, MasterLabelSchemas};
use crate::writer::{csv_header, token_column_count, OutputKind};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info};

/// Brings every written file in line with the canonical schema of its label.
pub trait RewriteCommand: Send + Sync {
    fn execute(&self, master: &MasterLabelSchemas, kind: OutputKind) -> Result<GraphElementSchemas>;
}

pub fn rewrite_command(format: OutputFormat) -> Box<dyn RewriteCommand> {
    match format {
        OutputFormat::Csv => Box::new(RewriteCsv),
        OutputFormat::Json => Box::new(NoRewrite),
    }
}

/// Line-JSON rows are self-describing; nothing to fix up
pub struct NoRewrite;

impl RewriteCommand for NoRewrite {
    fn execute(
        &self,
        master: &MasterLabelSchemas,
        _kind: OutputKind,
    ) -> Result<GraphElementSchemas> {
        Ok(master.to_graph_element_schemas())
    }
}

/// Re-emits CSV files whose header differs from the canonical one, padding
/// columns the file never saw and reordering to canonical order.
pub struct RewriteCsv;

impl RewriteCommand for RewriteCsv {
    fn execute(
        &self,
        master: &MasterLabelSchemas,
        kind: OutputKind,
    ) -> Result<GraphElementSchemas> {
        let jobs: Vec<(&Label, &LabelSchema, &FileSchema)> = master
            .iter()
            .flat_map(|(label, entry)| entry.files.iter().map(move |f| (label, &entry.schema, f)))
            .collect();

        let rewritten = jobs
            .par_iter()
            .map(|(label, canonical, file)| rewrite_file(kind, label, canonical, file))
            .collect::<Result<Vec<bool>>>()?
            .into_iter()
            .filter(|&changed| changed)
            .count();

        info!(
            kind = kind.dir_name(),
            files = jobs.len(),
            rewritten,
            "Reconciled CSV headers"
        );
        Ok(master.to_graph_element_schemas())
    }
}

/// Returns true when the file had to be rewritten.
pub fn rewrite_file(
    kind: OutputKind,
    label: &Label,
    canonical: &LabelSchema,
    file: &FileSchema,
) -> Result<bool> {
    let path = &file.path;
    let expected = csv_header(kind, label, canonical);

    let input = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut input = BufReader::with_capacity(REWRITE_BUFFER_SIZE, input);

    // Compared byte-wise: a header with no columns is a blank line, which the
    // csv reader would skip.
    let mut header = Vec::new();
    if input
        .read_until(b'\n', &mut header)
        .with_context(|| format!("Failed to read {}", path.display()))?
        == 0
    {
        return Ok(false);
    }
    if header == encode_record(&expected)? {
        debug!(path = %path.display(), "Header already canonical");
        return Ok(false);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let records = reader.records();

    // Rows are positional under the file's own column order
    let tokens = token_column_count(kind, label);
    let file_columns: Vec<&str> = file.schema.properties().map(|p| p.name()).collect();
    let positions: Vec<Option<usize>> = canonical
        .properties()
        .map(|p| {
            file_columns
                .iter()
                .position(|c| *c == p.name())
                .map(|i| tokens + i)
        })
        .collect();

    let tmp_path = tmp_path_for(path);
    {
        let output = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .from_writer(BufWriter::with_capacity(REWRITE_BUFFER_SIZE, output));
        writer.write_record(&expected)?;

        for record in records {
            let record = record.with_context(|| format!("Failed to read {}", path.display()))?;
            let row = (0..tokens)
                .map(|i| record.get(i).unwrap_or(""))
                .chain(
                    positions
                        .iter()
                        .map(|p| p.and_then(|i| record.get(i)).unwrap_or("")),
                );
            writer.write_record(row)?;
        }
        writer.flush()?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    debug!(path = %path.display(), label = %label, "Rewrote file");
    Ok(true)
}

fn encode_record(fields: &[String]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(fields)?;
    Ok(writer.into_inner()?)
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    name.into()
}
