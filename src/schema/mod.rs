//! Schema model: per-label structure, per-file fragments and the canonical merge
//!
//! - [`data_type`] -- observed value types and the widening rule
//! - [`label_schema`] -- columns and types of one label
//! - [`graph_schema`] -- canonical schemas of a whole export (`schema.json`)
//! - [`file_specific`] -- which files hold which label, merged across tasks
//! - [`rewrite`] -- reconciles already-written CSV files with the canonical schema

pub mod data_type;
pub mod file_specific;
pub mod graph_schema;
pub mod label_schema;
pub mod rewrite;

pub use data_type::DataType;
pub use file_specific::{
    FileSchema, FileSpecificLabelSchemas, MasterLabelSchema, MasterLabelSchemas,
};
pub use graph_schema::{GraphElementSchemas, GraphSchema};
pub use label_schema::{LabelSchema, PropertySchema};
pub use rewrite::{rewrite_command, RewriteCommand};
