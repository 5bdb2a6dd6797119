//! Error types for the export engine
//!
//! Most functions return `anyhow::Result`; the variants here are the ones callers
//! need to tell apart:
//! - `Config` is fatal and raised before any worker starts
//! - `MalformedElement` skips one element and keeps the worker going
//! - `UnexpectedResult` and `UnsupportedQuery` abandon one named query

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    /// Settings that cannot work together
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single element is missing a required part or has the wrong shape
    #[error("Malformed element {id}: {reason}")]
    MalformedElement { id: String, reason: String },

    /// A query produced a row that is not a key/value structure
    #[error("Unexpected result value: {0}")]
    UnexpectedResult(String),

    /// The graph client cannot execute the query text
    #[error("Unsupported query '{0}'")]
    UnsupportedQuery(String),
}

impl ExportError {
    pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        ExportError::MalformedElement {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that only invalidate the element being handled.
    pub fn is_element_local(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ExportError>(),
            Some(ExportError::MalformedElement { .. })
        )
    }

    /// True for errors that only invalidate the named query being executed.
    pub fn is_query_local(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ExportError>(),
            Some(ExportError::UnexpectedResult(_)) | Some(ExportError::UnsupportedQuery(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_element_is_element_local() {
        let err = anyhow::Error::new(ExportError::malformed("7", "missing ~from"));
        assert!(ExportError::is_element_local(&err));
        assert!(!ExportError::is_query_local(&err));
    }

    #[test]
    fn unexpected_result_is_query_local() {
        let err = anyhow::Error::new(ExportError::UnexpectedResult("Expected map".into()));
        assert!(ExportError::is_query_local(&err));
        assert!(!ExportError::is_element_local(&err));
    }

    #[test]
    fn io_errors_are_neither() {
        let err = anyhow::Error::new(std::io::Error::other("disk full"));
        assert!(!ExportError::is_element_local(&err));
        assert!(!ExportError::is_query_local(&err));
    }

    #[test]
    fn context_does_not_hide_kind() {
        let err = anyhow::Error::new(ExportError::malformed("1", "no id"))
            .context("handling element");
        assert!(ExportError::is_element_local(&err));
    }
}
