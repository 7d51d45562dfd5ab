//! Error types and result types for mapper operations.
//!
//! Every fallible operation in the crate returns [`OdmResult<T>`]. Store failures are
//! wrapped as [`OdmError::StoreOperation`] with the driver's message preserved, and
//! relationship loading failures are reported against the relation and owning model
//! rather than as raw store errors.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors raised by the mapper.
#[derive(Error, Debug)]
pub enum OdmError {
    /// `first_or_fail` / `find_or_fail` matched nothing. Carries the model name.
    #[error("No {model} record matched the query")]
    NotFound {
        /// Name of the model that was queried.
        model: String,
    },
    /// A model, relation or session reference could not be resolved.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// An operation was attempted on an instance in the wrong lifecycle state,
    /// e.g. creating a related record before the owner has been persisted.
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// The underlying store rejected or failed an operation.
    #[error("Store operation failed: {0}")]
    StoreOperation(String),
    /// A field failed a declared rule, or a query used an unknown operator.
    #[error("Validation failed on `{field}`: {message}")]
    Validation {
        /// The offending field.
        field: String,
        /// Human readable description of the failed rule.
        message: String,
    },
    /// Conversion between BSON, JSON and typed values failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Loading a relationship failed.
    #[error("Failed to load relation `{relation}` of {model}: {source}")]
    Relationship {
        /// The relation being loaded.
        relation: String,
        /// The model owning the relation.
        model: String,
        /// The underlying cause.
        #[source]
        source: Box<OdmError>,
    },
}

impl OdmError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        OdmError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn relationship(relation: &str, model: &str, source: OdmError) -> Self {
        OdmError::Relationship {
            relation: relation.to_string(),
            model: model.to_string(),
            source: Box::new(source),
        }
    }

    /// Wraps any displayable driver error as a store failure.
    pub fn store(err: impl std::fmt::Display) -> Self {
        OdmError::StoreOperation(err.to_string())
    }
}

/// A specialized `Result` type for mapper operations.
pub type OdmResult<T> = Result<T, OdmError>;

impl From<BsonError> for OdmError {
    fn from(err: BsonError) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for OdmError {
    fn from(err: SerdeJsonError) -> Self {
        OdmError::Serialization(err.to_string())
    }
}
