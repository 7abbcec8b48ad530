//! Error types for unit-of-work operations.

use crate::value::Value;

/// The primary error type for all persist operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two different instances claim the same (type, id) in one unit of work.
    #[error("duplicate identity: {entity}#{id} is already bound to a different instance")]
    DuplicateIdentity { entity: String, id: Value },

    /// The row backing a load or lazy initialization does not exist.
    #[error("no row found for {entity}#{id}")]
    EntityNotFound { entity: String, id: Value },

    /// A result row does not have the shape the mapping expects.
    #[error("hydration of {entity} failed: {message}")]
    Hydration { entity: String, message: String },

    /// A versioned (or keyed) write touched no row.
    #[error("stale state for {entity}#{id}: row was updated or deleted by another transaction")]
    StaleState {
        entity: String,
        id: Value,
        expected_version: Option<Value>,
    },

    /// The store rejected a write.
    #[error("constraint violation on {table}: {message}")]
    ConstraintViolation {
        table: String,
        constraint: Option<String>,
        message: String,
    },

    /// A placeholder was accessed after its unit of work was gone.
    #[error("could not initialize {entity}#{id}: no unit of work is available")]
    LazyInitialization { entity: String, id: Value },

    /// The named entity type is not mapped.
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),

    /// The named attribute is not mapped on the entity type.
    #[error("unknown attribute '{attribute}' on entity '{entity}'")]
    UnknownAttribute { entity: String, attribute: String },

    /// Mapping metadata is inconsistent or used with the wrong attribute kind.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// A managed instance references an instance the unit of work does not know.
    #[error(
        "{entity}.{attribute} references an unsaved instance of {target}; persist it first or cascade persist"
    )]
    TransientReference {
        entity: String,
        attribute: String,
        target: String,
    },

    /// Pending inserts (or deletes) form a cycle that cannot be broken.
    #[error("cycle detected between entity types: {}", .entities.join(" -> "))]
    CycleDetected { entities: Vec<String> },

    /// The operation is not valid for the instance's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transport-level failure reported by the SQL collaborator.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// A previous flush failed; the unit of work must be discarded.
    #[error("unit of work is unusable after a failed flush; discard it and open a new one")]
    UnitOfWorkFailed,

    /// Second-level cache failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serde(String),
}

impl Error {
    /// Whether the unit of work must be discarded after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DuplicateIdentity { .. }
                | Error::StaleState { .. }
                | Error::ConstraintViolation { .. }
                | Error::Connectivity(_)
                | Error::UnitOfWorkFailed
        )
    }

    /// Whether this error reports a missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EntityNotFound { .. })
    }

    /// Shorthand for [`Error::Hydration`].
    pub fn hydration(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Hydration {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::UnknownAttribute`].
    pub fn unknown_attribute(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        Error::UnknownAttribute {
            entity: entity.into(),
            attribute: attribute.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for persist operations.
pub type Result<T> = std::result::Result<T, Error>;
