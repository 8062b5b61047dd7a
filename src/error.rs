// ABOUTME: Typed domain errors for normalization, audit, storage and sync
// ABOUTME: Application seams wrap these in anyhow with context

use std::time::Duration;

use thiserror::Error;

/// A raw notification that could not be turned into a `ChangeEvent`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("unrecognized operation '{0}'")]
    UnknownOperation(String),

    #[error("no resolvable primary key for {table}")]
    MissingPrimaryKey { table: String },

    #[error("primary key column '{column}' missing from row image of {table}")]
    MissingKeyValue { table: String, column: String },

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("malformed field '{field}': {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("{operation} requires {image} row image")]
    MissingImage {
        operation: &'static str,
        image: &'static str,
    },

    #[error("unparseable timestamp '{0}'")]
    Timestamp(String),

    #[error("no change source registered as '{0}'")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("change event has no table name")]
    MissingTable,

    #[error("change event for {0} has an empty primary key")]
    MissingPrimaryKey(String),
}

/// Tamper evidence found on a stored or incoming record. Never auto-corrected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("checksum mismatch for audit record {id}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        id: String,
        stored: String,
        computed: String,
    },

    #[error("audit record {id} already exists with checksum {existing}, refusing {incoming}")]
    DuplicateId {
        id: String,
        existing: String,
        incoming: String,
    },

    #[error("signature mismatch for audit record {0}")]
    SignatureMismatch(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("audit store: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("audit store record {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("audit store io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to a destination store.
#[derive(Debug, Clone, Error)]
pub enum DestinationError {
    #[error("destination {destination} unavailable: {reason}")]
    Unavailable { destination: String, reason: String },

    #[error("destination {destination} rejected write: {reason}")]
    Rejected { destination: String, reason: String },

    #[error("destination {destination} verification failed: {reason}")]
    VerificationFailed { destination: String, reason: String },

    #[error("circuit open for {destination}, retry after {retry_after:?}")]
    CircuitOpen {
        destination: String,
        retry_after: Duration,
    },
}

impl DestinationError {
    pub fn unavailable(destination: &str, reason: impl ToString) -> Self {
        Self::Unavailable {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn rejected(destination: &str, reason: impl ToString) -> Self {
        Self::Rejected {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn verification(destination: &str, reason: impl ToString) -> Self {
        Self::VerificationFailed {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure counts against the breaker and the record's attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CircuitOpen { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal sync transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate sync config for pair {0}")]
    DuplicatePair(String),

    #[error("sync pair {0} references unknown destination '{1}'")]
    UnknownDestination(String, String),

    #[error("duplicate destination '{0}'")]
    DuplicateDestination(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
