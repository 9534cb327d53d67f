// package-restore/src/errors.rs
use std::fmt;
use thiserror::Error;

use crate::models::package::PackageType;

/// A package or dataset is addressed either by its internal integer id or by its node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Id(i64),
    NodeId(String),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Id(id) => write!(f, "{}", id),
            EntityRef::NodeId(node_id) => write!(f, "{}", node_id),
        }
    }
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("dataset {dataset} not found in workspace {org_id}")]
    DatasetNotFound { org_id: i32, dataset: EntityRef },

    #[error("package with node id {package} not found in dataset {}, workspace {org_id}", display_dataset(.dataset))]
    PackageNotFound {
        org_id: i32,
        dataset: Option<EntityRef>,
        package: EntityRef,
    },

    #[error("folder with node id {node_id:?} not found in dataset {dataset}, workspace {org_id}{}", display_actual_type(.actual_type))]
    FolderNotFound {
        org_id: i32,
        dataset: EntityRef,
        node_id: String,
        actual_type: Option<PackageType>,
    },

    #[error("package {package_id} in workspace {org_id} cannot be renamed to {name:?}: name already taken")]
    NameUniqueness {
        org_id: i32,
        package_id: i64,
        name: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("name {name:?} does not start with expected prefix {expected_prefix:?}")]
    InvalidDeletedName { name: String, expected_prefix: String },

    #[error("{operation}: {remaining} items still unprocessed after {attempts} retries")]
    RetriesExhausted {
        operation: String,
        remaining: usize,
        attempts: u32,
    },

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("DynamoDB error: {0}")]
    DynamoDb(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RestoreError>,
    },
}

fn display_dataset(dataset: &Option<EntityRef>) -> String {
    match dataset {
        Some(d) => d.to_string(),
        None => "<unknown>".to_string(),
    }
}

fn display_actual_type(actual_type: &Option<PackageType>) -> String {
    match actual_type {
        Some(t) => format!(" (actual type {})", t),
        None => String::new(),
    }
}

/// What kind of entity a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Dataset,
    Package,
    Folder,
}

/// Classification callers branch on instead of matching concrete variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound {
        subject: Subject,
        keys: Vec<(&'static str, String)>,
    },
    NameConflict { candidate: String },
    Transient,
    Fatal,
}

impl RestoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RestoreError::DatasetNotFound { org_id, dataset } => ErrorKind::NotFound {
                subject: Subject::Dataset,
                keys: vec![("orgId", org_id.to_string()), ("datasetId", dataset.to_string())],
            },
            RestoreError::PackageNotFound {
                org_id,
                dataset,
                package,
            } => ErrorKind::NotFound {
                subject: Subject::Package,
                keys: vec![
                    ("orgId", org_id.to_string()),
                    ("datasetId", display_dataset(dataset)),
                    ("nodeId", package.to_string()),
                ],
            },
            RestoreError::FolderNotFound {
                org_id,
                dataset,
                node_id,
                ..
            } => ErrorKind::NotFound {
                subject: Subject::Folder,
                keys: vec![
                    ("orgId", org_id.to_string()),
                    ("datasetId", dataset.to_string()),
                    ("nodeId", node_id.clone()),
                ],
            },
            RestoreError::NameUniqueness { name, .. } => ErrorKind::NameConflict {
                candidate: name.clone(),
            },
            RestoreError::RetriesExhausted { .. }
            | RestoreError::DynamoDb(_)
            | RestoreError::S3(_)
            | RestoreError::Sqs(_) => ErrorKind::Transient,
            RestoreError::Sqlx(err) if is_transient_sqlx(err) => ErrorKind::Transient,
            RestoreError::Context { source, .. } => source.kind(),
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_name_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::NameConflict { .. })
    }

    pub fn is_not_found(&self, subject: Subject) -> bool {
        matches!(self.kind(), ErrorKind::NotFound { subject: s, .. } if s == subject)
    }

    /// Wraps the error with a message while keeping its kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        RestoreError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

pub type Result<T> = std::result::Result<T, RestoreError>;

/// Adds a context message to the error of a `Result`.
pub trait ResultExt<T> {
    fn with_restore_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_restore_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|err| err.context(f()))
    }
}
