//! Packages: the files and folders of a dataset's storage tree.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a package row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Unavailable,
    Uploaded,
    Processing,
    Ready,
    Deleting,
    Deleted,
    Restoring,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Unavailable => "UNAVAILABLE",
            PackageState::Uploaded => "UPLOADED",
            PackageState::Processing => "PROCESSING",
            PackageState::Ready => "READY",
            PackageState::Deleting => "DELETING",
            PackageState::Deleted => "DELETED",
            PackageState::Restoring => "RESTORING",
        }
    }

    /// State a package ends up in once restored.
    pub fn restored(package_type: PackageType) -> Self {
        if package_type.is_collection() {
            PackageState::Ready
        } else {
            PackageState::Uploaded
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNAVAILABLE" => Ok(PackageState::Unavailable),
            "UPLOADED" => Ok(PackageState::Uploaded),
            "PROCESSING" => Ok(PackageState::Processing),
            "READY" => Ok(PackageState::Ready),
            "DELETING" => Ok(PackageState::Deleting),
            "DELETED" => Ok(PackageState::Deleted),
            "RESTORING" => Ok(PackageState::Restoring),
            other => Err(format!("unknown package state {:?}", other)),
        }
    }
}

/// Package type. Everything that is not a `Collection` is a leaf backed by source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    Collection,
    #[serde(rename = "PDF")]
    Pdf,
    Text,
    Image,
    Slide,
    #[serde(rename = "MRI")]
    Mri,
    Video,
    TimeSeries,
    Tabular,
    Unsupported,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Collection => "Collection",
            PackageType::Pdf => "PDF",
            PackageType::Text => "Text",
            PackageType::Image => "Image",
            PackageType::Slide => "Slide",
            PackageType::Mri => "MRI",
            PackageType::Video => "Video",
            PackageType::TimeSeries => "TimeSeries",
            PackageType::Tabular => "Tabular",
            PackageType::Unsupported => "Unsupported",
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, PackageType::Collection)
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for PackageType {
    // unknown types are stored leaves
    fn from(s: &str) -> Self {
        match s {
            "Collection" => PackageType::Collection,
            "PDF" => PackageType::Pdf,
            "Text" => PackageType::Text,
            "Image" => PackageType::Image,
            "Slide" => PackageType::Slide,
            "MRI" => PackageType::Mri,
            "Video" => PackageType::Video,
            "TimeSeries" => PackageType::TimeSeries,
            "Tabular" => PackageType::Tabular,
            _ => PackageType::Unsupported,
        }
    }
}

/// A row of `"{org}".packages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub package_type: PackageType,
    pub state: PackageState,
    pub node_id: String,
    pub parent_id: Option<i64>,
    pub dataset_id: i64,
    pub owner_id: i64,
    pub size: Option<i64>,
    pub import_id: Option<Uuid>,
    pub attributes: Option<serde_json::Value>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl<'r> FromRow<'r, PgRow> for Package {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let type_str: String = row.try_get("type")?;
        let state_str: String = row.try_get("state")?;
        let state = state_str
            .parse::<PackageState>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "state".to_string(),
                source: e.into(),
            })?;
        Ok(Package {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            package_type: PackageType::from(type_str.as_str()),
            state,
            node_id: row.try_get("node_id")?,
            parent_id: row.try_get("parent_id")?,
            dataset_id: row.try_get("dataset_id")?,
            owner_id: row.try_get("owner_id")?,
            size: row.try_get("size")?,
            import_id: row.try_get("import_id")?,
            attributes: row.try_get("attributes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// The subset of `"{org}".datasets` this service needs.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub node_id: Option<String>,
}
