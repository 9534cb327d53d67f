//! Audit events recorded for every package a restore brings back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RESTORE_PACKAGE_EVENT_TYPE: &str = "RESTORE_PACKAGE";

/// Detail of one restored package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogEvent {
    pub id: i64,
    pub node_id: String,
    /// Name after the restore.
    pub name: String,
    /// Set only when the package could not get its pre-delete name back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ChangelogParent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogParent {
    pub id: i64,
    pub node_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_detail: ChangelogEvent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogJob {
    pub organization_id: i64,
    pub dataset_id: i64,
    pub user_id: String,
    pub events: Vec<EventEnvelope>,
    pub trace_id: String,
    pub id: String,
}

/// Message placed on the jobs queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogMessage {
    #[serde(rename = "DatasetChangelogEventJob")]
    pub dataset_changelog_event_job: ChangelogJob,
}

impl ChangelogMessage {
    pub fn restores(
        org_id: i64,
        dataset_id: i64,
        user_id: &str,
        events: Vec<ChangelogEvent>,
        now: DateTime<Utc>,
    ) -> Self {
        let events = events
            .into_iter()
            .map(|event_detail| EventEnvelope {
                event_type: RESTORE_PACKAGE_EVENT_TYPE.to_string(),
                event_detail,
                timestamp: now,
            })
            .collect();
        ChangelogMessage {
            dataset_changelog_event_job: ChangelogJob {
                organization_id: org_id,
                dataset_id,
                user_id: user_id.to_string(),
                events,
                trace_id: uuid::Uuid::new_v4().to_string(),
                id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}
