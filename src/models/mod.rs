//! Data model shared by the stores, the restore worker and the request service.
//!
//! `package` mirrors the rows of the per-workspace `packages` table, `restore`
//! holds the queue and API payloads, and `changelog` the audit events emitted
//! after a successful restore.

pub mod changelog;
pub mod package;
pub mod restore;
