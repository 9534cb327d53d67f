// package-restore/src/store/postgres.rs
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::PostgresConfig;
use crate::errors::{EntityRef, RestoreError, Result};
use crate::models::package::{Dataset, Package, PackageState, PackageType};
use crate::store::{DescendantTraversal, PackageStore, PackageStoreFactory, PackageTx};

const PACKAGE_COLUMNS: &str = "id::bigint AS id, name, type, state, node_id, \
    parent_id::bigint AS parent_id, dataset_id::bigint AS dataset_id, \
    owner_id::bigint AS owner_id, size::bigint AS size, import_id::uuid AS import_id, \
    attributes::jsonb AS attributes, created_at::timestamp AS created_at, \
    updated_at::timestamp AS updated_at";

const UNIQUE_VIOLATION: &str = "23505";
const ROOT_PACKAGE_NAME_CONSTRAINT: &str = "packages_name_dataset_id__parent_id_null_idx";
const PACKAGE_NAME_CONSTRAINT: &str = "packages_name_dataset_id_parent_id__parent_id_not_null_idx";

pub struct PostgresStoreFactory {
    pool: PgPool,
    traversal: DescendantTraversal,
}

impl PostgresStoreFactory {
    pub fn new(pool: PgPool, traversal: DescendantTraversal) -> Self {
        PostgresStoreFactory { pool, traversal }
    }

    pub async fn connect(
        config: &PostgresConfig,
        max_connections: u32,
        traversal: DescendantTraversal,
    ) -> anyhow::Result<Self> {
        tracing::info!(url = %config.redacted(), "connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(config.connection_url())
            .await
            .with_context(|| format!("Failed to connect to {}", config.redacted()))?;
        Ok(Self::new(pool, traversal))
    }
}

#[async_trait]
impl PackageStoreFactory for PostgresStoreFactory {
    async fn begin(&self, org_id: i32) -> Result<Box<dyn PackageTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgPackageTx {
            tx,
            org_id,
            traversal: self.traversal,
        }))
    }
}

/// Package statements scoped to one workspace schema, run inside one transaction.
pub struct PgPackageTx {
    tx: Transaction<'static, Postgres>,
    org_id: i32,
    traversal: DescendantTraversal,
}

fn dataset_by_node_id_sql(org_id: i32) -> String {
    format!(
        r#"SELECT id::bigint AS id, name, node_id FROM "{}".datasets WHERE node_id = $1"#,
        org_id
    )
}

fn package_by_node_id_sql(org_id: i32) -> String {
    format!(
        r#"SELECT {} FROM "{}".packages WHERE dataset_id = $1 AND node_id = $2"#,
        PACKAGE_COLUMNS, org_id
    )
}

fn transition_package_state_sql(org_id: i32) -> String {
    format!(
        r#"UPDATE "{}".packages SET state = $1, updated_at = CURRENT_TIMESTAMP
           WHERE node_id = $2 AND dataset_id = $3 AND state = $4
           RETURNING {}"#,
        org_id, PACKAGE_COLUMNS
    )
}

/// $1 root package id, $2 dataset id, $3 expected state, $4 target state.
/// Rows come back ordered by depth below the root, so parents precede children.
fn transition_descendants_sql(org_id: i32, traversal: DescendantTraversal) -> String {
    let (seed_filter, step_filter) = match traversal {
        DescendantTraversal::StopAtNonMatching => ("AND state = $3", "WHERE child.state = $3"),
        DescendantTraversal::EntireSubtree => ("", ""),
    };
    format!(
        r#"WITH RECURSIVE nodes(id, depth) AS (
               SELECT id, 1 FROM "{org}".packages
                   WHERE parent_id = $1 AND dataset_id = $2 {seed_filter}
               UNION ALL
               SELECT child.id, nodes.depth + 1 FROM "{org}".packages child
                   JOIN nodes ON nodes.id = child.parent_id
                   {step_filter}
           ),
           updated AS (
               UPDATE "{org}".packages SET state = $4, updated_at = CURRENT_TIMESTAMP
               WHERE state = $3 AND id IN (SELECT id FROM nodes)
               RETURNING {columns}
           )
           SELECT updated.* FROM updated
               JOIN nodes ON nodes.id = updated.id
               ORDER BY nodes.depth, updated.id"#,
        org = org_id,
        seed_filter = seed_filter,
        step_filter = step_filter,
        columns = PACKAGE_COLUMNS
    )
}

/// $1 collection type, $2 starting package id, $3 expected state, $4 target state.
fn transition_ancestors_sql(org_id: i32) -> String {
    format!(
        r#"WITH RECURSIVE ancestors(id, parent_id) AS (
               SELECT id, parent_id FROM "{org}".packages
                   WHERE type = $1 AND id = $2 AND state = $3
               UNION ALL
               SELECT parents.id, parents.parent_id FROM "{org}".packages parents
                   JOIN ancestors ON ancestors.parent_id = parents.id
                   WHERE parents.type = $1 AND parents.state = $3
           )
           UPDATE "{org}".packages SET state = $4, updated_at = CURRENT_TIMESTAMP
           WHERE type = $1 AND state = $3 AND id IN (SELECT id FROM ancestors)
           RETURNING {columns}"#,
        org = org_id,
        columns = PACKAGE_COLUMNS
    )
}

fn update_package_name_sql(org_id: i32) -> String {
    format!(
        r#"UPDATE "{}".packages SET name = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2"#,
        org_id
    )
}

fn package_sizes_sql(org_id: i32) -> String {
    format!(
        r#"SELECT package_id::bigint AS package_id, COALESCE(SUM(size), 0)::bigint AS size
           FROM "{}".files WHERE package_id = ANY($1) GROUP BY package_id"#,
        org_id
    )
}

fn increment_package_storage_sql(org_id: i32) -> String {
    format!(
        r#"INSERT INTO "{}".package_storage AS package_storage (package_id, size) VALUES ($1, $2)
           ON CONFLICT (package_id) DO UPDATE
           SET size = COALESCE(package_storage.size, 0) + EXCLUDED.size"#,
        org_id
    )
}

/// Walks up from $1 (inclusive) and adds $2 to every package on the way.
fn increment_package_storage_ancestors_sql(org_id: i32) -> String {
    format!(
        r#"WITH RECURSIVE ancestors(id, parent_id) AS (
               SELECT packages.id, packages.parent_id FROM "{org}".packages packages
                   WHERE packages.id = $1
               UNION
               SELECT parents.id, parents.parent_id FROM "{org}".packages parents
                   JOIN ancestors ON ancestors.parent_id = parents.id
           )
           INSERT INTO "{org}".package_storage AS package_storage (package_id, size)
           SELECT id, $2 FROM ancestors
           ON CONFLICT (package_id)
           DO UPDATE SET size = COALESCE(package_storage.size, 0) + EXCLUDED.size"#,
        org = org_id
    )
}

fn increment_dataset_storage_sql(org_id: i32) -> String {
    format!(
        r#"INSERT INTO "{}".dataset_storage AS dataset_storage (dataset_id, size) VALUES ($1, $2)
           ON CONFLICT (dataset_id) DO UPDATE
           SET size = COALESCE(dataset_storage.size, 0) + EXCLUDED.size"#,
        org_id
    )
}

const INCREMENT_ORGANIZATION_STORAGE_SQL: &str = r#"INSERT INTO pennsieve.organization_storage
    AS organization_storage (organization_id, size) VALUES ($1, $2)
    ON CONFLICT (organization_id) DO UPDATE
    SET size = COALESCE(organization_storage.size, 0) + EXCLUDED.size"#;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_package_name_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
                && matches!(
                    db_err.constraint(),
                    Some(c) if c == ROOT_PACKAGE_NAME_CONSTRAINT || c == PACKAGE_NAME_CONSTRAINT
                )
        }
        _ => false,
    }
}

#[async_trait]
impl PackageStore for PgPackageTx {
    fn org_id(&self) -> i32 {
        self.org_id
    }

    async fn get_dataset_by_node_id(&mut self, dataset_node_id: &str) -> Result<Dataset> {
        let dataset = sqlx::query_as::<_, Dataset>(&dataset_by_node_id_sql(self.org_id))
            .bind(dataset_node_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        dataset.ok_or_else(|| RestoreError::DatasetNotFound {
            org_id: self.org_id,
            dataset: EntityRef::NodeId(dataset_node_id.to_string()),
        })
    }

    async fn get_package_by_node_id(&mut self, dataset_id: i64, node_id: &str) -> Result<Package> {
        let package = sqlx::query_as::<_, Package>(&package_by_node_id_sql(self.org_id))
            .bind(dataset_id)
            .bind(node_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        package.ok_or_else(|| RestoreError::PackageNotFound {
            org_id: self.org_id,
            dataset: Some(EntityRef::Id(dataset_id)),
            package: EntityRef::NodeId(node_id.to_string()),
        })
    }

    async fn transition_package_state(
        &mut self,
        dataset_id: i64,
        node_id: &str,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Package> {
        let package = sqlx::query_as::<_, Package>(&transition_package_state_sql(self.org_id))
            .bind(target.as_str())
            .bind(node_id)
            .bind(dataset_id)
            .bind(expected.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        package.ok_or_else(|| RestoreError::PackageNotFound {
            org_id: self.org_id,
            dataset: Some(EntityRef::Id(dataset_id)),
            package: EntityRef::NodeId(node_id.to_string()),
        })
    }

    async fn transition_descendant_package_state(
        &mut self,
        dataset_id: i64,
        package_id: i64,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Vec<Package>> {
        let sql = transition_descendants_sql(self.org_id, self.traversal);
        let packages = sqlx::query_as::<_, Package>(&sql)
            .bind(package_id)
            .bind(dataset_id)
            .bind(expected.as_str())
            .bind(target.as_str())
            .fetch_all(&mut *self.tx)
            .await?;
        tracing::debug!(
            org_id = self.org_id,
            dataset_id,
            package_id,
            count = packages.len(),
            "transitioned descendants from {} to {}",
            expected,
            target
        );
        Ok(packages)
    }

    async fn transition_ancestor_package_state(
        &mut self,
        parent_id: i64,
        expected: PackageState,
        target: PackageState,
    ) -> Result<Vec<Package>> {
        let packages = sqlx::query_as::<_, Package>(&transition_ancestors_sql(self.org_id))
            .bind(PackageType::Collection.as_str())
            .bind(parent_id)
            .bind(expected.as_str())
            .bind(target.as_str())
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(packages)
    }

    async fn update_package_name(&mut self, package_id: i64, new_name: &str) -> Result<()> {
        let result = sqlx::query(&update_package_name_sql(self.org_id))
            .bind(new_name)
            .bind(package_id)
            .execute(&mut *self.tx)
            .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(RestoreError::PackageNotFound {
                org_id: self.org_id,
                dataset: None,
                package: EntityRef::Id(package_id),
            }),
            Ok(_) => Ok(()),
            Err(err) if is_package_name_violation(&err) => Err(RestoreError::NameUniqueness {
                org_id: self.org_id,
                package_id,
                name: new_name.to_string(),
                cause: Box::new(err),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_package_sizes(&mut self, package_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        if package_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (i64, i64)>(&package_sizes_sql(self.org_id))
            .bind(package_ids)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn increment_package_storage(&mut self, package_id: i64, delta: i64) -> Result<()> {
        sqlx::query(&increment_package_storage_sql(self.org_id))
            .bind(package_id)
            .bind(delta)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_package_storage_ancestors(&mut self, start_id: i64, delta: i64) -> Result<()> {
        sqlx::query(&increment_package_storage_ancestors_sql(self.org_id))
            .bind(start_id)
            .bind(delta)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_dataset_storage(&mut self, dataset_id: i64, delta: i64) -> Result<()> {
        sqlx::query(&increment_dataset_storage_sql(self.org_id))
            .bind(dataset_id)
            .bind(delta)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_organization_storage(&mut self, org_id: i64, delta: i64) -> Result<()> {
        sqlx::query(INCREMENT_ORGANIZATION_STORAGE_SQL)
            .bind(org_id)
            .bind(delta)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn new_savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("SAVEPOINT {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PackageTx for PgPackageTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
