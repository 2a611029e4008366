// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::CoreError;
use crate::migrations;
use crate::model::{
    Job, JobStep, JobStepState, MonOrderProgress, OrderState, ProcessingOrder, Product,
    StepCounts,
};
use crate::planning::Plan;

use super::{Persistence, ProductQuery};

macro_rules! order_columns {
    () => {
        "id, identifier, mission_code, state, version, start_time, stop_time, slicing_type, \
         slice_duration_secs, slice_overlap_secs, requested_product_classes, facility, \
         processing_mode, dynamic_parameters, tolerate_partial_failure, max_step_attempts, \
         state_message, diagnostic_kind, diagnostic_code, failed_job_step_id, created_at, \
         updated_at, eviction_time"
    };
}

macro_rules! job_columns {
    () => {
        "id, order_id, facility, state, version, slice_index, start_time, stop_time, \
         created_at, updated_at"
    };
}

macro_rules! step_columns {
    () => {
        "id, job_id, order_id, step_index, product_class, processor, state, version, \
         retry_count, max_attempts, input_products, execution_handle, joborder_location, \
         diagnostic_kind, diagnostic_code, diagnostic_message, started_at, finished_at, \
         created_at, updated_at"
    };
}

macro_rules! product_columns {
    () => {
        "id, product_class, mission_code, sensing_start, sensing_stop, generation_time, \
         file_name, facility, job_step_id, created_at"
    };
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Turn a zero-row versioned update into the matching error.
    async fn lost_update(
        &self,
        table: &'static str,
        entity: &'static str,
        id: &str,
        expected_version: i64,
    ) -> CoreError {
        let exists = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE id = ?",
            table
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(0) => not_found(entity, id),
            Ok(_) => CoreError::Conflict {
                entity,
                id: id.to_string(),
                expected_version,
            },
            Err(e) => e.into(),
        }
    }
}

fn not_found(entity: &'static str, id: &str) -> CoreError {
    match entity {
        "order" => CoreError::OrderNotFound {
            order_id: id.to_string(),
        },
        "job" => CoreError::JobNotFound {
            job_id: id.to_string(),
        },
        _ => CoreError::JobStepNotFound {
            job_step_id: id.to_string(),
        },
    }
}

async fn cas_update_order<'e, E>(
    executor: E,
    order: &ProcessingOrder,
    now: DateTime<Utc>,
) -> Result<u64, CoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE processing_orders
        SET state = ?, version = version + 1, start_time = ?, stop_time = ?,
            slicing_type = ?, slice_duration_secs = ?, slice_overlap_secs = ?,
            requested_product_classes = ?, facility = ?, processing_mode = ?,
            dynamic_parameters = ?, tolerate_partial_failure = ?, max_step_attempts = ?,
            state_message = ?, diagnostic_kind = ?, diagnostic_code = ?,
            failed_job_step_id = ?, updated_at = ?, eviction_time = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(order.state.as_str())
    .bind(order.start_time)
    .bind(order.stop_time)
    .bind(order.slicing_type.as_str())
    .bind(order.slice_duration_secs)
    .bind(order.slice_overlap_secs)
    .bind(Json(&order.requested_product_classes))
    .bind(&order.facility)
    .bind(&order.processing_mode)
    .bind(Json(&order.dynamic_parameters))
    .bind(order.tolerate_partial_failure)
    .bind(order.max_step_attempts)
    .bind(&order.state_message)
    .bind(&order.diagnostic_kind)
    .bind(&order.diagnostic_code)
    .bind(&order.failed_job_step_id)
    .bind(now)
    .bind(order.eviction_time)
    .bind(&order.id)
    .bind(order.version)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

fn bumped_order(order: &ProcessingOrder, now: DateTime<Utc>) -> ProcessingOrder {
    let mut stored = order.clone();
    stored.version += 1;
    stored.updated_at = now;
    stored
}

/// Versioned step update, optionally conditioned on the order's state.
async fn cas_update_step(
    pool: &SqlitePool,
    step: &JobStep,
    now: DateTime<Utc>,
    order_states: Option<&[OrderState]>,
) -> Result<u64, CoreError> {
    let mut sql = String::from(
        "UPDATE job_steps \
         SET state = ?, version = version + 1, retry_count = ?, max_attempts = ?, \
             input_products = ?, execution_handle = ?, joborder_location = ?, \
             diagnostic_kind = ?, diagnostic_code = ?, diagnostic_message = ?, \
             started_at = ?, finished_at = ?, updated_at = ? \
         WHERE id = ? AND version = ?",
    );
    if let Some(states) = order_states {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM processing_orders o \
             WHERE o.id = job_steps.order_id AND o.state IN (",
        );
        sql.push_str(&vec!["?"; states.len()].join(", "));
        sql.push_str("))");
    }

    let mut query = sqlx::query(&sql)
        .bind(step.state.as_str())
        .bind(step.retry_count)
        .bind(step.max_attempts)
        .bind(Json(&step.input_products))
        .bind(&step.execution_handle)
        .bind(&step.joborder_location)
        .bind(&step.diagnostic_kind)
        .bind(&step.diagnostic_code)
        .bind(&step.diagnostic_message)
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(now)
        .bind(&step.id)
        .bind(step.version);
    for state in order_states.unwrap_or_default() {
        query = query.bind(state.as_str());
    }

    Ok(query.execute(pool).await?.rows_affected())
}

fn bumped_step(step: &JobStep, now: DateTime<Utc>) -> JobStep {
    let mut stored = step.clone();
    stored.version += 1;
    stored.updated_at = now;
    stored
}

fn product_select<'a>(mission_code: &'a str, product_class: &'a str) -> QueryBuilder<'a, Sqlite> {
    let mut builder = QueryBuilder::new(concat!(
        "SELECT ",
        product_columns!(),
        " FROM products WHERE mission_code = "
    ));
    builder
        .push_bind(mission_code)
        .push(" AND product_class = ")
        .push_bind(product_class);
    builder
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_order(&self, order: &ProcessingOrder) -> Result<(), CoreError> {
        sqlx::query(concat!(
            "INSERT INTO processing_orders (",
            order_columns!(),
            ") VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&order.id)
        .bind(&order.identifier)
        .bind(&order.mission_code)
        .bind(order.state.as_str())
        .bind(order.version)
        .bind(order.start_time)
        .bind(order.stop_time)
        .bind(order.slicing_type.as_str())
        .bind(order.slice_duration_secs)
        .bind(order.slice_overlap_secs)
        .bind(Json(&order.requested_product_classes))
        .bind(&order.facility)
        .bind(&order.processing_mode)
        .bind(Json(&order.dynamic_parameters))
        .bind(order.tolerate_partial_failure)
        .bind(order.max_step_attempts)
        .bind(&order.state_message)
        .bind(&order.diagnostic_kind)
        .bind(&order.diagnostic_code)
        .bind(&order.failed_job_step_id)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.eviction_time)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::ValidationError {
                field: "identifier".to_string(),
                message: format!(
                    "order '{}' already exists for mission {}",
                    order.identifier, order.mission_code
                ),
            },
            other => other.into(),
        })?;

        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<ProcessingOrder>, CoreError> {
        let order = sqlx::query_as::<_, ProcessingOrder>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM processing_orders WHERE id = ?"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn list_orders(&self, states: &[OrderState]) -> Result<Vec<ProcessingOrder>, CoreError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(concat!(
            "SELECT ",
            order_columns!(),
            " FROM processing_orders WHERE state IN ("
        ));
        let mut separated = builder.separated(", ");
        for state in states {
            separated.push_bind(state.as_str());
        }
        separated.push_unseparated(") ORDER BY created_at, id");

        let orders = builder
            .build_query_as::<ProcessingOrder>()
            .fetch_all(&self.pool)
            .await?;

        Ok(orders)
    }

    async fn update_order(&self, order: &ProcessingOrder) -> Result<ProcessingOrder, CoreError> {
        let now = Utc::now();
        if cas_update_order(&self.pool, order, now).await? == 0 {
            return Err(self
                .lost_update("processing_orders", "order", &order.id, order.version)
                .await);
        }
        Ok(bumped_order(order, now))
    }

    async fn store_plan(
        &self,
        order: &ProcessingOrder,
        plan: &Plan,
    ) -> Result<ProcessingOrder, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if cas_update_order(&mut *tx, order, now).await? == 0 {
            tx.rollback().await?;
            return Err(self
                .lost_update("processing_orders", "order", &order.id, order.version)
                .await);
        }

        for job in &plan.jobs {
            sqlx::query(concat!(
                "INSERT INTO jobs (",
                job_columns!(),
                ") VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&job.id)
            .bind(&job.order_id)
            .bind(&job.facility)
            .bind(job.state.as_str())
            .bind(job.version)
            .bind(job.slice_index)
            .bind(job.start_time)
            .bind(job.stop_time)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for step in &plan.steps {
            sqlx::query(concat!(
                "INSERT INTO job_steps (",
                step_columns!(),
                ") VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&step.id)
            .bind(&step.job_id)
            .bind(&step.order_id)
            .bind(step.step_index)
            .bind(&step.product_class)
            .bind(&step.processor)
            .bind(step.state.as_str())
            .bind(step.version)
            .bind(step.retry_count)
            .bind(step.max_attempts)
            .bind(Json(&step.input_products))
            .bind(&step.execution_handle)
            .bind(&step.joborder_location)
            .bind(&step.diagnostic_kind)
            .bind(&step.diagnostic_code)
            .bind(&step.diagnostic_message)
            .bind(step.started_at)
            .bind(step.finished_at)
            .bind(step.created_at)
            .bind(step.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(bumped_order(order, now))
    }

    async fn discard_plan(&self, order: &ProcessingOrder) -> Result<ProcessingOrder, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if cas_update_order(&mut *tx, order, now).await? == 0 {
            tx.rollback().await?;
            return Err(self
                .lost_update("processing_orders", "order", &order.id, order.version)
                .await);
        }

        sqlx::query("DELETE FROM job_steps WHERE order_id = ?")
            .bind(&order.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE order_id = ?")
            .bind(&order.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(bumped_order(order, now))
    }

    async fn list_jobs(&self, order_id: &str) -> Result<Vec<Job>, CoreError> {
        let jobs = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE order_id = ? ORDER BY slice_index"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn update_job(&self, job: &Job) -> Result<Job, CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(now)
        .bind(&job.id)
        .bind(job.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost_update("jobs", "job", &job.id, job.version).await);
        }

        let mut stored = job.clone();
        stored.version += 1;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn get_job_step(&self, job_step_id: &str) -> Result<Option<JobStep>, CoreError> {
        let step = sqlx::query_as::<_, JobStep>(concat!(
            "SELECT ",
            step_columns!(),
            " FROM job_steps WHERE id = ?"
        ))
        .bind(job_step_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(step)
    }

    async fn list_job_steps(&self, order_id: &str) -> Result<Vec<JobStep>, CoreError> {
        let steps = sqlx::query_as::<_, JobStep>(
            r#"
            SELECT s.id, s.job_id, s.order_id, s.step_index, s.product_class, s.processor,
                   s.state, s.version, s.retry_count, s.max_attempts, s.input_products,
                   s.execution_handle, s.joborder_location, s.diagnostic_kind,
                   s.diagnostic_code, s.diagnostic_message, s.started_at, s.finished_at,
                   s.created_at, s.updated_at
            FROM job_steps s
            JOIN jobs j ON j.id = s.job_id
            WHERE s.order_id = ?
            ORDER BY j.slice_index, s.step_index
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(steps)
    }

    async fn update_job_step(&self, step: &JobStep) -> Result<JobStep, CoreError> {
        let now = Utc::now();
        if cas_update_step(&self.pool, step, now, None).await? == 0 {
            return Err(self
                .lost_update("job_steps", "job step", &step.id, step.version)
                .await);
        }
        Ok(bumped_step(step, now))
    }

    async fn update_job_step_guarded(
        &self,
        step: &JobStep,
        order_states: &[OrderState],
    ) -> Result<Option<JobStep>, CoreError> {
        if order_states.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        if cas_update_step(&self.pool, step, now, Some(order_states)).await? > 0 {
            return Ok(Some(bumped_step(step, now)));
        }

        let order_state: Option<String> = sqlx::query_scalar(
            "SELECT o.state FROM job_steps s JOIN processing_orders o ON o.id = s.order_id \
             WHERE s.id = ?",
        )
        .bind(&step.id)
        .fetch_optional(&self.pool)
        .await?;

        match order_state {
            Some(state) if !order_states.iter().any(|s| s.as_str() == state) => Ok(None),
            _ => Err(self
                .lost_update("job_steps", "job step", &step.id, step.version)
                .await),
        }
    }

    async fn count_job_steps(&self, order_id: &str) -> Result<StepCounts, CoreError> {
        // SQLite transactions are serializable, so a plain read transaction
        // already gives a consistent snapshot.
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM job_steps WHERE order_id = ? GROUP BY state",
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut counts = StepCounts::default();
        for (state, n) in rows {
            let state: JobStepState = state.parse().map_err(|e: crate::model::ParseStateError| {
                CoreError::DatabaseError {
                    operation: "count_job_steps".to_string(),
                    details: e.to_string(),
                }
            })?;
            counts.add(state, n);
        }
        Ok(counts)
    }

    async fn insert_product(&self, product: &Product) -> Result<bool, CoreError> {
        let result = sqlx::query(concat!(
            "INSERT INTO products (",
            product_columns!(),
            ") VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING"
        ))
        .bind(&product.id)
        .bind(&product.product_class)
        .bind(&product.mission_code)
        .bind(product.sensing_start)
        .bind(product.sensing_stop)
        .bind(product.generation_time)
        .bind(&product.file_name)
        .bind(&product.facility)
        .bind(&product.job_step_id)
        .bind(product.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_products(
        &self,
        mission_code: &str,
        product_class: &str,
        query: &ProductQuery,
    ) -> Result<Vec<Product>, CoreError> {
        let mut lookups = Vec::with_capacity(2);
        let select = || product_select(mission_code, product_class);

        match query {
            ProductQuery::Intersecting(window) => {
                let mut builder = select();
                builder
                    .push(" AND sensing_start < ")
                    .push_bind(window.stop)
                    .push(" AND sensing_stop > ")
                    .push_bind(window.start)
                    .push(" ORDER BY sensing_start, id");
                lookups.push(builder);
            }
            ProductQuery::NewestIntersecting(window) => {
                let mut builder = select();
                builder
                    .push(" AND sensing_start < ")
                    .push_bind(window.stop)
                    .push(" AND sensing_stop > ")
                    .push_bind(window.start)
                    .push(" ORDER BY generation_time DESC, id LIMIT 1");
                lookups.push(builder);
            }
            ProductQuery::NewestCovering(window) => {
                let mut builder = select();
                builder
                    .push(" AND sensing_start <= ")
                    .push_bind(window.start)
                    .push(" AND sensing_stop >= ")
                    .push_bind(window.stop)
                    .push(" ORDER BY generation_time DESC, id LIMIT 1");
                lookups.push(builder);
            }
            ProductQuery::LatestStart => {
                let mut builder = select();
                builder.push(" ORDER BY sensing_start DESC, generation_time DESC, id LIMIT 1");
                lookups.push(builder);
            }
            ProductQuery::NearestStart(at) => {
                let mut before = select();
                before
                    .push(" AND sensing_start <= ")
                    .push_bind(*at)
                    .push(" ORDER BY sensing_start DESC, generation_time DESC, id LIMIT 1");
                lookups.push(before);

                let mut after = select();
                after
                    .push(" AND sensing_start > ")
                    .push_bind(*at)
                    .push(" ORDER BY sensing_start, generation_time DESC, id LIMIT 1");
                lookups.push(after);
            }
        }

        let mut products = Vec::new();
        for mut builder in lookups {
            products.extend(
                builder
                    .build_query_as::<Product>()
                    .fetch_all(&self.pool)
                    .await?,
            );
        }
        Ok(products)
    }

    async fn get_products(&self, product_ids: &[String]) -> Result<Vec<Product>, CoreError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(concat!(
            "SELECT ",
            product_columns!(),
            " FROM products WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in product_ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") ORDER BY product_class, id");

        let products = builder
            .build_query_as::<Product>()
            .fetch_all(&self.pool)
            .await?;

        Ok(products)
    }

    async fn append_progress(&self, progress: &MonOrderProgress) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mon_order_progress (
                order_id, recorded_at, order_state, total_steps, waiting_steps,
                ready_steps, running_steps, completed_steps, failed_steps
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&progress.order_id)
        .bind(progress.recorded_at)
        .bind(progress.order_state.as_str())
        .bind(progress.total_steps)
        .bind(progress.waiting_steps)
        .bind(progress.ready_steps)
        .bind(progress.running_steps)
        .bind(progress.completed_steps)
        .bind(progress.failed_steps)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_progress(&self, order_id: &str) -> Result<Vec<MonOrderProgress>, CoreError> {
        let rows = sqlx::query_as::<_, MonOrderProgress>(
            r#"
            SELECT id, order_id, recorded_at, order_state, total_steps, waiting_steps,
                   ready_steps, running_steps, completed_steps, failed_steps
            FROM mon_order_progress
            WHERE order_id = ?
            ORDER BY id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn latest_progress(
        &self,
        order_id: &str,
    ) -> Result<Option<MonOrderProgress>, CoreError> {
        let row = sqlx::query_as::<_, MonOrderProgress>(
            r#"
            SELECT id, order_id, recorded_at, order_state, total_steps, waiting_steps,
                   ready_steps, running_steps, completed_steps, failed_steps
            FROM mon_order_progress
            WHERE order_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }

    async fn get_evictable_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM processing_orders
            WHERE state = 'CLOSED' AND eviction_time IS NOT NULL AND eviction_time <= ?
            ORDER BY eviction_time, id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn delete_orders_batch(&self, order_ids: &[String]) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for id in order_ids {
            for statement in [
                "DELETE FROM mon_order_progress WHERE order_id = ?",
                "DELETE FROM job_steps WHERE order_id = ?",
                "DELETE FROM jobs WHERE order_id = ?",
            ] {
                sqlx::query(statement).bind(id).execute(&mut *tx).await?;
            }
            deleted += sqlx::query("DELETE FROM processing_orders WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }
}

/// In-memory database with migrations applied.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MissionCatalog;
    use crate::lifecycle::StepTransition;
    use crate::model::{SensingWindow, SlicingType};
    use crate::planning::decompose;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    const CATALOG: &str = r#"{
        "mission_code": "S5P",
        "product_classes": [{"product_type": "L2_O3", "processor": "o3"}],
        "processors": [{"identifier": "o3", "processor_name": "O3", "version": "1", "image": "o3:1"}]
    }"#;

    fn new_order(state: OrderState) -> ProcessingOrder {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ProcessingOrder {
            id: Uuid::new_v4().to_string(),
            identifier: Uuid::new_v4().to_string(),
            mission_code: "S5P".to_string(),
            state,
            version: 0,
            start_time: start,
            stop_time: start + Duration::hours(12),
            slicing_type: SlicingType::TimeSlice,
            slice_duration_secs: Some(6 * 3600),
            slice_overlap_secs: 0,
            requested_product_classes: vec!["L2_O3".to_string()],
            facility: "localhost".to_string(),
            processing_mode: None,
            dynamic_parameters: BTreeMap::from([("k".to_string(), "v".to_string())]),
            tolerate_partial_failure: false,
            max_step_attempts: 3,
            state_message: None,
            diagnostic_kind: None,
            diagnostic_code: None,
            failed_job_step_id: None,
            created_at: start,
            updated_at: start,
            eviction_time: None,
        }
    }

    async fn planned(persistence: &SqlitePersistence) -> ProcessingOrder {
        let order = new_order(OrderState::Approved);
        persistence.insert_order(&order).await.unwrap();
        let catalog = MissionCatalog::from_json(CATALOG).unwrap();
        let plan = decompose(&order, &catalog, Utc::now()).unwrap();
        let next = order.transition(OrderState::Planned).unwrap();
        persistence.store_plan(&next, &plan).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_order() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = new_order(OrderState::Initial);
        persistence.insert_order(&order).await.unwrap();

        let loaded = persistence.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded, order);

        let duplicate = persistence.insert_order(&order).await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_versioned_order_update() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = new_order(OrderState::Initial);
        persistence.insert_order(&order).await.unwrap();

        let approved = order.transition(OrderState::Approved).unwrap();
        let stored = persistence.update_order(&approved).await.unwrap();
        assert_eq!(stored.version, 1);

        // Stale version
        let err = persistence.update_order(&approved).await.unwrap_err();
        assert!(err.is_conflict());

        let mut missing = stored.clone();
        missing.id = "nope".to_string();
        let err = persistence.update_order(&missing).await.unwrap_err();
        assert_eq!(err.error_code(), "ORDER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_store_plan_and_list_steps() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = planned(&persistence).await;
        assert_eq!(order.state, OrderState::Planned);

        let jobs = persistence.list_jobs(&order.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].slice_index, 1);

        let steps = persistence.list_job_steps(&order.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].job_id, jobs[0].id);

        let listed = persistence
            .list_orders(&[OrderState::Planned, OrderState::Released])
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let reset = order.transition(OrderState::Initial).unwrap();
        persistence.discard_plan(&reset).await.unwrap();
        assert!(persistence.list_job_steps(&order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_racing_step_writers_one_wins() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = planned(&persistence).await;
        let step = persistence.list_job_steps(&order.id).await.unwrap().remove(0);

        let writer_a = step
            .apply(StepTransition::InputsResolved {
                input_products: vec!["p-1".to_string()],
            })
            .unwrap();
        let writer_b = step.apply(StepTransition::AwaitInputs).unwrap();

        let (a, b) = tokio::join!(
            persistence.update_job_step(&writer_a),
            persistence.update_job_step(&writer_b)
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(loser.unwrap_err().is_conflict());

        let stored = persistence.get_job_step(&step.id).await.unwrap().unwrap();
        assert_eq!(stored.version, step.version + 1);
    }

    #[tokio::test]
    async fn test_products_are_idempotent_and_filtered() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let product = Product {
            id: "p-1".to_string(),
            product_class: "L1B".to_string(),
            mission_code: "S5P".to_string(),
            sensing_start: at,
            sensing_stop: at + Duration::hours(1),
            generation_time: at,
            file_name: "p-1.nc".to_string(),
            facility: "localhost".to_string(),
            job_step_id: None,
            created_at: at,
        };

        assert!(persistence.insert_product(&product).await.unwrap());
        assert!(!persistence.insert_product(&product).await.unwrap());

        let window = SensingWindow::new(at, at + Duration::hours(2));
        let query = ProductQuery::Intersecting(window);
        assert_eq!(
            persistence.find_products("S5P", "L1B", &query).await.unwrap().len(),
            1
        );
        assert!(
            persistence
                .find_products("S5P", "L2", &query)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            persistence.get_products(&["p-1".to_string()]).await.unwrap(),
            vec![product]
        );
    }

    fn catalogued(id: &str, start: u32, stop: u32, generated: u32) -> Product {
        let day = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Product {
            id: id.to_string(),
            product_class: "AUX".to_string(),
            mission_code: "S5P".to_string(),
            sensing_start: day + Duration::hours(start.into()),
            sensing_stop: day + Duration::hours(stop.into()),
            generation_time: day + Duration::days(1) + Duration::hours(generated.into()),
            file_name: format!("{}.nc", id),
            facility: "localhost".to_string(),
            job_step_id: None,
            created_at: day,
        }
    }

    async fn ids(persistence: &SqlitePersistence, query: ProductQuery) -> Vec<String> {
        persistence
            .find_products("S5P", "AUX", &query)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect()
    }

    #[tokio::test]
    async fn test_product_queries_are_bounded_by_window() {
        let persistence = SqlitePersistence::new(test_pool().await);
        for product in [
            catalogued("old", 0, 2, 1),
            catalogued("touching", 2, 4, 9),
            catalogued("inside", 5, 7, 3),
            catalogued("cover-a", 4, 10, 5),
            catalogued("cover-b", 3, 12, 5),
            catalogued("late", 20, 22, 0),
        ] {
            persistence.insert_product(&product).await.unwrap();
        }
        let day = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = SensingWindow::new(day + Duration::hours(4), day + Duration::hours(8));

        assert_eq!(
            ids(&persistence, ProductQuery::Intersecting(window)).await,
            vec!["cover-b", "cover-a", "inside"]
        );
        assert_eq!(
            ids(&persistence, ProductQuery::NewestIntersecting(window)).await,
            vec!["cover-a"]
        );
        assert_eq!(
            ids(&persistence, ProductQuery::NewestCovering(window)).await,
            vec!["cover-a"]
        );
        assert_eq!(ids(&persistence, ProductQuery::LatestStart).await, vec!["late"]);
        assert_eq!(
            ids(&persistence, ProductQuery::NearestStart(day + Duration::hours(13))).await,
            vec!["inside", "late"]
        );
        assert_eq!(
            ids(&persistence, ProductQuery::NearestStart(day + Duration::hours(30))).await,
            vec!["late"]
        );
    }

    #[tokio::test]
    async fn test_guarded_step_update_follows_order_state() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = planned(&persistence).await;
        let step = persistence.list_job_steps(&order.id).await.unwrap().remove(0);

        let waiting = step.apply(StepTransition::AwaitInputs).unwrap();
        let outcome = persistence
            .update_job_step_guarded(&waiting, &OrderState::ACCEPTING)
            .await
            .unwrap();
        assert!(outcome.is_none());
        let stored = persistence.get_job_step(&step.id).await.unwrap().unwrap();
        assert_eq!(stored.version, step.version);

        let released = persistence
            .update_order(&order.transition(OrderState::Released).unwrap())
            .await
            .unwrap();
        let written = persistence
            .update_job_step_guarded(&waiting, &OrderState::ACCEPTING)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.version, step.version + 1);

        // Stale version under an accepting order is a conflict.
        let err = persistence
            .update_job_step_guarded(&waiting, &OrderState::ACCEPTING)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(released.state, OrderState::Released);
    }

    #[tokio::test]
    async fn test_counts_and_progress() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = planned(&persistence).await;

        let counts = persistence.count_job_steps(&order.id).await.unwrap();
        assert_eq!(counts.initial, 2);
        assert_eq!(counts.total(), 2);

        let snapshot = counts.snapshot(&order.id, order.state, Utc::now());
        persistence.append_progress(&snapshot).await.unwrap();
        persistence.append_progress(&snapshot).await.unwrap();

        let progress = persistence.list_progress(&order.id).await.unwrap();
        assert_eq!(progress.len(), 2);
        assert!(progress[0].id < progress[1].id);
        assert_eq!(progress[0].waiting_steps, 2);

        let latest = persistence.latest_progress(&order.id).await.unwrap().unwrap();
        assert_eq!(latest.id, progress[1].id);
        assert!(latest.same_figures(&snapshot));
        assert!(persistence.latest_progress("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evictable_orders_are_deleted_with_children() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let order = planned(&persistence).await;

        let mut closed = order.clone();
        closed.state = OrderState::Closed;
        closed.eviction_time = Some(Utc::now() - Duration::hours(1));
        persistence.update_order(&closed).await.unwrap();

        let kept = planned(&persistence).await;

        let ids = persistence.get_evictable_orders(Utc::now(), 10).await.unwrap();
        assert_eq!(ids, vec![order.id.clone()]);

        assert_eq!(persistence.delete_orders_batch(&ids).await.unwrap(), 1);
        assert!(persistence.get_order(&order.id).await.unwrap().is_none());
        assert!(persistence.list_job_steps(&order.id).await.unwrap().is_empty());
        assert!(persistence.get_order(&kept.id).await.unwrap().is_some());
    }
}
