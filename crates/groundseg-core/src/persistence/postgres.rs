// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence operations for PostgreSQL.
//!
//! Provides durable storage access for orders, jobs, job steps, products and
//! progress snapshots.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::CoreError;
use crate::model::{
    Job, JobStep, JobStepState, MonOrderProgress, OrderState, ProcessingOrder, Product,
    StepCounts,
};
use crate::planning::Plan;

use super::{Persistence, ProductQuery};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const ORDER_COLUMNS: &str = "id, identifier, mission_code, state, version, start_time, stop_time, \
     slicing_type, slice_duration_secs, slice_overlap_secs, requested_product_classes, facility, \
     processing_mode, dynamic_parameters, tolerate_partial_failure, max_step_attempts, \
     state_message, diagnostic_kind, diagnostic_code, failed_job_step_id, created_at, \
     updated_at, eviction_time";

const STEP_COLUMNS: &str = "id, job_id, order_id, step_index, product_class, processor, state, \
     version, retry_count, max_attempts, input_products, execution_handle, joborder_location, \
     diagnostic_kind, diagnostic_code, diagnostic_message, started_at, finished_at, created_at, \
     updated_at";

const PRODUCT_COLUMNS: &str = "id, product_class, mission_code, sensing_start, sensing_stop, \
     generation_time, file_name, facility, job_step_id, created_at";

// ============================================================================
// Versioned writes
// ============================================================================

/// Map a zero-row versioned update to `NotFound` or `Conflict`.
async fn lost_update(
    pool: &PgPool,
    table: &'static str,
    entity: &'static str,
    id: &str,
    expected_version: i64,
) -> CoreError {
    let exists = sqlx::query_scalar::<_, bool>(&format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
        table
    ))
    .bind(id)
    .fetch_one(pool)
    .await;

    match exists {
        Ok(false) => match entity {
            "order" => CoreError::OrderNotFound {
                order_id: id.to_string(),
            },
            "job" => CoreError::JobNotFound {
                job_id: id.to_string(),
            },
            _ => CoreError::JobStepNotFound {
                job_step_id: id.to_string(),
            },
        },
        Ok(true) => CoreError::Conflict {
            entity,
            id: id.to_string(),
            expected_version,
        },
        Err(e) => e.into(),
    }
}

async fn cas_update_order<'e, E>(
    executor: E,
    order: &ProcessingOrder,
    now: DateTime<Utc>,
) -> Result<u64, CoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE processing_orders
        SET state = $1, version = version + 1, start_time = $2, stop_time = $3,
            slicing_type = $4, slice_duration_secs = $5, slice_overlap_secs = $6,
            requested_product_classes = $7, facility = $8, processing_mode = $9,
            dynamic_parameters = $10, tolerate_partial_failure = $11, max_step_attempts = $12,
            state_message = $13, diagnostic_kind = $14, diagnostic_code = $15,
            failed_job_step_id = $16, updated_at = $17, eviction_time = $18
        WHERE id = $19 AND version = $20
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

fn bumped<T: Clone>(record: &T, bump: impl FnOnce(&mut T)) -> T {
    let mut stored = record.clone();
    bump(&mut stored);
    stored
}

// ============================================================================
// Order Operations
// ============================================================================

/// Insert a new order.
pub async fn insert_order(pool: &PgPool, order: &ProcessingOrder) -> Result<(), CoreError> {
    sqlx::query(&format!(
        "INSERT INTO processing_orders ({}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
          $19, $20, $21, $22, $23)",
        ORDER_COLUMNS
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
    .execute(pool)
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

/// Get an order by ID.
pub async fn get_order(pool: &PgPool, order_id: &str) -> Result<Option<ProcessingOrder>, CoreError> {
    let order = sqlx::query_as::<_, ProcessingOrder>(&format!(
        "SELECT {} FROM processing_orders WHERE id = $1",
        ORDER_COLUMNS
    ))
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    Ok(order)
}

/// List orders in any of the given states, oldest first.
pub async fn list_orders(
    pool: &PgPool,
    states: &[OrderState],
) -> Result<Vec<ProcessingOrder>, CoreError> {
    let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
    let orders = sqlx::query_as::<_, ProcessingOrder>(&format!(
        "SELECT {} FROM processing_orders WHERE state = ANY($1) ORDER BY created_at, id",
        ORDER_COLUMNS
    ))
    .bind(states)
    .fetch_all(pool)
    .await?;

    Ok(orders)
}

/// Versioned order update.
pub async fn update_order(
    pool: &PgPool,
    order: &ProcessingOrder,
) -> Result<ProcessingOrder, CoreError> {
    let now = Utc::now();
    if cas_update_order(pool, order, now).await? == 0 {
        return Err(lost_update(pool, "processing_orders", "order", &order.id, order.version).await);
    }
    Ok(bumped(order, |o| {
        o.version += 1;
        o.updated_at = now;
    }))
}

/// Versioned order update plus insertion of the plan, in one transaction.
pub async fn store_plan(
    pool: &PgPool,
    order: &ProcessingOrder,
    plan: &Plan,
) -> Result<ProcessingOrder, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    if cas_update_order(&mut *tx, order, now).await? == 0 {
        tx.rollback().await?;
        return Err(lost_update(pool, "processing_orders", "order", &order.id, order.version).await);
    }

    for job in &plan.jobs {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, order_id, facility, state, version, slice_index,
                              start_time, stop_time, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
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
        sqlx::query(&format!(
            "INSERT INTO job_steps ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
              $19, $20)",
            STEP_COLUMNS
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
    Ok(bumped(order, |o| {
        o.version += 1;
        o.updated_at = now;
    }))
}

/// Versioned order update plus removal of its jobs and steps.
pub async fn discard_plan(
    pool: &PgPool,
    order: &ProcessingOrder,
) -> Result<ProcessingOrder, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    if cas_update_order(&mut *tx, order, now).await? == 0 {
        tx.rollback().await?;
        return Err(lost_update(pool, "processing_orders", "order", &order.id, order.version).await);
    }

    // Steps go with their jobs.
    sqlx::query("DELETE FROM jobs WHERE order_id = $1")
        .bind(&order.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(bumped(order, |o| {
        o.version += 1;
        o.updated_at = now;
    }))
}

// ============================================================================
// Job and Job Step Operations
// ============================================================================

pub async fn list_jobs(pool: &PgPool, order_id: &str) -> Result<Vec<Job>, CoreError> {
    let jobs = sqlx::query_as::<_, Job>(
        r#"
        SELECT id, order_id, facility, state, version, slice_index, start_time, stop_time,
               created_at, updated_at
        FROM jobs
        WHERE order_id = $1
        ORDER BY slice_index
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;

    Ok(jobs)
}

pub async fn update_job(pool: &PgPool, job: &Job) -> Result<Job, CoreError> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET state = $1, version = version + 1, updated_at = $2
        WHERE id = $3 AND version = $4
        "#,
    )
    .bind(job.state.as_str())
    .bind(now)
    .bind(&job.id)
    .bind(job.version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(lost_update(pool, "jobs", "job", &job.id, job.version).await);
    }
    Ok(bumped(job, |j| {
        j.version += 1;
        j.updated_at = now;
    }))
}

pub async fn get_job_step(pool: &PgPool, job_step_id: &str) -> Result<Option<JobStep>, CoreError> {
    let step = sqlx::query_as::<_, JobStep>(&format!(
        "SELECT {} FROM job_steps WHERE id = $1",
        STEP_COLUMNS
    ))
    .bind(job_step_id)
    .fetch_optional(pool)
    .await?;

    Ok(step)
}

pub async fn list_job_steps(pool: &PgPool, order_id: &str) -> Result<Vec<JobStep>, CoreError> {
    let steps = sqlx::query_as::<_, JobStep>(
        r#"
        SELECT s.id, s.job_id, s.order_id, s.step_index, s.product_class, s.processor,
               s.state, s.version, s.retry_count, s.max_attempts, s.input_products,
               s.execution_handle, s.joborder_location, s.diagnostic_kind,
               s.diagnostic_code, s.diagnostic_message, s.started_at, s.finished_at,
               s.created_at, s.updated_at
        FROM job_steps s
        JOIN jobs j ON j.id = s.job_id
        WHERE s.order_id = $1
        ORDER BY j.slice_index, s.step_index
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;

    Ok(steps)
}

async fn cas_update_step<'e, E>(
    executor: E,
    step: &JobStep,
    now: DateTime<Utc>,
) -> Result<u64, CoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE job_steps
        SET state = $1, version = version + 1, retry_count = $2, max_attempts = $3,
            input_products = $4, execution_handle = $5, joborder_location = $6,
            diagnostic_kind = $7, diagnostic_code = $8, diagnostic_message = $9,
            started_at = $10, finished_at = $11, updated_at = $12
        WHERE id = $13 AND version = $14
        "#,
    )
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
    .bind(step.version)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

fn bumped_step(step: &JobStep, now: DateTime<Utc>) -> JobStep {
    bumped(step, |s| {
        s.version += 1;
        s.updated_at = now;
    })
}

pub async fn update_job_step(pool: &PgPool, step: &JobStep) -> Result<JobStep, CoreError> {
    let now = Utc::now();
    if cas_update_step(pool, step, now).await? == 0 {
        return Err(lost_update(pool, "job_steps", "job step", &step.id, step.version).await);
    }
    Ok(bumped_step(step, now))
}

/// Step update under a share lock on the order row, so an order state
/// change either lands before the check or waits for the commit.
pub async fn update_job_step_guarded(
    pool: &PgPool,
    step: &JobStep,
    order_states: &[OrderState],
) -> Result<Option<JobStep>, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let order_state: Option<String> =
        sqlx::query_scalar("SELECT state FROM processing_orders WHERE id = $1 FOR SHARE")
            .bind(&step.order_id)
            .fetch_optional(&mut *tx)
            .await?;
    let accepted = order_state
        .as_deref()
        .is_some_and(|state| order_states.iter().any(|s| s.as_str() == state));
    if !accepted {
        tx.rollback().await?;
        return Ok(None);
    }

    if cas_update_step(&mut *tx, step, now).await? == 0 {
        tx.rollback().await?;
        return Err(lost_update(pool, "job_steps", "job step", &step.id, step.version).await);
    }
    tx.commit().await?;
    Ok(Some(bumped_step(step, now)))
}

/// Per-state step counts from one repeatable-read snapshot.
pub async fn count_job_steps(pool: &PgPool, order_id: &str) -> Result<StepCounts, CoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await?;

    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM job_steps WHERE order_id = $1 GROUP BY state",
    )
    .bind(order_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    let mut counts = StepCounts::default();
    for (state, n) in rows {
        let state = state
            .parse::<JobStepState>()
            .map_err(|e| CoreError::DatabaseError {
                operation: "count_job_steps".to_string(),
                details: e.to_string(),
            })?;
        counts.add(state, n);
    }
    Ok(counts)
}

// ============================================================================
// Product Operations
// ============================================================================

pub async fn insert_product(pool: &PgPool, product: &Product) -> Result<bool, CoreError> {
    let result = sqlx::query(&format!(
        "INSERT INTO products ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (id) DO NOTHING",
        PRODUCT_COLUMNS
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
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn product_select<'a>(mission_code: &'a str, product_class: &'a str) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM products WHERE mission_code = ",
        PRODUCT_COLUMNS
    ));
    builder
        .push_bind(mission_code)
        .push(" AND product_class = ")
        .push_bind(product_class);
    builder
}

/// Products matching `query`. Every lookup is bounded by the index on
/// (mission_code, product_class, sensing_start) or by a LIMIT.
pub async fn find_products(
    pool: &PgPool,
    mission_code: &str,
    product_class: &str,
    query: &ProductQuery,
) -> Result<Vec<Product>, CoreError> {
    let select = || product_select(mission_code, product_class);
    let mut lookups = Vec::with_capacity(2);

    match query {
        ProductQuery::Intersecting(window) | ProductQuery::NewestIntersecting(window) => {
            let mut builder = select();
            builder
                .push(" AND sensing_start < ")
                .push_bind(window.stop)
                .push(" AND sensing_stop > ")
                .push_bind(window.start);
            if matches!(query, ProductQuery::Intersecting(_)) {
                builder.push(" ORDER BY sensing_start, id");
            } else {
                builder.push(" ORDER BY generation_time DESC, id LIMIT 1");
            }
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
        products.extend(builder.build_query_as::<Product>().fetch_all(pool).await?);
    }
    Ok(products)
}

pub async fn get_products(pool: &PgPool, product_ids: &[String]) -> Result<Vec<Product>, CoreError> {
    let products = sqlx::query_as::<_, Product>(&format!(
        "SELECT {} FROM products WHERE id = ANY($1) ORDER BY product_class, id",
        PRODUCT_COLUMNS
    ))
    .bind(product_ids)
    .fetch_all(pool)
    .await?;

    Ok(products)
}

// ============================================================================
// Progress Operations
// ============================================================================

pub async fn append_progress(pool: &PgPool, progress: &MonOrderProgress) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO mon_order_progress (
            order_id, recorded_at, order_state, total_steps, waiting_steps,
            ready_steps, running_steps, completed_steps, failed_steps
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_progress(
    pool: &PgPool,
    order_id: &str,
) -> Result<Vec<MonOrderProgress>, CoreError> {
    let rows = sqlx::query_as::<_, MonOrderProgress>(
        r#"
        SELECT id, order_id, recorded_at, order_state, total_steps, waiting_steps,
               ready_steps, running_steps, completed_steps, failed_steps
        FROM mon_order_progress
        WHERE order_id = $1
        ORDER BY id
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn latest_progress(
    pool: &PgPool,
    order_id: &str,
) -> Result<Option<MonOrderProgress>, CoreError> {
    let row = sqlx::query_as::<_, MonOrderProgress>(
        r#"
        SELECT id, order_id, recorded_at, order_state, total_steps, waiting_steps,
               ready_steps, running_steps, completed_steps, failed_steps
        FROM mon_order_progress
        WHERE order_id = $1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

// ============================================================================
// Health / Cleanup
// ============================================================================

pub async fn health_check(pool: &PgPool) -> Result<bool, CoreError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(true)
}

/// Closed orders past their eviction time.
pub async fn get_evictable_orders(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<String>, CoreError> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM processing_orders
        WHERE state = 'CLOSED' AND eviction_time IS NOT NULL AND eviction_time <= $1
        ORDER BY eviction_time, id
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Delete orders; jobs, steps and progress follow through `ON DELETE CASCADE`.
pub async fn delete_orders_batch(pool: &PgPool, order_ids: &[String]) -> Result<u64, CoreError> {
    if order_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query("DELETE FROM processing_orders WHERE id = ANY($1)")
        .bind(order_ids)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Persistence trait implementation
// ============================================================================

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_order(&self, order: &ProcessingOrder) -> Result<(), CoreError> {
        insert_order(&self.pool, order).await
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<ProcessingOrder>, CoreError> {
        get_order(&self.pool, order_id).await
    }

    async fn list_orders(&self, states: &[OrderState]) -> Result<Vec<ProcessingOrder>, CoreError> {
        list_orders(&self.pool, states).await
    }

    async fn update_order(&self, order: &ProcessingOrder) -> Result<ProcessingOrder, CoreError> {
        update_order(&self.pool, order).await
    }

    async fn store_plan(
        &self,
        order: &ProcessingOrder,
        plan: &Plan,
    ) -> Result<ProcessingOrder, CoreError> {
        store_plan(&self.pool, order, plan).await
    }

    async fn discard_plan(&self, order: &ProcessingOrder) -> Result<ProcessingOrder, CoreError> {
        discard_plan(&self.pool, order).await
    }

    async fn list_jobs(&self, order_id: &str) -> Result<Vec<Job>, CoreError> {
        list_jobs(&self.pool, order_id).await
    }

    async fn update_job(&self, job: &Job) -> Result<Job, CoreError> {
        update_job(&self.pool, job).await
    }

    async fn get_job_step(&self, job_step_id: &str) -> Result<Option<JobStep>, CoreError> {
        get_job_step(&self.pool, job_step_id).await
    }

    async fn list_job_steps(&self, order_id: &str) -> Result<Vec<JobStep>, CoreError> {
        list_job_steps(&self.pool, order_id).await
    }

    async fn update_job_step(&self, step: &JobStep) -> Result<JobStep, CoreError> {
        update_job_step(&self.pool, step).await
    }

    async fn update_job_step_guarded(
        &self,
        step: &JobStep,
        order_states: &[OrderState],
    ) -> Result<Option<JobStep>, CoreError> {
        update_job_step_guarded(&self.pool, step, order_states).await
    }

    async fn count_job_steps(&self, order_id: &str) -> Result<StepCounts, CoreError> {
        count_job_steps(&self.pool, order_id).await
    }

    async fn insert_product(&self, product: &Product) -> Result<bool, CoreError> {
        insert_product(&self.pool, product).await
    }

    async fn find_products(
        &self,
        mission_code: &str,
        product_class: &str,
        query: &ProductQuery,
    ) -> Result<Vec<Product>, CoreError> {
        find_products(&self.pool, mission_code, product_class, query).await
    }

    async fn get_products(&self, product_ids: &[String]) -> Result<Vec<Product>, CoreError> {
        get_products(&self.pool, product_ids).await
    }

    async fn append_progress(&self, progress: &MonOrderProgress) -> Result<(), CoreError> {
        append_progress(&self.pool, progress).await
    }

    async fn list_progress(&self, order_id: &str) -> Result<Vec<MonOrderProgress>, CoreError> {
        list_progress(&self.pool, order_id).await
    }

    async fn latest_progress(
        &self,
        order_id: &str,
    ) -> Result<Option<MonOrderProgress>, CoreError> {
        latest_progress(&self.pool, order_id).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check(&self.pool).await
    }

    async fn get_evictable_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        get_evictable_orders(&self.pool, now, limit).await
    }

    async fn delete_orders_batch(&self, order_ids: &[String]) -> Result<u64, CoreError> {
        delete_orders_batch(&self.pool, order_ids).await
    }
}
