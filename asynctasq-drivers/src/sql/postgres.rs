//! PostgreSQL row-locked queue driver. At-least-once delivery falls out of `locked_until` expiry:
//! any `processing` row whose lease has elapsed is eligible for `fetch`
//! again, so crash recovery needs no separate sweep.

use std::time::Duration;

use asynctasq_core::driver::{DeliveryHandle, Delivery, Driver, QueueDepth};
use asynctasq_core::envelope::TaskEnvelope;
use asynctasq_core::error::DriverError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::migrator::migrate_postgres;

#[derive(Clone)]
struct SqlHandle {
    id: Uuid,
    worker_id: String,
}

pub struct SqlPostgresDriver {
    pool: PgPool,
    worker_id: String,
    visibility_timeout: Duration,
    keep_completed_tasks: bool,
}

impl SqlPostgresDriver {
    pub async fn connect(
        database_url: &str,
        visibility_timeout: Duration,
        keep_completed_tasks: bool,
    ) -> Result<Self, DriverError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        migrate_postgres(&pool).await?;
        Ok(SqlPostgresDriver {
            pool,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            visibility_timeout,
            keep_completed_tasks,
        })
    }

    fn to_chrono(duration: Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
    }
}

#[async_trait]
impl Driver for SqlPostgresDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn enqueue(
        &self,
        queue: &str,
        envelope_bytes: Vec<u8>,
        delay: Duration,
    ) -> Result<(), DriverError> {
        let envelope = TaskEnvelope::decode(&envelope_bytes)?;
        let available_at = Utc::now() + Self::to_chrono(delay);
        sqlx::query(
            "INSERT INTO task_queue \
             (id, queue, payload, status, current_attempt, max_attempts, available_at, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', 0, $4, $5, now(), now())",
        )
        .bind(envelope.id)
        .bind(queue)
        .bind(envelope_bytes)
        .bind(envelope.max_attempts as i32)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn fetch(
        &self,
        queues: &[String],
        max_batch: usize,
        wait_deadline: Duration,
    ) -> Result<Vec<Delivery>, DriverError> {
        let deadline = tokio::time::Instant::now() + wait_deadline;

        loop {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DriverError::Other(e.into()))?;

            let candidate_rows = sqlx::query(
                "SELECT id FROM task_queue \
                 WHERE queue = ANY($1) \
                   AND (status = 'pending' OR (status = 'processing' AND locked_until < now())) \
                   AND available_at <= now() \
                 ORDER BY array_position($1::text[], queue), available_at \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(queues)
            .bind(max_batch as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

            let ids: Vec<Uuid> = candidate_rows.iter().map(|row| row.get("id")).collect();

            if ids.is_empty() {
                tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;
                if tokio::time::Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
                let remaining = deadline - tokio::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(100).min(remaining)).await;
                continue;
            }

            let locked_until = Utc::now() + Self::to_chrono(self.visibility_timeout);
            let updated_rows = sqlx::query(
                "UPDATE task_queue \
                 SET status = 'processing', locked_until = $1, worker_id = $2, \
                     current_attempt = current_attempt + 1, updated_at = now() \
                 WHERE id = ANY($3) \
                 RETURNING id, payload, current_attempt",
            )
            .bind(locked_until)
            .bind(&self.worker_id)
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

            tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;

            let deliveries = updated_rows
                .into_iter()
                .map(|row| {
                    let id: Uuid = row.get("id");
                    let payload: Vec<u8> = row.get("payload");
                    let current_attempt: i32 = row.get("current_attempt");
                    Delivery {
                        handle: DeliveryHandle::new(
                            "sql-postgres",
                            SqlHandle {
                                id,
                                worker_id: self.worker_id.clone(),
                            },
                        ),
                        envelope_bytes: payload,
                        delivery_attempt: current_attempt as u32,
                    }
                })
                .collect();
            return Ok(deliveries);
        }
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), DriverError> {
        let h = handle.downcast_ref::<SqlHandle>().ok_or(DriverError::LeaseLost)?;
        let affected = if self.keep_completed_tasks {
            sqlx::query(
                "UPDATE task_queue SET status = 'completed', updated_at = now() \
                 WHERE id = $1 AND worker_id = $2",
            )
            .bind(h.id)
            .bind(&h.worker_id)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query("DELETE FROM task_queue WHERE id = $1 AND worker_id = $2")
                .bind(h.id)
                .bind(&h.worker_id)
                .execute(&self.pool)
                .await
        }
        .map_err(|e| DriverError::Other(e.into()))?
        .rows_affected();

        if affected == 0 {
            return Err(DriverError::LeaseLost);
        }
        Ok(())
    }

    async fn nack(
        &self,
        handle: &DeliveryHandle,
        _envelope_bytes: &[u8],
        requeue_after: Option<Duration>,
    ) -> Result<(), DriverError> {
        // `current_attempt` already advanced server-side when this row was
        // claimed; the payload column is left untouched.
        let h = handle.downcast_ref::<SqlHandle>().ok_or(DriverError::LeaseLost)?;
        let delay = requeue_after.unwrap_or(Duration::ZERO);
        let available_at = Utc::now() + Self::to_chrono(delay);
        let affected = sqlx::query(
            "UPDATE task_queue \
             SET status = 'pending', available_at = $1, locked_until = NULL, worker_id = NULL \
             WHERE id = $2 AND worker_id = $3",
        )
        .bind(available_at)
        .bind(h.id)
        .bind(&h.worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| DriverError::Other(e.into()))?
        .rows_affected();

        if affected == 0 {
            return Err(DriverError::LeaseLost);
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, reason: &str) -> Result<(), DriverError> {
        let h = handle.downcast_ref::<SqlHandle>().ok_or(DriverError::LeaseLost)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        let row = sqlx::query(
            "SELECT queue, payload, status, current_attempt, max_attempts, available_at, \
                    locked_until, worker_id, last_error, created_at, updated_at \
             FROM task_queue WHERE id = $1 AND worker_id = $2 FOR UPDATE",
        )
        .bind(h.id)
        .bind(&h.worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| DriverError::Other(e.into()))?
        .ok_or(DriverError::LeaseLost)?;

        let current_attempt: i32 = row.get("current_attempt");
        sqlx::query(
            "INSERT INTO dead_letter_queue \
             (id, queue, payload, status, current_attempt, max_attempts, available_at, \
              locked_until, worker_id, last_error, created_at, updated_at, attempts, final_error) \
             VALUES ($1, $2, $3, 'failed', $4, $5, $6, $7, $8, $9, $10, now(), $4, $11)",
        )
        .bind(h.id)
        .bind(row.get::<String, _>("queue"))
        .bind(row.get::<Vec<u8>, _>("payload"))
        .bind(current_attempt)
        .bind(row.get::<i32, _>("max_attempts"))
        .bind(row.get::<chrono::DateTime<Utc>, _>("available_at"))
        .bind(row.get::<Option<chrono::DateTime<Utc>>, _>("locked_until"))
        .bind(row.get::<Option<String>, _>("worker_id"))
        .bind(row.get::<Option<String>, _>("last_error"))
        .bind(row.get::<chrono::DateTime<Utc>, _>("created_at"))
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;

        sqlx::query("DELETE FROM task_queue WHERE id = $1")
            .bind(h.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        handle: &DeliveryHandle,
        additional: Duration,
    ) -> Result<DeliveryHandle, DriverError> {
        let h = handle.downcast_ref::<SqlHandle>().ok_or(DriverError::LeaseLost)?;
        let locked_until = Utc::now() + Self::to_chrono(additional);
        let affected = sqlx::query(
            "UPDATE task_queue SET locked_until = $1 \
             WHERE id = $2 AND worker_id = $3 AND status = 'processing'",
        )
        .bind(locked_until)
        .bind(h.id)
        .bind(&h.worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| DriverError::Other(e.into()))?
        .rows_affected();

        if affected == 0 {
            return Err(DriverError::LeaseLost);
        }
        Ok(handle.clone())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, DriverError> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM task_queue WHERE queue = $1 AND status = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;
        let count: i64 = row.get("n");
        Ok(QueueDepth {
            count: count as u64,
            approximate: false,
        })
    }

    fn requires_lease_renewal(&self) -> bool {
        true
    }
}
