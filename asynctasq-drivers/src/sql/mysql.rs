//! MySQL row-locked queue driver. Same fetch contract as the PostgreSQL driver; MySQL lacks
//! `= ANY(array)` and `array_position`, so the queue list is spliced in via
//! `QueryBuilder` and priority falls back to `FIELD(queue, ...)`.

use std::time::Duration;

use asynctasq_core::driver::{DeliveryHandle, Delivery, Driver, QueueDepth};
use asynctasq_core::envelope::TaskEnvelope;
use asynctasq_core::error::DriverError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, QueryBuilder, Row};
use uuid::Uuid;

use super::migrator::migrate_mysql;

#[derive(Clone)]
struct SqlHandle {
    id: Uuid,
    worker_id: String,
}

pub struct SqlMysqlDriver {
    pool: MySqlPool,
    worker_id: String,
    visibility_timeout: Duration,
    keep_completed_tasks: bool,
}

impl SqlMysqlDriver {
    pub async fn connect(
        database_url: &str,
        visibility_timeout: Duration,
        keep_completed_tasks: bool,
    ) -> Result<Self, DriverError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        migrate_mysql(&pool).await?;
        Ok(SqlMysqlDriver {
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

fn push_in_list<'a>(builder: &mut QueryBuilder<'a, sqlx::MySql>, queues: &'a [String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for queue in queues {
        separated.push_bind(queue);
    }
    builder.push(")");
}

#[async_trait]
impl Driver for SqlMysqlDriver {
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
             VALUES (?, ?, ?, 'pending', 0, ?, ?, now(), now())",
        )
        .bind(envelope.id.to_string())
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

            let mut select = QueryBuilder::new(
                "SELECT id FROM task_queue WHERE queue IN ",
            );
            push_in_list(&mut select, queues);
            select.push(
                " AND (status = 'pending' OR (status = 'processing' AND locked_until < now())) \
                  AND available_at <= now() ORDER BY FIELD(queue, ",
            );
            {
                let mut separated = select.separated(", ");
                for queue in queues {
                    separated.push_bind(queue);
                }
            }
            select.push("), available_at LIMIT ");
            select.push_bind(max_batch as i64);
            select.push(" FOR UPDATE SKIP LOCKED");

            let candidate_rows = select
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| DriverError::Other(e.into()))?;

            let ids: Vec<String> = candidate_rows
                .iter()
                .map(|row| row.get::<String, _>("id"))
                .collect();

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

            let mut update = QueryBuilder::new("UPDATE task_queue SET status = 'processing', locked_until = ");
            update.push_bind(locked_until);
            update.push(", worker_id = ");
            update.push_bind(&self.worker_id);
            update.push(", current_attempt = current_attempt + 1, updated_at = now() WHERE id IN ");
            push_in_list(&mut update, &ids);
            update
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| DriverError::Other(e.into()))?;

            let mut select_updated = QueryBuilder::new(
                "SELECT id, payload, current_attempt FROM task_queue WHERE id IN ",
            );
            push_in_list(&mut select_updated, &ids);
            let updated_rows = select_updated
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| DriverError::Other(e.into()))?;

            tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;

            let deliveries = updated_rows
                .into_iter()
                .map(|row| {
                    let id: String = row.get("id");
                    let payload: Vec<u8> = row.get("payload");
                    let current_attempt: i32 = row.get("current_attempt");
                    Delivery {
                        handle: DeliveryHandle::new(
                            "sql-mysql",
                            SqlHandle {
                                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
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
            sqlx::query("UPDATE task_queue SET status = 'completed', updated_at = now() WHERE id = ? AND worker_id = ?")
                .bind(h.id.to_string())
                .bind(&h.worker_id)
                .execute(&self.pool)
                .await
        } else {
            sqlx::query("DELETE FROM task_queue WHERE id = ? AND worker_id = ?")
                .bind(h.id.to_string())
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
            "UPDATE task_queue SET status = 'pending', available_at = ?, locked_until = NULL, worker_id = NULL \
             WHERE id = ? AND worker_id = ?",
        )
        .bind(available_at)
        .bind(h.id.to_string())
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
                    locked_until, worker_id, last_error, created_at \
             FROM task_queue WHERE id = ? AND worker_id = ? FOR UPDATE",
        )
        .bind(h.id.to_string())
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
             VALUES (?, ?, ?, 'failed', ?, ?, ?, ?, ?, ?, ?, now(), ?, ?)",
        )
        .bind(h.id.to_string())
        .bind(row.get::<String, _>("queue"))
        .bind(row.get::<Vec<u8>, _>("payload"))
        .bind(current_attempt)
        .bind(row.get::<i32, _>("max_attempts"))
        .bind(row.get::<chrono::DateTime<Utc>, _>("available_at"))
        .bind(row.get::<Option<chrono::DateTime<Utc>>, _>("locked_until"))
        .bind(row.get::<Option<String>, _>("worker_id"))
        .bind(row.get::<Option<String>, _>("last_error"))
        .bind(row.get::<chrono::DateTime<Utc>, _>("created_at"))
        .bind(current_attempt)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;

        sqlx::query("DELETE FROM task_queue WHERE id = ?")
            .bind(h.id.to_string())
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
            "UPDATE task_queue SET locked_until = ? WHERE id = ? AND worker_id = ? AND status = 'processing'",
        )
        .bind(locked_until)
        .bind(h.id.to_string())
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
        let row = sqlx::query("SELECT count(*) AS n FROM task_queue WHERE queue = ? AND status = 'pending'")
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
