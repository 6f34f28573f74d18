//! SQL schema migrator: idempotent DDL application run once at
//! worker/CLI startup, ahead of any driver use.

use asynctasq_core::error::DriverError;

use super::schema::{MYSQL_SCHEMA, POSTGRES_SCHEMA};

fn statements(schema: &str) -> impl Iterator<Item = &str> {
    schema
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
}

#[cfg(feature = "sql-postgres")]
pub async fn migrate_postgres(pool: &sqlx::PgPool) -> Result<(), DriverError> {
    for statement in statements(POSTGRES_SCHEMA) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
    }
    Ok(())
}

#[cfg(feature = "sql-mysql")]
pub async fn migrate_mysql(pool: &sqlx::MySqlPool) -> Result<(), DriverError> {
    for statement in statements(MYSQL_SCHEMA) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_splits_and_trims_ddl_blocks() {
        let all: Vec<&str> = statements(POSTGRES_SCHEMA).collect();
        assert!(all.len() >= 3);
        assert!(all.iter().all(|s| !s.is_empty() && !s.ends_with(';')));
    }
}
