//! Row-locked SQL drivers sharing one schema shape across PostgreSQL and
//! MySQL.

pub mod migrator;
pub mod schema;

#[cfg(feature = "sql-postgres")]
pub mod postgres;
#[cfg(feature = "sql-mysql")]
pub mod mysql;

#[cfg(feature = "sql-postgres")]
pub use postgres::SqlPostgresDriver;
#[cfg(feature = "sql-mysql")]
pub use mysql::SqlMysqlDriver;
