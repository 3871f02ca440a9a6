//! Database module for SeedWatch.
//!
//! One [`Store`] trait with SQLite, PostgreSQL and MySQL backends, each
//! carrying its own embedded migrations.

mod models;
mod mysql;
mod postgres;
mod rollup;
mod sqlite;
mod store;

pub use models::*;
pub use mysql::MysqlStore;
pub use postgres::PostgresStore;
pub use rollup::*;
pub use sqlite::{format_db_time, parse_db_time, SqliteStore};
pub use store::*;
