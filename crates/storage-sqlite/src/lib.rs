//! SQLite persistence for Calibra client state.

pub mod db;
pub mod errors;
pub mod schema;
pub mod session_store;

pub use db::{create_pool, get_connection, init, run_migrations, DbConnection, DbPool};
pub use errors::StorageError;
pub use session_store::SqliteSecretStore;
