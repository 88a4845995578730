use std::path::Path;
use std::sync::Arc;

use calibra_core::secrets::SecretStore;
use calibra_core::Result;
use chrono::Utc;
use diesel::prelude::*;
use log::debug;

use super::model::SessionSecretDB;
use crate::db::{self, get_connection, DbPool};
use crate::errors::StorageError;
use crate::schema::session_store;

/// [`SecretStore`] backed by the `session_store` table.
pub struct SqliteSecretStore {
    pool: Arc<DbPool>,
}

impl SqliteSecretStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        SqliteSecretStore { pool }
    }

    /// Opens (and migrates) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(db::init(db_path)?))
    }
}

impl SecretStore for SqliteSecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let mut conn = get_connection(&self.pool)?;
        let value = session_store::table
            .find(key)
            .select(session_store::value)
            .first::<String>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(value)
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        let row = SessionSecretDB {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now().to_rfc3339(),
        };
        diesel::replace_into(session_store::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        debug!("[Store] Saved {}", key);
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        diesel::delete(session_store::table.find(key))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calibra_core::secrets::{ACCESS_TOKEN_KEY, REDIRECT_PATH_KEY, REFRESH_TOKEN_KEY};
    use tempfile::tempdir;

    #[test]
    fn set_get_delete_round() {
        let dir = tempdir().unwrap();
        let store = SqliteSecretStore::open(&dir.path().join("session.db")).unwrap();

        assert_eq!(store.get_secret(ACCESS_TOKEN_KEY).unwrap(), None);
        store.set_secret(ACCESS_TOKEN_KEY, "a1").unwrap();
        store.set_secret(ACCESS_TOKEN_KEY, "a2").unwrap();
        assert_eq!(store.get_secret(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("a2"));

        store.delete_secret(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(store.get_secret(ACCESS_TOKEN_KEY).unwrap(), None);
        store.delete_secret(ACCESS_TOKEN_KEY).unwrap();
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile").join("session.db");
        {
            let store = SqliteSecretStore::open(&path).unwrap();
            store.set_secret(REFRESH_TOKEN_KEY, "r1").unwrap();
            store.set_secret(REDIRECT_PATH_KEY, "/records/42").unwrap();
        }

        let reopened = SqliteSecretStore::open(&path).unwrap();
        assert_eq!(reopened.get_secret(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("r1"));
        assert_eq!(
            reopened.get_secret(REDIRECT_PATH_KEY).unwrap().as_deref(),
            Some("/records/42")
        );
    }

    #[test]
    fn usable_as_trait_object() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SecretStore> =
            Arc::new(SqliteSecretStore::open(&dir.path().join("session.db")).unwrap());
        store.set_secret("k", "v").unwrap();
        assert_eq!(store.get_secret("k").unwrap().as_deref(), Some("v"));
    }
}
