//! SQLite-backed user registry.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// bcrypt work factor for stored passwords.
pub const HASH_COST: u32 = 10;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    password TEXT NOT NULL,
    phone TEXT
)";

#[derive(Error, Debug)]
pub enum UserStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("username {0:?} already exists")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// bcrypt hash, never the plain password.
    pub password_hash: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub phone: Option<String>,
}

/// Shared handle to the user table. Calls block; run them off the async
/// runtime.
#[derive(Clone)]
pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
    cost: u32,
}

impl UserStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UserStoreError> {
        Self::with_connection(Connection::open(path)?, HASH_COST)
    }

    /// Lower `cost` keeps tests fast.
    pub fn with_connection(conn: Connection, cost: u32) -> Result<Self, UserStoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cost,
        })
    }

    pub fn find_user_by_name(&self, username: &str) -> Result<Option<User>, UserStoreError> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, username, email, password, phone FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        password_hash: row.get(3)?,
                        phone: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn create_user(&self, new: NewUser) -> Result<User, UserStoreError> {
        if self.find_user_by_name(&new.username)?.is_some() {
            return Err(UserStoreError::Duplicate(new.username));
        }
        let password_hash = bcrypt::hash(&new.password, self.cost)?;

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO users (username, email, password, phone) VALUES (?1, ?2, ?3, ?4)",
            params![new.username, new.email, password_hash, new.phone],
        );
        match inserted {
            Ok(_) => {}
            // Lost a race with a concurrent registration of the same name.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(UserStoreError::Duplicate(new.username));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(User {
            id: conn.last_insert_rowid(),
            username: new.username,
            email: new.email,
            password_hash,
            phone: new.phone,
        })
    }

    pub fn verify_password(&self, user: &User, candidate: &str) -> Result<bool, UserStoreError> {
        Ok(bcrypt::verify(candidate, &user.password_hash)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> UserStore {
        UserStore::with_connection(Connection::open_in_memory().unwrap(), 4).unwrap()
    }

    fn alice() -> NewUser {
        NewUser {
            username: "alice".into(),
            email: "alice@example.com".into(),
            password: "hunter2".into(),
            phone: None,
        }
    }

    #[test]
    fn create_then_find() {
        let store = store();
        let created = store.create_user(alice()).unwrap();
        assert_ne!(created.password_hash, "hunter2");

        let found = store.find_user_by_name("alice").unwrap().unwrap();
        assert_eq!(found, created);
        assert!(store.find_user_by_name("bob").unwrap().is_none());
    }

    #[test]
    fn duplicate_username_rejected() {
        let store = store();
        store.create_user(alice()).unwrap();
        assert!(matches!(
            store.create_user(alice()),
            Err(UserStoreError::Duplicate(name)) if name == "alice"
        ));
    }

    #[test]
    fn password_verification() {
        let store = store();
        let user = store.create_user(alice()).unwrap();
        assert!(store.verify_password(&user, "hunter2").unwrap());
        assert!(!store.verify_password(&user, "hunter3").unwrap());
    }

    #[test]
    fn corrupt_hash_is_an_error() {
        let store = store();
        let mut user = store.create_user(alice()).unwrap();
        user.password_hash = "not-a-hash".into();
        assert!(matches!(
            store.verify_password(&user, "hunter2"),
            Err(UserStoreError::Hash(_))
        ));
    }

    #[test]
    fn users_persist_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        {
            let store = UserStore::with_connection(Connection::open(&path).unwrap(), 4).unwrap();
            store.create_user(alice()).unwrap();
        }
        let reopened = UserStore::open(&path).unwrap();
        assert!(reopened.find_user_by_name("alice").unwrap().is_some());
    }
}
