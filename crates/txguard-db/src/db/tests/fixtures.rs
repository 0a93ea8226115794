//! Test fixtures for the transaction layer.
//!
//! Provides an in-memory connection manager whose connections stage writes
//! until commit, record every transactional call, and can be told to fail
//! at connect, begin, commit, or rollback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diesel::r2d2::ManageConnection;
use diesel::result::{DatabaseErrorKind, Error as DieselError, QueryResult};
use txguard_core::config::PoolConfig;

use crate::db::connection::{GuardedManager, TransactionalConnection};
use crate::db::pool::ConnectionPool;

pub type FakePool = ConnectionPool<GuardedManager<FakeManager>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected(usize),
    Begin(usize),
    Commit(usize),
    Rollback(usize),
    Closed(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Default)]
struct State {
    books: Vec<Book>,
    last_book_id: i64,
    last_connection_id: usize,
    events: Vec<Event>,
    fail_connect: bool,
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
    fail_restore: bool,
}

/// Shared storage behind every fake connection.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: Event) {
        self.lock().events.push(event);
    }

    pub fn books(&self) -> Vec<Book> {
        self.lock().books.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.lock().fail_begin = fail;
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.lock().fail_commit = fail;
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.lock().fail_rollback = fail;
    }

    /// Makes re-enabling auto-commit fail, leaving the connection in its transaction.
    pub fn set_fail_restore(&self, fail: bool) {
        self.lock().fail_restore = fail;
    }

    pub fn manager(&self) -> GuardedManager<FakeManager> {
        GuardedManager::new(FakeManager { db: self.clone() })
    }

    pub fn pool(&self, max_size: u32) -> FakePool {
        ConnectionPool::new(self.manager(), &pool_config(max_size))
            .expect("fake pool should build")
    }
}

/// Pool settings sized for tests: no idle connections kept warm and a short
/// acquisition timeout so exhaustion is detected quickly.
pub fn pool_config(max_size: u32) -> PoolConfig {
    PoolConfig {
        max_size,
        min_idle: 0,
        connection_timeout_ms: 200,
        ..PoolConfig::default()
    }
}

pub fn driver_error(message: &str) -> DieselError {
    DieselError::DatabaseError(DatabaseErrorKind::Unknown, Box::new(message.to_string()))
}

#[derive(Debug)]
pub struct FakeConnection {
    id: usize,
    db: FakeDatabase,
    in_transaction: bool,
    pending: Vec<Book>,
}

impl FakeConnection {
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Inserts a book and returns its generated id. Outside a transaction the
    /// row is visible immediately.
    pub fn insert_book(&mut self, title: &str) -> QueryResult<i64> {
        let mut state = self.db.lock();
        state.last_book_id += 1;
        let book = Book {
            id: state.last_book_id,
            title: title.to_string(),
        };

        if self.in_transaction {
            self.pending.push(book.clone());
        } else {
            state.books.push(book.clone());
        }

        Ok(book.id)
    }

    fn publish_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.db.lock().books.extend(pending);
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.db.record(Event::Closed(self.id));
    }
}

impl TransactionalConnection for FakeConnection {
    fn auto_commit(&mut self) -> QueryResult<bool> {
        Ok(!self.in_transaction)
    }

    fn set_auto_commit(&mut self, enabled: bool) -> QueryResult<()> {
        if enabled {
            if self.db.lock().fail_restore {
                return Err(driver_error("cannot enable auto-commit"));
            }
            if self.in_transaction {
                self.publish_pending();
                self.in_transaction = false;
            }
            return Ok(());
        }

        if self.db.lock().fail_begin {
            return Err(driver_error("cannot disable auto-commit"));
        }
        if !self.in_transaction {
            self.in_transaction = true;
            self.db.record(Event::Begin(self.id));
        }
        Ok(())
    }

    fn commit(&mut self) -> QueryResult<()> {
        self.db.record(Event::Commit(self.id));
        if self.db.lock().fail_commit {
            return Err(driver_error("could not serialize access"));
        }
        self.publish_pending();
        Ok(())
    }

    fn rollback(&mut self) -> QueryResult<()> {
        self.db.record(Event::Rollback(self.id));
        if self.db.lock().fail_rollback {
            return Err(driver_error("server closed the connection unexpectedly"));
        }
        self.pending.clear();
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("could not connect to the fake database")]
pub struct FakeConnectError;

#[derive(Debug)]
pub struct FakeManager {
    db: FakeDatabase,
}

impl ManageConnection for FakeManager {
    type Connection = FakeConnection;
    type Error = FakeConnectError;

    fn connect(&self) -> Result<FakeConnection, FakeConnectError> {
        let id = {
            let mut state = self.db.lock();
            if state.fail_connect {
                return Err(FakeConnectError);
            }
            state.last_connection_id += 1;
            let id = state.last_connection_id;
            state.events.push(Event::Connected(id));
            id
        };

        Ok(FakeConnection {
            id,
            db: self.db.clone(),
            in_transaction: false,
            pending: Vec::new(),
        })
    }

    fn is_valid(&self, _conn: &mut FakeConnection) -> Result<(), FakeConnectError> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut FakeConnection) -> bool {
        false
    }
}
