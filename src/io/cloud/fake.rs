//! Fake implementations for testing.
//!
//! These implementations use in-memory data structures to simulate the storage,
//! database, queue and secrets collaborators, making them ideal for unit testing
//! without external dependencies.

use crate::io::cloud::traits::{
    CloudIOError, CloudResult, DatabaseIO, ErrorKind, ObjectIO, ObjectMetadata, QueueIO,
    QueueMessage, Row, SecretsIO, Transaction,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

// Type aliases for complex nested types
type BucketStorage = Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>;
type StatementLog = Arc<Mutex<Vec<(String, Vec<String>)>>>;
type QueryHandler = Arc<dyn Fn(&str, &[String]) -> Vec<Row> + Send + Sync>;

// ============================================================================
// FakeObjectIO
// ============================================================================

#[derive(Clone, Default)]
pub struct FakeObjectIO {
    storage: BucketStorage,
    failing_puts: Arc<Mutex<Vec<String>>>,
}

impl FakeObjectIO {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put_object` whose key contains `fragment` fail.
    ///
    /// # Panics
    ///
    /// Panics if the mutex protecting the failure list is poisoned.
    pub fn fail_puts_matching(&self, fragment: &str) {
        self.failing_puts
            .lock()
            .expect("failing_puts mutex poisoned")
            .push(fragment.to_string());
    }

    /// Keys stored in `bucket`, sorted.
    ///
    /// # Panics
    ///
    /// Panics if the mutex protecting the storage is poisoned.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let storage = self.storage.lock().expect("storage mutex poisoned");
        let mut keys: Vec<String> = storage
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        drop(storage);
        keys.sort();
        keys
    }
}

impl ObjectIO for FakeObjectIO {
    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> CloudResult<()> {
        let failing = self
            .failing_puts
            .lock()
            .expect("failing_puts mutex poisoned")
            .iter()
            .any(|fragment| key.contains(fragment.as_str()));
        if failing {
            return Err(CloudIOError::new(
                ErrorKind::ServiceUnavailable,
                format!("Injected failure writing {bucket}/{key}"),
            ));
        }
        self.storage
            .lock()
            .expect("storage mutex poisoned")
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Vec<u8>> {
        let storage = self.storage.lock().expect("storage mutex poisoned");
        storage
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| {
                CloudIOError::new(
                    ErrorKind::NotFound,
                    format!("Object {bucket}/{key} not found"),
                )
            })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        if let Some(bucket_map) = self
            .storage
            .lock()
            .expect("storage mutex poisoned")
            .get_mut(bucket)
        {
            bucket_map.remove(key);
        }
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> CloudResult<Vec<ObjectMetadata>> {
        let storage = self.storage.lock().expect("storage mutex poisoned");
        let bucket_map = storage.get(bucket).ok_or_else(|| {
            CloudIOError::new(ErrorKind::NotFound, format!("Bucket {bucket} not found"))
        })?;

        let mut objects: Vec<ObjectMetadata> = bucket_map
            .keys()
            .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
            .map(|key| ObjectMetadata { key: key.clone() })
            .collect();

        drop(storage);
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool> {
        let storage = self.storage.lock().expect("storage mutex poisoned");
        Ok(storage.get(bucket).is_some_and(|b| b.contains_key(key)))
    }
}

// ============================================================================
// FakeDatabaseIO
// ============================================================================

/// Journaling fake of a relational store.
///
/// Statements executed outside a transaction land in the journal immediately;
/// statements executed inside a transaction land there only on commit. Queries
/// are answered by an optional handler, and `execute` reports
/// `rows_affected` (default 1) for every statement.
#[derive(Clone)]
pub struct FakeDatabaseIO {
    journal: StatementLog,
    commits: Arc<Mutex<u64>>,
    rollbacks: Arc<Mutex<u64>>,
    rows_affected: Arc<Mutex<u64>>,
    handler: Arc<Mutex<Option<QueryHandler>>>,
}

impl FakeDatabaseIO {
    #[must_use]
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            commits: Arc::new(Mutex::new(0)),
            rollbacks: Arc::new(Mutex::new(0)),
            rows_affected: Arc::new(Mutex::new(1)),
            handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Answer every query with the rows produced by `handler`.
    ///
    /// # Panics
    ///
    /// Panics if the handler mutex is poisoned.
    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(&str, &[String]) -> Vec<Row> + Send + Sync + 'static,
    {
        *self.handler.lock().expect("handler mutex poisoned") = Some(Arc::new(handler));
    }

    /// Set the row count reported by every subsequent `execute`.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn set_rows_affected(&self, rows: u64) {
        *self.rows_affected.lock().expect("rows mutex poisoned") = rows;
    }

    /// Statements that reached the store (committed or auto-committed).
    ///
    /// # Panics
    ///
    /// Panics if the journal mutex is poisoned.
    #[must_use]
    pub fn journal(&self) -> Vec<(String, Vec<String>)> {
        self.journal.lock().expect("journal mutex poisoned").clone()
    }

    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        *self.commits.lock().expect("commits mutex poisoned")
    }

    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        *self.rollbacks.lock().expect("rollbacks mutex poisoned")
    }

    fn answer(&self, sql: &str, params: &[String]) -> Vec<Row> {
        let handler = self.handler.lock().expect("handler mutex poisoned").clone();
        handler.map(|h| h(sql, params)).unwrap_or_default()
    }

    fn affected(&self) -> u64 {
        *self.rows_affected.lock().expect("rows mutex poisoned")
    }
}

impl Default for FakeDatabaseIO {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseIO for FakeDatabaseIO {
    fn query(&self, sql: &str, params: Vec<String>) -> CloudResult<Vec<Row>> {
        Ok(self.answer(sql, &params))
    }

    fn execute(&self, sql: &str, params: Vec<String>) -> CloudResult<u64> {
        self.journal
            .lock()
            .expect("journal mutex poisoned")
            .push((sql.to_string(), params));
        Ok(self.affected())
    }

    fn begin_transaction(&self) -> CloudResult<Box<dyn Transaction>> {
        Ok(Box::new(FakeTransaction {
            db: self.clone(),
            pending: Vec::new(),
        }))
    }
}

struct FakeTransaction {
    db: FakeDatabaseIO,
    pending: Vec<(String, Vec<String>)>,
}

impl Transaction for FakeTransaction {
    fn query(&mut self, sql: &str, params: Vec<String>) -> CloudResult<Vec<Row>> {
        Ok(self.db.answer(sql, &params))
    }

    fn execute(&mut self, sql: &str, params: Vec<String>) -> CloudResult<u64> {
        self.pending.push((sql.to_string(), params));
        Ok(self.db.affected())
    }

    fn commit(mut self: Box<Self>) -> CloudResult<()> {
        self.db
            .journal
            .lock()
            .expect("journal mutex poisoned")
            .append(&mut self.pending);
        *self.db.commits.lock().expect("commits mutex poisoned") += 1;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> CloudResult<()> {
        *self.db.rollbacks.lock().expect("rollbacks mutex poisoned") += 1;
        Ok(())
    }
}

// ============================================================================
// FakeQueueIO
// ============================================================================

/// In-memory queue with visibility semantics.
///
/// `receive` moves messages in flight; `delete` removes them for good, and
/// [`FakeQueueIO::expire_visibility`] returns every undeleted in-flight message
/// to the queue, as a visibility timeout would.
#[derive(Clone, Default)]
pub struct FakeQueueIO {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueMessage>>>>,
    in_flight: Arc<Mutex<HashMap<String, Vec<QueueMessage>>>>,
    message_counter: Arc<Mutex<u64>>,
}

impl FakeQueueIO {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        let mut counter = self
            .message_counter
            .lock()
            .expect("message_counter mutex poisoned");
        *counter += 1;
        format!("msg-{}", *counter)
    }

    /// Return every undeleted in-flight message of `queue` to the front of the queue.
    ///
    /// # Panics
    ///
    /// Panics if a queue mutex is poisoned.
    pub fn expire_visibility(&self, queue: &str) {
        let expired = self
            .in_flight
            .lock()
            .expect("in_flight mutex poisoned")
            .remove(queue)
            .unwrap_or_default();
        let mut queues = self.queues.lock().expect("queues mutex poisoned");
        let q = queues.entry(queue.to_string()).or_default();
        for msg in expired.into_iter().rev() {
            q.push_front(msg);
        }
    }

    /// Bodies of the messages currently waiting (not in flight).
    ///
    /// # Panics
    ///
    /// Panics if the queue mutex is poisoned.
    #[must_use]
    pub fn pending_bodies(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .expect("queues mutex poisoned")
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

impl QueueIO for FakeQueueIO {
    fn send(
        &self,
        queue: &str,
        body: &str,
        attributes: HashMap<String, String>,
    ) -> CloudResult<String> {
        let id = self.next_id();
        let msg = QueueMessage {
            id: id.clone(),
            receipt_handle: String::new(),
            body: body.to_string(),
            attributes,
            receive_count: 0,
        };
        self.queues
            .lock()
            .expect("queues mutex poisoned")
            .entry(queue.to_string())
            .or_default()
            .push_back(msg);
        Ok(id)
    }

    fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        _visibility_timeout_secs: u32,
    ) -> CloudResult<Vec<QueueMessage>> {
        let mut queues = self.queues.lock().expect("queues mutex poisoned");
        let q = queues.entry(queue.to_string()).or_default();
        let count = std::cmp::min(max_messages as usize, q.len());
        let drained: Vec<QueueMessage> = q.drain(0..count).collect();
        drop(queues);

        let mut received = Vec::with_capacity(drained.len());
        for mut msg in drained {
            msg.receive_count += 1;
            msg.receipt_handle = format!("{}-r{}", msg.id, msg.receive_count);
            received.push(msg);
        }
        self.in_flight
            .lock()
            .expect("in_flight mutex poisoned")
            .entry(queue.to_string())
            .or_default()
            .extend(received.iter().cloned());
        Ok(received)
    }

    fn delete(&self, queue: &str, receipt_handle: &str) -> CloudResult<()> {
        let mut in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
        let msgs = in_flight.entry(queue.to_string()).or_default();
        let before = msgs.len();
        msgs.retain(|m| m.receipt_handle != receipt_handle);
        if msgs.len() == before {
            return Err(CloudIOError::new(
                ErrorKind::InvalidInput,
                format!("Unknown receipt handle {receipt_handle}"),
            ));
        }
        Ok(())
    }

    fn queue_size(&self, queue: &str) -> CloudResult<u64> {
        let waiting = self
            .queues
            .lock()
            .expect("queues mutex poisoned")
            .get(queue)
            .map_or(0, VecDeque::len);
        let flying = self
            .in_flight
            .lock()
            .expect("in_flight mutex poisoned")
            .get(queue)
            .map_or(0, Vec::len);
        Ok((waiting + flying) as u64)
    }
}

// ============================================================================
// FakeSecretsIO
// ============================================================================

#[derive(Clone, Default)]
pub struct FakeSecretsIO {
    secrets: Arc<Mutex<HashMap<String, String>>>,
}

impl FakeSecretsIO {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if the secrets mutex is poisoned.
    pub fn insert(&self, name: &str, value: &str) {
        self.secrets
            .lock()
            .expect("secrets mutex poisoned")
            .insert(name.to_string(), value.to_string());
    }
}

impl SecretsIO for FakeSecretsIO {
    fn get_secret(&self, name: &str) -> CloudResult<String> {
        self.secrets
            .lock()
            .expect("secrets mutex poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| CloudIOError::new(ErrorKind::NotFound, format!("Secret {name} not found")))
    }
}
