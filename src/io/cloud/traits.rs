//! Collaborator traits for storage, the relational store, queues and secrets.
//!
//! These traits are synchronous. Implementations backed by async SDKs are
//! expected to block internally, the same way the pipeline stages block on them.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::{Cursor, Read};

// ============================================================================
// Core Error Type
// ============================================================================

/// Generic error type for collaborator operations
#[derive(Debug, Clone)]
pub struct CloudIOError {
    pub message: String,
    pub kind: ErrorKind,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    NotFound,
    InvalidInput,
    Network,
    Timeout,
    ServiceUnavailable,
    InternalError,
    Other,
}

impl fmt::Display for CloudIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl Error for CloudIOError {}

impl CloudIOError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl From<std::io::Error> for CloudIOError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Authorization,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

pub type CloudResult<T> = Result<T, CloudIOError>;

// ============================================================================
// ObjectIO - Object Storage
// ============================================================================

/// An object found by a listing.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub key: String,
}

/// Trait for object storage operations
pub trait ObjectIO: Send + Sync {
    /// Upload data to object storage, replacing any object under the same key
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket doesn't exist, permissions are not enough, or the upload fails
    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> CloudResult<()>;

    /// Download data from object storage
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist, permissions are not enough, or the download fails
    fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Vec<u8>>;

    /// Open an object as a stream.
    ///
    /// The default implementation buffers the whole object; backends that can
    /// stream (files, ranged HTTP reads) should override it.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened
    fn open_object(&self, bucket: &str, key: &str) -> CloudResult<Box<dyn Read + Send>> {
        let data = self.get_object(bucket, key)?;
        Ok(Box::new(Cursor::new(data)))
    }

    /// Delete an object
    ///
    /// # Errors
    ///
    /// Returns an error if permissions are not enough or the deletion fails
    fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()>;

    /// List objects whose key starts with `prefix`, sorted by key
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket doesn't exist, permissions are not enough, or the listing fails
    fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> CloudResult<Vec<ObjectMetadata>>;

    /// Check if an object exists
    ///
    /// # Errors
    ///
    /// Returns an error if permissions are not enough or the check fails
    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool>;
}

// ============================================================================
// DatabaseIO - Relational Databases
// ============================================================================

/// A row from a database query, keyed by column name
pub type Row = HashMap<String, String>;

/// Trait for relational database operations
pub trait DatabaseIO: Send + Sync {
    /// Execute a query and return results
    ///
    /// # Errors
    ///
    /// Returns an error if the query is invalid, execution fails, or there's a connection issue
    fn query(&self, sql: &str, params: Vec<String>) -> CloudResult<Vec<Row>>;

    /// Execute a statement without returning results (INSERT, UPDATE, DELETE)
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is invalid, execution fails, or there's a connection issue
    fn execute(&self, sql: &str, params: Vec<String>) -> CloudResult<u64>;

    /// Begin a transaction
    ///
    /// # Errors
    ///
    /// Returns an error if transaction creation fails or there's a connection issue
    fn begin_transaction(&self) -> CloudResult<Box<dyn Transaction>>;
}

/// Trait for database transactions
pub trait Transaction: Send + Sync {
    /// Execute a query within the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the query is invalid, execution fails, or the transaction has been rolled back
    fn query(&mut self, sql: &str, params: Vec<String>) -> CloudResult<Vec<Row>>;

    /// Execute a statement within the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is invalid, execution fails, or the transaction has been rolled back
    fn execute(&mut self, sql: &str, params: Vec<String>) -> CloudResult<u64>;

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails or there's a connection issue
    fn commit(self: Box<Self>) -> CloudResult<()>;

    /// Roll back the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails or there's a connection issue
    fn rollback(self: Box<Self>) -> CloudResult<()>;
}

// ============================================================================
// QueueIO - Message Queues
// ============================================================================

/// A queue message
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub receipt_handle: String, // For acknowledgment
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub receive_count: u32,
}

/// Trait for message queue operations
pub trait QueueIO: Send + Sync {
    /// Send a message to a queue
    ///
    /// # Errors
    ///
    /// Returns an error if the queue doesn't exist, permissions are not enough, or sending fails
    fn send(
        &self,
        queue: &str,
        body: &str,
        attributes: HashMap<String, String>,
    ) -> CloudResult<String>;

    /// Receive messages from a queue.
    ///
    /// Received messages stay invisible for `visibility_timeout_secs` and are
    /// redelivered afterwards unless deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue doesn't exist, permissions are insufficient, or receiving fails
    fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout_secs: u32,
    ) -> CloudResult<Vec<QueueMessage>>;

    /// Delete a received message from the queue
    ///
    /// # Errors
    ///
    /// Returns an error if the queue doesn't exist, the receipt handle is invalid, or deletion fails
    fn delete(&self, queue: &str, receipt_handle: &str) -> CloudResult<()>;

    /// Get approximate queue size, including in-flight messages
    ///
    /// # Errors
    ///
    /// Returns an error if the queue doesn't exist, permissions are not enough, or the operation fails
    fn queue_size(&self, queue: &str) -> CloudResult<u64>;
}

// ============================================================================
// SecretsIO - Secret Managers
// ============================================================================

/// Trait for secret lookups
pub trait SecretsIO: Send + Sync {
    /// Fetch the secret string stored under `name`
    ///
    /// # Errors
    ///
    /// Returns an error if the secret doesn't exist or permissions are not enough
    fn get_secret(&self, name: &str) -> CloudResult<String>;
}
