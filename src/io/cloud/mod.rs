//! Collaborator abstractions for the storage, relational, queue and secrets services.
//!
//! Each trait represents one category of external service the pipeline talks to
//! and comes with:
//!
//! - **Synchronous interface** - stages run as blocking workers, so every
//!   operation blocks; async SDKs are wrapped internally by implementations
//! - **Fake implementations** - in-memory versions for tests, with hooks for
//!   failure injection and redelivery
//!
//! ## Available Traits
//!
//! - [`ObjectIO`] - object storage (S3, GCS) plus [`LocalObjectIO`] for a
//!   directory tree on local disk
//! - [`DatabaseIO`] / [`Transaction`] - the relational store holding submissions
//! - [`QueueIO`] - storage-event queues with visibility-timeout redelivery
//! - [`SecretsIO`] - database credential lookup
//!
//! ## Usage
//!
//! ```
//! use filing_pipeline::io::cloud::*;
//!
//! # fn main() -> CloudResult<()> {
//! let storage = FakeObjectIO::new();
//! storage.put_object("bucket", "upload/2024/LEI/1.csv", b"a,b\n1,2\n")?;
//! assert!(storage.object_exists("bucket", "upload/2024/LEI/1.csv")?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`CloudResult<T>`] where the error is [`CloudIOError`],
//! categorised by [`ErrorKind`]. `NotFound` is the only kind the pipeline
//! interprets itself (an absent bucket or prefix lists as empty); everything
//! else propagates to the stage runner.

pub mod fake;
pub mod local;
pub mod traits;

pub use fake::*;
pub use local::LocalObjectIO;
pub use traits::*;
