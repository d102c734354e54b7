//! Testing utilities for the filing pipeline.
//!
//! This module ships inside the library so downstream crates (and the
//! integration tests) can exercise the stages without a real rule engine,
//! object store or database. It includes:
//!
//! - **Rule engine double**: [`RowRuleEngine`] evaluates per-row closures with
//!   the same phase ordering and Syntactical short-circuit a production engine has
//! - **In-memory tables**: [`MemoryTable`] is a [`TableSource`](crate::engine::TableSource)
//!   over batches already in memory
//! - **Fixtures**: sample submissions, CSV bodies and a ready-made rule set
//! - **Assertions**: read back shards and reports and check submission states
//!
//! # Quick Start
//!
//! ```
//! use filing_pipeline::io::cloud::FakeObjectIO;
//! use filing_pipeline::testing::*;
//! use filing_pipeline::ShardWriter;
//!
//! # fn main() -> anyhow::Result<()> {
//! let storage = FakeObjectIO::new();
//! put_csv(&storage, "filings", "upload/2024/LEI/1.csv", &sample_csv(5))?;
//! let output = ShardWriter::new(&storage, 2).convert("filings", "upload/2024/LEI/1.csv")?;
//! assert_eq!(output.shard_keys.len(), 3);
//! assert_eq!(read_table(&storage, "filings", &output.shard_dir)?.num_rows(), 5);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod rule_engine;

pub use assertions::*;
pub use fixtures::*;
pub use rule_engine::*;
