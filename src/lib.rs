//! # Contatori Distribuiti - Sharded Counters for Document Stores
//!
//! A Rust library implementing **sharded counters with periodic rollup** on top
//! of a document database such as Firestore.
//!
//! ## The Problem
//!
//! Document databases limit how often a single document can be written
//! (Firestore sustains roughly one write per second per document). A counter
//! stored as a field of a popular document, like the like count of a viral
//! post, quickly hits that limit: concurrent increments contend on the same
//! document, get aborted and retried, and eventually fail.
//!
//! ## The Solution: Shards and Rollup
//!
//! Increments are spread over `N` **shard** documents stored in a
//! sub-collection of the counted document. Each write picks one shard at
//! random, so the write rate sustained by a parent grows with `N`.
//!
//! Reading `N` shards on every read is expensive, so a periodic **rollup**
//! folds the shards back into the parent and deletes them. Readers then read
//! a single document, whose value is at most a few rollup intervals behind.
//!
//! ```text
//!   posts/p1 {count: 100}                           posts/p1 {count: 115}
//!      │                                                   ▲
//!      ├── likes/0 {count: 5,  did: posts/p1, ct: 101}     │
//!      ├── likes/2 {count: 10, did: posts/p1, ct: 101} ────┘  rollup
//!      └── ...                                            (one atomic batch:
//!                                                          increment + deletes)
//! ```
//!
//! ### Design Principles
//!
//! 1. **Random shard selection**: writers pick a shard uniformly from a
//!    per-thread generator ([`counter::selector`]).
//!
//! 2. **Lazy shard creation**: a shard is created from the counter's template
//!    on its first increment; nothing has to be set up per parent.
//!
//! 3. **Time ticks**: time is divided into ticks of one rollup interval. A
//!    write stamps its shard with `current tick + 1`, so a shard is never
//!    rolled up in the interval it was written in.
//!
//! 4. **Atomic rollup batches**: the increment of a parent and the deletion
//!    of the shards it consumed commit together, so a count is never lost
//!    nor applied twice by a single rollup process.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`definition`] | Counter configuration: name, shard count, template, interval |
//! | [`counter`] | Increment dispatch and shard initialization |
//! | [`rollup`] | Folding stale shards into their parents |
//! | [`store`] | The document store interface and an in-memory implementation |
//! | [`value`] | Numeric deltas and reserved shard fields |
//! | [`clock`] | Wall clock abstraction used to compute ticks |
//! | [`cancel`] | Cooperative cancellation of store calls and rollup passes |
//! | [`error`] | Error types |
//!
//! ## Quick Start
//!
//! ```rust
//! use contatori_distribuiti::cancel::CancellationToken;
//! use contatori_distribuiti::counter::ShardedCounter;
//! use contatori_distribuiti::definition::CounterDefinition;
//! use contatori_distribuiti::store::memory::MemoryStore;
//! use contatori_distribuiti::store::{DocumentRef, DocumentStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> contatori_distribuiti::error::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let likes = CounterDefinition::builder("likes")
//!     .shard_count(10)
//!     .template(&json!({"count": 0}))
//!     .build()?;
//! let counter = ShardedCounter::new(likes, Arc::clone(&store));
//!
//! let post = DocumentRef::new("posts", "p1");
//! store.set(&post, json!({"count": 0}).as_object().unwrap().clone(), &CancellationToken::new())?;
//!
//! // From any number of writers:
//! counter.increment(&post, "count", 1)?;
//!
//! // Not yet rolled up:
//! assert_eq!(counter.shard_totals(&post)?.len(), 1);
//!
//! // Periodically, from a single process:
//! let report = counter.rollup()?;
//! println!("rolled up {} parents", report.parents);
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! [`ShardedCounter`](counter::ShardedCounter) is `Send + Sync` whenever its
//! store, clock and selector are. Increments never coordinate with each
//! other. Rollup passes of one counter never overlap; passes started from
//! different processes are not coordinated.
//!
//! ## Logging
//!
//! The library logs through [`tracing`] under the targets
//! `contatori::dispatch`, `contatori::shards` and `contatori::rollup`. It never
//! installs a subscriber.

pub mod cancel;
pub mod clock;
pub mod counter;
pub mod definition;
pub mod error;
pub mod rollup;
pub mod store;
pub mod value;
