//! In-process [`DocumentStore`] implementation.
//!
//! [`MemoryStore`] keeps every document in a `BTreeMap` behind a single
//! `RwLock`. Batches are staged and applied under the write lock, so they are
//! atomic with respect to every other operation. Query results are ordered
//! by the ordering field and then by path, which makes cursors stable while
//! earlier documents are deleted.
//!
//! The store also counts operations ([`StoreStats`]), can be told to fail
//! a given operation ([`MemoryStore::fail_after`]) and can simulate network
//! latency ([`MemoryStore::set_latency`]). That is how the tests exercise
//! error propagation and cancellation of calls in flight.
//!
//! # Examples
//!
//! ```rust
//! use contatori_distribuiti::cancel::CancellationToken;
//! use contatori_distribuiti::store::memory::MemoryStore;
//! use contatori_distribuiti::store::{DocumentRef, DocumentStore, FieldUpdate};
//! use contatori_distribuiti::value::Delta;
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let cancel = CancellationToken::new();
//! let doc = DocumentRef::new("videos", "v1");
//!
//! store.set(&doc, json!({"views": 1}).as_object().unwrap().clone(), &cancel).unwrap();
//! store
//!     .update(&doc, &[FieldUpdate::increment("views", Delta::Integer(2))], &cancel)
//!     .unwrap();
//!
//! let views = store.get(&doc, &cancel).unwrap().unwrap().get("views").cloned();
//! assert_eq!(views, Some(json!(3)));
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::error::StoreError;
use crate::store::{
    compare_values, Cursor, Document, DocumentRef, DocumentStore, FieldUpdate, GroupQuery, Page,
    WriteBatch, WriteOp, WriteResult, WriteValue,
};
use crate::value::Fields;

/// Granularity at which a simulated latency notices cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(1);

/// Store operations, used to target injected failures and latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`DocumentStore::get`]
    Get,
    /// [`DocumentStore::create`]
    Create,
    /// [`DocumentStore::set`]
    Set,
    /// [`DocumentStore::update`]
    Update,
    /// [`DocumentStore::delete`]
    Delete,
    /// [`DocumentStore::query_group`]
    Query,
    /// [`DocumentStore::commit`]
    Commit,
}

/// Snapshot of the operation counters of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Point reads.
    pub reads: u64,
    /// Query pages served.
    pub queries: u64,
    /// Batches committed.
    pub commits: u64,
    /// Documents created, overwritten, updated or deleted, including the
    /// writes of committed batches.
    pub writes: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    queries: AtomicU64,
    commits: AtomicU64,
    writes: AtomicU64,
}

struct InjectedFailure {
    op: StoreOp,
    skip: usize,
    error: StoreError,
}

/// A thread-safe in-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<DocumentRef, Fields>>,
    counters: Counters,
    failures: Mutex<Vec<InjectedFailure>>,
    latencies: Mutex<HashMap<StoreOp, Duration>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.fail_after(op, 0, error);
    }

    /// Lets `successes` calls of `op` through, then fails the following one
    /// with `error`. Each injected failure fires once.
    pub fn fail_after(&self, op: StoreOp, successes: usize, error: StoreError) {
        self.failures.lock().push(InjectedFailure {
            op,
            skip: successes,
            error,
        });
    }

    /// Makes every call of `op` wait `latency` before touching the data.
    ///
    /// The wait ends early with [`StoreError::Cancelled`] when the caller's
    /// token is cancelled. A zero latency removes the delay.
    pub fn set_latency(&self, op: StoreOp, latency: Duration) {
        let mut latencies = self.latencies.lock();
        if latency.is_zero() {
            latencies.remove(&op);
        } else {
            latencies.insert(op, latency);
        }
    }

    /// Returns the operation counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
        }
    }

    /// Number of documents in the store.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Returns `true` if the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Every document of the collection group `group`, ordered by path.
    pub fn group_documents(&self, group: &str) -> Vec<Document> {
        self.documents
            .read()
            .iter()
            .filter(|(reference, _)| reference.collection_id() == group)
            .map(|(reference, fields)| Document::new(reference.clone(), fields.clone()))
            .collect()
    }

    /// Checks cancellation and injected failures, then waits out any
    /// simulated latency for `op`.
    fn enter(&self, op: StoreOp, cancel: &CancellationToken) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.injected(op)?;

        let latency = self.latencies.lock().get(&op).copied();
        if let Some(latency) = latency {
            let deadline = Instant::now() + latency;
            loop {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep(CANCEL_POLL.min(deadline - now));
            }
        }
        Ok(())
    }

    fn injected(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut failures = self.failures.lock();
        let Some(pos) = failures.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if failures[pos].skip > 0 {
            failures[pos].skip -= 1;
            return Ok(());
        }
        Err(failures.remove(pos).error)
    }

    fn written(&self, count: usize) -> WriteResult {
        self.counters
            .writes
            .fetch_add(count as u64, Ordering::Relaxed);
        WriteResult {
            update_time: SystemTime::now(),
        }
    }
}

fn apply_updates(
    reference: &DocumentRef,
    fields: &mut Fields,
    updates: &[FieldUpdate],
) -> Result<(), StoreError> {
    for update in updates {
        let value = match &update.value {
            WriteValue::Set(value) => value.clone(),
            WriteValue::Increment(delta) => {
                delta.apply_to(fields.get(&update.field)).ok_or_else(|| {
                    StoreError::InvalidArgument(format!(
                        "increment of `{}` in {reference} overflows",
                        update.field
                    ))
                })?
            }
        };
        fields.insert(update.field.clone(), value);
    }
    Ok(())
}

fn order_value(fields: &Fields, order_by: Option<&str>) -> Value {
    order_by
        .and_then(|field| fields.get(field))
        .cloned()
        .unwrap_or(Value::Null)
}

fn cmp_position(
    a: (&Value, &DocumentRef),
    b: (&Value, &DocumentRef),
) -> CmpOrdering {
    compare_values(a.0, b.0).then_with(|| a.1.cmp(b.1))
}

impl DocumentStore for MemoryStore {
    fn get(
        &self,
        reference: &DocumentRef,
        cancel: &CancellationToken,
    ) -> Result<Option<Document>, StoreError> {
        self.enter(StoreOp::Get, cancel)?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .documents
            .read()
            .get(reference)
            .map(|fields| Document::new(reference.clone(), fields.clone())))
    }

    fn create(
        &self,
        reference: &DocumentRef,
        fields: Fields,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError> {
        self.enter(StoreOp::Create, cancel)?;
        let mut documents = self.documents.write();
        if documents.contains_key(reference) {
            return Err(StoreError::AlreadyExists(reference.to_string()));
        }
        documents.insert(reference.clone(), fields);
        Ok(self.written(1))
    }

    fn set(
        &self,
        reference: &DocumentRef,
        fields: Fields,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError> {
        self.enter(StoreOp::Set, cancel)?;
        self.documents.write().insert(reference.clone(), fields);
        Ok(self.written(1))
    }

    fn update(
        &self,
        reference: &DocumentRef,
        updates: &[FieldUpdate],
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError> {
        self.enter(StoreOp::Update, cancel)?;
        let mut documents = self.documents.write();
        let fields = documents
            .get_mut(reference)
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))?;
        let mut updated = fields.clone();
        apply_updates(reference, &mut updated, updates)?;
        *fields = updated;
        Ok(self.written(1))
    }

    fn delete(
        &self,
        reference: &DocumentRef,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError> {
        self.enter(StoreOp::Delete, cancel)?;
        self.documents.write().remove(reference);
        Ok(self.written(1))
    }

    fn query_group(
        &self,
        query: &GroupQuery,
        cancel: &CancellationToken,
    ) -> Result<Page, StoreError> {
        self.enter(StoreOp::Query, cancel)?;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let order_by = query.order_field();
        let documents = self.documents.read();

        let mut matches = documents
            .iter()
            .filter(|(reference, _)| reference.collection_id() == query.group())
            .filter(|(_, fields)| order_by.map_or(true, |field| fields.contains_key(field)))
            .filter(|(_, fields)| match query.filter() {
                Some((field, values)) => fields.get(field).is_some_and(|value| {
                    values
                        .iter()
                        .any(|candidate| compare_values(candidate, value).is_eq())
                }),
                None => true,
            })
            .map(|(reference, fields)| (order_value(fields, order_by), reference, fields))
            .filter(|(value, reference, _)| match query.cursor() {
                Some(cursor) => cmp_position(
                    (value, *reference),
                    (cursor.order_value(), cursor.reference()),
                )
                .is_gt(),
                None => true,
            })
            .collect::<Vec<_>>();

        matches.sort_by(|a, b| cmp_position((&a.0, a.1), (&b.0, b.1)));
        if let Some(limit) = query.limit_value() {
            matches.truncate(limit);
        }

        let documents = matches
            .into_iter()
            .map(|(_, reference, fields)| Document::new(reference.clone(), fields.clone()))
            .collect::<Vec<_>>();
        let cursor = documents.last().map(|last| Cursor::at(last, order_by));

        Ok(Page { documents, cursor })
    }

    fn commit(
        &self,
        batch: WriteBatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<WriteResult>, StoreError> {
        self.enter(StoreOp::Commit, cancel)?;
        let mut documents = self.documents.write();

        let count = batch.len();
        let mut staged: BTreeMap<DocumentRef, Option<Fields>> = BTreeMap::new();
        for op in batch.into_ops() {
            match op {
                WriteOp::Set { reference, fields } => {
                    staged.insert(reference, Some(fields));
                }
                WriteOp::Update { reference, updates } => {
                    let current = staged
                        .get(&reference)
                        .cloned()
                        .unwrap_or_else(|| documents.get(&reference).cloned());
                    let mut fields =
                        current.ok_or_else(|| StoreError::NotFound(reference.to_string()))?;
                    apply_updates(&reference, &mut fields, &updates)?;
                    staged.insert(reference, Some(fields));
                }
                WriteOp::Delete { reference } => {
                    staged.insert(reference, None);
                }
            }
        }

        for (reference, fields) in staged {
            match fields {
                Some(fields) => documents.insert(reference, fields),
                None => documents.remove(&reference),
            };
        }

        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        let result = self.written(count);
        Ok(vec![result; count])
    }
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("documents", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
