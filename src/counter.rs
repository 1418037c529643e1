//! Sharded counters bound to a document store.
//!
//! A [`ShardedCounter`] ties a [`CounterDefinition`] to a [`DocumentStore`]
//! and implements the write side of the counter:
//!
//! 1. the caller fills a [`CounterHandle`] with field deltas;
//! 2. [`CounterHandle::apply`] picks a shard index uniformly at random;
//! 3. the deltas are sent as atomic increments to that shard, together with
//!    the creation tick (`current tick + 1`) that keeps the shard away from
//!    rollup for at least one full interval;
//! 4. if the shard does not exist yet it is created from the definition's
//!    template plus the deltas.
//!
//! ```text
//!   handle {count: +1} ──► select k ∈ [0, N) ──► update parent/likes/k
//!                                                    │
//!                                   NotFound ◄───────┘
//!                                       │
//!                                       ▼
//!                      create parent/likes/k = template + deltas
//!                                          + did + ct
//! ```
//!
//! The read side, folding shards back into their parent, lives in
//! [`rollup`](crate::rollup).
//!
//! # Examples
//!
//! ```rust
//! use contatori_distribuiti::counter::ShardedCounter;
//! use contatori_distribuiti::definition::CounterDefinition;
//! use contatori_distribuiti::store::memory::MemoryStore;
//! use contatori_distribuiti::store::DocumentRef;
//! use serde_json::json;
//!
//! # fn main() -> contatori_distribuiti::error::Result<()> {
//! let definition = CounterDefinition::builder("likes")
//!     .shard_count(4)
//!     .template(&json!({"count": 0}))
//!     .build()?;
//! let counter = ShardedCounter::new(definition, MemoryStore::new());
//!
//! let video = DocumentRef::new("videos", "v1");
//! let mut handle = counter.handle();
//! handle.increment("count", 1)?.increment("watch_time", 12.5)?;
//! handle.apply(&video)?;
//!
//! assert_eq!(counter.shard_totals(&video)?.get("count").map(|d| d.as_f64()), Some(1.0));
//! # Ok(())
//! # }
//! ```

pub mod selector;

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::atomic::AtomicBool;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::definition::CounterDefinition;
use crate::error::{ConfigError, CounterError, Result, StoreError};
use crate::rollup::aggregate;
use crate::store::{DocumentRef, DocumentStore, FieldUpdate, WriteBatch, WriteResult};
use crate::value::{
    check_field, check_fields, value_kind, Delta, Fields, IntoDelta, CREATION_TICK_FIELD,
    DOCUMENT_ID_FIELD,
};

use self::selector::{RandomSelector, ShardSelector};

/// A sharded counter stored in a [`DocumentStore`].
///
/// The store, the clock and the shard selector are injected, so one process
/// can run many counters against different stores and tests can control
/// time and shard choice.
pub struct ShardedCounter<S, C = SystemClock, R = RandomSelector> {
    definition: CounterDefinition,
    store: S,
    clock: C,
    selector: R,
    pub(crate) rollup_running: AtomicBool,
}

impl<S: DocumentStore> ShardedCounter<S> {
    /// Creates a counter using the system clock and random shard selection.
    pub fn new(definition: CounterDefinition, store: S) -> Self {
        Self {
            definition,
            store,
            clock: SystemClock,
            selector: RandomSelector,
            rollup_running: AtomicBool::new(false),
        }
    }
}

impl<S, C, R> ShardedCounter<S, C, R> {
    /// Replaces the clock used to compute ticks.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> ShardedCounter<S, C2, R> {
        ShardedCounter {
            definition: self.definition,
            store: self.store,
            clock,
            selector: self.selector,
            rollup_running: self.rollup_running,
        }
    }

    /// Replaces the shard selection strategy.
    pub fn with_selector<R2: ShardSelector>(self, selector: R2) -> ShardedCounter<S, C, R2> {
        ShardedCounter {
            definition: self.definition,
            store: self.store,
            clock: self.clock,
            selector,
            rollup_running: self.rollup_running,
        }
    }

    /// The counter's configuration.
    pub fn definition(&self) -> &CounterDefinition {
        &self.definition
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }
}

impl<S: DocumentStore, C: Clock, R: ShardSelector> ShardedCounter<S, C, R> {
    /// Starts an empty set of field deltas for one update.
    pub fn handle(&self) -> CounterHandle<'_, S, C, R> {
        CounterHandle {
            counter: self,
            deltas: BTreeMap::new(),
        }
    }

    /// Adds `delta` to `field` of one shard of `parent`.
    ///
    /// Shorthand for a handle with a single field.
    pub fn increment(
        &self,
        parent: &DocumentRef,
        field: &str,
        delta: impl IntoDelta,
    ) -> Result<WriteResult> {
        self.increment_with_cancel(parent, field, delta, &CancellationToken::new())
    }

    /// Like [`increment`](Self::increment), abandoned with
    /// [`CounterError::Cancelled`] once `cancel` is cancelled.
    pub fn increment_with_cancel(
        &self,
        parent: &DocumentRef,
        field: &str,
        delta: impl IntoDelta,
        cancel: &CancellationToken,
    ) -> Result<WriteResult> {
        let mut handle = self.handle();
        handle.increment(field, delta)?;
        handle.apply_with_cancel(parent, cancel)
    }

    /// Creates all shards of `parent`, each holding `template`.
    ///
    /// Shards `0..shard_count` are written in one atomic batch and stamped
    /// with the parent path and the current creation tick, so rollup sweeps
    /// them even if they never receive an increment.
    ///
    /// Call this at most once per parent and before any increment: it
    /// overwrites existing shards, discarding counts not yet rolled up.
    pub fn create_shards<T: Serialize + ?Sized>(
        &self,
        parent: &DocumentRef,
        template: &T,
    ) -> Result<Vec<WriteResult>> {
        self.create_shards_with_cancel(parent, template, &CancellationToken::new())
    }

    /// Like [`create_shards`](Self::create_shards), abandoned with
    /// [`CounterError::Cancelled`] once `cancel` is cancelled. The batch is
    /// all-or-nothing, so a cancelled call leaves no partial set of shards.
    pub fn create_shards_with_cancel<T: Serialize + ?Sized>(
        &self,
        parent: &DocumentRef,
        template: &T,
        cancel: &CancellationToken,
    ) -> Result<Vec<WriteResult>> {
        let template = match serde_json::to_value(template).map_err(ConfigError::from)? {
            Value::Object(fields) => fields,
            other => return Err(ConfigError::TemplateNotAnObject(value_kind(&other)).into()),
        };
        check_fields(&template)?;

        let tick = self.definition.creation_tick_at(self.clock.now());
        let mut batch = WriteBatch::new();
        for index in 0..self.definition.shard_count() {
            let mut fields = template.clone();
            stamp(&mut fields, parent, tick);
            batch.set(self.definition.shard_ref(parent, index), fields);
        }

        debug!(
            target: "contatori::shards",
            parent = %parent,
            shards = batch.len(),
            tick,
            "initializing shards"
        );
        Ok(self.store.commit(batch, cancel)?)
    }

    /// Creates all shards of `parent` from the definition's template.
    pub fn create_default_shards(&self, parent: &DocumentRef) -> Result<Vec<WriteResult>> {
        self.create_shards(parent, self.definition.template())
    }

    /// Sums the numeric fields of the shards of `parent` that have not been
    /// rolled up yet.
    ///
    /// Reads shards `0..shard_count` one by one; the result is not a
    /// consistent snapshot under concurrent writes.
    pub fn shard_totals(&self, parent: &DocumentRef) -> Result<BTreeMap<String, Delta>> {
        let cancel = CancellationToken::new();
        let mut shards = Vec::with_capacity(self.definition.shard_count());
        for index in 0..self.definition.shard_count() {
            let shard = self.definition.shard_ref(parent, index);
            if let Some(shard) = self.store.get(&shard, &cancel)? {
                shards.push(shard);
            }
        }
        aggregate(&shards)
    }

    fn dispatch(
        &self,
        parent: &DocumentRef,
        deltas: &BTreeMap<String, Delta>,
        cancel: &CancellationToken,
    ) -> Result<WriteResult> {
        if deltas.is_empty() {
            return Err(CounterError::NoFieldsSpecified);
        }
        if cancel.is_cancelled() {
            return Err(CounterError::Cancelled);
        }

        let index = self.selector.select(self.definition.shard_count());
        let shard = self.definition.shard_ref(parent, index);
        let tick = self.definition.creation_tick_at(self.clock.now());

        let mut updates = deltas
            .iter()
            .map(|(field, delta)| FieldUpdate::increment(field.clone(), *delta))
            .collect::<Vec<_>>();
        updates.push(FieldUpdate::set(CREATION_TICK_FIELD, tick));

        trace!(
            target: "contatori::dispatch",
            shard = %shard,
            fields = deltas.len(),
            tick,
            "incrementing shard"
        );

        match self.store.update(&shard, &updates, cancel) {
            Err(StoreError::NotFound(_)) => {
                let fields = self.initial_fields(parent, deltas, tick)?;
                debug!(target: "contatori::dispatch", shard = %shard, "creating missing shard");
                match self.store.create(&shard, fields, cancel) {
                    // Another writer created it first: add on top of its value.
                    Err(StoreError::AlreadyExists(_)) => {
                        debug!(
                            target: "contatori::dispatch",
                            shard = %shard,
                            "shard created concurrently, re-issuing increment"
                        );
                        Ok(self.store.update(&shard, &updates, cancel)?)
                    }
                    result => Ok(result?),
                }
            }
            result => Ok(result?),
        }
    }

    /// Template plus deltas plus reserved fields.
    fn initial_fields(
        &self,
        parent: &DocumentRef,
        deltas: &BTreeMap<String, Delta>,
        tick: i64,
    ) -> Result<Fields> {
        let mut fields = self.definition.template().clone();
        check_fields(&fields)?;
        for (field, delta) in deltas {
            let value = delta
                .apply_to(fields.get(field))
                .ok_or_else(|| CounterError::Overflow {
                    field: field.clone(),
                })?;
            fields.insert(field.clone(), value);
        }
        stamp(&mut fields, parent, tick);
        Ok(fields)
    }
}

fn stamp(fields: &mut Fields, parent: &DocumentRef, tick: i64) {
    fields.insert(DOCUMENT_ID_FIELD.to_string(), Value::from(parent.path()));
    fields.insert(CREATION_TICK_FIELD.to_string(), Value::from(tick));
}

impl<S, C, R> Debug for ShardedCounter<S, C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedCounter")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Field deltas waiting to be applied to one shard.
///
/// Deltas for the same field accumulate. A handle is consumed by
/// [`apply`](CounterHandle::apply).
pub struct CounterHandle<'a, S, C, R> {
    counter: &'a ShardedCounter<S, C, R>,
    deltas: BTreeMap<String, Delta>,
}

impl<S: DocumentStore, C: Clock, R: ShardSelector> CounterHandle<'_, S, C, R> {
    /// Adds `delta` to `field`.
    ///
    /// Fails if `field` is reserved, if `delta` cannot be represented
    /// exactly, or if the accumulated delta for `field` overflows.
    pub fn increment(
        &mut self,
        field: &str,
        delta: impl IntoDelta,
    ) -> std::result::Result<&mut Self, ConfigError> {
        check_field(field)?;
        let unsupported = |reason: String| ConfigError::UnsupportedDelta {
            field: field.to_string(),
            reason,
        };

        let delta = delta.into_delta().map_err(|e| unsupported(e.to_string()))?;
        let total = match self.deltas.get(field) {
            Some(pending) => pending
                .checked_add(delta)
                .ok_or_else(|| unsupported("accumulated delta overflows".to_string()))?,
            None => delta,
        };
        self.deltas.insert(field.to_string(), total);
        Ok(self)
    }

    /// The pending deltas.
    pub fn deltas(&self) -> &BTreeMap<String, Delta> {
        &self.deltas
    }

    /// Returns `true` if no field has been incremented.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Applies the deltas to a randomly selected shard of `parent`.
    ///
    /// Returns [`CounterError::NoFieldsSpecified`] if the handle is empty.
    /// Store errors are returned as they are; nothing is retried.
    pub fn apply(self, parent: &DocumentRef) -> Result<WriteResult> {
        self.apply_with_cancel(parent, &CancellationToken::new())
    }

    /// Like [`apply`](Self::apply), abandoned with
    /// [`CounterError::Cancelled`] once `cancel` is cancelled, including
    /// while a store call is in flight.
    pub fn apply_with_cancel(
        self,
        parent: &DocumentRef,
        cancel: &CancellationToken,
    ) -> Result<WriteResult> {
        self.counter.dispatch(parent, &self.deltas, cancel)
    }
}

impl<S, C, R> Debug for CounterHandle<'_, S, C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHandle")
            .field("counter", &self.counter.definition.name())
            .field("deltas", &self.deltas)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::counter::selector::{FixedSelector, SeededSelector};
    use crate::store::memory::{MemoryStore, StoreOp};
    use crate::store::Document;
    use serde_json::json;
    use std::sync::Arc;

    const NOW: u64 = 6_000; // tick 100 with a 60s interval

    fn likes() -> CounterDefinition {
        CounterDefinition::builder("likes")
            .shard_count(4)
            .rollup_interval(std::time::Duration::from_secs(60))
            .template(&json!({"count": 0}))
            .build()
            .unwrap()
    }

    fn counter(
        store: Arc<MemoryStore>,
    ) -> ShardedCounter<Arc<MemoryStore>, ManualClock, SeededSelector> {
        ShardedCounter::new(likes(), store)
            .with_clock(ManualClock::new(NOW))
            .with_selector(SeededSelector::new(1))
    }

    fn shard(store: &MemoryStore, parent: &DocumentRef, index: usize) -> Option<Document> {
        store
            .get(&likes().shard_ref(parent, index), &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_empty_handle() {
        let counter = counter(Arc::new(MemoryStore::new()));
        let handle = counter.handle();
        assert!(handle.is_empty());
        assert!(matches!(
            handle.apply(&DocumentRef::new("posts", "p1")),
            Err(CounterError::NoFieldsSpecified)
        ));
    }

    #[test]
    fn test_reserved_fields_rejected() {
        let counter = counter(Arc::new(MemoryStore::new()));
        let mut handle = counter.handle();
        assert!(matches!(
            handle.increment("did", 1),
            Err(ConfigError::ReservedField(f)) if f == "did"
        ));
        assert!(matches!(
            handle.increment("ct", 1),
            Err(ConfigError::ReservedField(f)) if f == "ct"
        ));
        assert!(handle.is_empty());
    }

    #[test]
    fn test_unsupported_deltas_rejected() {
        let counter = counter(Arc::new(MemoryStore::new()));
        let mut handle = counter.handle();
        assert!(matches!(
            handle.increment("count", u64::MAX),
            Err(ConfigError::UnsupportedDelta { .. })
        ));
        assert!(matches!(
            handle.increment("count", f64::NAN),
            Err(ConfigError::UnsupportedDelta { .. })
        ));
        assert!(matches!(
            handle.increment("count", json!("five")),
            Err(ConfigError::UnsupportedDelta { .. })
        ));
    }

    #[test]
    fn test_deltas_accumulate() {
        let counter = counter(Arc::new(MemoryStore::new()));
        let mut handle = counter.handle();
        handle
            .increment("count", 2)
            .unwrap()
            .increment("count", 3u8)
            .unwrap()
            .increment("score", 0.5)
            .unwrap();
        assert_eq!(handle.deltas().get("count"), Some(&Delta::Integer(5)));
        assert_eq!(handle.deltas().get("score"), Some(&Delta::Float(0.5)));

        handle.increment("big", i64::MAX).unwrap();
        assert!(handle.increment("big", 1).is_err());
    }

    #[test]
    fn test_missing_shard_is_created() {
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::new(likes(), Arc::clone(&store))
            .with_clock(ManualClock::new(NOW))
            .with_selector(FixedSelector(2));
        let parent = DocumentRef::new("posts", "p1");

        counter.increment(&parent, "count", 5).unwrap();

        let created = shard(&store, &parent, 2).unwrap();
        assert_eq!(
            created.fields(),
            json!({"count": 5, "did": "posts/p1", "ct": 101})
                .as_object()
                .unwrap()
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_shard_adds_to_template() {
        let definition = CounterDefinition::builder("likes")
            .shard_count(1)
            .template(&json!({"count": 10, "label": "video"}))
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::new(definition, Arc::clone(&store))
            .with_clock(ManualClock::new(NOW));
        let parent = DocumentRef::new("posts", "p1");

        let mut handle = counter.handle();
        handle.increment("count", 5).unwrap().increment("views", 1).unwrap();
        handle.apply(&parent).unwrap();

        let created = store
            .get(&parent.collection("likes").doc("0"), &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(created.get("count"), Some(&json!(15)));
        assert_eq!(created.get("views"), Some(&json!(1)));
        assert_eq!(created.get("label"), Some(&json!("video")));
    }

    #[test]
    fn test_existing_shard_is_incremented() {
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::new(likes(), Arc::clone(&store))
            .with_clock(ManualClock::new(NOW))
            .with_selector(FixedSelector(1));
        let parent = DocumentRef::new("posts", "p1");

        counter.create_shards(&parent, &json!({"count": 7})).unwrap();
        counter.increment(&parent, "count", 3).unwrap();

        let updated = shard(&store, &parent, 1).unwrap();
        assert_eq!(updated.get("count"), Some(&json!(10)));
        assert_eq!(updated.get("ct"), Some(&json!(101)));
        assert_eq!(shard(&store, &parent, 0).unwrap().get("count"), Some(&json!(7)));
    }

    #[test]
    fn test_increment_stamps_latest_tick() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let counter = ShardedCounter::new(likes(), Arc::clone(&store))
            .with_clock(Arc::clone(&clock))
            .with_selector(FixedSelector(0));
        let parent = DocumentRef::new("posts", "p1");

        counter.increment(&parent, "count", 1).unwrap();
        clock.advance(std::time::Duration::from_secs(120));
        counter.increment(&parent, "count", 1).unwrap();

        let doc = shard(&store, &parent, 0).unwrap();
        assert_eq!(doc.get("ct"), Some(&json!(103)));
        assert_eq!(doc.get("count"), Some(&json!(2)));
    }

    #[test]
    fn test_create_race_falls_back_to_update() {
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::new(likes(), Arc::clone(&store))
            .with_clock(ManualClock::new(NOW))
            .with_selector(FixedSelector(0));
        let parent = DocumentRef::new("posts", "p1");

        // The update misses, then a concurrent writer wins the create.
        store.fail_next(
            StoreOp::Update,
            StoreError::NotFound("posts/p1/likes/0".to_string()),
        );
        store
            .set(
                &likes().shard_ref(&parent, 0),
                json!({"count": 4, "did": "posts/p1", "ct": 101})
                    .as_object()
                    .unwrap()
                    .clone(),
                &CancellationToken::new(),
            )
            .unwrap();

        counter.increment(&parent, "count", 5).unwrap();
        assert_eq!(shard(&store, &parent, 0).unwrap().get("count"), Some(&json!(9)));
    }

    #[test]
    fn test_store_errors_surface_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");

        store.fail_next(
            StoreOp::Update,
            StoreError::PermissionDenied("read-only".to_string()),
        );
        let err = counter.increment(&parent, "count", 1).unwrap_err();
        assert_eq!(
            err.store_error(),
            Some(&StoreError::PermissionDenied("read-only".to_string()))
        );

        // A failing create after a miss is surfaced too.
        store.fail_next(StoreOp::Create, StoreError::Unavailable("down".to_string()));
        let err = counter.increment(&parent, "count", 1).unwrap_err();
        assert_eq!(
            err.store_error(),
            Some(&StoreError::Unavailable("down".to_string()))
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_create_shards() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");

        let results = counter.create_shards(&parent, &json!({"count": 0})).unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(store.len(), 4);
        for index in 0..4 {
            let doc = shard(&store, &parent, index).unwrap();
            assert_eq!(doc.reference().id(), index.to_string());
            assert_eq!(
                doc.fields(),
                json!({"count": 0, "did": "posts/p1", "ct": 101})
                    .as_object()
                    .unwrap()
            );
        }
        assert!(shard(&store, &parent, 4).is_none());
    }

    #[test]
    fn test_create_shards_overwrites() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");

        counter.create_default_shards(&parent).unwrap();
        counter.increment(&parent, "count", 9).unwrap();
        counter.create_default_shards(&parent).unwrap();

        assert_eq!(
            counter.shard_totals(&parent).unwrap().get("count"),
            Some(&Delta::Integer(0))
        );
    }

    #[test]
    fn test_create_shards_rejects_reserved_template() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");

        let err = counter
            .create_shards(&parent, &json!({"count": 0, "ct": 1}))
            .unwrap_err();
        assert!(err.is_config());
        let err = counter.create_shards(&parent, &5).unwrap_err();
        assert!(err.is_config());
        assert!(store.is_empty());
    }

    #[test]
    fn test_likes_scenario_shard_sum() {
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::new(likes(), Arc::clone(&store))
            .with_clock(ManualClock::new(NOW));
        let parent = DocumentRef::new("posts", "p1");

        counter.create_shards(&parent, &json!({"count": 0})).unwrap();
        for _ in 0..3 {
            counter.increment(&parent, "count", 5).unwrap();
        }

        assert_eq!(store.len(), 4);
        assert_eq!(
            counter.shard_totals(&parent).unwrap().get("count"),
            Some(&Delta::Integer(15))
        );
    }

    #[test]
    fn test_concurrent_increments() {
        use std::thread;

        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(
            ShardedCounter::new(likes(), Arc::clone(&store)).with_clock(ManualClock::new(NOW)),
        );
        let parent = DocumentRef::new("posts", "p1");
        counter.create_default_shards(&parent).unwrap();

        let handles = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let parent = parent.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        counter.increment(&parent, "count", 1).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            counter.shard_totals(&parent).unwrap().get("count"),
            Some(&Delta::Integer(400))
        );
    }

    #[test]
    fn test_cancelled_increment_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = counter
            .increment_with_cancel(&parent, "count", 1, &cancel)
            .unwrap_err();
        assert!(matches!(err, CounterError::Cancelled));
        assert!(err.is_cancelled());

        let mut handle = counter.handle();
        handle.increment("count", 1).unwrap();
        assert!(matches!(
            handle.apply_with_cancel(&parent, &cancel),
            Err(CounterError::Cancelled)
        ));
        assert!(store.is_empty());
        assert_eq!(store.stats().writes, 0);
    }

    #[test]
    fn test_increment_cancelled_while_store_is_slow() {
        use std::thread;
        use std::time::{Duration, Instant};

        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");
        store.set_latency(StoreOp::Update, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let err = counter
            .increment_with_cancel(&parent, "count", 1, &cancel)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, CounterError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        // The miss was never observed, so no shard was created either.
        assert!(store.is_empty());
    }

    #[test]
    fn test_cancelled_create_shards_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(Arc::clone(&store));
        let parent = DocumentRef::new("posts", "p1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            counter.create_shards_with_cancel(&parent, &json!({"count": 0}), &cancel),
            Err(CounterError::Cancelled)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_debug() {
        let counter = counter(Arc::new(MemoryStore::new()));
        let mut handle = counter.handle();
        handle.increment("count", 1).unwrap();
        let debug_str = format!("{:?}", handle);
        assert!(debug_str.contains("likes"));
        assert!(debug_str.contains("count"));
        assert!(format!("{:?}", counter).starts_with("ShardedCounter"));
    }
}
