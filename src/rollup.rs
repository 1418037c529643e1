//! Rollup: folding stale shards back into their parents.
//!
//! A rollup pass drains every shard, across all parents, whose creation tick
//! falls in the trailing
//! [`STALENESS_WINDOW_TICKS`](crate::definition::STALENESS_WINDOW_TICKS) ticks:
//!
//! 1. compute the window `current, current-1, ..., current-9`;
//! 2. page through the shard collection group ordered by parent path (`did`)
//!    and filtered on `ct` in the window, `shard_count` shards per page;
//! 3. because shards are ordered by parent, the shards of one parent form a
//!    contiguous run. A run is finalized as soon as a shard of another parent
//!    shows up, or when the scan is exhausted. At most one unfinished run is
//!    carried from one page to the next;
//! 4. each finalized run is summed field by field and committed as one atomic
//!    batch: a multi-field increment of the parent (zero sums left out) plus
//!    a delete of every consumed shard;
//! 5. a page shorter than `shard_count` ends the scan.
//!
//! ```text
//!   page 1: [p1/0 p1/1 p1/3 p2/0]      page 2: [p2/2 p3/1]
//!            └──── p1 ────┘  └─ carry ─────┘└p2┘ └p3┘
//!                   │                        │     │
//!                commit                   commit commit
//! ```
//!
//! Batches committed before a failure stay committed; the failure aborts the
//! pass and is returned as [`CounterError::Rollup`] together with the
//! progress made. Cancellation likewise returns
//! [`CounterError::RollupCancelled`] with the progress made. A later pass
//! picks up whatever is left, since the consumed shards of a failed batch
//! were not deleted either.
//!
//! Passes of one [`ShardedCounter`] never overlap: a call made while a pass
//! is running returns [`CounterError::RollupInProgress`]. Passes run by
//! different processes over the same store are not coordinated and may
//! double count; run rollup from one place per counter definition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::counter::ShardedCounter;
use crate::error::{CounterError, Result};
use crate::store::{Document, DocumentRef, DocumentStore, FieldUpdate, GroupQuery, WriteBatch};
use crate::value::{is_reserved_field, Delta, CREATION_TICK_FIELD, DOCUMENT_ID_FIELD};

/// Summary of a rollup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupReport {
    /// Query pages fetched.
    pub pages: usize,
    /// Parents whose shards were folded in.
    pub parents: usize,
    /// Shards deleted after being folded in.
    pub shards_deleted: usize,
    /// Parent fields incremented, summed over all parents.
    pub fields_incremented: usize,
    /// Shards left in place because their parent path is unusable.
    pub shards_skipped: usize,
}

/// Sums every non-reserved numeric field of `shards`.
///
/// Integer fields are summed as 64-bit integers and fail with
/// [`CounterError::Overflow`] instead of wrapping; a field holding a float in
/// any shard is summed as a float. Non-numeric fields are ignored.
///
/// ```rust
/// use contatori_distribuiti::rollup::aggregate;
/// use contatori_distribuiti::store::{Document, DocumentRef};
/// use contatori_distribuiti::value::Delta;
/// use serde_json::json;
///
/// let shard = |id: &str, fields: serde_json::Value| {
///     Document::new(
///         DocumentRef::new("posts", "p1").collection("likes").doc(id),
///         fields.as_object().unwrap().clone(),
///     )
/// };
///
/// let totals = aggregate(&[
///     shard("0", json!({"count": 2, "did": "posts/p1", "ct": 7})),
///     shard("1", json!({"count": 3, "time": 0.5, "tag": "x"})),
/// ])
/// .unwrap();
///
/// assert_eq!(totals.get("count"), Some(&Delta::Integer(5)));
/// assert_eq!(totals.get("time"), Some(&Delta::Float(0.5)));
/// assert!(!totals.contains_key("ct"));
/// assert!(!totals.contains_key("tag"));
/// ```
pub fn aggregate(shards: &[Document]) -> Result<BTreeMap<String, Delta>> {
    let mut totals: BTreeMap<String, Delta> = BTreeMap::new();
    for shard in shards {
        for (field, value) in shard.fields() {
            if is_reserved_field(field) {
                continue;
            }
            let Value::Number(number) = value else {
                continue;
            };

            let overflow = || CounterError::Overflow {
                field: field.clone(),
            };
            let delta = Delta::from_number(number).ok_or_else(overflow)?;
            let total = match totals.get(field) {
                Some(total) => total.checked_add(delta).ok_or_else(overflow)?,
                None => delta,
            };
            totals.insert(field.clone(), total);
        }
    }
    Ok(totals)
}

/// Clears the running flag when a pass ends, however it ends.
struct SingleFlight<'a>(&'a AtomicBool);

impl<'a> SingleFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SingleFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shards of one parent seen so far.
struct PendingGroup {
    parent: String,
    shards: Vec<Document>,
}

struct RollupPass<'a, S> {
    store: &'a S,
    page_size: usize,
    cancel: &'a CancellationToken,
    report: RollupReport,
}

impl<S: DocumentStore> RollupPass<'_, S> {
    fn run(mut self, query: GroupQuery) -> Result<RollupReport> {
        match self.scan(query) {
            Ok(()) => Ok(self.report),
            Err(CounterError::Cancelled) => Err(CounterError::RollupCancelled {
                committed: self.report,
            }),
            Err(err) => Err(err),
        }
    }

    fn scan(&mut self, query: GroupQuery) -> Result<()> {
        let mut next = query.clone();
        let mut pending: Option<PendingGroup> = None;

        loop {
            self.check_cancelled()?;
            let page = self.store.query_group(&next, self.cancel)?;
            self.report.pages += 1;
            let exhausted = page.documents.len() < self.page_size;

            for shard in page.documents {
                let Some(parent) = shard.get(DOCUMENT_ID_FIELD).and_then(Value::as_str) else {
                    warn!(
                        target: "contatori::rollup",
                        shard = %shard.reference(),
                        "skipping shard without a parent path"
                    );
                    self.report.shards_skipped += 1;
                    continue;
                };

                if let Some(group) = pending.as_mut().filter(|g| g.parent == parent) {
                    group.shards.push(shard);
                    continue;
                }

                let group = PendingGroup {
                    parent: parent.to_string(),
                    shards: vec![shard],
                };
                if let Some(done) = pending.replace(group) {
                    self.finalize(done)?;
                }
            }

            match page.cursor {
                Some(cursor) if !exhausted => next = query.clone().start_after(cursor),
                _ => break,
            }
        }

        if let Some(done) = pending.take() {
            self.finalize(done)?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(CounterError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn finalize(&mut self, group: PendingGroup) -> Result<()> {
        self.check_cancelled()?;
        let parent = group.parent.clone();
        self.commit_group(group).map_err(|source| match source {
            CounterError::Cancelled => CounterError::Cancelled,
            source => CounterError::Rollup {
                parent,
                source: Box::new(source),
                committed: self.report,
            },
        })
    }

    fn commit_group(&mut self, group: PendingGroup) -> Result<()> {
        let Ok(parent) = DocumentRef::parse(&group.parent) else {
            warn!(
                target: "contatori::rollup",
                parent = %group.parent,
                shards = group.shards.len(),
                "skipping shards with an invalid parent path"
            );
            self.report.shards_skipped += group.shards.len();
            return Ok(());
        };

        let updates = aggregate(&group.shards)?
            .into_iter()
            .filter(|(_, total)| !total.is_zero())
            .map(|(field, total)| FieldUpdate::increment(field, total))
            .collect::<Vec<_>>();
        let fields = updates.len();

        let mut batch = WriteBatch::new();
        if !updates.is_empty() {
            batch.update(parent.clone(), updates);
        }
        for shard in &group.shards {
            batch.delete(shard.reference().clone());
        }

        self.store.commit(batch, self.cancel)?;

        self.report.parents += 1;
        self.report.shards_deleted += group.shards.len();
        self.report.fields_incremented += fields;
        debug!(
            target: "contatori::rollup",
            parent = %parent,
            shards = group.shards.len(),
            fields,
            "rolled up shards"
        );
        Ok(())
    }
}

impl<S: DocumentStore, C: Clock, R> ShardedCounter<S, C, R> {
    /// Runs one rollup pass over the shards of every parent.
    ///
    /// Returns what was rolled up. A pass that finds nothing to do performs
    /// no writes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use contatori_distribuiti::cancel::CancellationToken;
    /// use contatori_distribuiti::clock::ManualClock;
    /// use contatori_distribuiti::counter::ShardedCounter;
    /// use contatori_distribuiti::definition::CounterDefinition;
    /// use contatori_distribuiti::store::memory::MemoryStore;
    /// use contatori_distribuiti::store::{DocumentRef, DocumentStore};
    /// use serde_json::json;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// # fn main() -> contatori_distribuiti::error::Result<()> {
    /// let store = Arc::new(MemoryStore::new());
    /// let clock = Arc::new(ManualClock::new(6_000));
    /// let definition = CounterDefinition::builder("likes").shard_count(4).build()?;
    /// let counter = ShardedCounter::new(definition, Arc::clone(&store))
    ///     .with_clock(Arc::clone(&clock));
    ///
    /// let cancel = CancellationToken::new();
    /// let post = DocumentRef::new("posts", "p1");
    /// store.set(&post, json!({"count": 100}).as_object().unwrap().clone(), &cancel)?;
    ///
    /// counter.increment(&post, "count", 5)?;
    /// counter.increment(&post, "count", 5)?;
    ///
    /// // Fresh shards are not eligible during the interval they were written in.
    /// assert_eq!(counter.rollup()?.parents, 0);
    ///
    /// clock.advance(Duration::from_secs(60));
    /// let report = counter.rollup()?;
    /// assert_eq!(report.parents, 1);
    ///
    /// let post = store.get(&post, &cancel)?.unwrap();
    /// assert_eq!(post.get("count"), Some(&json!(110)));
    /// # Ok(())
    /// # }
    /// ```
    pub fn rollup(&self) -> Result<RollupReport> {
        self.rollup_with_cancel(&CancellationToken::new())
    }

    /// Runs one rollup pass, stopping early once `cancel` is cancelled.
    ///
    /// The token is checked before every page fetch and every batch commit,
    /// and handed to the store so that a query or commit in flight is
    /// abandoned too. Batches committed before cancellation stay committed;
    /// the pass returns [`CounterError::RollupCancelled`] describing them.
    pub fn rollup_with_cancel(&self, cancel: &CancellationToken) -> Result<RollupReport> {
        let name = self.definition().name();
        let _running = SingleFlight::acquire(&self.rollup_running)
            .ok_or_else(|| CounterError::RollupInProgress(name.to_string()))?;

        let window = self.definition().staleness_window(self.clock().now());
        let (newest, oldest) = (window.first().copied(), window.last().copied());

        let page_size = self.definition().shard_count();
        let query = GroupQuery::collection_group(name)
            .order_by(DOCUMENT_ID_FIELD)
            .where_in(CREATION_TICK_FIELD, window.into_iter().map(Value::from).collect())
            .limit(page_size);

        let pass = RollupPass {
            store: self.store(),
            page_size,
            cancel,
            report: RollupReport::default(),
        };

        match pass.run(query) {
            Ok(report) => {
                info!(
                    target: "contatori::rollup",
                    counter = name,
                    newest_tick = newest,
                    oldest_tick = oldest,
                    pages = report.pages,
                    parents = report.parents,
                    shards = report.shards_deleted,
                    skipped = report.shards_skipped,
                    "rollup pass completed"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(target: "contatori::rollup", counter = name, error = %err, "rollup pass aborted");
                Err(err)
            }
        }
    }
}
