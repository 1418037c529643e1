//! The document store interface required by the counters.
//!
//! Counters never talk to a concrete database. They are handed a
//! [`DocumentStore`], which provides:
//!
//! - point reads, creates, overwrites and deletes of single documents;
//! - field updates, including the atomic [`WriteValue::Increment`] marker
//!   ("add this delta to the current value, treating a missing field as
//!   zero");
//! - collection-group queries ordered by one field, filtered by an `IN`
//!   predicate, limited, and resumable through a [`Cursor`];
//! - all-or-nothing [`WriteBatch`] commits.
//!
//! Documents live at slash-separated paths alternating collection ids and
//! document ids, e.g. `videos/v1/likes/3`. A *collection group* is every
//! collection with a given id, wherever it is nested; the rollup scan uses it
//! to walk the shards of all parents at once.
//!
//! [`memory::MemoryStore`] is a complete in-process implementation used by
//! the tests, the benchmark and the demo.
//!
//! ```text
//!   videos/v1 ──────────────► parent document (owned by the application)
//!   videos/v1/likes/0  ─┐
//!   videos/v1/likes/1   ├───► shard documents (owned by the counter)
//!   videos/v1/likes/N-1 ┘
//! ```

pub mod memory;

use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::error::StoreError;
use crate::value::{Delta, Fields};

/// Reference to a document by path.
///
/// # Examples
///
/// ```rust
/// use contatori_distribuiti::store::DocumentRef;
///
/// let video = DocumentRef::new("videos", "v1");
/// let shard = video.collection("likes").doc("3");
///
/// assert_eq!(shard.path(), "videos/v1/likes/3");
/// assert_eq!(shard.id(), "3");
/// assert_eq!(shard.collection_id(), "likes");
/// assert_eq!(shard.parent(), Some(video));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentRef {
    path: String,
}

impl DocumentRef {
    /// Creates a reference to a top-level document.
    pub fn new(collection: &str, id: &str) -> Self {
        Self {
            path: format!("{collection}/{id}"),
        }
    }

    /// Parses a full document path.
    ///
    /// The path must have an even, non-zero number of non-empty segments.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let segments = path.split('/').collect::<Vec<_>>();
        if segments.len() % 2 != 0 || segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(Self {
            path: path.to_string(),
        })
    }

    /// The full path of the document.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The id of the document, i.e. the last path segment.
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// The id of the collection containing the document.
    pub fn collection_id(&self) -> &str {
        self.path.rsplit('/').nth(1).unwrap_or_default()
    }

    /// The document owning the collection this document belongs to, if the
    /// document is nested.
    pub fn parent(&self) -> Option<DocumentRef> {
        let (collection_path, _) = self.path.rsplit_once('/')?;
        let (parent_path, _) = collection_path.rsplit_once('/')?;
        Some(DocumentRef {
            path: parent_path.to_string(),
        })
    }

    /// A sub-collection of this document.
    pub fn collection(&self, id: &str) -> CollectionRef {
        CollectionRef {
            path: format!("{}/{id}", self.path),
        }
    }
}

impl Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Reference to a (possibly nested) collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    path: String,
}

impl CollectionRef {
    /// The full path of the collection.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A document of this collection.
    pub fn doc(&self, id: &str) -> DocumentRef {
        DocumentRef {
            path: format!("{}/{id}", self.path),
        }
    }
}

/// A document read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    reference: DocumentRef,
    fields: Fields,
}

impl Document {
    /// Creates a document snapshot.
    pub fn new(reference: DocumentRef, fields: Fields) -> Self {
        Self { reference, fields }
    }

    /// Where the document lives.
    pub fn reference(&self) -> &DocumentRef {
        &self.reference
    }

    /// All fields of the document.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// A single field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// When the store applied the write.
    pub update_time: SystemTime,
}

/// The value written by a [`FieldUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    /// Replace the field.
    Set(Value),
    /// Add to the field atomically, treating a missing field as zero.
    Increment(Delta),
}

/// One field of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    /// Name of the field.
    pub field: String,
    /// What to write.
    pub value: WriteValue,
}

impl FieldUpdate {
    /// Replaces `field` with `value`.
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: WriteValue::Set(value.into()),
        }
    }

    /// Adds `delta` to `field`.
    pub fn increment(field: impl Into<String>, delta: Delta) -> Self {
        Self {
            field: field.into(),
            value: WriteValue::Increment(delta),
        }
    }
}

/// A write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or overwrite a document.
    Set {
        /// Target document.
        reference: DocumentRef,
        /// New content.
        fields: Fields,
    },
    /// Update fields of an existing document.
    Update {
        /// Target document, which must exist.
        reference: DocumentRef,
        /// Fields to write.
        updates: Vec<FieldUpdate>,
    },
    /// Delete a document.
    Delete {
        /// Target document.
        reference: DocumentRef,
    },
}

/// A list of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an overwrite of `reference`.
    pub fn set(&mut self, reference: DocumentRef, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Set { reference, fields });
        self
    }

    /// Adds an update of `reference`.
    pub fn update(&mut self, reference: DocumentRef, updates: Vec<FieldUpdate>) -> &mut Self {
        self.ops.push(WriteOp::Update { reference, updates });
        self
    }

    /// Adds a delete of `reference`.
    pub fn delete(&mut self, reference: DocumentRef) -> &mut Self {
        self.ops.push(WriteOp::Delete { reference });
        self
    }

    /// The writes of the batch, in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if the batch contains no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, returning its writes.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Position after which a [`GroupQuery`] resumes.
///
/// Cursors are produced by the store for the last document of a [`Page`];
/// callers only hand them back.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    order_value: Value,
    reference: DocumentRef,
}

impl Cursor {
    /// Creates a cursor positioned on `document` for a query ordered by
    /// `order_by`. Without an ordering field, or when `document` lacks it,
    /// the ordering value is `null` and the path alone decides.
    pub fn at(document: &Document, order_by: Option<&str>) -> Self {
        Self {
            order_value: order_by
                .and_then(|field| document.get(field))
                .cloned()
                .unwrap_or(Value::Null),
            reference: document.reference().clone(),
        }
    }

    /// Value of the ordering field at the cursor position.
    pub fn order_value(&self) -> &Value {
        &self.order_value
    }

    /// Document at the cursor position, the tie-breaker for equal values.
    pub fn reference(&self) -> &DocumentRef {
        &self.reference
    }
}

/// A query over every collection with a given id.
///
/// # Examples
///
/// ```rust
/// use contatori_distribuiti::store::GroupQuery;
/// use serde_json::json;
///
/// let query = GroupQuery::collection_group("likes")
///     .order_by("did")
///     .where_in("ct", vec![json!(10), json!(9)])
///     .limit(4);
///
/// assert_eq!(query.group(), "likes");
/// assert_eq!(query.limit_value(), Some(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GroupQuery {
    group: String,
    order_by: Option<String>,
    filter: Option<(String, Vec<Value>)>,
    limit: Option<usize>,
    start_after: Option<Cursor>,
}

impl GroupQuery {
    /// Starts a query over every collection named `group`.
    pub fn collection_group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            order_by: None,
            filter: None,
            limit: None,
            start_after: None,
        }
    }

    /// Orders results by `field` ascending; ties are broken by path.
    pub fn order_by(self, field: impl Into<String>) -> Self {
        Self {
            order_by: Some(field.into()),
            ..self
        }
    }

    /// Keeps documents whose `field` equals one of `values`.
    pub fn where_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            filter: Some((field.into(), values)),
            ..self
        }
    }

    /// Returns at most `n` documents.
    pub fn limit(self, n: usize) -> Self {
        Self {
            limit: Some(n),
            ..self
        }
    }

    /// Resumes after `cursor`.
    pub fn start_after(self, cursor: Cursor) -> Self {
        Self {
            start_after: Some(cursor),
            ..self
        }
    }

    /// Collection id scanned by the query.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Ordering field, if any.
    pub fn order_field(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    /// `IN` filter, if any.
    pub fn filter(&self) -> Option<(&str, &[Value])> {
        self.filter
            .as_ref()
            .map(|(field, values)| (field.as_str(), values.as_slice()))
    }

    /// Page size, if any.
    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    /// Resume position, if any.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.start_after.as_ref()
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Matching documents, in query order.
    pub documents: Vec<Document>,
    /// Cursor on the last document, `None` for an empty page.
    pub cursor: Option<Cursor>,
}

/// Total order over JSON values used for query ordering.
///
/// Values of different kinds order as null < booleans < numbers < strings <
/// arrays < objects.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A document store with atomic increments, collection-group queries and
/// atomic batches.
///
/// Every method is a blocking call and receives the caller's
/// [`CancellationToken`]. Once the token is cancelled an implementation
/// should abandon the call, including one already waiting on the network,
/// and return [`StoreError::Cancelled`]. Whether a write abandoned in flight
/// was applied is up to the store; [`WriteBatch`] commits stay all-or-nothing
/// either way. Errors are returned verbatim to the counter's caller.
pub trait DocumentStore {
    /// Reads a document, returning `None` if it does not exist.
    fn get(
        &self,
        reference: &DocumentRef,
        cancel: &CancellationToken,
    ) -> Result<Option<Document>, StoreError>;

    /// Creates a document, failing with [`StoreError::AlreadyExists`] if it
    /// exists.
    fn create(
        &self,
        reference: &DocumentRef,
        fields: Fields,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError>;

    /// Creates or overwrites a document.
    fn set(
        &self,
        reference: &DocumentRef,
        fields: Fields,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError>;

    /// Updates fields of an existing document, failing with
    /// [`StoreError::NotFound`] if it does not exist.
    fn update(
        &self,
        reference: &DocumentRef,
        updates: &[FieldUpdate],
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError>;

    /// Deletes a document. Deleting a missing document succeeds.
    fn delete(
        &self,
        reference: &DocumentRef,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, StoreError>;

    /// Runs one page of a collection-group query.
    fn query_group(
        &self,
        query: &GroupQuery,
        cancel: &CancellationToken,
    ) -> Result<Page, StoreError>;

    /// Applies every write of `batch`, or none of them.
    fn commit(
        &self,
        batch: WriteBatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<WriteResult>, StoreError>;
}

macro_rules! forward_document_store {
    ($($ty:ty),*) => {$(
        impl<S: DocumentStore + ?Sized> DocumentStore for $ty {
            fn get(
                &self,
                reference: &DocumentRef,
                cancel: &CancellationToken,
            ) -> Result<Option<Document>, StoreError> {
                (**self).get(reference, cancel)
            }

            fn create(
                &self,
                reference: &DocumentRef,
                fields: Fields,
                cancel: &CancellationToken,
            ) -> Result<WriteResult, StoreError> {
                (**self).create(reference, fields, cancel)
            }

            fn set(
                &self,
                reference: &DocumentRef,
                fields: Fields,
                cancel: &CancellationToken,
            ) -> Result<WriteResult, StoreError> {
                (**self).set(reference, fields, cancel)
            }

            fn update(
                &self,
                reference: &DocumentRef,
                updates: &[FieldUpdate],
                cancel: &CancellationToken,
            ) -> Result<WriteResult, StoreError> {
                (**self).update(reference, updates, cancel)
            }

            fn delete(
                &self,
                reference: &DocumentRef,
                cancel: &CancellationToken,
            ) -> Result<WriteResult, StoreError> {
                (**self).delete(reference, cancel)
            }

            fn query_group(
                &self,
                query: &GroupQuery,
                cancel: &CancellationToken,
            ) -> Result<Page, StoreError> {
                (**self).query_group(query, cancel)
            }

            fn commit(
                &self,
                batch: WriteBatch,
                cancel: &CancellationToken,
            ) -> Result<Vec<WriteResult>, StoreError> {
                (**self).commit(batch, cancel)
            }
        }
    )*};
}

forward_document_store!(&S, Arc<S>, Box<S>);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_ref_paths() {
        let parent = DocumentRef::new("posts", "p1");
        assert_eq!(parent.path(), "posts/p1");
        assert_eq!(parent.id(), "p1");
        assert_eq!(parent.collection_id(), "posts");
        assert_eq!(parent.parent(), None);

        let shard = parent.collection("likes").doc("0");
        assert_eq!(shard.to_string(), "posts/p1/likes/0");
        assert_eq!(shard.parent().unwrap(), parent);
    }

    #[test]
    fn test_document_ref_parse() {
        assert!(DocumentRef::parse("posts/p1").is_ok());
        assert!(DocumentRef::parse("posts/p1/likes/2").is_ok());
        assert_eq!(
            DocumentRef::parse("posts"),
            Err(StoreError::InvalidPath("posts".to_string()))
        );
        assert!(DocumentRef::parse("posts//likes/2").is_err());
        assert!(DocumentRef::parse("").is_err());
    }

    #[test]
    fn test_write_batch() {
        let doc = DocumentRef::new("posts", "p1");
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch
            .update(
                doc.clone(),
                vec![FieldUpdate::increment("count", Delta::Integer(1))],
            )
            .delete(doc.collection("likes").doc("0"));

        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], WriteOp::Update { .. }));
        assert!(matches!(batch.ops()[1], WriteOp::Delete { .. }));
    }

    #[test]
    fn test_cursor_at_document() {
        let reference = DocumentRef::new("posts", "p1").collection("likes").doc("1");
        let fields = json!({"did": "posts/p1", "count": 3});
        let doc = Document::new(reference.clone(), fields.as_object().unwrap().clone());

        let cursor = Cursor::at(&doc, Some("did"));
        assert_eq!(cursor.order_value(), &json!("posts/p1"));
        assert_eq!(cursor.reference(), &reference);

        let missing = Cursor::at(&doc, Some("nope"));
        assert_eq!(missing.order_value(), &Value::Null);

        let unordered = Cursor::at(&doc, None);
        assert_eq!(unordered.order_value(), &Value::Null);
        assert_eq!(unordered.reference(), &reference);
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!("a"), &json!("b")), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(1), &json!("1")), Ordering::Less);
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }
}
