//! hetseq - Heterogeneous Sequence Containers
//!
//! Containers that store a sequence of values of *different* complete types
//! in a single contiguous (or paged) memory region, with value semantics and
//! tight packing:
//!
//! - [`DenseList`]: a tightly packed single-owner list. Each element sits at
//!   the next address aligned to its own alignment; mutations rebuild the
//!   block atomically with the strong exception guarantee.
//! - [`Queue`] (and its configuration aliases like [`MpMcQueue`] and
//!   [`SpScQueue`]): a lock-free page-based FIFO with configurable producer
//!   and consumer cardinalities and consistency models, a three-phase put
//!   protocol (allocate, construct, commit) and a two-phase consume protocol
//!   (claim, commit-or-cancel).
//!
//! Both are built on [`RuntimeType`], a pointer-sized descriptor that erases
//! an element's complete type behind a selectable feature set.
//!
//! # Example
//!
//! ```
//! use hetseq::{dense_list, MpMcQueue};
//!
//! // Dense list: three values of three types, packed in one block.
//! let list = dense_list![7i32, String::from("x"), 3.5f64];
//! assert_eq!(list.len(), 3);
//!
//! // Queue: heterogeneous FIFO between threads.
//! let queue = MpMcQueue::<()>::new();
//! let producer = queue.producer().unwrap();
//! let consumer = queue.consumer().unwrap();
//! producer.push(String::from("job"));
//! let op = consumer.try_start_consume().unwrap();
//! assert_eq!(op.element::<String>(), "job");
//! op.commit();
//! ```

mod address;
mod backoff;
mod dense_buffer;
mod dense_list;
mod error;
mod invariants;
mod metrics;
mod page_alloc;
mod queue;
mod runtime_type;

pub use backoff::Backoff;
pub use dense_list::{DenseList, ElementRef, Iter, MakeList, Value};
pub use error::{AllocError, CtorError, DenseError, RegisterError, StreamError, TryPushError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use page_alloc::{PageAllocator, PagedAllocator, ProgressGuarantee};
pub use queue::{
    ConsumeOperation, Consumer, DynPutTransaction, McHead, MpMcQueue, MpRelaxedTail, MpScQueue,
    MpSeqTail, MultiConsumer, MultiProducer, Producer, PutTransaction, Queue, RelaxedMpMcQueue,
    RelaxedMpScQueue, ScHead, SpMcQueue, SpScQueue, SpTail,
};
pub use runtime_type::{feature, BaseOf, RuntimeType, TryClone, TryDefault};
