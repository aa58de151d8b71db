//! LuckyOnes Core
//!
//! Sans-IO messaging core: pairwise ratchet sessions, time-bounded threads
//! and the deadline queue that deletes them. Nothing here performs I/O or
//! reads a clock directly. Time and randomness come from an
//! [`Environment`], and every operation returns the frames or notices the
//! caller must act on.
//!
//! # Components
//!
//! - [`RatchetEngine`]: owns every session, one lock per session
//! - [`ThreadRegistry`]: owns every thread, one lock per thread
//! - [`ExpiryScheduler`]: pollable deadline queue for threads and attachments
//! - [`MessageRouter`]: façade translating protocol events into engine and
//!   registry calls
//!
//! # Concurrency
//!
//! All components take `&self` and are shared behind `Arc`. Two sends on
//! the same session serialize on that session's mutex, so no counter or
//! message key is ever handed out twice. Locks are never held across I/O
//! and never nested across sessions or threads.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod attachment;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod expiry;
pub mod identity;
pub mod router;
pub mod thread;
pub mod thread_registry;

pub use attachment::{AttachmentError, AttachmentStore, MemoryAttachmentStore};
pub use config::CoreConfig;
pub use engine::RatchetEngine;
pub use env::Environment;
pub use error::CoreError;
pub use expiry::{DeadlineId, ExpiryScheduler, ExpiryTarget, Fired};
pub use identity::{AttachmentId, ParticipantId, ThreadId};
pub use router::{
    DeliveredContent, DeliveredMessage, MessageRouter, Notice, RouterAction, RouterStats,
};
pub use thread::{Admission, DeleteReason, MessageEnvelope, ThreadKind, ThreadSnapshot};
pub use thread_registry::{ClosedThread, NewThread, ThreadRegistry};
