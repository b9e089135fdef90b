//! External collaborator traits.
//!
//! The store consumes these as optional, mutable-atomic-field collaborators
//! installed post-construction, since
//! `SearchIndexer`/`TranscodeDeleter`-equivalents break a cyclic
//! initialization dependency and so are wired in after `Store::open`
//! returns, not passed into its constructor.

use std::fmt;

/// Structured logging sink. Optional: internal diagnostics always go
/// through `tracing` regardless of whether a `Logger` is installed; this
/// trait exists purely so host applications can bridge store-level events
/// into their own structured log pipeline.
pub trait Logger: Send + Sync {
    fn info(&self, msg: &str, fields: &[(&str, &str)]);
    fn warn(&self, msg: &str, fields: &[(&str, &str)]);
    fn error(&self, msg: &str, fields: &[(&str, &str)]);
    fn debug(&self, msg: &str, fields: &[(&str, &str)]);
}

/// Fire-and-forget domain-event sink. Never blocks or errors
/// the store: failures (a full channel, a panicking subscriber) are logged
/// and swallowed at the call site.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: DomainEvent);
    fn set_scanning(&self, scanning: bool);
}

/// A domain event broadcast after a successful commit. Intentionally coarse
/// (entity + id + kind) — payload enrichment is the DTO layer's job
/// (out of scope for this layer).
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub entity: &'static str,
    pub id: String,
    pub kind: DomainEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEventKind {
    Created,
    Updated,
    Deleted,
}

/// Async index-update sink. Failures are logged, never
/// propagated — the originating store operation has already committed.
pub trait SearchIndexer: Send + Sync {
    fn index_book(&self, id: &str);
    fn delete_book(&self, id: &str);
    fn index_contributor(&self, id: &str);
    fn delete_contributor(&self, id: &str);
    fn index_series(&self, id: &str);
    fn delete_series(&self, id: &str);
}

/// Cascade hook for on-disk transcoded-artifact cleanup.
pub trait TranscodeDeleter: Send + Sync {
    fn delete_transcodes_for_book(&self, book_id: &str);
}

/// No-op implementations, used when a collaborator hasn't been installed
/// yet.
#[derive(Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _msg: &str, _fields: &[(&str, &str)]) {}
    fn warn(&self, _msg: &str, _fields: &[(&str, &str)]) {}
    fn error(&self, _msg: &str, _fields: &[(&str, &str)]) {}
    fn debug(&self, _msg: &str, _fields: &[(&str, &str)]) {}
}

#[derive(Debug, Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: DomainEvent) {}
    fn set_scanning(&self, _scanning: bool) {}
}

impl fmt::Debug for dyn SearchIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn SearchIndexer")
    }
}

impl fmt::Debug for dyn TranscodeDeleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn TranscodeDeleter")
    }
}
