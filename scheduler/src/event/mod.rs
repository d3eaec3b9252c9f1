//! Durable-queue seam for terminal outcomes (spec.md §4.11). `CompletionQueue`
//! is the trait a real at-least-once broker client would implement; this
//! crate ships an in-process `tokio::mpsc` implementation for tests and
//! single-node runs, matching the spec's explicit "the message queue itself
//! is out of scope" framing (spec.md §1).

pub mod consumer;
pub mod producer;

pub use consumer::CompletionConsumer;
pub use producer::{CompletionQueue, InMemoryCompletionQueue};
