//! Conversation state engine for tangent.
//!
//! This crate owns everything between the UI and a model provider:
//!
//! - [`models`]: sessions, messages, typed content parts, threads, and fork
//!   buckets, plus the [`SessionStore`](models::SessionStore) that keeps them
//!   in memory, persists them, and broadcasts changes.
//! - [`repositories`]: pluggable persistence (SQLite, JSON files, in-memory)
//!   behind the [`SessionRepository`](repositories::SessionRepository) trait.
//! - [`services`]: the provider-agnostic [`ChatModel`](services::ChatModel)
//!   seam, stream-to-content-part assembly, blob storage for attachments, and
//!   the pure fork/thread mutations.
//! - [`controllers`]: the
//!   [`GenerationController`](controllers::GenerationController) driving one
//!   generation from prompt assembly to terminal message state, with
//!   cancellation.
//!
//! Provider adapters live outside this crate; they implement
//! [`ChatModel`](services::ChatModel) and translate their wire format into
//! [`StreamChunk`](services::StreamChunk)s.

pub mod controllers;
pub mod error;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

pub use controllers::GenerationController;
pub use error::{ErrorCode, GenerationError, GenerationResult};
pub use models::{Message, Session, SessionStore};
pub use settings::{Settings, SessionSettings};
