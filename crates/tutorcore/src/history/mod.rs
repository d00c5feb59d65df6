//! Conversation history and context windowing.

mod models;
mod repository;
pub mod window;

pub use models::{EntryKind, HistoryEntry, NewEntry, Role};
pub use repository::{DEFAULT_MAX_CHARS, HistoryUser, HistoryWindow};
