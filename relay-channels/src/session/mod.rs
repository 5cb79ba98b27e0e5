//! Thread → assistant session persistence.
//!
//! Maps each conversation thread to the session id the assistant issued for
//! it, so a reply in the thread resumes the same assistant context even after
//! the relay restarts. The whole map is one JSON document rewritten atomically
//! on every change.

mod backend;
mod store;

pub use backend::{JsonFileBackend, MemoryBackend, SessionBackend, SessionMap, SessionRecord};
pub use store::{SessionStore, StoreError};
