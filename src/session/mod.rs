//! Session management over the backend adapters.
//!
//! A session is the durable, client-visible handle on exactly one adapter
//! instance. The service keeps the process-local session → runtime index and
//! routes every other operation to the owning adapter.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ SessionService                                           │
//! │   ├─ sessions: RwLock<HashMap<id, SessionRuntime>>       │
//! │   ├─ adapters: RwLock<HashMap<BackendType, adapter>>     │
//! │   └─ store:    Arc<dyn SessionStore>  (records, templates)│
//! └──────────────────────────────────────────────────────────┘
//!            │ get_adapter(session) → (adapter, instance id)
//!            ▼
//!   QemuAdapter          RenodeAdapter          SkyEyeAdapter
//! ```
//!
//! Status transitions:
//!
//! ```text
//! created ──on──▶ running ──pause──▶ paused
//!                 │  ▲  ◀──resume──    │
//!               off  on                off
//!                 ▼  │                 │
//!                stopped ◀─────────────┘
//! any ──fatal adapter error──▶ error        any ──delete──▶ destroyed
//! ```

mod service;
mod store;
mod types;

pub use service::{BackendSummary, CapabilityMatrix, SessionService};
pub use store::{BoardTemplate, MemoryStore, SessionStore};
pub use types::{Caller, CreateSessionRequest, PowerAction, Session, SessionRuntime, SessionStatus};
