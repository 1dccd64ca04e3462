//! Operator console core: PTY execution with live classification,
//! redaction before persistence, session recording and a per-engagement
//! audit store.

pub mod classifier;
pub mod command_kind;
pub mod config;
pub mod error;
pub mod executor;
pub mod i18n;
pub mod interrupt;
pub mod logging;
pub mod recorder;
pub mod redactor;
pub mod session;
pub mod storage;
pub mod store_manager;
pub mod terminal;

pub use classifier::{Category, HighlightSet, PatternTable};
pub use error::{ExecFailure, PersistenceError, StoreResult};
pub use executor::{EngineConfig, ExecutionOutcome, PtyEngine};
pub use recorder::{Recording, SessionRecorder};
pub use session::{Session, SessionContext};
pub use store_manager::{AuditStore, ExecutionQuery, SearchScope};
