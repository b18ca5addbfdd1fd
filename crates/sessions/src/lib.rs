//! Session identity and bookkeeping: key resolution from inbound metadata,
//! the session registry the Router consults for reset decisions, and the
//! reset lifecycle policy itself.

pub mod lifecycle;
pub mod session_key;
pub mod store;

pub use lifecycle::{LifecycleManager, ResetContext, ResetOverride, ResetReason, SessionLifecycleConfig};
pub use session_key::{resolve_session_key, InboundMeta};
pub use store::{SessionEntry, SessionRegistry};
