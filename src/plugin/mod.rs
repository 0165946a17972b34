//! Plugin Runtime
//!
//! Per-session resource cache, the scan context handed to plugins, the
//! scan lifecycle with its transactional flush, and edge-triggered alert
//! tracking.

pub mod alerts;
pub mod cache;
pub mod context;
pub mod events;
mod flush;
pub mod session;

pub use alerts::{AlertKey, AlertTracker};
pub use cache::SessionCache;
pub use context::ScanContext;
pub use events::{ScanKind, SessionEvent};
pub use session::{PluginSession, ScanReport, SessionState};
