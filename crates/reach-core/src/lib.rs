pub mod canon;
pub mod config;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod policy;
pub mod traits;
pub mod types;

pub use error::{ErrorCategory, ErrorEnvelope, ReachError, Result};
pub use event::TelemetryBus;
pub use fingerprint::{compute_fingerprint, derive_run_id, event_log_hash, ENGINE_VERSION};
pub use policy::{Capability, DenyReason, PackContext, PackIntegrity, Policy};
pub use types::*;
