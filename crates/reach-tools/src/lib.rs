pub mod adapters;
pub mod registry;

pub use adapters::fallback::SmallDeterministicFallback;
pub use adapters::hosted::HostedAdapter;
pub use adapters::local::LocalAdapter;
pub use registry::{AdapterRegistry, AdapterSet};
