pub mod store;

pub use store::{RunSummary, SqliteStorage};
