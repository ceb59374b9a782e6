pub mod registry;
pub mod runs;
pub mod store;

pub use store::SqliteStore;
