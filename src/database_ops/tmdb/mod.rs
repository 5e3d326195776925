pub mod provider;

pub use provider::{TmdbConfig, TmdbProvider};
