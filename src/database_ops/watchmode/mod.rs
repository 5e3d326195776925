pub mod provider;

pub use provider::{WatchmodeConfig, WatchmodeProvider, PAGE_LIMIT};
