pub mod daemon;
pub mod sync;
pub mod token_provider;
