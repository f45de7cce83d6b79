pub mod engine;
pub mod filter;
pub mod hasher;
pub mod index;
pub mod paths;
pub mod queue;
pub mod remote;
pub mod scanner;
pub mod status;
pub mod store;
