//! Shared database plumbing

pub mod init;

pub use init::*;
