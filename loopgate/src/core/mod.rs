//! Pure, deterministic logic over session documents and agent output.
//!
//! Nothing in here touches the filesystem or spawns processes.

pub mod immutability;
pub mod metadata;
pub mod sections;
pub mod status;
pub mod stream;
pub mod tools;
pub mod types;
pub mod verdict;
