//! Block I/O Layer
//!
//! The 512-byte block device contract and the LRU block cache.

pub mod block;
pub mod cache;
