//! Cluster Integration Tests
//!
//! Several clients committing against one server at once: end-to-end mutual
//! exclusion, global apply order, watermark publication.

#[path = "../common/mod.rs"]
mod common;

mod contention;
mod watermarks;
