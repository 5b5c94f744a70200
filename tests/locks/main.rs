//! Lock Integration Tests
//!
//! Distributed locking between loopback clients: greedy recall, wait and
//! notify carried by transactions, try-lock refusal, disconnect cleanup.

#[path = "../common/mod.rs"]
mod common;

mod greedy;
mod wait_notify;
