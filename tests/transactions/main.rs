//! Transaction Integration Tests
//!
//! Client transactions committed through the loopback cluster: apply,
//! acknowledgement, low-water-mark, nesting, atomic commits, resend.

#[path = "../common/mod.rs"]
mod common;

mod reconnect;
mod round_trip;
