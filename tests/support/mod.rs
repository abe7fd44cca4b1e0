//! Shared helpers for integration tests: socket guard and fake media servers.

#![allow(dead_code)]

pub mod media;
pub mod socket_guard;
