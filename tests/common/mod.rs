//! Shared support for the producer integration tests

#![allow(dead_code)]

pub mod helpers;
pub mod mocks;
