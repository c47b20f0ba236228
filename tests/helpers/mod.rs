#![allow(dead_code)]

pub mod builders;

pub use builders::{admin, fixture_table, user, SnapshotBuilder};
