//! Database tests
//!
//! Store behaviour against an on-disk SQLite file.

#[cfg(test)]
pub mod upsert_test;
