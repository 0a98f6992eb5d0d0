#![forbid(unsafe_code)]

//! SQLite-backed assertion store: durable bitemporal rows, an in-memory snapshot index,
//! and reconstruction of the nested document.

mod store;

pub use store::*;
