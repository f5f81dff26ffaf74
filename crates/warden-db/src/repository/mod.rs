//! Repository layer — query functions organized by entity.
//!
//! All functions take a `&mut AnyConnection`; callers decide whether that
//! connection is a plain pooled one (reads) or the inside of an open
//! transaction (every mutating engine operation).

pub mod certificates;
pub mod clients;
pub mod devices;
pub mod transactions;
pub mod users;
