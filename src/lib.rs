//! # edb
//!
//! Facade crate for the engineering database. Everything lives in
//! [`edb_core`]; this crate re-exports it so applications can depend on a
//! single name.

pub use edb_core::*;
