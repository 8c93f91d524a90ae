//! Query functions, one module per entity family.
//!
//! Every function takes a borrowed [`rusqlite::Connection`]; callers that
//! need cross-row atomicity (earnings) take `&mut Connection` and run a
//! transaction.

pub mod assignments;
pub mod chunks;
pub mod earnings;
pub mod files;
pub mod peers;
pub mod proofs;
