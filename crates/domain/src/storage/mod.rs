//! Storage abstractions consumed by the verifiers. Implemented over SeaORM
//! in the storage crate; mocked in unit tests.

mod traits;

pub use traits::*;
