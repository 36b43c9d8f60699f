//! gatekeeper/crates/gk-core/src/lib.rs
//!
//! Domain models, the document filter language, port traits and the error
//! taxonomy shared by every Gatekeeper crate.

pub mod error;
pub mod filter;
pub mod models;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use filter::*;
pub use models::*;
pub use traits::*;
