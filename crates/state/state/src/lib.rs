//! Metadata store abstraction.
//!
//! The engine persists objects, their chunks and health scans through
//! [`MetadataStore`]. The schema belongs to the backend; the engine only needs
//! the operations on the trait.

pub mod error;
pub mod store;
pub mod testing;

pub use error::StateError;
pub use store::{ChunkUrlUpdate, MetadataStore};
