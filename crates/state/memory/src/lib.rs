//! In-memory [`MetadataStore`](chatvault_state::MetadataStore) backend.

mod store;

pub use store::MemoryMetadataStore;
