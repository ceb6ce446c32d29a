//! Business collaborators reached through the pipeline.
//!
//! Only the catalog lives here. It is deliberately thin: the pipeline is
//! the subject of this crate, and the catalog exists to exercise deadline
//! propagation into repository calls.

pub mod catalog;

pub use catalog::{CatalogError, CatalogRepository, InMemoryCatalog, Item, NewItem};
