//! Encoding catalog: media info parsing and format classification.

pub mod models;
pub mod resolver;

pub use models::{FormatDescriptor, MediaDescriptor, RawFormat, RawMediaInfo};
pub use resolver::{CatalogResolver, DEFAULT_QUALITY_FLOOR, FormatCatalog};
