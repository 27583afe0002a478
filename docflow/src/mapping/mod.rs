//! Content-addressed mapping cache.
//!
//! Deriving column-mapping code for a spreadsheet is expensive, so the
//! result is cached under a fingerprint of the active profile and the
//! document's canonical header list. Equal header shapes under one
//! profile share one mapping.

mod cache;
mod fingerprint;
pub mod generator;
mod resolver;
pub mod sql;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use cache::{InMemoryMappingCache, MappingCache, MappingCacheEntry};
pub use fingerprint::{canonicalize_header, canonicalize_headers, Fingerprint};
pub use generator::{HeaderMatchGenerator, MappingGenerator, MappingRequest};
#[cfg(feature = "llm")]
pub use generator::ChatMappingGenerator;
pub use resolver::{MappingOrigin, MappingResolver, ResolverStats};
pub use sql::Projection;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMappingCache;
