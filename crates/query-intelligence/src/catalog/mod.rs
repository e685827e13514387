//! Entity catalog - maps business entity names onto actual table names

pub mod entity_catalog;
pub mod entity_map;

pub use entity_catalog::{is_junction_table, EntityCatalog};
pub use entity_map::EntityMap;
