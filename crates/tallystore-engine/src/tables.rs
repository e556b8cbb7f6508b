//! Redb table definitions shared by every store.

use redb::TableDefinition;

// De-duplicated stores, keyed by (content hash, disambiguator)
// Value: raw dimension key bytes
pub const KEYS: TableDefinition<(u64, u16), &[u8]> = TableDefinition::new("keys");
// Value: type tag byte followed by the payload
pub const VALUES: TableDefinition<(u64, u16), &[u8]> = TableDefinition::new("values");

// Key: row key built by the store's codec, Value: encoded record
pub const ROWS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rows");

// Key: "schema", Value: bincode-encoded SchemaInfo
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const SCHEMA_KEY: &str = "schema";
