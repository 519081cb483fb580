//! redb table definitions for the WarpFleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Member clusters keyed by `{name}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Placement policies keyed by `{namespace}/{name}`.
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// Bindings keyed by `{namespace}/{name}`.
pub const BINDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("bindings");
