//! redb table definitions for the Forgepool instance store.
//!
//! A single table holds every instance record, keyed by instance id with
//! JSON-serialized values.

use redb::TableDefinition;

/// Instance records keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
