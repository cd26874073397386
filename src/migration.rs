//! Schema migrations
//!
//! A migration rewrites every entity's materialized value from one schema
//! version to the next. The rewritten values are emitted as `initialize`
//! operations stamped with the zero timestamp of the target version, so every
//! replica running the same migration produces identical operations, and any
//! real edit made under the new version sorts after them.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::clock::{SchemaVersion, TimeAuthority};
use crate::convergent::{Operation, OperationData, Value};
use crate::store::ReplicaStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationError {
    #[error("No migration path from version {from} to {to}")]
    NoPath { from: SchemaVersion, to: SchemaVersion },
}

/// Rewrites one entity's value. Returning the input unchanged emits nothing
/// for that entity.
pub type MigrateFn = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct Migration {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub migrate: MigrateFn,
}

impl Migration {
    pub fn new(
        from: SchemaVersion,
        to: SchemaVersion,
        migrate: impl Fn(&str, &Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            from,
            to,
            migrate: Arc::new(migrate),
        }
    }

    /// The operations that move `entities` across this migration.
    pub fn operations<'a>(&self, entities: impl IntoIterator<Item = (&'a str, &'a Value)>) -> Vec<Operation> {
        let stamp = TimeAuthority::zero(self.to);
        entities
            .into_iter()
            .filter_map(|(oid, value)| {
                let migrated = (self.migrate)(oid, value);
                (migrated != *value)
                    .then(|| Operation::new(oid, stamp.clone(), OperationData::initialize(migrated)))
            })
            .collect()
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<SchemaVersion, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration. A later registration from the same version
    /// replaces the earlier one.
    pub fn register(&mut self, migration: Migration) {
        self.migrations.insert(migration.from, migration);
    }

    /// The chain of migrations from `from` to `to`.
    pub fn path(&self, from: SchemaVersion, to: SchemaVersion) -> Result<Vec<&Migration>, MigrationError> {
        let mut path = Vec::new();
        let mut current = from;
        while current < to {
            match self.migrations.get(&current) {
                Some(migration) if migration.to > current && migration.to <= to => {
                    path.push(migration);
                    current = migration.to;
                }
                _ => return Err(MigrationError::NoPath { from, to }),
            }
        }
        if current != to {
            return Err(MigrationError::NoPath { from, to });
        }
        Ok(path)
    }

    /// Migrate a store to `target`, returning the operations emitted. The
    /// store's schema version is raised step by step, releasing any operations
    /// it had deferred for each version.
    pub fn run(&self, store: &mut ReplicaStore, target: SchemaVersion) -> Result<Vec<Operation>, MigrationError> {
        let from = store.schema_version();
        let path = self.path(from, target)?;
        let mut emitted = Vec::new();
        for migration in path {
            let ops = {
                let arena = store.arena();
                let entities: Vec<(&str, &Value)> = arena
                    .oids()
                    .filter_map(|oid| arena.view(oid).map(|value| (oid.as_str(), value)))
                    .collect();
                migration.operations(entities)
            };
            log::info!(
                "Migrating {} entities from schema {} to {}",
                ops.len(),
                migration.from,
                migration.to
            );
            store.apply_migration(ops.clone());
            store.set_schema_version(migration.to);
            emitted.extend(ops);
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    fn rename_title() -> Migration {
        Migration::new(1, 2, |_, value| match value.as_map() {
            Some(map) => {
                let mut map = map.clone();
                if let Some(title) = map.remove("title") {
                    map.insert("name".into(), title);
                }
                Value::Map(map)
            }
            None => value.clone(),
        })
    }

    #[test]
    fn test_path_finding() {
        let mut registry = MigrationRegistry::new();
        registry.register(rename_title());
        registry.register(Migration::new(2, 3, |_, v| v.clone()));

        assert_eq!(registry.path(1, 3).unwrap().len(), 2);
        assert!(registry.path(2, 2).unwrap().is_empty());
        assert_eq!(
            registry.path(1, 4).unwrap_err(),
            MigrationError::NoPath { from: 1, to: 4 }
        );
        assert!(registry.path(3, 1).is_err());
    }

    #[test]
    fn test_operations_are_deterministic() {
        let migration = rename_title();
        let before = Value::map([("title", Value::string("Groceries"))]);
        let untouched = Value::empty_list();

        let ops = migration.operations([("lists/a", &before), ("lists/a:x", &untouched)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].timestamp, TimeAuthority::zero(2));
        assert_eq!(
            ops[0].data,
            OperationData::initialize(Value::map([("name", Value::string("Groceries"))]))
        );
        assert_eq!(ops, migration.operations([("lists/a", &before)]));
    }

    #[test]
    fn test_run_migrates_store_and_releases_deferred() {
        let mut registry = MigrationRegistry::new();
        registry.register(rename_title());

        let clock = Arc::new(TimeAuthority::new("a"));
        let mut store = ReplicaStore::new(clock, 1, &SyncConfig::default());
        let oid = store
            .create("lists", "a", Value::map([("title", Value::string("Groceries"))]))
            .unwrap();

        let newer = TimeAuthority::new("b");
        store
            .apply_remote(vec![Operation::new(
                oid.clone(),
                newer.now(2),
                OperationData::set("name", Value::string("Shopping")),
            )]);
        assert_eq!(store.deferred_count(), 1);

        store.take_outgoing();
        let ops = registry.run(&mut store, 2).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(store.take_outgoing(), ops);
        assert_eq!(store.schema_version(), 2);
        assert_eq!(store.deferred_count(), 0);
        assert_eq!(
            store.view(&oid),
            Some(Value::map([("name", Value::string("Shopping"))]))
        );
    }
}
