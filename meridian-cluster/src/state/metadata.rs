//! Index metadata: the settings, mapping and aliases of every index.

use crate::error::{ClusterError, Result};
use meridian::{IndexMapping, IndexSettings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    /// Immutable for the index's lifetime; survives delete/recreate of the
    /// same name with a different identity.
    pub uuid: String,
    pub settings: IndexSettings,
    pub mapping: IndexMapping,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
}

impl IndexMetadata {
    pub fn new(
        name: impl Into<String>,
        settings: IndexSettings,
        mapping: IndexMapping,
    ) -> IndexMetadata {
        IndexMetadata {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            settings,
            mapping,
            aliases: BTreeSet::new(),
        }
    }

    pub fn number_of_shards(&self) -> u32 {
        self.settings.number_of_shards
    }

    pub fn number_of_replicas(&self) -> u32 {
        self.settings.number_of_replicas
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn index_by_uuid(&self, uuid: &str) -> Option<&IndexMetadata> {
        self.indices.values().find(|m| m.uuid == uuid)
    }

    /// Resolve a name or alias to concrete index metadata. An alias pointing
    /// at several indices is fine for reads but ambiguous for writes; the
    /// caller passes `single` accordingly.
    pub fn resolve(&self, name_or_alias: &str, single: bool) -> Result<Vec<&IndexMetadata>> {
        if let Some(metadata) = self.indices.get(name_or_alias) {
            return Ok(vec![metadata]);
        }
        let matches: Vec<&IndexMetadata> = self
            .indices
            .values()
            .filter(|m| m.aliases.contains(name_or_alias))
            .collect();
        if matches.is_empty() {
            return Err(ClusterError::IndexNotFound(name_or_alias.to_string()));
        }
        if single && matches.len() > 1 {
            return Err(ClusterError::Validation(format!(
                "alias [{}] resolves to {} indices, writes need exactly one",
                name_or_alias,
                matches.len()
            )));
        }
        Ok(matches)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian::{FieldMapping, IndexMapping};

    fn metadata_with(names: &[(&str, &[&str])]) -> Metadata {
        let mut metadata = Metadata::default();
        for (name, aliases) in names {
            let mut index = IndexMetadata::new(
                *name,
                IndexSettings::with_shards(1, 0),
                IndexMapping::builder().field("f", FieldMapping::text()).build(),
            );
            index.aliases = aliases.iter().map(|a| a.to_string()).collect();
            metadata.indices.insert(name.to_string(), index);
        }
        metadata
    }

    #[test]
    fn test_resolve_direct_name() {
        let metadata = metadata_with(&[("logs-1", &[])]);
        let resolved = metadata.resolve("logs-1", true).unwrap();
        assert_eq!(resolved[0].name, "logs-1");
    }

    #[test]
    fn test_resolve_alias() {
        let metadata = metadata_with(&[("logs-1", &["logs"]), ("logs-2", &["logs"])]);
        // Reads may fan out over the alias.
        assert_eq!(metadata.resolve("logs", false).unwrap().len(), 2);
        // Writes need exactly one target.
        assert!(metadata.resolve("logs", true).is_err());
    }

    #[test]
    fn test_resolve_missing() {
        let metadata = metadata_with(&[("a", &[])]);
        let err = metadata.resolve("nope", false).unwrap_err();
        assert_eq!(err.error_type(), "index_not_found");
    }

    #[test]
    fn test_uuid_distinct_from_name() {
        let a = IndexMetadata::new(
            "same",
            IndexSettings::default(),
            IndexMapping::default(),
        );
        let b = IndexMetadata::new(
            "same",
            IndexSettings::default(),
            IndexMapping::default(),
        );
        assert_ne!(a.uuid, b.uuid);
    }
}
