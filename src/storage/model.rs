use crate::time::DateTime;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One published version of a resource. The named fields are required for
/// every entry reachable from a metadata document; anything else the
/// publisher attached travels in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub resource_id: String,
    pub resource_file: String,
    pub resource_path: String,
    pub publish_date: DateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller-supplied fields for a push. Whatever is left unset is filled in
/// by the storage's factories.
#[derive(Debug, Clone, Default)]
pub struct NewResource {
    pub resource_id: Option<String>,
    pub resource_file: Option<String>,
    pub resource_group: Option<String>,
    pub file_md5: Option<String>,
    pub features: Option<i64>,
    pub layer: Option<String>,
    pub extra: Map<String, Value>,
}

/// Archive entries retain every displaced version, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub current: Option<ResourceMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub histories: Vec<ResourceMetadata>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResourceEntry {
    Archive(ArchiveEntry),
    Single(ResourceMetadata),
}

/// Entries are discriminated by shape, not by a tag: archive entries always
/// serialize their `current` key (null until the first push lands), plain
/// entries never carry `current` or `histories`. A derived untagged decode
/// cannot tell these apart because a missing `Option` field reads as `None`.
impl<'de> Deserialize<'de> for ResourceEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let archive = value
            .as_object()
            .is_some_and(|entry| entry.contains_key("current") || entry.contains_key("histories"));
        match archive {
            true => serde_json::from_value(value).map(Self::Archive),
            false => serde_json::from_value(value).map(Self::Single),
        }
        .map_err(de::Error::custom)
    }
}

impl ResourceEntry {
    /// The version a reader should see: `current` for archives, the entry
    /// itself otherwise.
    pub fn latest(&self) -> Option<&ResourceMetadata> {
        match self {
            Self::Archive(entry) => entry.current.as_ref(),
            Self::Single(metadata) => Some(metadata),
        }
    }

    /// Every blob path referenced by this entry, current and historical.
    pub fn blob_paths(&self) -> Vec<&str> {
        match self {
            Self::Archive(entry) => entry
                .current
                .iter()
                .chain(&entry.histories)
                .map(|metadata| metadata.resource_path.as_str())
                .collect(),
            Self::Single(metadata) => vec![metadata.resource_path.as_str()],
        }
    }
}

pub type EntryMap = BTreeMap<String, ResourceEntry>;
pub type GroupMap = BTreeMap<String, EntryMap>;

/// The parsed form of a resource metadata document. Flat documents map
/// resource ids to entries; grouped documents add a group level above that.
/// The shape is fixed by the owning storage, not self-described, so parsing
/// picks the variant from the storage's configuration.
#[derive(Debug, Clone)]
pub enum Document {
    Flat(EntryMap),
    Grouped(GroupMap),
}

impl Document {
    pub fn empty(grouped: bool) -> Self {
        match grouped {
            true => Self::Grouped(GroupMap::new()),
            false => Self::Flat(EntryMap::new()),
        }
    }

    pub fn from_value(grouped: bool, value: Value) -> serde_json::Result<Self> {
        match grouped {
            true => serde_json::from_value(value).map(Self::Grouped),
            false => serde_json::from_value(value).map(Self::Flat),
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Flat(entries) => serde_json::to_value(entries),
            Self::Grouped(groups) => serde_json::to_value(groups),
        }
    }

    pub fn group(&self, group: &str) -> Option<&EntryMap> {
        match self {
            Self::Grouped(groups) => groups.get(group),
            Self::Flat(_) => None,
        }
    }

    /// The map that holds entries for the given group: the group map for
    /// grouped documents, the top level otherwise. Creates the group on demand.
    pub fn entries_mut(&mut self, group: Option<&str>) -> &mut EntryMap {
        match (self, group) {
            (Self::Grouped(groups), Some(group)) => groups.entry(group.to_owned()).or_default(),
            (Self::Grouped(_), None) => unreachable!("grouped documents are always addressed with a group"),
            (Self::Flat(entries), _) => entries,
        }
    }

    pub fn entry(&self, id: &str, group: Option<&str>) -> Option<&ResourceEntry> {
        match (self, group) {
            (Self::Grouped(groups), Some(group)) => groups.get(group)?.get(id),
            (Self::Grouped(_), None) => None,
            (Self::Flat(entries), _) => entries.get(id),
        }
    }

    pub fn remove_entry(&mut self, id: &str, group: Option<&str>) -> Option<ResourceEntry> {
        match (self, group) {
            (Self::Grouped(groups), Some(group)) => {
                let entries = groups.get_mut(group)?;
                let removed = entries.remove(id);
                if entries.is_empty() {
                    groups.remove(group);
                }
                removed
            }
            (Self::Grouped(_), None) => None,
            (Self::Flat(entries), _) => entries.remove(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_shape_is_detected_from_keys() {
        let archive = serde_json::json!({
            "current": {
                "resource_id": "loggedpoint2024-05-01",
                "resource_file": "loggedpoint2024-05-01.gpkg",
                "resource_path": "loggedpoint/data/loggedpoint2024-05/loggedpoint2024-05-01.gpkg",
                "publish_date": {"_type": "datetime", "value": "2024-05-02 01:00:00.000000"},
            },
            "histories": [],
        });
        let entry: ResourceEntry = serde_json::from_value(archive).unwrap();
        assert!(matches!(entry, ResourceEntry::Archive(_)));

        let single = serde_json::json!({
            "resource_id": "loggedpoint2024-05-01",
            "resource_file": "loggedpoint2024-05-01.gpkg",
            "resource_path": "loggedpoint/data/loggedpoint2024-05/loggedpoint2024-05-01.gpkg",
            "publish_date": {"_type": "datetime", "value": "2024-05-02 01:00:00.000000"},
            "features": 2,
        });
        let entry: ResourceEntry = serde_json::from_value(single).unwrap();
        match entry {
            ResourceEntry::Single(metadata) => assert_eq!(metadata.features, Some(2)),
            ResourceEntry::Archive(_) => panic!("entry without a current key parsed as an archive"),
        }
    }

    #[test]
    fn entry_shape_survives_a_serialize_round_trip() {
        let metadata: ResourceMetadata = serde_json::from_value(serde_json::json!({
            "resource_id": "loggedpoint2024-05-01",
            "resource_file": "loggedpoint2024-05-01.gpkg",
            "resource_path": "loggedpoint/data/loggedpoint2024-05/loggedpoint2024-05-01.gpkg",
            "publish_date": {"_type": "datetime", "value": "2024-05-02 01:00:00.000000"},
        }))
        .unwrap();

        let written = serde_json::to_value(ResourceEntry::Single(metadata.clone())).unwrap();
        let reread: ResourceEntry = serde_json::from_value(written).unwrap();
        assert!(matches!(reread, ResourceEntry::Single(_)));

        let written = serde_json::to_value(ResourceEntry::Archive(ArchiveEntry {
            current: Some(metadata),
            histories: Vec::new(),
        }))
        .unwrap();
        let reread: ResourceEntry = serde_json::from_value(written).unwrap();
        match reread {
            ResourceEntry::Archive(entry) => assert!(entry.current.is_some()),
            ResourceEntry::Single(_) => panic!("archive entry lost its shape on reread"),
        }

        // An archive entry that has never been pushed keeps its current key
        let written = serde_json::to_value(ResourceEntry::Archive(ArchiveEntry {
            current: None,
            histories: Vec::new(),
        }))
        .unwrap();
        assert_eq!(written, serde_json::json!({"current": null}));
        let reread: ResourceEntry = serde_json::from_value(written).unwrap();
        assert!(matches!(reread, ResourceEntry::Archive(ArchiveEntry { current: None, .. })));
    }

    #[test]
    fn required_fields_are_validated_on_load() {
        let missing_path = serde_json::json!({
            "resource_id": "x",
            "resource_file": "x.json",
            "publish_date": {"_type": "datetime", "value": "2024-05-02 01:00:00.000000"},
        });
        assert!(serde_json::from_value::<ResourceEntry>(missing_path).is_err());
    }

    #[test]
    fn removing_the_last_entry_drops_the_group() {
        let value = serde_json::json!({
            "loggedpoint2024-05": {
                "loggedpoint2024-05-01": {
                    "resource_id": "loggedpoint2024-05-01",
                    "resource_file": "loggedpoint2024-05-01.gpkg",
                    "resource_path": "loggedpoint/data/loggedpoint2024-05/loggedpoint2024-05-01.gpkg",
                    "publish_date": {"_type": "datetime", "value": "2024-05-02 01:00:00.000000"},
                },
            },
        });
        let mut document = Document::from_value(true, value).unwrap();
        assert!(document.entry("loggedpoint2024-05-01", Some("loggedpoint2024-05")).is_some());

        document.remove_entry("loggedpoint2024-05-01", Some("loggedpoint2024-05"));
        assert!(document.group("loggedpoint2024-05").is_none());
    }
}
