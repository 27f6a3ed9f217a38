//! Durable storage of the known-node set.
//!
//! The default [`JsonNodeStore`] keeps `nodes.json` in the gateway's persist
//! directory. Writes go through a temporary file in the same directory which
//! is synced and then renamed over the old file, so a crash never leaves a
//! truncated node list behind.

use std::{
    collections::BTreeSet,
    io::Write,
    path::{Path, PathBuf},
};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{address::NetAddress, error::PersistError};

/// File name of the known-node list inside the persist directory.
pub const NODES_FILE: &str = "nodes.json";

const NODES_HEADER: &str = "Nodegate Gateway Nodes";
const NODES_VERSION: &str = "1";

/// Backend holding the known-node set between runs.
pub trait NodeStore: Send + Sync {
    /// Load the saved set. A store that has never been written is empty.
    fn load(&self) -> Result<BTreeSet<NetAddress>, PersistError>;

    /// Replace the saved set with `nodes`.
    fn save(&self, nodes: &BTreeSet<NetAddress>) -> Result<(), PersistError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct NodesFile {
    header: String,
    version: String,
    #[serde(default)]
    nodes: Vec<NetAddress>,
}

/// `nodes.json` in a directory.
#[derive(Debug, Clone)]
pub struct JsonNodeStore {
    path: PathBuf,
}

impl JsonNodeStore {
    pub fn new(persist_dir: impl AsRef<Path>) -> Self {
        Self {
            path: persist_dir.as_ref().join(NODES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NodeStore for JsonNodeStore {
    fn load(&self) -> Result<BTreeSet<NetAddress>, PersistError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no node file, starting empty");
                return Ok(BTreeSet::new());
            },
            Err(source) => {
                return Err(PersistError::Read {
                    path: self.path.clone(),
                    source,
                });
            },
        };

        let file: NodesFile =
            serde_json::from_slice(&data).map_err(|source| PersistError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if file.header != NODES_HEADER || file.version != NODES_VERSION {
            return Err(PersistError::UnknownFormat {
                path: self.path.clone(),
                header: file.header,
                version: file.version,
            });
        }

        let mut nodes = BTreeSet::new();
        for node in file.nodes {
            if node.is_valid() {
                nodes.insert(node);
            } else {
                warn!(node = %node, path = %self.path.display(), "skipping invalid node address");
            }
        }
        debug!(path = %self.path.display(), count = nodes.len(), "loaded known nodes");
        Ok(nodes)
    }

    fn save(&self, nodes: &BTreeSet<NetAddress>) -> Result<(), PersistError> {
        let write_err = |source| PersistError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let file = NodesFile {
            header: NODES_HEADER.into(),
            version: NODES_VERSION.into(),
            nodes: nodes.iter().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(PersistError::Encode)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&data).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), count = nodes.len(), "saved known nodes");
        Ok(())
    }
}

/// Load the known-node set from `persist_dir/nodes.json`.
pub fn load(persist_dir: impl AsRef<Path>) -> Result<BTreeSet<NetAddress>, PersistError> {
    JsonNodeStore::new(persist_dir).load()
}

/// Save the known-node set to `persist_dir/nodes.json`.
pub fn save(persist_dir: impl AsRef<Path>, nodes: &BTreeSet<NetAddress>) -> Result<(), PersistError> {
    JsonNodeStore::new(persist_dir).save(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(addrs: &[&str]) -> BTreeSet<NetAddress> {
        addrs.iter().map(|a| NetAddress::from(*a)).collect()
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn store_writes_to_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonNodeStore::new(dir.path());
        assert_eq!(store.path(), dir.path().join(NODES_FILE));
        store.save(&set(&["10.0.0.1:1"])).unwrap();
        assert!(store.path().is_file());
        assert_eq!(store.load().unwrap(), set(&["10.0.0.1:1"]));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = set(&["127.0.0.1:9981", "[::1]:9982", "example.com:9981"]);
        save(dir.path(), &nodes).unwrap();
        assert_eq!(load(dir.path()).unwrap(), nodes);
    }

    #[test]
    fn save_replaces_previous_file_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &set(&["10.0.0.1:1", "10.0.0.2:2"])).unwrap();
        save(dir.path(), &set(&["10.0.0.3:3"])).unwrap();

        assert_eq!(load(dir.path()).unwrap(), set(&["10.0.0.3:3"]));
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(NODES_FILE)]);
    }

    #[test]
    fn save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        save(&nested, &set(&["10.0.0.1:1"])).unwrap();
        assert_eq!(load(&nested).unwrap().len(), 1);
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(NODES_FILE), [1u8, 2, 3]).unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(PersistError::Corrupt { .. })
        ));
    }

    #[test]
    fn foreign_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(NODES_FILE),
            r#"{"header": "Something Else", "version": "1", "nodes": []}"#,
        )
        .unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(PersistError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn unknown_fields_are_ignored_and_invalid_nodes_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(NODES_FILE),
            r#"{
                "header": "Nodegate Gateway Nodes",
                "version": "1",
                "written_by": "a future release",
                "nodes": ["127.0.0.1:9981", "not-an-address"]
            }"#,
        )
        .unwrap();
        assert_eq!(load(dir.path()).unwrap(), set(&["127.0.0.1:9981"]));
    }
}
