//! Hinted-handoff log: a persistent, ordered map recording writes that a
//! peer missed, keyed by `uuid ‖ 4-byte-random-salt` so repeated misses for
//! the same key/peer pair don't collide, valued by the big-endian node id
//! that missed it.
//!
//! Backed by `redb`. `redb`'s write transactions are already serialized
//! against each other and its read transactions see a consistent snapshot
//! concurrent with in-flight writes — exactly the "put/delete serialized,
//! scan tolerates concurrent put but need not reflect puts started after the
//! scan began" contract this log needs, so no extra lock wrapper is added
//! on top (see DESIGN.md).

use std::path::Path;

use rand::Rng;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};
use crate::peer::NodeId;

const HINTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hints");

pub struct HintLog {
    db: Database,
}

fn to_err(e: impl std::fmt::Display) -> Error {
    Error::HintLog(e.to_string())
}

impl HintLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create hint log dir", e))?;
        }
        let db = Database::create(path).map_err(to_err)?;
        let write_txn = db.begin_write().map_err(to_err)?;
        {
            write_txn.open_table(HINTS_TABLE).map_err(to_err)?;
        }
        write_txn.commit().map_err(to_err)?;
        Ok(Self { db })
    }

    /// Records a hint: `uuid` failed to reach `node_id`.
    pub fn put(&self, uuid: &str, node_id: NodeId) -> Result<Vec<u8>> {
        let mut salt = [0u8; 4];
        rand::rng().fill(&mut salt);
        let mut key = Vec::with_capacity(uuid.len() + 4);
        key.extend_from_slice(uuid.as_bytes());
        key.extend_from_slice(&salt);
        let value = node_id.to_be_bytes();

        let write_txn = self.db.begin_write().map_err(to_err)?;
        {
            let mut table = write_txn.open_table(HINTS_TABLE).map_err(to_err)?;
            table.insert(key.as_slice(), value.as_slice()).map_err(to_err)?;
        }
        write_txn.commit().map_err(to_err)?;
        Ok(key)
    }

    /// Returns every outstanding hint as `(composite_key, node_id)`, in key
    /// order (stable but not otherwise meaningful).
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, NodeId)>> {
        let read_txn = self.db.begin_read().map_err(to_err)?;
        let table = read_txn.open_table(HINTS_TABLE).map_err(to_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(to_err)? {
            let (k, v) = entry.map_err(to_err)?;
            let bytes = v.value();
            if bytes.len() != 8 {
                continue;
            }
            let mut node_bytes = [0u8; 8];
            node_bytes.copy_from_slice(bytes);
            out.push((k.value().to_vec(), NodeId::from_be_bytes(node_bytes)));
        }
        Ok(out)
    }

    pub fn delete(&self, composite_key: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(to_err)?;
        {
            let mut table = write_txn.open_table(HINTS_TABLE).map_err(to_err)?;
            table.remove(composite_key).map_err(to_err)?;
        }
        write_txn.commit().map_err(to_err)?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.scan()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Recovers the original uuid from a composite key by stripping the trailing
/// 4-byte salt.
pub fn strip_salt(composite_key: &[u8]) -> Result<String> {
    if composite_key.len() < 4 {
        return Err(Error::HintLog("composite key shorter than salt".to_string()));
    }
    let uuid_bytes = &composite_key[..composite_key.len() - 4];
    String::from_utf8(uuid_bytes.to_vec()).map_err(|e| Error::HintLog(e.to_string()))
}
