//! Persistent metadata: the root file holding the configuration table,
//! the ordered volume list, and the series dictionary rows.

use crate::error::{Error, Result};
use crate::series::SeriesMatcher;
use crate::types::ParamId;

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const META_MAGIC: &[u8; 8] = b"TPRMETA1";
const META_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaTables {
    version: u32,
    config: BTreeMap<String, String>,
    /// Ring order is row order.
    volumes: Vec<String>,
    series: Vec<(ParamId, String)>,
}

/// The metadata store behind the storage engine. Everything lives in one
/// file, rewritten atomically (tmp sibling + rename) on every update.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    tables: Mutex<MetaTables>,
}

impl MetadataStore {
    /// Creates the metadata file. Fails if it already exists.
    pub fn create<P: AsRef<Path>>(
        path: P,
        config: BTreeMap<String, String>,
        volumes: Vec<PathBuf>,
    ) -> Result<MetadataStore> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(Error::BadArg(format!(
                "metadata file {} already exists",
                path.display()
            )));
        }
        let tables = MetaTables {
            version: META_VERSION,
            config,
            volumes: volumes
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            series: Vec::new(),
        };
        write_atomic(&path, &tables)?;
        Ok(MetadataStore {
            path,
            tables: Mutex::new(tables),
        })
    }

    /// Opens an existing metadata file; `NotFound` if it is missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MetadataStore> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "metadata file {} does not exist",
                path.display()
            )));
        }
        let tables = read_tables(&path)?;
        Ok(MetadataStore {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn volumes(&self) -> Vec<PathBuf> {
        let tables = self.tables.lock().expect("metadata lock");
        tables.volumes.iter().map(PathBuf::from).collect()
    }

    pub fn config_value(&self, key: &str) -> Option<String> {
        let tables = self.tables.lock().expect("metadata lock");
        tables.config.get(key).cloned()
    }

    /// Largest persisted series id, 0 when the dictionary is empty.
    pub fn largest_series_id(&self) -> ParamId {
        let tables = self.tables.lock().expect("metadata lock");
        tables.series.iter().map(|(id, _)| *id).max().unwrap_or(0)
    }

    /// Seeds a matcher with every persisted dictionary row.
    pub fn load_series(&self, matcher: &SeriesMatcher) {
        let tables = self.tables.lock().expect("metadata lock");
        for (id, name) in &tables.series {
            matcher.insert_loaded(name, *id);
        }
    }

    /// Appends freshly assigned dictionary rows and persists the file.
    pub fn insert_new_names(&self, rows: &[(String, ParamId)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.lock().expect("metadata lock");
        for (name, id) in rows {
            tables.series.push((*id, name.clone()));
        }
        write_atomic(&self.path, &tables)
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_atomic(path: &Path, tables: &MetaTables) -> Result<()> {
    let payload = bincode::serialize(tables)
        .map_err(|e| Error::General(format!("metadata serialization failed: {}", e)))?;
    let mut tmp_path = path.to_path_buf();
    tmp_path.set_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(META_MAGIC)?;
        file.write_all(&META_VERSION.to_le_bytes())?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc32(&payload).to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_tables(path: &Path) -> Result<MetaTables> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != META_MAGIC {
        return Err(Error::BadData(format!(
            "bad metadata magic in {}",
            path.display()
        )));
    }
    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != META_VERSION {
        return Err(Error::BadData(format!(
            "unsupported metadata version {}",
            version
        )));
    }
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    file.read_exact(&mut word)?;
    let expected_crc = u32::from_le_bytes(word);
    if crc32(&payload) != expected_crc {
        return Err(Error::BadData(format!(
            "metadata checksum mismatch in {}",
            path.display()
        )));
    }
    bincode::deserialize(&payload)
        .map_err(|e| Error::BadData(format!("undecodable metadata: {}", e)))
}
