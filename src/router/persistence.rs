//! Persisted atoms.
//!
//! The view keeps small pieces of UI state ("atoms") across restarts. The
//! router holds them in memory, answers reads from there, and flushes the
//! whole map to an [`AtomStore`] on a debounce timer. A burst of updates
//! produces one write.
//!
//! ```text
//! update ─► map (dirty) ─► schedule flush ─┐  (coalesced while pending)
//! update ─► map (dirty) ───────────────────┤
//!                                          ▼
//!                           FlushAtoms ─► store.save(map)
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Where persisted atoms live between runs.
pub trait AtomStore: Send + std::fmt::Debug {
    /// Read every atom. A missing store is an empty map.
    fn load(&self) -> Result<Map<String, Value>>;

    /// Replace the stored atoms.
    fn save(&self, atoms: &Map<String, Value>) -> Result<()>;
}

/// Atoms stored as one JSON object in a file.
#[derive(Debug, Clone)]
pub struct JsonFileAtomStore {
    path: PathBuf,
}

impl JsonFileAtomStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AtomStore for JsonFileAtomStore {
    fn load(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn save(&self, atoms: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(atoms)?)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory store. Clones share contents, so tests can inspect writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryAtomStore {
    inner: Arc<Mutex<MemoryContents>>,
}

#[derive(Debug, Default)]
struct MemoryContents {
    atoms: Map<String, Value>,
    saves: usize,
}

impl MemoryAtomStore {
    /// Store pre-filled with `atoms`.
    pub fn with_atoms(atoms: Map<String, Value>) -> Self {
        let store = Self::default();
        store.contents().atoms = atoms;
        store
    }

    /// Last saved atoms.
    pub fn atoms(&self) -> Map<String, Value> {
        self.contents().atoms.clone()
    }

    /// Number of `save` calls so far.
    pub fn saves(&self) -> usize {
        self.contents().saves
    }

    fn contents(&self) -> std::sync::MutexGuard<'_, MemoryContents> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AtomStore for MemoryAtomStore {
    fn load(&self) -> Result<Map<String, Value>> {
        Ok(self.contents().atoms.clone())
    }

    fn save(&self, atoms: &Map<String, Value>) -> Result<()> {
        let mut contents = self.contents();
        contents.atoms = atoms.clone();
        contents.saves += 1;
        Ok(())
    }
}

/// Atom map plus its dirty flag.
#[derive(Debug)]
pub struct PersistedAtoms {
    store: Box<dyn AtomStore>,
    atoms: Map<String, Value>,
    dirty: bool,
}

impl PersistedAtoms {
    /// Load from `store`. A store that fails to load starts empty.
    pub fn load(store: Box<dyn AtomStore>) -> Self {
        let atoms = store.load().unwrap_or_else(|e| {
            log::warn!("[Router] Could not load persisted atoms: {e:#}");
            Map::new()
        });
        Self {
            store,
            atoms,
            dirty: false,
        }
    }

    /// Every atom.
    pub fn all(&self) -> &Map<String, Value> {
        &self.atoms
    }

    /// Set one atom. Returns true when the value changed.
    pub fn update(&mut self, key: &str, value: Value) -> bool {
        if self.atoms.get(key) == Some(&value) {
            return false;
        }
        self.atoms.insert(key.to_string(), value);
        self.dirty = true;
        true
    }

    /// Remove one atom. Returns true when it existed.
    pub fn reset(&mut self, key: &str) -> bool {
        let existed = self.atoms.remove(key).is_some();
        self.dirty |= existed;
        existed
    }

    /// True when memory differs from the last flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write to the store if anything changed.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        match self.store.save(&self.atoms) {
            Ok(()) => {
                self.dirty = false;
                log::debug!("[Router] Flushed {} persisted atoms", self.atoms.len());
            }
            Err(e) => log::error!("[Router] Failed to flush persisted atoms: {e:#}"),
        }
    }
}
