//! File identity and the name → entity registry.
//!
//! Every cache file is identified by the device and inode of the underlying file, not by its name:
//! two names hard-linked to one inode share a single [`CacheEntity`], and a name whose file was
//! replaced is moved over to a fresh entity without disturbing the old one's other names.

use std::fmt;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::CacheEntity;
use crate::cache::observer::CacheEvent;
use crate::directory::Settings;
use crate::error::CacheError;
use crate::fs::names;

/// Identity of one underlying file: its device and inode at the last successful stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Device the file lives on.
    pub dev: u64,
    /// Inode number on that device.
    pub ino: u64,
}

impl EntityKey {
    /// The identity of the file `meta` was obtained from.
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// What the caller is about to do with the resolved file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intent {
    /// A missing file resolves to the entity last linked to the name, or to nothing.
    Read,
    /// A missing file is created.
    Write,
}

/// A resolved name.
pub(crate) struct Resolved {
    pub entity: Arc<CacheEntity>,
    pub path: PathBuf,
}

/// Maps names to identities and identities to their coordinating entity.
pub(crate) struct Registry {
    root: PathBuf,
    settings: Arc<Settings>,
    /// Names currently linked to an entity. Also serves as the set of already validated names.
    names: scc::HashMap<Arc<str>, EntityKey>,
    entities: scc::HashMap<EntityKey, Arc<CacheEntity>>,
}

impl Registry {
    pub(crate) fn new(root: PathBuf, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            root,
            settings,
            names: scc::HashMap::new(),
            entities: scc::HashMap::new(),
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Number of live entities.
    pub(crate) fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Resolve `name` to the entity coordinating its file.
    pub(crate) async fn resolve(
        self: &Arc<Self>,
        name: &str,
        intent: Intent,
    ) -> Result<Option<Resolved>, CacheError> {
        let name = self.validated(name)?;
        let path = self.root.join(&*name);

        let mut created = false;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => match intent {
                Intent::Read => {
                    trace!(path = ?path, "file absent; falling back to last linked entity");
                    return Ok(self.linked(&name).map(|entity| Resolved { entity, path }));
                }
                Intent::Write => {
                    crate::io::touch(&path)
                        .await
                        .map_err(|e| CacheError::io(&path, e))?;
                    created = true;
                    tokio::fs::metadata(&path)
                        .await
                        .map_err(|e| CacheError::io(&path, e))?
                }
            },
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        if meta.is_dir() {
            return Err(CacheError::io(
                &path,
                io::Error::from_raw_os_error(libc::EISDIR),
            ));
        }

        let key = EntityKey::from_metadata(&meta);
        let entity = self.link(&name, key, &path);
        if created {
            // A recreated file may reuse the inode of one that expired while its snapshot lived on.
            entity.note_file_created();
        }
        Ok(Some(Resolved { entity, path }))
    }

    /// Validate `name` unless it is already linked, returning the interned name.
    fn validated(&self, name: &str) -> Result<Arc<str>, CacheError> {
        if let Some(known) = self.names.read_sync(name, |k, _| Arc::clone(k)) {
            return Ok(known);
        }
        names::validate(name)?;
        Ok(Arc::from(name))
    }

    /// The entity `name` is currently linked to, if any.
    fn linked(&self, name: &str) -> Option<Arc<CacheEntity>> {
        let key = self.names.read_sync(name, |_, k| *k)?;
        self.entities.read_sync(&key, |_, e| Arc::clone(e))
    }

    /// Returns the entity for `key`, creating one if absent.
    fn entity_for(self: &Arc<Self>, key: EntityKey, path: &Path) -> Arc<CacheEntity> {
        if let Some(entity) = self.entities.read_sync(&key, |_, e| Arc::clone(e)) {
            return entity;
        }
        match self.entities.entry_sync(key) {
            scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let entity = CacheEntity::new(
                    key,
                    Arc::clone(&self.settings),
                    Arc::downgrade(self),
                    path,
                );
                debug!(key = %key, path = ?path, "created cache entity");
                vac.insert_entry(Arc::clone(&entity));
                entity
            }
        }
    }

    /// Link `name` to the entity for `key`, detaching it from whatever it was linked to before.
    fn link(self: &Arc<Self>, name: &Arc<str>, key: EntityKey, path: &Path) -> Arc<CacheEntity> {
        let entity = loop {
            let entity = self.entity_for(key, path);
            if entity.link_name(name) {
                break entity;
            }
            // Retired between the lookup and the link.
            drop(
                self.entities
                    .remove_if_sync(&key, |e| Arc::ptr_eq(e, &entity)),
            );
        };

        let previous = match self.names.entry_sync(Arc::clone(name)) {
            scc::hash_map::Entry::Occupied(mut occ) => Some(std::mem::replace(occ.get_mut(), key)),
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(key);
                None
            }
        };

        if let Some(old) = previous
            && old != key
        {
            entity.emit(path, CacheEvent::NameRelinked);
            if let Some(old_entity) = self.entities.read_sync(&old, |_, e| Arc::clone(e)) {
                old_entity.unlink_name(name);
            }
        }

        entity
    }

    /// Drop a retired entity and unlink the names it still held.
    pub(crate) fn forget(&self, entity: &CacheEntity, names: Vec<Arc<str>>) {
        let key = entity.key();
        drop(
            self.entities
                .remove_if_sync(&key, |e| std::ptr::eq(Arc::as_ptr(e), entity)),
        );
        for name in names {
            drop(self.names.remove_if_sync(&*name, |linked| *linked == key));
        }
    }

    #[cfg(test)]
    fn name_count(&self) -> usize {
        self.names.len()
    }
}
