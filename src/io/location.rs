//! Path and URL resolution plus the process-wide mapping registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::SciioResult;

use super::url::list_url_directory;

/// What a resolved identifier points at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocationKind {
    File,
    Url,
}

/// A resolved reference to a dataset: a local path or a URL.
///
/// Two locations are equal iff their absolute paths are equal.
#[derive(Clone, Debug)]
pub struct Location {
    kind: LocationKind,
    path: String,
}

impl Location {
    /// Resolves `id` through the registry's alias map and classifies it.
    pub fn new(registry: &LocationRegistry, id: &str) -> Self {
        let mapped = registry.get_mapped_id(id);
        let kind = if mapped.contains("://") {
            LocationKind::Url
        } else {
            LocationKind::File
        };
        let path = match kind {
            LocationKind::Url => mapped,
            LocationKind::File => absolutize(&mapped),
        };
        Location { kind, path }
    }

    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    /// The canonical identifier: an absolute path or the URL itself.
    pub fn absolute_path(&self) -> &str {
        &self.path
    }

    /// The last path segment.
    pub fn name(&self) -> &str {
        match self.kind {
            LocationKind::File => Path::new(&self.path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&self.path),
            LocationKind::Url => self
                .path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(&self.path),
        }
    }

    pub fn parent(&self) -> Option<Location> {
        match self.kind {
            LocationKind::File => Path::new(&self.path).parent().map(|p| Location {
                kind: LocationKind::File,
                path: p.to_string_lossy().into_owned(),
            }),
            LocationKind::Url => {
                let trimmed = self.path.trim_end_matches('/');
                let cut = trimmed.rfind('/')?;
                Some(Location {
                    kind: LocationKind::Url,
                    path: trimmed[..cut + 1].to_string(),
                })
            }
        }
    }

    pub fn exists(&self) -> bool {
        match self.kind {
            LocationKind::File => Path::new(&self.path).exists(),
            LocationKind::Url => true,
        }
    }

    pub fn is_directory(&self) -> bool {
        match self.kind {
            LocationKind::File => Path::new(&self.path).is_dir(),
            LocationKind::Url => self.path.ends_with('/'),
        }
    }

    pub fn length(&self) -> u64 {
        match self.kind {
            LocationKind::File => std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            LocationKind::Url => 0,
        }
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        match self.kind {
            LocationKind::File => std::fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok(),
            LocationKind::Url => None,
        }
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Location {}

fn absolutize(path: &str) -> String {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p.to_string_lossy().into_owned()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&p))
            .unwrap_or(p)
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ListingKey {
    path: String,
    include_hidden: bool,
}

#[derive(Default)]
struct RegistryState {
    /// alias -> canonical identifier
    aliases: HashMap<String, String>,
    /// identifier -> synthetic in-memory source
    sources: HashMap<String, Arc<Vec<u8>>>,
    /// (path, include_hidden) -> cached child names
    listings: HashMap<ListingKey, Arc<Vec<String>>>,
}

/// Identifier mappings and the directory-listing cache.
///
/// Created once at process init (or per test), explicitly cleared at
/// teardown. All state sits behind a single mutex; every operation releases
/// the lock before returning.
#[derive(Default)]
pub struct LocationRegistry {
    state: Mutex<RegistryState>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects `alias` to `target` for every subsequent resolution.
    pub fn map_id(&self, alias: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        state.aliases.insert(alias.to_string(), target.to_string());
    }

    /// Removes a redirection.
    pub fn unmap_id(&self, alias: &str) {
        let mut state = self.state.lock().unwrap();
        state.aliases.remove(alias);
    }

    /// Returns the alias target if registered, the path unchanged otherwise.
    pub fn get_mapped_id(&self, path: &str) -> String {
        let state = self.state.lock().unwrap();
        state
            .aliases
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }

    /// Feeds synthetic bytes for `path`; readers will open them instead of
    /// touching the filesystem.
    pub fn map_source(&self, path: &str, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.sources.insert(path.to_string(), Arc::new(bytes));
    }

    pub fn get_mapped_source(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        state.sources.get(path).cloned()
    }

    /// Lists the children of `path`, consulting and filling the cache.
    ///
    /// Local directories are enumerated directly; URLs go through the HTML
    /// directory-index heuristic. Entries starting with `.` are skipped
    /// unless `include_hidden` is set. The cache is invalidated only by
    /// [`LocationRegistry::invalidate_listings`] or [`LocationRegistry::clear`].
    pub fn list(&self, path: &str, include_hidden: bool) -> SciioResult<Arc<Vec<String>>> {
        let key = ListingKey {
            path: path.to_string(),
            include_hidden,
        };
        {
            let state = self.state.lock().unwrap();
            if let Some(cached) = state.listings.get(&key) {
                return Ok(cached.clone());
            }
        }

        let names = if path.contains("://") {
            list_url_directory(path, include_hidden)?
        } else {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !include_hidden && name.starts_with('.') {
                    continue;
                }
                names.push(name);
            }
            names.sort();
            names
        };

        let names = Arc::new(names);
        let mut state = self.state.lock().unwrap();
        state.listings.insert(key, names.clone());
        Ok(names)
    }

    /// Drops every cached listing.
    pub fn invalidate_listings(&self) {
        let mut state = self.state.lock().unwrap();
        state.listings.clear();
    }

    /// Drops all aliases, mapped sources and cached listings.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.aliases.clear();
        state.sources.clear();
        state.listings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution() {
        let registry = LocationRegistry::new();
        registry.map_id("virtual.tif", "/data/actual.tif");
        assert_eq!(registry.get_mapped_id("virtual.tif"), "/data/actual.tif");
        assert_eq!(registry.get_mapped_id("other.tif"), "other.tif");

        registry.unmap_id("virtual.tif");
        assert_eq!(registry.get_mapped_id("virtual.tif"), "virtual.tif");
    }

    #[test]
    fn mapped_sources() {
        let registry = LocationRegistry::new();
        registry.map_source("synthetic.tif", vec![1, 2, 3]);
        assert_eq!(
            registry.get_mapped_source("synthetic.tif").unwrap()[..],
            [1, 2, 3]
        );
        assert!(registry.get_mapped_source("missing.tif").is_none());
    }

    #[test]
    fn listing_is_cached_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tif"), b"").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();
        let path = dir.path().to_string_lossy().into_owned();

        let registry = LocationRegistry::new();
        let visible = registry.list(&path, false).unwrap();
        assert_eq!(visible[..], ["a.tif".to_string()]);

        let all = registry.list(&path, true).unwrap();
        assert_eq!(all.len(), 2);

        // new file is invisible until the cache is dropped
        std::fs::write(dir.path().join("b.tif"), b"").unwrap();
        assert_eq!(registry.list(&path, false).unwrap().len(), 1);
        registry.invalidate_listings();
        assert_eq!(registry.list(&path, false).unwrap().len(), 2);
    }

    #[test]
    fn location_equality_is_path_equality() {
        let registry = LocationRegistry::new();
        let a = Location::new(&registry, "/data/x.tif");
        let b = Location::new(&registry, "/data/x.tif");
        let c = Location::new(&registry, "/data/y.tif");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.name(), "x.tif");
    }

    #[test]
    fn url_locations() {
        let registry = LocationRegistry::new();
        let url = Location::new(&registry, "https://example.org/data/stack.tif");
        assert_eq!(url.kind(), LocationKind::Url);
        assert_eq!(url.name(), "stack.tif");
        assert_eq!(
            url.parent().unwrap().absolute_path(),
            "https://example.org/data/"
        );
    }
}
