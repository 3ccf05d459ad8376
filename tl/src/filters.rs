//! Named transform filters
//!
//! A filter called `max` lives in `libfiltermax.so` and exports `filtermax`.
//! The working directory is searched first, then every directory listed in
//! the colon-separated filter path. The first file that exists is handed to
//! the transport, which does the actual loading.

use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::error::SessionError;
use crate::transport::{FilterId, FrontNetwork};

/// Separator between directories in the filter path
pub const FILTER_PATH_SEPARATOR: char = ':';

/// Resolves filter names to shared objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoader {
    search_path: Vec<PathBuf>,
}

impl Default for FilterLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

impl FilterLoader {
    /// Search `.` and then each directory of `filter_path`
    pub fn new(filter_path: Option<&str>) -> Self {
        let mut search_path = vec![PathBuf::from(".")];
        if let Some(filter_path) = filter_path {
            search_path.extend(
                filter_path
                    .split(FILTER_PATH_SEPARATOR)
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from),
            );
        }
        debug!(?search_path, "FilterLoader::new: called");
        Self { search_path }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// File name of the shared object implementing `name`
    pub fn file_name(name: &str) -> String {
        format!("libfilter{}.so", name)
    }

    /// Entry point exported by the shared object implementing `name`
    pub fn entry_point(name: &str) -> String {
        format!("filter{}", name)
    }

    /// First existing shared object for `name`
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let file_name = Self::file_name(name);
        self.search_path
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }

    /// Resolve `name` and load it into the transport
    pub fn load(&self, network: &dyn FrontNetwork, name: &str) -> Result<FilterId, SessionError> {
        debug!(%name, "FilterLoader::load: called");
        let Some(path) = (!name.is_empty()).then(|| self.resolve(name)).flatten() else {
            error!(%name, "Filter not found");
            return Err(SessionError::FilterNotFound {
                name: name.to_string(),
                searched: self.describe(),
            });
        };

        let entry_point = Self::entry_point(name);
        let id = network.load_filter(&path, &entry_point).map_err(|e| {
            error!(path = %path.display(), %entry_point, error = %e, "Filter load failed");
            SessionError::FilterLoad(e)
        })?;
        info!(path = %path.display(), %entry_point, id, "Filter loaded");
        Ok(id)
    }

    fn describe(&self) -> String {
        self.search_path
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(&FILTER_PATH_SEPARATOR.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::transport::Topology;
    use crate::transport::memory::MemoryFabric;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_naming_convention() {
        assert_eq!(FilterLoader::file_name("max"), "libfiltermax.so");
        assert_eq!(FilterLoader::entry_point("max"), "filtermax");
    }

    #[test]
    fn test_search_path_starts_with_cwd() {
        let loader = FilterLoader::new(Some("/a::/b"));
        assert_eq!(
            loader.search_path(),
            &[PathBuf::from("."), PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(FilterLoader::default().search_path(), &[PathBuf::from(".")]);
    }

    #[test]
    fn test_resolve_first_existing_directory_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(second.path().join("libfiltermax.so"), b"").unwrap();
        let path = format!("{}:{}", first.path().display(), second.path().display());
        let loader = FilterLoader::new(Some(&path));
        assert_eq!(loader.resolve("max"), Some(second.path().join("libfiltermax.so")));

        std::fs::write(first.path().join("libfiltermax.so"), b"").unwrap();
        assert_eq!(loader.resolve("max"), Some(first.path().join("libfiltermax.so")));
        assert_eq!(loader.resolve("min"), None);
    }

    #[test]
    fn test_load_through_transport() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("libfiltermax.so"), b"").unwrap();
        let fabric = MemoryFabric::new();
        fabric.register_filter("filtermax", Arc::new(|wave: Vec<Packet>| wave));
        let front = fabric.create_group_with(Topology::flat("localhost", 1), None).unwrap();

        let loader = FilterLoader::new(dir.path().to_str());
        assert_eq!(loader.load(front.as_ref(), "max").unwrap(), 0);

        let err = loader.load(front.as_ref(), "missing").unwrap_err();
        assert!(matches!(err, SessionError::FilterNotFound { .. }));
        assert!(matches!(loader.load(front.as_ref(), ""), Err(SessionError::FilterNotFound { .. })));
    }

    #[test]
    fn test_load_without_entry_point_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("libfilteravg.so"), b"").unwrap();
        let fabric = MemoryFabric::new();
        let front = fabric.create_group_with(Topology::flat("localhost", 1), None).unwrap();

        let loader = FilterLoader::new(dir.path().to_str());
        let err = loader.load(front.as_ref(), "avg").unwrap_err();
        assert!(matches!(err, SessionError::FilterLoad(_)));
    }
}
