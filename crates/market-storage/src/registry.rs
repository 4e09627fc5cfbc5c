use crate::error::{Result, StoreError};
use crate::kv::KvRepo;
use crate::repo::Repo;
use crate::sqlite::SqliteRepo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Builds a repository from the location part of a DSN.
pub type BackendCtor = Arc<dyn Fn(&str) -> Result<Arc<dyn Repo>> + Send + Sync>;

/// Protocol tag to backend constructor, resolved once at startup.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    ctors: BTreeMap<String, BackendCtor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `memory`, `sqlite` and (with the `rocksdb` feature) `rocks`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", Arc::new(|_| Ok(Arc::new(KvRepo::memory()) as Arc<dyn Repo>)));
        registry.register(
            "sqlite",
            Arc::new(|location| {
                let repo = if location.is_empty() || location == ":memory:" {
                    SqliteRepo::open_in_memory()?
                } else {
                    SqliteRepo::open(location)?
                };
                Ok(Arc::new(repo) as Arc<dyn Repo>)
            }),
        );
        #[cfg(feature = "rocksdb")]
        registry.register(
            "rocks",
            Arc::new(|location| {
                if location.is_empty() {
                    return Err(StoreError::InvalidLocation("rocks backend needs a path".into()));
                }
                std::fs::create_dir_all(location)?;
                Ok(Arc::new(KvRepo::open_rocks(location)?) as Arc<dyn Repo>)
            }),
        );
        registry
    }

    pub fn register(&mut self, tag: &str, ctor: BackendCtor) {
        self.ctors.insert(tag.to_string(), ctor);
    }

    pub fn tags(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    /// Open `tag:location`, e.g. `rocks:./data/market` or `memory:`.
    pub fn open(&self, dsn: &str) -> Result<Arc<dyn Repo>> {
        let (tag, location) = dsn
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidLocation(format!("expected <tag>:<location>, got {}", dsn)))?;
        let ctor = self
            .ctors
            .get(tag)
            .ok_or_else(|| StoreError::UnknownBackend(tag.to_string()))?;
        let repo = ctor(location)?;
        info!(backend = repo.backend_name(), location, "🗄️ Deal repository ready");
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_unknown_tag() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.tags().contains(&"memory"));
        assert!(registry.tags().contains(&"sqlite"));

        assert_eq!(registry.open("memory:").unwrap().backend_name(), "memory");
        assert_eq!(registry.open("sqlite::memory:").unwrap().backend_name(), "sqlite");
        assert!(matches!(registry.open("badger:/tmp/x"), Err(StoreError::UnknownBackend(_))));
        assert!(matches!(registry.open("nocolon"), Err(StoreError::InvalidLocation(_))));
    }

    #[test]
    fn test_custom_backend() {
        let mut registry = BackendRegistry::new();
        registry.register("scratch", Arc::new(|_| Ok(Arc::new(KvRepo::memory()) as Arc<dyn Repo>)));
        assert!(registry.open("scratch:anything").is_ok());
        assert!(registry.open("memory:").is_err());
    }
}
