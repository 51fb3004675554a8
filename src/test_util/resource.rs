use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::resource::{ReprError, Representation, ResourceModel};

enum Entry {
    Available(Representation),
    Failing,
}

/// An in-memory [ResourceModel] with per-path representations that tests can set,
///  replace, remove or make fail.
pub struct TestResources {
    entries: RwLock<FxHashMap<String, Entry>>,
}

impl TestResources {
    #[allow(clippy::new_without_default)]
    pub fn new() -> TestResources {
        TestResources {
            entries: Default::default(),
        }
    }

    pub async fn set(&self, uri_path: &str, representation: Representation) {
        self.entries.write().await
            .insert(uri_path.to_string(), Entry::Available(representation));
    }

    /// makes every representation request for this path fail with an application error
    pub async fn set_failing(&self, uri_path: &str) {
        self.entries.write().await
            .insert(uri_path.to_string(), Entry::Failing);
    }

    pub async fn remove(&self, uri_path: &str) {
        self.entries.write().await
            .remove(uri_path);
    }
}

#[async_trait]
impl ResourceModel for TestResources {
    async fn representation(&self, uri_path: &str, accept: Option<u16>) -> Result<Representation, ReprError> {
        match self.entries.read().await.get(uri_path) {
            Some(Entry::Available(representation)) => {
                match accept {
                    Some(format) if format != representation.content_format =>
                        Err(ReprError::UnsupportedFormat),
                    _ => Ok(representation.clone()),
                }
            }
            Some(Entry::Failing) => Err(ReprError::Failed(anyhow!("representation unavailable"))),
            None => Err(ReprError::NotFound),
        }
    }
}
