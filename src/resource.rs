use bytes::Bytes;

/// One serialized representation of a resource, plus the metadata the exchange layer
///  interprets: entity tag for 'not modified' handling and cache lifetime for the
///  max-age option. Everything else about the resource model is outside this crate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Representation {
    pub payload: Bytes,
    pub etag: Bytes,
    pub max_age_seconds: u32,
    pub content_format: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ReprError {
    #[error("no such resource")]
    NotFound,
    #[error("the resource cannot be rendered in the requested format")]
    UnsupportedFormat,
    /// an application failure while building the representation - converted into a
    ///  best-effort error response / notification, never propagated as a crash
    #[error("building the representation failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// The narrow interface to the resource model: fetch the current representation of a
///  path in a requested format. Registration of the engine as a change listener goes
///  through [ResourceListener] rather than a shared observable base class.
#[async_trait::async_trait]
pub trait ResourceModel: Send + Sync + 'static {
    async fn representation(&self, uri_path: &str, accept: Option<u16>) -> Result<Representation, ReprError>;
}

/// Explicitly typed change notifications pushed by the resource model. The observation
///  registry registers itself through this trait; the resource side never mutates
///  subscription state directly.
#[async_trait::async_trait]
pub trait ResourceListener: Send + Sync + 'static {
    /// the resource at `uri_path` has a new state - notify every current observer
    async fn on_changed(&self, uri_path: &str);

    /// the resource at `uri_path` was removed - end all its observations
    async fn on_removed(&self, uri_path: &str);
}
