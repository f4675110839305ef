/// Errors that can occur within the storage layer.
///
/// The [`StateStore`](pbxmon_alert::StateStore) and
/// [`ConfigProvider`](pbxmon_alert::ConfigProvider) trait implementations
/// surface these through `anyhow::Result` at the trait seam; the inherent
/// methods return `store::error::Result<T>` directly.
///
/// # Examples
///
/// ```rust
/// use pbxmon_store::error::StoreError;
///
/// let err = StoreError::Other("disk full".to_string());
/// assert!(err.to_string().contains("disk full"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure on a state or config
    /// column.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic storage error for cases not covered by other variants.
    #[error("Storage: {0}")]
    Other(String),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
