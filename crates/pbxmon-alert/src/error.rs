use pbxmon_common::types::AlertEvent;

/// Errors surfaced by the reading-processing pipeline.
///
/// Evaluation itself never fails; these cover the collaborator seams around
/// it. Persistence failures still carry the computed events so the caller
/// can retry the write without losing the decision.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No configuration exists for the device; the reading was skipped
    /// without partial evaluation.
    #[error("Alert: no config for device '{device_id}', reading skipped")]
    ConfigMissing { device_id: String },

    /// The configuration provider itself failed.
    #[error("Alert: config lookup failed for device '{device_id}': {source}")]
    ConfigLoad {
        device_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Loading the persisted alert state failed.
    #[error("Alert: state load failed for device '{device_id}': {source}")]
    StateLoad {
        device_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Saving the updated state failed. The computed events are attached;
    /// they must not be silently dropped.
    #[error("Alert: state save failed for device '{device_id}': {source}")]
    Persistence {
        device_id: String,
        #[source]
        source: anyhow::Error,
        events: Vec<AlertEvent>,
    },
}

/// Convenience `Result` alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ProcessError>;
