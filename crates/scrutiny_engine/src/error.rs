use thiserror::Error;

/// Failures that scope to a single rule's evaluation. The engine records
/// them in the owning ruleset's error map; it never aborts a run over one
/// rule.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("provider `{provider}` has no capability `{capability}`")]
    UnknownCapability { provider: String, capability: String },

    #[error("provider `{provider}` failed evaluating `{capability}`: {source:#}")]
    Provider {
        provider: String,
        capability: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("chain template `{0}` is not defined")]
    ChainMissing(String),
}
