use thiserror::Error;

/// Error categories surfaced by the engine. Plumbing code keeps using
/// `anyhow::Result`; these are raised where callers must branch on the kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid parameter space definition or contradictory settings.
    #[error("{0}")]
    Configuration(String),
    /// Strategy callback failure or a signal frame that failed validation.
    #[error("{0}")]
    Strategy(String),
    /// Malformed input data in a derived computation.
    #[error("{context}: {source}")]
    Dependency {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    /// Transient exchange-facing failure; never aborts a simulation.
    #[error("{0}")]
    RetryableOrder(String),
    #[error("{0}")]
    Operational(String),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn strategy(message: impl Into<String>) -> Self {
        Self::Strategy(message.into())
    }

    pub fn operational(message: impl Into<String>) -> Self {
        Self::Operational(message.into())
    }

    pub fn dependency(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Dependency {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableOrder(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Strategy(_) => "StrategyError",
            Self::Dependency { .. } => "DependencyException",
            Self::RetryableOrder(_) => "RetryableOrderError",
            Self::Operational(_) => "OperationalException",
        }
    }
}

/// Returns the typed engine error carried by an `anyhow` chain, if any.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<EngineError>())
}
