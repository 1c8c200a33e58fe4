/// Every failure the optimizer can report.  Structural errors name the offending
/// identifiers; engine errors are recoverable by re-running with a different
/// configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TrafficError {
    #[error("invalid topology at '{id}': {reason}")]
    InvalidTopology { id: String, reason: String },
    #[error("duplicate identifier '{0}'")]
    DuplicateId(String),
    #[error("no feasible path for vehicle '{vehicle}' from '{origin}' to '{destination}': {reason}")]
    NoFeasiblePath {
        vehicle: String,
        origin: String,
        destination: String,
        reason: String,
    },
    #[error("infeasible cycle at intersection '{intersection}': {reason}")]
    InfeasibleCycle { intersection: String, reason: String },
    #[error("objective unsupported by the {backend} backend: {reason}")]
    UnsupportedObjective { backend: String, reason: String },
    #[error("optimization timed out after {elapsed_s:.3}s and {iterations} iterations")]
    OptimizationTimeout { elapsed_s: f64, iterations: u64 },
    #[error("optimization cancelled after {iterations} iterations")]
    OptimizationCancelled { iterations: u64 },
    #[error("none of the {reads} samples decoded to a feasible assignment")]
    NoFeasibleSample { reads: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TrafficError {
    pub fn invalid_topology(id: &str, reason: &str) -> TrafficError {
        TrafficError::InvalidTopology {
            id: String::from(id),
            reason: String::from(reason),
        }
    }

    pub fn infeasible_cycle(intersection: &str, reason: String) -> TrafficError {
        TrafficError::InfeasibleCycle {
            intersection: String::from(intersection),
            reason,
        }
    }

    pub fn unsupported(backend: &str, reason: String) -> TrafficError {
        TrafficError::UnsupportedObjective {
            backend: String::from(backend),
            reason,
        }
    }

    /// Engine-level failures can succeed on a retry with a larger budget, another seed
    /// or another backend.  Structural failures will fail again on the same input.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrafficError::OptimizationTimeout { .. } => true,
            TrafficError::OptimizationCancelled { .. } => true,
            TrafficError::UnsupportedObjective { .. } => true,
            TrafficError::NoFeasibleSample { .. } => true,
            _ => false,
        }
    }
}
