use std::{error::Error, fmt, io};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, FedAvgError>;

/// Everything that can go wrong while running the protocol.
///
/// None of these are fatal to a coordinator or a client: the round and
/// training loops log them and carry on.
#[derive(Debug)]
pub enum FedAvgError {
    /// A feature or weight vector of unexpected length was supplied.
    DimensionMismatch { expected: usize, got: usize },
    /// Serialized weights were malformed or had the wrong cardinality.
    Serialization(String),
    /// The round had nothing usable to aggregate.
    AggregationSkipped { round: u32, reason: &'static str },
    /// A local update arrived for a round other than the active one.
    StaleRound { current: Option<u32>, got: u32 },
    /// A configured peer address could not be resolved.
    UnresolvedEndpoint {
        endpoint: String,
        source: Option<io::Error>,
    },
    /// A datagram could not be decoded into a protocol message.
    Codec(serde_json::Error),
    /// Invalid or unreadable configuration.
    Config(String),
    Io(io::Error),
}

impl fmt::Display for FedAvgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch { expected, got } => {
                write!(f, "dimension mismatch: expected {expected}, got {got}")
            }
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Self::AggregationSkipped { round, reason } => {
                write!(f, "aggregation skipped for round {round}: {reason}")
            }
            Self::StaleRound {
                current: Some(current),
                got,
            } => write!(f, "update for round {got} but current round is {current}"),
            Self::StaleRound { current: None, got } => {
                write!(f, "update for round {got} while no round is active")
            }
            Self::UnresolvedEndpoint {
                endpoint,
                source: Some(e),
            } => write!(f, "cannot resolve endpoint '{endpoint}': {e}"),
            Self::UnresolvedEndpoint {
                endpoint,
                source: None,
            } => write!(f, "cannot resolve endpoint '{endpoint}': no address found"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for FedAvgError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnresolvedEndpoint {
                source: Some(e), ..
            } => Some(e),
            Self::Codec(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FedAvgError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for FedAvgError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}
