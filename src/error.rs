use std::sync::PoisonError;

use kafka_protocol::{
    messages::ApiKey,
    protocol::{DecodeError, EncodeError},
    ResponseError,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Custom(String),
    Connection(ConnectionError),
    InvalidVersion(i16),
    InvalidApiRequest(ApiKey),
    Consume(ConsumeError),
    Response {
        error: ResponseError,
        msg: Option<String>,
    },
}

impl Error {
    /// Lifts a broker error code into `Error::Response`.
    pub fn response(error: ResponseError) -> Self {
        Error::Response { error, msg: None }
    }

    /// The broker error carried by this error, if any.
    pub fn response_err(&self) -> Option<ResponseError> {
        match self {
            Error::Response { error, .. } => Some(*error),
            _ => None,
        }
    }

    pub(crate) fn is_rebalance_in_progress(&self) -> bool {
        matches!(self.response_err(), Some(ResponseError::RebalanceInProgress))
    }

    /// IllegalGeneration and UnknownMemberId invalidate the membership
    /// outright; the supervisor treats them as lost, not as a rebalance.
    pub(crate) fn invalidates_membership(&self) -> bool {
        matches!(
            self.response_err(),
            Some(ResponseError::IllegalGeneration) | Some(ResponseError::UnknownMemberId)
        )
    }

    pub(crate) fn is_canceled(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Canceled))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(value: PoisonError<T>) -> Self {
        Self::Custom(value.to_string())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<ConsumeError> for Error {
    fn from(err: ConsumeError) -> Self {
        Error::Consume(err)
    }
}

impl From<EncodeError> for Error {
    fn from(_: EncodeError) -> Self {
        Error::Connection(ConnectionError::Encoding("encode error".into()))
    }
}

impl From<DecodeError> for Error {
    fn from(_: DecodeError) -> Self {
        Error::Connection(ConnectionError::Decoding("decode error".into()))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Custom(e) => write!(f, "{e}"),
            Error::Connection(e) => write!(f, "Connection error: {e}"),
            Error::InvalidVersion(v) => write!(f, "Invalid version: {v}"),
            Error::InvalidApiRequest(api) => write!(f, "Unsupported api request: {api:?}"),
            Error::Consume(e) => write!(f, "Consume error: {e}"),
            Error::Response { error, msg } => write!(f, "Error code: {error:?}, msg: {msg:?}"),
        }
    }
}

impl std::error::Error for Error {}

/// Failures raised by the transport seam rather than by the coordinator.
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Disconnected,
    Decoding(String),
    Encoding(String),
    UnexpectedResponse(String),
    Canceled,
    Shutdown,
    Timeout,
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "{e}"),
            ConnectionError::Disconnected => write!(f, "Disconnected"),
            ConnectionError::Decoding(e) => write!(f, "Error decoding message: {e}"),
            ConnectionError::Encoding(e) => write!(f, "Error encoding message: {e}"),
            ConnectionError::UnexpectedResponse(e) => {
                write!(f, "Unexpected response from kafka: {e}")
            }
            ConnectionError::Canceled => write!(f, "Canceled request"),
            ConnectionError::Shutdown => write!(f, "The connection was shut down"),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

pub enum ConsumeError {
    Custom(String),
    CoordinatorNotAvailable,
    BalancerNotAvailable(String),
    MixedBalancerProtocols,
    LeftGroup,
    StaleGroup,
    NotTransactional,
    NotInTransaction,
    ProducerIdUninitialized,
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConsumeError::Custom(e) => write!(f, "Custom error: {e}"),
            ConsumeError::CoordinatorNotAvailable => write!(f, "Group coordinator not available"),
            ConsumeError::BalancerNotAvailable(name) => {
                write!(f, "Balancer: {name} not available")
            }
            ConsumeError::MixedBalancerProtocols => {
                write!(f, "Cooperative and eager balancers cannot be mixed in one group")
            }
            ConsumeError::LeftGroup => write!(f, "Left group or client closed"),
            ConsumeError::StaleGroup => write!(f, "Stale group generation"),
            ConsumeError::NotTransactional => {
                write!(f, "Client has no transactional id configured")
            }
            ConsumeError::NotInTransaction => write!(f, "Client is not in a transaction"),
            ConsumeError::ProducerIdUninitialized => write!(f, "Unable to init producer id"),
        }
    }
}

impl std::fmt::Debug for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumeError::Custom(msg) => write!(f, "Custom({msg})"),
            ConsumeError::CoordinatorNotAvailable => write!(f, "CoordinatorNotAvailable"),
            ConsumeError::BalancerNotAvailable(name) => {
                write!(f, "BalancerNotAvailable({name})")
            }
            ConsumeError::MixedBalancerProtocols => write!(f, "MixedBalancerProtocols"),
            ConsumeError::LeftGroup => write!(f, "LeftGroup"),
            ConsumeError::StaleGroup => write!(f, "StaleGroup"),
            ConsumeError::NotTransactional => write!(f, "NotTransactional"),
            ConsumeError::NotInTransaction => write!(f, "NotInTransaction"),
            ConsumeError::ProducerIdUninitialized => write!(f, "ProducerIdUninitialized"),
        }
    }
}
