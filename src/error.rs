use std::fmt;

#[derive(Debug)]
pub enum CrackError {
    Validation(String),
    Config(String),
    BrokerUnavailable(String),
    Broker(String),
    Store(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl fmt::Display for CrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrackError::Validation(e) => write!(f, "Validation error: {}", e),
            CrackError::Config(e) => write!(f, "Configuration error: {}", e),
            CrackError::BrokerUnavailable(e) => write!(f, "Broker unavailable: {}", e),
            CrackError::Broker(e) => write!(f, "Broker error: {}", e),
            CrackError::Store(e) => write!(f, "Store error: {}", e),
            CrackError::Serialization(e) => write!(f, "Serialization error: {}", e),
            CrackError::Io(e) => write!(f, "IO error: {}", e),
            CrackError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for CrackError {}

impl From<serde_json::Error> for CrackError {
    fn from(err: serde_json::Error) -> Self {
        CrackError::Serialization(err)
    }
}

impl From<std::io::Error> for CrackError {
    fn from(err: std::io::Error) -> Self {
        CrackError::Io(err)
    }
}

#[cfg(feature = "distributed")]
impl From<amiquip::Error> for CrackError {
    fn from(err: amiquip::Error) -> Self {
        CrackError::Broker(err.to_string())
    }
}

#[cfg(feature = "distributed")]
impl From<postgres::Error> for CrackError {
    fn from(err: postgres::Error) -> Self {
        CrackError::Store(err.to_string())
    }
}

impl From<String> for CrackError {
    fn from(err: String) -> Self {
        CrackError::Other(err)
    }
}

impl From<&str> for CrackError {
    fn from(err: &str) -> Self {
        CrackError::Other(err.to_string())
    }
}
