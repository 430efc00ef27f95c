use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use thiserror::Error;

/// Per-request failures. They never leave the worker that produced them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed dns packet: {0}")]
    Decode(#[source] ProtoError),

    #[error("dns packet carries no question")]
    MissingQuestion,

    #[error("no rule matched {qname}")]
    NoMatchingRule {
        qname: String,
        message: Box<Message>,
    },

    #[error("upstream resolution failed after {attempts} attempts: {last}")]
    Network { attempts: usize, last: String },

    #[error("failed to encode dns message: {0}")]
    Encode(#[source] ProtoError),
}

impl EngineError {
    /// Whether the client may get a synthesized SERVFAIL for this error.
    pub fn is_answerable(&self) -> bool {
        matches!(
            self,
            EngineError::NoMatchingRule { .. } | EngineError::Network { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum RuleSyntaxError {
    #[error("line does not match any known rule syntax")]
    UnknownSyntax,

    #[error("invalid domain pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid resolver address {0:?}")]
    InvalidResolver(String),

    #[error("resolver list is empty")]
    NoResolvers,

    #[error("unknown record type {0:?}")]
    InvalidType(String),

    #[error("unknown record class {0:?}")]
    InvalidClass(String),

    #[error("invalid domain name {0:?}")]
    InvalidName(String),

    #[error("invalid timeout {0:?}")]
    InvalidTimeout(String),
}
