//! Error types for Flashgate

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Flashgate
///
/// Absent entities, lock contention and admission rejections are *not*
/// errors: they surface as `Ok(None)`, `Ok(false)` and
/// [`AdmissionDecision`](crate::order::AdmissionDecision) respectively.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Substrate Errors
    // =========================================================================
    /// Key-value substrate unreachable or rejected the command
    #[error("Key-value store error: {0}")]
    Substrate(String),

    /// Malformed wire data from the substrate
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Substrate returned a value of an unexpected shape
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// Durable store failure
    #[error("Durable store error: {0}")]
    DurableStore(String),

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// Lock could not be acquired within the configured policy
    #[error("Lock contention on resource: {resource}")]
    LockContention { resource: String },

    /// Daily sequence counter overflowed its 32 bits
    #[error("Sequence {sequence} exhausted for today (counter {counter})")]
    SequenceExhausted { sequence: String, counter: i64 },

    /// Wall clock is earlier than the id baseline
    #[error("Clock is before the id baseline epoch: {0}")]
    ClockBeforeBaseline(i64),

    // =========================================================================
    // Order Errors
    // =========================================================================
    /// Voucher has no stock registered in the substrate
    #[error("Voucher not registered for flash sale: {0}")]
    VoucherNotFound(u64),

    /// Admitted order could not be queued for persistence
    #[error("Order queue full, admitted order {order_id} was not queued")]
    QueueFull { order_id: u64 },

    /// Pipeline is shut down
    #[error("Order pipeline is closed")]
    PipelineClosed,

    /// A guarantee of the admission path was observed to be broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_message_names_order() {
        let err = Error::QueueFull { order_id: 42 };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_codec_from_serde() {
        let parse: std::result::Result<u64, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Codec(_)));
    }
}
