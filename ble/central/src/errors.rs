//! Central errors

use crate::interfaces::peripheral::{Capability, PeripheralId, RadioState, RequestKey};
use uuid::Uuid;

/// An error surfaced by the platform transport. Forwarded unchanged to every waiter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct TransportError {
    /// Platform specific error code.
    pub code: i64,
    /// Human readable description from the platform stack.
    pub message: String,
}

impl TransportError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// An error that can occur while handling a central operation.
///
/// Every waiter of a coalesced request receives a clone of the same error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CentralError {
    /// The radio is not powered on.
    #[error("bluetooth radio is not powered on (state: {0:?})")]
    InvalidState(RadioState),

    /// The operation needs an active connection.
    #[error("peripheral {0} is not connected")]
    PeripheralNotConnected(PeripheralId),

    /// The connect timer fired before the link came up.
    #[error("connection to {0} timed out")]
    ConnectionTimeout(PeripheralId),

    /// The request timer fired before the platform answered.
    #[error("operation on {0} timed out")]
    OperationTimeout(RequestKey),

    /// Discovery finished without yielding the service.
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    /// Discovery finished without yielding the characteristic.
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// The characteristic lacks the property the operation needs.
    #[error("characteristic {uuid} does not support {capability}")]
    OperationNotSupported { uuid: Uuid, capability: Capability },

    /// The platform reported a successful read without a payload.
    #[error("characteristic {0} returned no value")]
    CharacteristicDataIsNil(Uuid),

    /// A write with a different payload is already in flight for the characteristic.
    #[error("a different write to characteristic {0} is in progress")]
    WriteInProgress(Uuid),

    /// The central was closed while the request was outstanding.
    #[error("central was closed")]
    Destroyed,

    /// The central was built outside of a tokio runtime.
    #[error("failed to attach to tokio runtime: {0}")]
    Runtime(String),

    /// An error reported by the platform stack.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
