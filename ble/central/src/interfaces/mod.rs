//! Bluetooth Transport Abstraction
//!
//! This module defines the [`BleTransport`] trait, the imperative half of a platform
//! Bluetooth LE central stack, and [`TransportEvent`], the delegate half. The central
//! calls the trait to start single-shot native operations and learns their outcome
//! (and any spontaneous events) from a stream of [`TransportEvent`]s.
//!
//! Key features:
//! - Non-blocking, fire-and-forget native calls.
//! - One event enum covering every delegate callback the central reacts to.
//!
//! Implement this trait to provide platform-specific Bluetooth functionality.

use crate::errors::TransportError;
use peripheral::{
    CharacteristicInfo, CharacteristicKey, ConnectOptions, PeripheralId, RadioState, ServiceInfo,
    ServiceKey, WriteType,
};
use uuid::Uuid;
pub mod peripheral;

/// Imperative one-shot operations of the platform stack.
///
/// Every call must return without waiting for the outcome; the outcome is reported
/// later as a [`TransportEvent`]. Implementations must not call back into the
/// central from inside these methods, and must not report discovery results for
/// calls made over a link after its `Disconnected` event.
#[cfg_attr(test, mockall::automock)]
pub trait BleTransport: Send + Sync + 'static {
    /// Start connecting to a peripheral.
    fn connect(&self, peripheral: PeripheralId, options: &ConnectOptions);

    /// Tear down a link or cancel a pending connection attempt.
    fn disconnect(&self, peripheral: PeripheralId);

    /// Discover the given services on a connected peripheral.
    fn discover_services(&self, peripheral: PeripheralId, services: &[Uuid]);

    /// Discover the given characteristics of a discovered service.
    fn discover_characteristics(&self, service: ServiceKey, characteristics: &[Uuid]);

    /// Read the current value of a characteristic.
    fn read_value(&self, characteristic: CharacteristicKey);

    /// Write a value to a characteristic.
    fn write_value(&self, characteristic: CharacteristicKey, data: &[u8], write_type: WriteType);

    /// Enable or disable notifications for a characteristic.
    fn set_notify_value(&self, characteristic: CharacteristicKey, enabled: bool);
}

/// Asynchronous outcome or spontaneous event reported by the platform stack.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The radio power state changed.
    StateChanged(RadioState),

    /// A link came up.
    Connected(PeripheralId),

    /// A connection attempt failed.
    FailedToConnect {
        peripheral: PeripheralId,
        error: TransportError,
    },

    /// A link went down, optionally because of an error.
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },

    /// Signal strength was measured.
    RssiUpdated {
        peripheral: PeripheralId,
        result: Result<i16, TransportError>,
    },

    /// The peripheral advertised a new name.
    NameUpdated {
        peripheral: PeripheralId,
        name: Option<String>,
    },

    /// One `discover_services` call finished.
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: Result<Vec<ServiceInfo>, TransportError>,
    },

    /// The peripheral changed its GATT database; the listed services are gone.
    ServicesInvalidated {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    },

    /// One `discover_characteristics` call finished.
    CharacteristicsDiscovered {
        service: ServiceKey,
        result: Result<Vec<CharacteristicInfo>, TransportError>,
    },

    /// A value arrived, either as a read response or as a notification.
    ValueUpdated {
        characteristic: CharacteristicKey,
        result: Result<Option<Vec<u8>>, TransportError>,
    },

    /// A write with response was acknowledged (or rejected).
    ValueWritten {
        characteristic: CharacteristicKey,
        result: Result<(), TransportError>,
    },

    /// The notification state of a characteristic changed (or failed to).
    NotificationStateUpdated {
        characteristic: CharacteristicKey,
        result: Result<bool, TransportError>,
    },
}

impl TransportEvent {
    /// Peripheral the event is scoped to, if any.
    pub fn peripheral(&self) -> Option<PeripheralId> {
        match self {
            TransportEvent::StateChanged(_) => None,
            TransportEvent::Connected(peripheral) => Some(*peripheral),
            TransportEvent::FailedToConnect { peripheral, .. }
            | TransportEvent::Disconnected { peripheral, .. }
            | TransportEvent::RssiUpdated { peripheral, .. }
            | TransportEvent::NameUpdated { peripheral, .. }
            | TransportEvent::ServicesDiscovered { peripheral, .. }
            | TransportEvent::ServicesInvalidated { peripheral, .. } => Some(*peripheral),
            TransportEvent::CharacteristicsDiscovered { service, .. } => Some(service.peripheral),
            TransportEvent::ValueUpdated { characteristic, .. }
            | TransportEvent::ValueWritten { characteristic, .. }
            | TransportEvent::NotificationStateUpdated { characteristic, .. } => {
                Some(characteristic.peripheral)
            }
        }
    }
}
