//! Broadcast events
//!
//! Every platform occurrence is published on its own [`tokio::sync::broadcast`]
//! channel, independently of request/response correlation. Subscribing or
//! unsubscribing never affects pending requests.
//!
//! For an occurrence that also resolves pending requests, the waiters are resolved
//! first and the broadcast is published afterwards.

use crate::errors::{CentralError, TransportError};
use crate::interfaces::peripheral::{
    Characteristic, CharacteristicKey, PeripheralId, RadioState, Service, ServiceKey,
};
use log::trace;
use tokio::sync::broadcast;

/// A link went down.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnection {
    pub peripheral: PeripheralId,
    pub error: Option<TransportError>,
}

/// One service discovery finished.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicesDiscovered {
    pub peripheral: PeripheralId,
    pub result: Result<Vec<Service>, CentralError>,
}

/// One characteristic discovery finished.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicsDiscovered {
    pub service: ServiceKey,
    pub result: Result<Vec<Characteristic>, CentralError>,
}

/// A value arrived, from a read or a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub characteristic: CharacteristicKey,
    pub value: Result<Vec<u8>, CentralError>,
}

/// A write with response was acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    pub characteristic: CharacteristicKey,
    pub result: Result<(), CentralError>,
}

/// The notification state of a characteristic changed.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyStateChange {
    pub characteristic: CharacteristicKey,
    pub result: Result<bool, CentralError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RssiUpdate {
    pub peripheral: PeripheralId,
    pub result: Result<i16, CentralError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameUpdate {
    pub peripheral: PeripheralId,
    pub name: Option<String>,
}

/// One broadcast point per event kind.
#[derive(Debug)]
pub struct EventHub {
    state_changed: broadcast::Sender<RadioState>,
    connected: broadcast::Sender<PeripheralId>,
    disconnected: broadcast::Sender<Disconnection>,
    services_discovered: broadcast::Sender<ServicesDiscovered>,
    characteristics_discovered: broadcast::Sender<CharacteristicsDiscovered>,
    value_updated: broadcast::Sender<ValueUpdate>,
    write_acked: broadcast::Sender<WriteAck>,
    notify_state_changed: broadcast::Sender<NotifyStateChange>,
    rssi_updated: broadcast::Sender<RssiUpdate>,
    name_updated: broadcast::Sender<NameUpdate>,
}

/// A broadcast ready to be published once the engine lock is released.
#[derive(Debug, Clone)]
pub(crate) enum Broadcast {
    StateChanged(RadioState),
    Connected(PeripheralId),
    Disconnected(Disconnection),
    ServicesDiscovered(ServicesDiscovered),
    CharacteristicsDiscovered(CharacteristicsDiscovered),
    ValueUpdated(ValueUpdate),
    WriteAcked(WriteAck),
    NotifyStateChanged(NotifyStateChange),
    RssiUpdated(RssiUpdate),
    NameUpdated(NameUpdate),
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state_changed: broadcast::channel(capacity).0,
            connected: broadcast::channel(capacity).0,
            disconnected: broadcast::channel(capacity).0,
            services_discovered: broadcast::channel(capacity).0,
            characteristics_discovered: broadcast::channel(capacity).0,
            value_updated: broadcast::channel(capacity).0,
            write_acked: broadcast::channel(capacity).0,
            notify_state_changed: broadcast::channel(capacity).0,
            rssi_updated: broadcast::channel(capacity).0,
            name_updated: broadcast::channel(capacity).0,
        }
    }

    pub fn state_changed(&self) -> broadcast::Receiver<RadioState> {
        self.state_changed.subscribe()
    }

    pub fn connected(&self) -> broadcast::Receiver<PeripheralId> {
        self.connected.subscribe()
    }

    pub fn disconnected(&self) -> broadcast::Receiver<Disconnection> {
        self.disconnected.subscribe()
    }

    pub fn services_discovered(&self) -> broadcast::Receiver<ServicesDiscovered> {
        self.services_discovered.subscribe()
    }

    pub fn characteristics_discovered(&self) -> broadcast::Receiver<CharacteristicsDiscovered> {
        self.characteristics_discovered.subscribe()
    }

    pub fn value_updated(&self) -> broadcast::Receiver<ValueUpdate> {
        self.value_updated.subscribe()
    }

    pub fn write_acked(&self) -> broadcast::Receiver<WriteAck> {
        self.write_acked.subscribe()
    }

    pub fn notify_state_changed(&self) -> broadcast::Receiver<NotifyStateChange> {
        self.notify_state_changed.subscribe()
    }

    pub fn rssi_updated(&self) -> broadcast::Receiver<RssiUpdate> {
        self.rssi_updated.subscribe()
    }

    pub fn name_updated(&self) -> broadcast::Receiver<NameUpdate> {
        self.name_updated.subscribe()
    }

    /// Publish to the matching channel. Having no subscribers is not an error.
    pub(crate) fn publish(&self, event: Broadcast) {
        trace!("publishing {:?}", event);
        let delivered = match event {
            Broadcast::StateChanged(state) => self.state_changed.send(state).is_ok(),
            Broadcast::Connected(id) => self.connected.send(id).is_ok(),
            Broadcast::Disconnected(event) => self.disconnected.send(event).is_ok(),
            Broadcast::ServicesDiscovered(event) => self.services_discovered.send(event).is_ok(),
            Broadcast::CharacteristicsDiscovered(event) => {
                self.characteristics_discovered.send(event).is_ok()
            }
            Broadcast::ValueUpdated(event) => self.value_updated.send(event).is_ok(),
            Broadcast::WriteAcked(event) => self.write_acked.send(event).is_ok(),
            Broadcast::NotifyStateChanged(event) => {
                self.notify_state_changed.send(event).is_ok()
            }
            Broadcast::RssiUpdated(event) => self.rssi_updated.send(event).is_ok(),
            Broadcast::NameUpdated(event) => self.name_updated.send(event).is_ok(),
        };
        if !delivered {
            trace!("no subscribers for event");
        }
    }
}
