//! Transport event handling.
//!
//! Updates the mirrored state, drains the registries the event resolves and queues
//! the matching broadcast. Events arriving after close are dropped.

use super::{Engine, EngineState, Settlement};
use crate::errors::{CentralError, TransportError};
use crate::events::{
    Broadcast, CharacteristicsDiscovered, Disconnection, NameUpdate, NotifyStateChange, RssiUpdate,
    ServicesDiscovered, ValueUpdate, WriteAck,
};
use crate::interfaces::peripheral::{
    Characteristic, CharacteristicInfo, CharacteristicKey, ConnectionState, PeripheralId,
    RadioState, Service, ServiceInfo, ServiceKey,
};
use crate::interfaces::TransportEvent;
use log::{debug, error, info, trace, warn};
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Feed transport events into the engine until the stream ends or the engine is gone.
pub(crate) async fn pump(
    engine: Weak<Engine>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.handle_event(event);
    }
    debug!("transport event pump stopped");
}

impl Engine {
    pub(crate) fn handle_event(&self, event: TransportEvent) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                trace!("dropping {:?} after close", event);
                return;
            }
            trace!(
                "transport event for {:?}: {:?}",
                event.peripheral(),
                event
            );
            match event {
                TransportEvent::StateChanged(radio) => {
                    on_state_changed(state, &mut settlement, radio)
                }
                TransportEvent::Connected(peripheral) => {
                    on_connected(state, &mut settlement, peripheral)
                }
                TransportEvent::FailedToConnect { peripheral, error } => {
                    on_failed_to_connect(state, &mut settlement, peripheral, error)
                }
                TransportEvent::Disconnected { peripheral, error } => {
                    on_disconnected(state, &mut settlement, peripheral, error)
                }
                TransportEvent::RssiUpdated { peripheral, result } => {
                    if let Ok(rssi) = result {
                        state.topology.peripheral_mut(peripheral).rssi = Some(rssi);
                    }
                    settlement.broadcast(Broadcast::RssiUpdated(RssiUpdate {
                        peripheral,
                        result: result.map_err(CentralError::from),
                    }));
                }
                TransportEvent::NameUpdated { peripheral, name } => {
                    state.topology.peripheral_mut(peripheral).name = name.clone();
                    settlement.broadcast(Broadcast::NameUpdated(NameUpdate { peripheral, name }));
                }
                TransportEvent::ServicesDiscovered { peripheral, result } => {
                    on_services_discovered(state, &mut settlement, peripheral, result)
                }
                TransportEvent::ServicesInvalidated {
                    peripheral,
                    services,
                } => on_services_invalidated(state, &mut settlement, peripheral, &services),
                TransportEvent::CharacteristicsDiscovered { service, result } => {
                    on_characteristics_discovered(state, &mut settlement, service, result)
                }
                TransportEvent::ValueUpdated {
                    characteristic,
                    result,
                } => on_value_updated(state, &mut settlement, characteristic, result),
                TransportEvent::ValueWritten {
                    characteristic,
                    result,
                } => {
                    let result = result.map_err(CentralError::from);
                    if let Some(waiters) = state.writes.drain(&characteristic) {
                        settlement.deliver(waiters, result.clone());
                    }
                    settlement.broadcast(Broadcast::WriteAcked(WriteAck {
                        characteristic,
                        result,
                    }));
                }
                TransportEvent::NotificationStateUpdated {
                    characteristic,
                    result,
                } => on_notification_state(state, &mut settlement, characteristic, result),
            }
        }
        self.settle(settlement);
    }
}

fn on_state_changed(state: &mut EngineState, settlement: &mut Settlement, radio: RadioState) {
    info!("radio state {:?} -> {:?}", state.radio, radio);
    let was_on = state.radio.is_powered_on();
    state.radio = radio;
    if !radio.is_powered_on() {
        if was_on {
            warn!(
                "radio left powered on, failing {} pending requests",
                state.pending_requests()
            );
        }
        state.topology.reset_all_links();
        state.fail_all(settlement, &CentralError::InvalidState(radio));
    }
    settlement.broadcast(Broadcast::StateChanged(radio));
}

fn on_connected(state: &mut EngineState, settlement: &mut Settlement, peripheral: PeripheralId) {
    info!("connected to {}", peripheral);
    state
        .topology
        .set_state(peripheral, ConnectionState::Connected);
    if let Some(waiters) = state.connects.drain(&peripheral) {
        settlement.deliver(waiters, Ok(()));
    }
    settlement.broadcast(Broadcast::Connected(peripheral));
}

fn on_failed_to_connect(
    state: &mut EngineState,
    settlement: &mut Settlement,
    peripheral: PeripheralId,
    error: TransportError,
) {
    error!("failed to connect to {}: {}", peripheral, error);
    if state.topology.connection_state(&peripheral) != ConnectionState::Connected {
        state
            .topology
            .set_state(peripheral, ConnectionState::Disconnected);
    }
    if let Some(waiters) = state.connects.drain(&peripheral) {
        settlement.deliver(waiters, Err(CentralError::Transport(error)));
    }
    if let Some(waiters) = state.disconnects.drain(&peripheral) {
        settlement.deliver(waiters, Ok(()));
    }
}

fn on_disconnected(
    state: &mut EngineState,
    settlement: &mut Settlement,
    peripheral: PeripheralId,
    error: Option<TransportError>,
) {
    match &error {
        Some(error) => warn!("disconnected from {}: {}", peripheral, error),
        None => info!("disconnected from {}", peripheral),
    }
    state.topology.reset_link(peripheral);
    let requested = state.disconnects.drain(&peripheral);
    let reconnecting = requested.is_some()
        && state
            .connects
            .meta_mut(&peripheral)
            .map(|after_disconnect| std::mem::replace(after_disconnect, false))
            .unwrap_or(false);
    if let Some(waiters) = requested {
        settlement.deliver(waiters, Ok(()));
    }
    if reconnecting {
        debug!("{} disconnected, reconnect still pending", peripheral);
        state
            .topology
            .set_state(peripheral, ConnectionState::Connecting);
    } else if let Some(waiters) = state.connects.drain(&peripheral) {
        let reason = error
            .clone()
            .map(CentralError::Transport)
            .unwrap_or(CentralError::PeripheralNotConnected(peripheral));
        settlement.deliver(waiters, Err(reason));
    }
    state.fail_gatt_requests(
        settlement,
        peripheral,
        &CentralError::PeripheralNotConnected(peripheral),
    );
    settlement.broadcast(Broadcast::Disconnected(Disconnection { peripheral, error }));
}

fn on_services_discovered(
    state: &mut EngineState,
    settlement: &mut Settlement,
    peripheral: PeripheralId,
    result: Result<Vec<ServiceInfo>, TransportError>,
) {
    let connected = state.topology.connection_state(&peripheral) == ConnectionState::Connected;
    let remaining = state.topology.finish_service_scan(peripheral);
    let found = match result {
        Ok(found) => found,
        Err(error) => {
            warn!("service discovery on {} failed: {}", peripheral, error);
            let error = CentralError::Transport(error);
            settlement.fail(
                state.services.drain_where(|key| key.peripheral == peripheral),
                &error,
            );
            settlement.broadcast(Broadcast::ServicesDiscovered(ServicesDiscovered {
                peripheral,
                result: Err(error),
            }));
            return;
        }
    };

    if connected {
        state.topology.merge_services(peripheral, &found);
    } else {
        debug!("ignoring services of {} discovered after link loss", peripheral);
    }

    let pending: Vec<ServiceKey> = state
        .services
        .keys()
        .filter(|key| key.peripheral == peripheral)
        .copied()
        .collect();
    for key in pending {
        let outcome = match state.topology.service(&key) {
            Some(service) => Ok(service.clone()),
            None if remaining == 0 => Err(CentralError::ServiceNotFound(key.service)),
            None => continue,
        };
        if let Some(waiters) = state.services.drain(&key) {
            settlement.deliver(waiters, outcome);
        }
    }

    let services = found
        .iter()
        .map(|info| Service {
            peripheral,
            uuid: info.uuid,
            is_primary: info.is_primary,
        })
        .collect();
    settlement.broadcast(Broadcast::ServicesDiscovered(ServicesDiscovered {
        peripheral,
        result: Ok(services),
    }));
}

fn on_services_invalidated(
    state: &mut EngineState,
    settlement: &mut Settlement,
    peripheral: PeripheralId,
    services: &[Uuid],
) {
    info!("{} invalidated {} services", peripheral, services.len());
    state.topology.remove_services(&peripheral, services);
    let gone = |key: &CharacteristicKey| {
        key.peripheral == peripheral && services.contains(&key.service)
    };
    for (key, waiters) in state.characteristics.drain_where(gone) {
        settlement.deliver(waiters, Err(CentralError::ServiceNotFound(key.service)));
    }
    for (key, waiters) in state.reads.drain_where(gone) {
        settlement.deliver(waiters, Err(CentralError::ServiceNotFound(key.service)));
    }
    for (key, waiters) in state.writes.drain_where(gone) {
        settlement.deliver(waiters, Err(CentralError::ServiceNotFound(key.service)));
    }
    for ((key, _), waiters) in state.notifies.drain_where(|(key, _)| gone(key)) {
        settlement.deliver(waiters, Err(CentralError::ServiceNotFound(key.service)));
    }
}

fn on_characteristics_discovered(
    state: &mut EngineState,
    settlement: &mut Settlement,
    service: ServiceKey,
    result: Result<Vec<CharacteristicInfo>, TransportError>,
) {
    let remaining = state.topology.finish_characteristic_scan(&service);
    let found = match result {
        Ok(found) => found,
        Err(error) => {
            warn!("characteristic discovery of {} failed: {}", service, error);
            let error = CentralError::Transport(error);
            settlement.fail(
                state
                    .characteristics
                    .drain_where(|key| key.service_key() == service),
                &error,
            );
            settlement.broadcast(Broadcast::CharacteristicsDiscovered(
                CharacteristicsDiscovered {
                    service,
                    result: Err(error),
                },
            ));
            return;
        }
    };

    if state.topology.connection_state(&service.peripheral) == ConnectionState::Connected {
        state.topology.merge_characteristics(&service, &found);
    }

    let pending: Vec<CharacteristicKey> = state
        .characteristics
        .keys()
        .filter(|key| key.service_key() == service)
        .copied()
        .collect();
    for key in pending {
        let outcome = match state.topology.characteristic(&key) {
            Some(characteristic) => Ok(characteristic.clone()),
            None if remaining == 0 => Err(CentralError::CharacteristicNotFound(key.characteristic)),
            None => continue,
        };
        if let Some(waiters) = state.characteristics.drain(&key) {
            settlement.deliver(waiters, outcome);
        }
    }

    let characteristics = found
        .iter()
        .map(|info| {
            let key = service.characteristic(info.uuid);
            state
                .topology
                .characteristic(&key)
                .cloned()
                .unwrap_or(Characteristic {
                    peripheral: service.peripheral,
                    service: service.service,
                    uuid: info.uuid,
                    properties: info.properties,
                    is_notifying: false,
                })
        })
        .collect();
    settlement.broadcast(Broadcast::CharacteristicsDiscovered(
        CharacteristicsDiscovered {
            service,
            result: Ok(characteristics),
        },
    ));
}

fn on_value_updated(
    state: &mut EngineState,
    settlement: &mut Settlement,
    characteristic: CharacteristicKey,
    result: Result<Option<Vec<u8>>, TransportError>,
) {
    let value = match result {
        Ok(Some(value)) => {
            state
                .cache
                .store(characteristic, value.clone(), Instant::now());
            Ok(value)
        }
        Ok(None) => Err(CentralError::CharacteristicDataIsNil(
            characteristic.characteristic,
        )),
        Err(error) => Err(CentralError::Transport(error)),
    };
    if let Some(waiters) = state.reads.drain(&characteristic) {
        debug!("read of {} resolved {} waiters", characteristic, waiters.len());
        settlement.deliver(waiters, value.clone());
    }
    settlement.broadcast(Broadcast::ValueUpdated(ValueUpdate {
        characteristic,
        value,
    }));
}

fn on_notification_state(
    state: &mut EngineState,
    settlement: &mut Settlement,
    characteristic: CharacteristicKey,
    result: Result<bool, TransportError>,
) {
    match &result {
        Ok(enabled) => {
            debug!("notifications on {} now {}", characteristic, enabled);
            state.topology.set_notifying(&characteristic, *enabled);
            if let Some(waiters) = state.notifies.drain(&(characteristic, *enabled)) {
                settlement.deliver(waiters, Ok(*enabled));
            }
        }
        Err(error) => {
            warn!("notify change on {} failed: {}", characteristic, error);
            let error = CentralError::Transport(error.clone());
            for enabled in [true, false] {
                if let Some(waiters) = state.notifies.drain(&(characteristic, enabled)) {
                    settlement.deliver(waiters, Err(error.clone()));
                }
            }
        }
    }
    settlement.broadcast(Broadcast::NotifyStateChanged(NotifyStateChange {
        characteristic,
        result: result.map_err(CentralError::from),
    }));
}
