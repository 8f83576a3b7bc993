//! Operation coordinators.
//!
//! Each operation follows the same steps under the engine lock: gate, join an
//! outstanding request for the same key or become its owner, arm the timeout, issue
//! the native call. Outcomes are resolved later by [`super::dispatch`] or by
//! [`Engine::on_timeout`].

use super::registry::{PendingRegistry, Waiter};
use super::{Engine, PendingOp, Settlement};
use crate::config::Timeout;
use crate::engine::cache::CachePolicy;
use crate::errors::CentralError;
use crate::interfaces::peripheral::{
    Capability, Characteristic, CharacteristicKey, ConnectOptions, ConnectionState, PeripheralId,
    Service, ServiceKey, WriteType,
};
use log::{debug, info, trace, warn};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

impl Engine {
    /// Join the outstanding request for `key`, or become its owner.
    ///
    /// Returns `true` when the caller owns the new entry and must issue the native call.
    #[allow(clippy::too_many_arguments)]
    fn admit<K, T, M>(
        &self,
        settlement: &mut Settlement,
        registry: &mut PendingRegistry<K, T, M>,
        key: K,
        meta: M,
        waiter: Waiter<T>,
        timeout: Option<Duration>,
        op: PendingOp,
    ) -> bool
    where
        K: Eq + Hash + Clone,
        T: Send + 'static,
    {
        let token = registry.begin_if_absent(key.clone(), meta);
        if let Err(waiter) = registry.add_waiter(&key, waiter) {
            settlement.immediate(waiter, Err(CentralError::Destroyed));
        }
        match token {
            Some(token) => {
                if let Some(duration) = timeout {
                    registry.attach_timer(&key, self.arm_timer(op, token, duration));
                }
                debug!("started {:?} (timeout {:?})", op, timeout);
                true
            }
            None => {
                debug!("joined pending {:?}", op);
                false
            }
        }
    }

    pub(crate) fn connect(
        &self,
        peripheral: PeripheralId,
        options: ConnectOptions,
        timeout: Timeout,
        waiter: Waiter<()>,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let checked = state.open().and_then(|_| state.gate().powered_on());
            if let Err(error) = checked {
                settlement.immediate(waiter, Err(error));
            } else if state.topology.connection_state(&peripheral) == ConnectionState::Connected {
                debug!("{} already connected", peripheral);
                settlement.immediate(waiter, Ok(()));
            } else {
                let timeout = timeout.resolve(self.config.connect_timeout());
                let op = PendingOp::Connect(peripheral);
                let after_disconnect = state.disconnects.has_pending(&peripheral);
                let owner = self.admit(
                    &mut settlement,
                    &mut state.connects,
                    peripheral,
                    after_disconnect,
                    waiter,
                    timeout,
                    op,
                );
                if owner {
                    info!("connecting to {}", peripheral);
                    state
                        .topology
                        .set_state(peripheral, ConnectionState::Connecting);
                    self.transport.connect(peripheral, &options);
                }
            }
        }
        self.settle(settlement);
    }

    pub(crate) fn disconnect(
        &self,
        peripheral: PeripheralId,
        timeout: Timeout,
        waiter: Waiter<()>,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let idle = state.topology.connection_state(&peripheral)
                == ConnectionState::Disconnected
                && !state.connects.has_pending(&peripheral);
            if let Err(error) = state.open() {
                settlement.immediate(waiter, Err(error));
            } else if idle {
                debug!("{} already disconnected", peripheral);
                settlement.immediate(waiter, Ok(()));
            } else {
                let timeout = timeout.resolve(self.config.connect_timeout());
                let op = PendingOp::Disconnect(peripheral);
                let owner = self.admit(
                    &mut settlement,
                    &mut state.disconnects,
                    peripheral,
                    (),
                    waiter,
                    timeout,
                    op,
                );
                if owner {
                    info!("disconnecting from {}", peripheral);
                    if state.topology.connection_state(&peripheral) == ConnectionState::Connected {
                        state
                            .topology
                            .set_state(peripheral, ConnectionState::Disconnecting);
                    }
                    self.transport.disconnect(peripheral);
                }
            }
        }
        self.settle(settlement);
    }

    /// Discover several services with one native call; each uuid resolves on its own.
    pub(crate) fn discover_services(
        &self,
        peripheral: PeripheralId,
        requests: Vec<(Uuid, Waiter<Service>)>,
        timeout: Timeout,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let checked = state
                .open()
                .and_then(|_| state.gate().connected(&peripheral));
            match checked {
                Err(error) => {
                    for (_, waiter) in requests {
                        settlement.immediate(waiter, Err(error.clone()));
                    }
                }
                Ok(()) => {
                    let timeout = timeout.resolve(self.config.discovery_timeout());
                    let mut scan = Vec::new();
                    for (uuid, waiter) in requests {
                        let key = ServiceKey::new(peripheral, uuid);
                        if let Some(service) = state.topology.service(&key) {
                            trace!("service {} already discovered", key);
                            settlement.immediate(waiter, Ok(service.clone()));
                            continue;
                        }
                        let op = PendingOp::Service(key);
                        let owner = self.admit(
                            &mut settlement,
                            &mut state.services,
                            key,
                            (),
                            waiter,
                            timeout,
                            op,
                        );
                        if owner {
                            scan.push(uuid);
                        }
                    }
                    if !scan.is_empty() {
                        debug!("discovering {} services on {}", scan.len(), peripheral);
                        state.topology.peripheral_mut(peripheral).service_scans += 1;
                        self.transport.discover_services(peripheral, &scan);
                    }
                }
            }
        }
        self.settle(settlement);
    }

    /// Discover several characteristics of one service with one native call.
    pub(crate) fn discover_characteristics(
        &self,
        service: ServiceKey,
        requests: Vec<(Uuid, Waiter<Characteristic>)>,
        timeout: Timeout,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let checked = state
                .open()
                .and_then(|_| state.gate().service(&service).map(drop));
            match checked {
                Err(error) => {
                    for (_, waiter) in requests {
                        settlement.immediate(waiter, Err(error.clone()));
                    }
                }
                Ok(()) => {
                    let timeout = timeout.resolve(self.config.discovery_timeout());
                    let mut scan = Vec::new();
                    for (uuid, waiter) in requests {
                        let key = service.characteristic(uuid);
                        if let Some(characteristic) = state.topology.characteristic(&key) {
                            trace!("characteristic {} already discovered", key);
                            settlement.immediate(waiter, Ok(characteristic.clone()));
                            continue;
                        }
                        let op = PendingOp::Characteristic(key);
                        let owner = self.admit(
                            &mut settlement,
                            &mut state.characteristics,
                            key,
                            (),
                            waiter,
                            timeout,
                            op,
                        );
                        if owner {
                            scan.push(uuid);
                        }
                    }
                    if !scan.is_empty() {
                        debug!("discovering {} characteristics of {}", scan.len(), service);
                        state.topology.begin_characteristic_scan(&service);
                        self.transport.discover_characteristics(service, &scan);
                    }
                }
            }
        }
        self.settle(settlement);
    }

    pub(crate) fn read(
        &self,
        key: CharacteristicKey,
        policy: CachePolicy,
        timeout: Timeout,
        waiter: Waiter<Vec<u8>>,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let checked = state
                .open()
                .and_then(|_| state.gate().characteristic(&key, Capability::Read).map(drop));
            if let Err(error) = checked {
                settlement.immediate(waiter, Err(error));
            } else if let Some(value) = state.cache.lookup(&key, policy, Instant::now()) {
                debug!("read of {} answered from cache ({:?})", key, policy);
                settlement.immediate(waiter, Ok(value.to_vec()));
            } else {
                let timeout = timeout.resolve(self.config.io_timeout());
                let owner = self.admit(
                    &mut settlement,
                    &mut state.reads,
                    key,
                    (),
                    waiter,
                    timeout,
                    PendingOp::Read(key),
                );
                if owner {
                    self.transport.read_value(key);
                }
            }
        }
        self.settle(settlement);
    }

    /// Write with response. Identical payloads coalesce; a different payload while a
    /// write is in flight fails with [`CentralError::WriteInProgress`].
    pub(crate) fn write(
        &self,
        key: CharacteristicKey,
        data: Vec<u8>,
        timeout: Timeout,
        waiter: Waiter<()>,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let checked = state
                .open()
                .and_then(|_| state.gate().characteristic(&key, Capability::Write).map(drop));
            let conflicting = state
                .writes
                .meta(&key)
                .is_some_and(|in_flight| *in_flight != data);
            if let Err(error) = checked {
                settlement.immediate(waiter, Err(error));
            } else if conflicting {
                warn!("rejecting write to {}: another payload is in flight", key);
                let error = CentralError::WriteInProgress(key.characteristic);
                settlement.immediate(waiter, Err(error));
            } else {
                let timeout = timeout.resolve(self.config.io_timeout());
                let op = PendingOp::Write(key);
                let owner = self.admit(
                    &mut settlement,
                    &mut state.writes,
                    key,
                    data.clone(),
                    waiter,
                    timeout,
                    op,
                );
                if owner {
                    self.transport
                        .write_value(key, &data, WriteType::WithResponse);
                }
            }
        }
        self.settle(settlement);
    }

    /// Fire-and-forget write. Only precondition failures are reported.
    pub(crate) fn write_without_response(
        &self,
        key: CharacteristicKey,
        data: &[u8],
    ) -> Result<(), CentralError> {
        let state = self.lock();
        state.open()?;
        state
            .gate()
            .characteristic(&key, Capability::WriteWithoutResponse)?;
        trace!("writing {} bytes to {} without response", data.len(), key);
        self.transport
            .write_value(key, data, WriteType::WithoutResponse);
        Ok(())
    }

    pub(crate) fn set_notify(
        &self,
        key: CharacteristicKey,
        enabled: bool,
        timeout: Timeout,
        waiter: Waiter<bool>,
    ) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let checked = state.open().and_then(|_| {
                state
                    .gate()
                    .characteristic(&key, Capability::Notify)
                    .map(|characteristic| characteristic.is_notifying)
            });
            let reverting = state.notifies.has_pending(&(key, !enabled));
            match checked {
                Err(error) => settlement.immediate(waiter, Err(error)),
                Ok(notifying) if notifying == enabled && !reverting => {
                    debug!("notifications on {} already {}", key, enabled);
                    settlement.immediate(waiter, Ok(enabled));
                }
                Ok(_) => {
                    let timeout = timeout.resolve(self.config.io_timeout());
                    let notify_key = (key, enabled);
                    let op = PendingOp::Notify(notify_key);
                    let owner = self.admit(
                        &mut settlement,
                        &mut state.notifies,
                        notify_key,
                        (),
                        waiter,
                        timeout,
                        op,
                    );
                    if owner {
                        self.transport.set_notify_value(key, enabled);
                    }
                }
            }
        }
        self.settle(settlement);
    }

    /// Timer expiry. A no-op unless the entry the timer was armed for is still pending.
    pub(crate) fn on_timeout(&self, op: PendingOp, token: u64) {
        let mut settlement = Settlement::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let timed_out = CentralError::OperationTimeout(op.request_key());
            match op {
                PendingOp::Connect(peripheral) => {
                    if let Some(waiters) = state.connects.drain_if_current(&peripheral, token) {
                        warn!("connection to {} timed out", peripheral);
                        if state.topology.connection_state(&peripheral)
                            == ConnectionState::Connecting
                        {
                            state
                                .topology
                                .set_state(peripheral, ConnectionState::Disconnected);
                        }
                        self.transport.disconnect(peripheral);
                        let error = CentralError::ConnectionTimeout(peripheral);
                        settlement.deliver(waiters, Err(error));
                    }
                }
                PendingOp::Disconnect(peripheral) => {
                    if let Some(waiters) = state.disconnects.drain_if_current(&peripheral, token) {
                        warn!("disconnect from {} timed out", peripheral);
                        settlement.deliver(waiters, Err(timed_out));
                    }
                }
                PendingOp::Service(key) => {
                    if let Some(waiters) = state.services.drain_if_current(&key, token) {
                        warn!("discovery of service {} timed out", key);
                        settlement.deliver(waiters, Err(timed_out));
                    }
                }
                PendingOp::Characteristic(key) => {
                    if let Some(waiters) = state.characteristics.drain_if_current(&key, token) {
                        warn!("discovery of characteristic {} timed out", key);
                        settlement.deliver(waiters, Err(timed_out));
                    }
                }
                PendingOp::Read(key) => {
                    if let Some(waiters) = state.reads.drain_if_current(&key, token) {
                        warn!("read of {} timed out", key);
                        settlement.deliver(waiters, Err(timed_out));
                    }
                }
                PendingOp::Write(key) => {
                    if let Some(waiters) = state.writes.drain_if_current(&key, token) {
                        warn!("write to {} timed out", key);
                        settlement.deliver(waiters, Err(timed_out));
                    }
                }
                PendingOp::Notify(notify_key) => {
                    if let Some(waiters) = state.notifies.drain_if_current(&notify_key, token) {
                        warn!("notify change on {} timed out", notify_key.0);
                        settlement.deliver(waiters, Err(timed_out));
                    }
                }
            }
        }
        self.settle(settlement);
    }
}
