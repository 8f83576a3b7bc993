//! Request correlation engine.
//!
//! All mutable state lives in one [`EngineState`] behind a mutex. Operation
//! coordinators ([`coordinator`]), transport event handling ([`dispatch`]) and timer
//! expiry all take that lock, mutate state, and collect the callbacks and
//! broadcasts to run into a [`Settlement`]. The settlement is carried out only after
//! the lock is released, so callbacks may call back into the central.

pub(crate) mod cache;
mod coordinator;
pub(crate) mod dispatch;
pub(crate) mod gate;
pub(crate) mod registry;
pub(crate) mod timer;
pub(crate) mod topology;

use crate::config::CentralConfig;
use crate::errors::CentralError;
use crate::events::{Broadcast, EventHub};
use crate::interfaces::peripheral::{
    Characteristic, CharacteristicKey, PeripheralId, RadioState, RequestKey, Service, ServiceKey,
};
use crate::interfaces::BleTransport;
use cache::ReadCache;
use gate::Gate;
use log::info;
use registry::{Delivery, Drained, PendingRegistry, Waiter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use topology::Topology;

/// Notify requests coalesce only with requests for the same target state.
pub(crate) type NotifyKey = (CharacteristicKey, bool);

/// Which registry entry a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    Service(ServiceKey),
    Characteristic(CharacteristicKey),
    Read(CharacteristicKey),
    Write(CharacteristicKey),
    Notify(NotifyKey),
}

impl PendingOp {
    fn request_key(&self) -> RequestKey {
        match self {
            PendingOp::Connect(id) | PendingOp::Disconnect(id) => RequestKey::Peripheral(*id),
            PendingOp::Service(key) => RequestKey::Service(*key),
            PendingOp::Characteristic(key)
            | PendingOp::Read(key)
            | PendingOp::Write(key)
            | PendingOp::Notify((key, _)) => RequestKey::Characteristic(*key),
        }
    }
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) closed: bool,
    pub(crate) radio: RadioState,
    pub(crate) topology: Topology,
    pub(crate) cache: ReadCache,
    /// Metadata is set when the connect was requested while a disconnect was in flight.
    pub(crate) connects: PendingRegistry<PeripheralId, (), bool>,
    pub(crate) disconnects: PendingRegistry<PeripheralId, ()>,
    pub(crate) services: PendingRegistry<ServiceKey, Service>,
    pub(crate) characteristics: PendingRegistry<CharacteristicKey, Characteristic>,
    pub(crate) reads: PendingRegistry<CharacteristicKey, Vec<u8>>,
    /// Metadata is the payload of the in-flight write.
    pub(crate) writes: PendingRegistry<CharacteristicKey, (), Vec<u8>>,
    pub(crate) notifies: PendingRegistry<NotifyKey, bool>,
}

impl EngineState {
    pub(crate) fn open(&self) -> Result<(), CentralError> {
        if self.closed {
            Err(CentralError::Destroyed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn gate(&self) -> Gate<'_> {
        Gate::new(self.radio, &self.topology)
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.connects.len()
            + self.disconnects.len()
            + self.services.len()
            + self.characteristics.len()
            + self.reads.len()
            + self.writes.len()
            + self.notifies.len()
    }

    /// Drain every registry, resolving all waiters with `error`.
    pub(crate) fn fail_all(&mut self, settlement: &mut Settlement, error: &CentralError) {
        settlement.fail(self.connects.drain_all(), error);
        settlement.fail(self.disconnects.drain_all(), error);
        settlement.fail(self.services.drain_all(), error);
        settlement.fail(self.characteristics.drain_all(), error);
        settlement.fail(self.reads.drain_all(), error);
        settlement.fail(self.writes.drain_all(), error);
        settlement.fail(self.notifies.drain_all(), error);
    }

    /// Drain every GATT request scoped to `peripheral`.
    pub(crate) fn fail_gatt_requests(
        &mut self,
        settlement: &mut Settlement,
        peripheral: PeripheralId,
        error: &CentralError,
    ) {
        settlement.fail(
            self.services.drain_where(|key| key.peripheral == peripheral),
            error,
        );
        settlement.fail(
            self.characteristics
                .drain_where(|key| key.peripheral == peripheral),
            error,
        );
        settlement.fail(
            self.reads.drain_where(|key| key.peripheral == peripheral),
            error,
        );
        settlement.fail(
            self.writes.drain_where(|key| key.peripheral == peripheral),
            error,
        );
        settlement.fail(
            self.notifies
                .drain_where(|(key, _)| key.peripheral == peripheral),
            error,
        );
    }
}

/// Callbacks and broadcasts collected under the lock, run after it is released.
#[derive(Default)]
pub(crate) struct Settlement {
    deliveries: Vec<Delivery>,
    broadcasts: Vec<Broadcast>,
}

impl Settlement {
    /// Resolve a single caller that never reached the registry.
    pub(crate) fn immediate<T>(&mut self, waiter: Waiter<T>, outcome: Result<T, CentralError>)
    where
        T: Send + 'static,
    {
        self.deliveries.push(Box::new(move || waiter(outcome)));
    }

    pub(crate) fn deliver<T>(&mut self, drained: Drained<T>, outcome: Result<T, CentralError>)
    where
        T: Clone + Send + 'static,
    {
        self.deliveries.push(drained.deferred(outcome));
    }

    pub(crate) fn fail<K, T>(&mut self, drained: Vec<(K, Drained<T>)>, error: &CentralError)
    where
        T: Clone + Send + 'static,
    {
        for (_, waiters) in drained {
            self.deliver(waiters, Err(error.clone()));
        }
    }

    pub(crate) fn broadcast(&mut self, event: Broadcast) {
        self.broadcasts.push(event);
    }
}

pub(crate) struct Engine {
    me: Weak<Engine>,
    runtime: Handle,
    transport: Box<dyn BleTransport>,
    config: CentralConfig,
    state: Mutex<EngineState>,
    events: EventHub,
}

impl Engine {
    pub(crate) fn new(
        transport: Box<dyn BleTransport>,
        config: CentralConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            runtime,
            transport,
            events: EventHub::new(config.event_capacity),
            config,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub(crate) fn events(&self) -> &EventHub {
        &self.events
    }

    pub(crate) fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Callbacks never run under this lock; poisoning can only come from a panicking transport.
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run collected callbacks in order, then publish collected broadcasts.
    pub(crate) fn settle(&self, settlement: Settlement) {
        for delivery in settlement.deliveries {
            delivery();
        }
        for event in settlement.broadcasts {
            self.events.publish(event);
        }
    }

    /// Resolve every outstanding request with [`CentralError::Destroyed`] and refuse new ones.
    pub(crate) fn close(&self) {
        let mut settlement = Settlement::default();
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            info!(
                "closing central with {} pending requests",
                state.pending_requests()
            );
            state.fail_all(&mut settlement, &CentralError::Destroyed);
        }
        self.settle(settlement);
    }

    fn arm_timer(&self, op: PendingOp, token: u64, duration: Duration) -> timer::TimeoutTimer {
        let engine = self.me.clone();
        timer::TimeoutTimer::arm(&self.runtime, duration, move || {
            if let Some(engine) = engine.upgrade() {
                engine.on_timeout(op, token);
            }
        })
    }
}
