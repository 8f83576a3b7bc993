//! High-level Central Abstraction
//!
//! This module provides the [`Central`] struct, a request/response wrapper around any
//! implementation of the [`BleTransport`] trait. The transport only knows how to start
//! one-shot native operations and report their outcome as [`TransportEvent`]s; the
//! central turns that into awaitable operations with per-request timeouts, coalescing
//! of identical concurrent requests and a read cache.
//!
//! # Features
//! - Every operation is available as an `async fn` and as a `*_with` variant taking a
//!   completion callback. Both share one pending request per key.
//! - Preconditions (radio, connection, discovered topology, characteristic
//!   properties) are checked before anything is sent to the platform.
//! - Every platform event is also published on an [`EventHub`] channel.
//!
//! # Example
//!
//! ```ignore
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let config = CentralConfig::from_env().expect("config");
//! let central = Central::new(MyTransport::new(events_tx), events_rx, config)?;
//! central.connect(peripheral, ConnectOptions::default(), Timeout::Default).await?;
//! let service = central.discover_service(peripheral, BATTERY, Timeout::Default).await?;
//! ```
//!
//! Dropping the central resolves every outstanding request with
//! [`CentralError::Destroyed`].

use crate::config::{CentralConfig, Timeout};
use crate::engine::cache::{CachePolicy, CacheRecord};
use crate::engine::dispatch;
use crate::engine::registry::Waiter;
use crate::engine::Engine;
use crate::errors::CentralError;
use crate::events::EventHub;
use crate::interfaces::peripheral::{
    Characteristic, CharacteristicKey, ConnectOptions, ConnectionState, PeripheralId, RadioState,
    Service, ServiceKey,
};
use crate::interfaces::{BleTransport, TransportEvent};
use futures::future::join_all;
use log::{debug, info};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct Central {
    engine: Arc<Engine>,
    pump: JoinHandle<()>,
}

impl Central {
    /// Creates a new `Central` driving `transport` and consuming its `events`.
    ///
    /// Must be called from within a tokio runtime; the event pump and all timeout
    /// timers run on it.
    pub fn new<T>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: CentralConfig,
    ) -> Result<Self, CentralError>
    where
        T: BleTransport,
    {
        let runtime =
            Handle::try_current().map_err(|e| CentralError::Runtime(e.to_string()))?;
        let engine = Engine::new(Box::new(transport), config, runtime.clone());
        let pump = runtime.spawn(dispatch::pump(Arc::downgrade(&engine), events));
        info!("central created");
        Ok(Self { engine, pump })
    }

    /// Connects to a peripheral.
    ///
    /// Resolves immediately when the peripheral is already connected. Concurrent
    /// callers share one connection attempt.
    ///
    /// # Arguments
    ///
    /// * `peripheral` - The peripheral to connect to.
    /// * `options` - Passed through to the platform stack.
    /// * `timeout` - How long to wait for the link before giving up.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the link is up.
    /// * `Err(CentralError::ConnectionTimeout)` if the timer fires first; the attempt is cancelled.
    /// * `Err` if the radio is off or the platform rejects the attempt.
    pub async fn connect(
        &self,
        peripheral: PeripheralId,
        options: ConnectOptions,
        timeout: Timeout,
    ) -> Result<(), CentralError> {
        let (waiter, outcome) = completion();
        self.engine.connect(peripheral, options, timeout, waiter);
        wait(outcome).await
    }

    pub fn connect_with<F>(
        &self,
        peripheral: PeripheralId,
        options: ConnectOptions,
        timeout: Timeout,
        completion: F,
    ) where
        F: FnOnce(Result<(), CentralError>) + Send + 'static,
    {
        self.engine
            .connect(peripheral, options, timeout, Box::new(completion));
    }

    /// Disconnects from a peripheral, or cancels a pending connection attempt.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the link is down, immediately if it already was.
    /// * `Err` on timeout or when the central is closed.
    pub async fn disconnect(
        &self,
        peripheral: PeripheralId,
        timeout: Timeout,
    ) -> Result<(), CentralError> {
        let (waiter, outcome) = completion();
        self.engine.disconnect(peripheral, timeout, waiter);
        wait(outcome).await
    }

    pub fn disconnect_with<F>(&self, peripheral: PeripheralId, timeout: Timeout, completion: F)
    where
        F: FnOnce(Result<(), CentralError>) + Send + 'static,
    {
        self.engine
            .disconnect(peripheral, timeout, Box::new(completion));
    }

    /// Discovers one service on a connected peripheral.
    ///
    /// Already discovered services are returned without asking the platform.
    ///
    /// # Returns
    ///
    /// * `Ok(Service)` once the service is known.
    /// * `Err(CentralError::ServiceNotFound)` if discovery finished without it.
    pub async fn discover_service(
        &self,
        peripheral: PeripheralId,
        service: Uuid,
        timeout: Timeout,
    ) -> Result<Service, CentralError> {
        let (waiter, outcome) = completion();
        self.engine
            .discover_services(peripheral, vec![(service, waiter)], timeout);
        wait(outcome).await
    }

    /// Discovers several services with a single platform call.
    ///
    /// # Returns
    ///
    /// One result per requested uuid, in request order.
    pub async fn discover_services(
        &self,
        peripheral: PeripheralId,
        services: &[Uuid],
        timeout: Timeout,
    ) -> Vec<Result<Service, CentralError>> {
        let (requests, outcomes): (Vec<_>, Vec<_>) = services
            .iter()
            .map(|&uuid| {
                let (waiter, outcome) = completion();
                ((uuid, waiter), outcome)
            })
            .unzip();
        self.engine.discover_services(peripheral, requests, timeout);
        join_all(outcomes.into_iter().map(wait)).await
    }

    /// Callback form of [`Central::discover_services`]; `completion` runs once per uuid.
    pub fn discover_services_with<F>(
        &self,
        peripheral: PeripheralId,
        services: &[Uuid],
        timeout: Timeout,
        completion: F,
    ) where
        F: Fn(Uuid, Result<Service, CentralError>) + Send + Sync + 'static,
    {
        let requests = per_item(services, completion);
        self.engine.discover_services(peripheral, requests, timeout);
    }

    /// Discovers one characteristic of a discovered service.
    ///
    /// # Returns
    ///
    /// * `Ok(Characteristic)` once the characteristic is known.
    /// * `Err(CentralError::ServiceNotFound)` if the service was never discovered.
    /// * `Err(CentralError::CharacteristicNotFound)` if discovery finished without it.
    pub async fn discover_characteristic(
        &self,
        service: ServiceKey,
        characteristic: Uuid,
        timeout: Timeout,
    ) -> Result<Characteristic, CentralError> {
        let (waiter, outcome) = completion();
        self.engine
            .discover_characteristics(service, vec![(characteristic, waiter)], timeout);
        wait(outcome).await
    }

    /// Discovers several characteristics of one service with a single platform call.
    pub async fn discover_characteristics(
        &self,
        service: ServiceKey,
        characteristics: &[Uuid],
        timeout: Timeout,
    ) -> Vec<Result<Characteristic, CentralError>> {
        let (requests, outcomes): (Vec<_>, Vec<_>) = characteristics
            .iter()
            .map(|&uuid| {
                let (waiter, outcome) = completion();
                ((uuid, waiter), outcome)
            })
            .unzip();
        self.engine
            .discover_characteristics(service, requests, timeout);
        join_all(outcomes.into_iter().map(wait)).await
    }

    pub fn discover_characteristics_with<F>(
        &self,
        service: ServiceKey,
        characteristics: &[Uuid],
        timeout: Timeout,
        completion: F,
    ) where
        F: Fn(Uuid, Result<Characteristic, CentralError>) + Send + Sync + 'static,
    {
        let requests = per_item(characteristics, completion);
        self.engine
            .discover_characteristics(service, requests, timeout);
    }

    /// Reads a characteristic value.
    ///
    /// # Arguments
    ///
    /// * `characteristic` - A discovered characteristic with the read property.
    /// * `policy` - Whether a cached value may answer the read.
    /// * `timeout` - How long to wait for the platform.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<u8>)` with the value.
    /// * `Err(CentralError::CharacteristicDataIsNil)` if the platform returned no payload.
    pub async fn read(
        &self,
        characteristic: CharacteristicKey,
        policy: CachePolicy,
        timeout: Timeout,
    ) -> Result<Vec<u8>, CentralError> {
        let (waiter, outcome) = completion();
        self.engine.read(characteristic, policy, timeout, waiter);
        wait(outcome).await
    }

    pub fn read_with<F>(
        &self,
        characteristic: CharacteristicKey,
        policy: CachePolicy,
        timeout: Timeout,
        completion: F,
    ) where
        F: FnOnce(Result<Vec<u8>, CentralError>) + Send + 'static,
    {
        self.engine
            .read(characteristic, policy, timeout, Box::new(completion));
    }

    /// Writes a value and waits for the acknowledgement.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the peripheral acknowledged the write.
    /// * `Err(CentralError::WriteInProgress)` if a different value is being written.
    pub async fn write(
        &self,
        characteristic: CharacteristicKey,
        data: &[u8],
        timeout: Timeout,
    ) -> Result<(), CentralError> {
        let (waiter, outcome) = completion();
        self.engine
            .write(characteristic, data.to_vec(), timeout, waiter);
        wait(outcome).await
    }

    pub fn write_with<F>(
        &self,
        characteristic: CharacteristicKey,
        data: &[u8],
        timeout: Timeout,
        completion: F,
    ) where
        F: FnOnce(Result<(), CentralError>) + Send + 'static,
    {
        self.engine
            .write(characteristic, data.to_vec(), timeout, Box::new(completion));
    }

    /// Writes a value without asking for an acknowledgement.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the write was handed to the platform.
    /// * `Err` if a precondition does not hold; nothing is sent in that case.
    pub fn write_without_response(
        &self,
        characteristic: CharacteristicKey,
        data: &[u8],
    ) -> Result<(), CentralError> {
        self.engine.write_without_response(characteristic, data)
    }

    /// Enables or disables notifications.
    ///
    /// # Returns
    ///
    /// * `Ok(bool)` with the new notification state.
    pub async fn set_notify(
        &self,
        characteristic: CharacteristicKey,
        enabled: bool,
        timeout: Timeout,
    ) -> Result<bool, CentralError> {
        let (waiter, outcome) = completion();
        self.engine
            .set_notify(characteristic, enabled, timeout, waiter);
        wait(outcome).await
    }

    pub fn set_notify_with<F>(
        &self,
        characteristic: CharacteristicKey,
        enabled: bool,
        timeout: Timeout,
        completion: F,
    ) where
        F: FnOnce(Result<bool, CentralError>) + Send + 'static,
    {
        self.engine
            .set_notify(characteristic, enabled, timeout, Box::new(completion));
    }

    /// Resolves every outstanding request with [`CentralError::Destroyed`] and stops
    /// processing transport events. Later calls fail with the same error.
    pub fn close(&self) {
        self.engine.close();
        self.pump.abort();
    }

    pub fn events(&self) -> &EventHub {
        self.engine.events()
    }

    pub fn config(&self) -> &CentralConfig {
        self.engine.config()
    }

    pub fn radio_state(&self) -> RadioState {
        self.engine.lock().radio
    }

    pub fn connection_state(&self, peripheral: &PeripheralId) -> ConnectionState {
        self.engine.lock().topology.connection_state(peripheral)
    }

    /// Last name the platform reported for the peripheral.
    pub fn peripheral_name(&self, peripheral: &PeripheralId) -> Option<String> {
        self.engine
            .lock()
            .topology
            .peripheral(peripheral)
            .and_then(|record| record.name.clone())
    }

    /// Last signal strength the platform reported for the peripheral.
    pub fn rssi(&self, peripheral: &PeripheralId) -> Option<i16> {
        self.engine
            .lock()
            .topology
            .peripheral(peripheral)
            .and_then(|record| record.rssi)
    }

    pub fn service(&self, key: &ServiceKey) -> Option<Service> {
        self.engine.lock().topology.service(key).cloned()
    }

    pub fn characteristic(&self, key: &CharacteristicKey) -> Option<Characteristic> {
        self.engine.lock().topology.characteristic(key).cloned()
    }

    /// Last value read from the characteristic, with the instant it arrived.
    pub fn cached_value(&self, key: &CharacteristicKey) -> Option<CacheRecord> {
        self.engine.lock().cache.record(key).cloned()
    }

    /// Number of native operations currently awaiting an outcome.
    pub fn pending_requests(&self) -> usize {
        self.engine.lock().pending_requests()
    }
}

impl Drop for Central {
    fn drop(&mut self) {
        debug!("dropping central");
        self.close();
    }
}

/// A waiter that forwards its outcome to a oneshot receiver.
fn completion<T>() -> (Waiter<T>, oneshot::Receiver<Result<T, CentralError>>)
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let waiter: Waiter<T> = Box::new(move |outcome| {
        // The receiver is gone when the caller dropped its future.
        let _ = tx.send(outcome);
    });
    (waiter, rx)
}

async fn wait<T>(outcome: oneshot::Receiver<Result<T, CentralError>>) -> Result<T, CentralError> {
    match outcome.await {
        Ok(result) => result,
        Err(_) => Err(CentralError::Destroyed),
    }
}

fn per_item<T, F>(uuids: &[Uuid], completion: F) -> Vec<(Uuid, Waiter<T>)>
where
    T: Send + 'static,
    F: Fn(Uuid, Result<T, CentralError>) + Send + Sync + 'static,
{
    let completion = Arc::new(completion);
    uuids
        .iter()
        .map(|&uuid| {
            let completion = Arc::clone(&completion);
            let waiter: Waiter<T> = Box::new(move |outcome| (*completion)(uuid, outcome));
            (uuid, waiter)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::peripheral::{CharacteristicInfo, CharacteristicProperties, ServiceInfo};
    use crate::interfaces::MockBleTransport;
    use mockall::predicate::eq;
    use std::sync::Mutex;
    use std::time::Duration;

    const BATTERY: Uuid = Uuid::from_u128(0x180f);
    const LEVEL: Uuid = Uuid::from_u128(0x2a19);

    fn peripheral() -> PeripheralId {
        PeripheralId::new(Uuid::from_u128(0xfeed))
    }

    fn level() -> CharacteristicKey {
        CharacteristicKey::new(peripheral(), BATTERY, LEVEL)
    }

    fn central(transport: MockBleTransport) -> Central {
        let (_tx, rx) = mpsc::unbounded_channel();
        Central::new(transport, rx, CentralConfig::default()).expect("central")
    }

    /// Feed the engine directly, skipping the pump task.
    fn inject(central: &Central, event: TransportEvent) {
        central.engine.handle_event(event);
    }

    fn discovered(central: &Central, properties: CharacteristicProperties) {
        inject(central, TransportEvent::StateChanged(RadioState::PoweredOn));
        inject(central, TransportEvent::Connected(peripheral()));
        central.engine.lock().topology.merge_services(
            peripheral(),
            &[ServiceInfo {
                uuid: BATTERY,
                is_primary: true,
            }],
        );
        central.engine.lock().topology.merge_characteristics(
            &ServiceKey::new(peripheral(), BATTERY),
            &[CharacteristicInfo {
                uuid: LEVEL,
                properties,
            }],
        );
    }

    #[test]
    fn new_outside_runtime_fails() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = Central::new(MockBleTransport::new(), rx, CentralConfig::default());
        assert!(matches!(result, Err(CentralError::Runtime(_))));
    }

    #[tokio::test]
    async fn connect_with_radio_off_never_reaches_transport() {
        let mut transport = MockBleTransport::new();
        transport.expect_connect().never();
        let central = central(transport);

        let result = central
            .connect(peripheral(), ConnectOptions::default(), Timeout::Never)
            .await;
        assert_eq!(result, Err(CentralError::InvalidState(RadioState::Unknown)));
        assert_eq!(central.pending_requests(), 0);
    }

    #[tokio::test]
    async fn write_to_disconnected_peripheral_fails_without_native_call() {
        let mut transport = MockBleTransport::new();
        transport.expect_write_value().never();
        let central = central(transport);
        inject(&central, TransportEvent::StateChanged(RadioState::PoweredOn));
        let mut acks = central.events().write_acked();

        let result = central.write(level(), &[1], Timeout::Default).await;
        assert_eq!(result, Err(CentralError::PeripheralNotConnected(peripheral())));
        assert!(acks.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_property_is_reported_per_capability() {
        let mut transport = MockBleTransport::new();
        transport.expect_write_value().never();
        transport.expect_read_value().never();
        let central = central(transport);
        discovered(&central, CharacteristicProperties::NOTIFY);

        assert_eq!(
            central.write_without_response(level(), &[1]),
            Err(CentralError::OperationNotSupported {
                uuid: LEVEL,
                capability: crate::interfaces::peripheral::Capability::WriteWithoutResponse,
            })
        );
        assert!(matches!(
            central
                .read(level(), CachePolicy::Never, Timeout::Default)
                .await,
            Err(CentralError::OperationNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn write_without_response_is_forwarded_once() {
        let mut transport = MockBleTransport::new();
        transport
            .expect_write_value()
            .with(
                eq(level()),
                eq(vec![0x01u8, 0x02]),
                eq(crate::interfaces::peripheral::WriteType::WithoutResponse),
            )
            .times(1)
            .return_const(());
        let central = central(transport);
        discovered(&central, CharacteristicProperties::WRITE_WITHOUT_RESPONSE);

        assert_eq!(central.write_without_response(level(), &[0x01, 0x02]), Ok(()));
        assert_eq!(central.pending_requests(), 0);
    }

    #[tokio::test]
    async fn callback_and_async_callers_share_one_read() {
        let mut transport = MockBleTransport::new();
        transport
            .expect_read_value()
            .with(eq(level()))
            .times(1)
            .return_const(());
        let central = central(transport);
        discovered(&central, CharacteristicProperties::READ);

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        central.read_with(level(), CachePolicy::Never, Timeout::Never, move |outcome| {
            *sink.lock().unwrap() = Some(outcome);
        });
        let read = central.read(level(), CachePolicy::Never, Timeout::Never);
        let respond = async {
            tokio::task::yield_now().await;
            inject(
                &central,
                TransportEvent::ValueUpdated {
                    characteristic: level(),
                    result: Ok(Some(vec![87])),
                },
            );
        };

        let (value, ()) = tokio::join!(read, respond);
        assert_eq!(value, Ok(vec![87]));
        assert_eq!(*seen.lock().unwrap(), Some(Ok(vec![87])));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_async_caller_leaves_request_pending() {
        let mut transport = MockBleTransport::new();
        transport.expect_read_value().times(1).return_const(());
        let central = central(transport);
        discovered(&central, CharacteristicProperties::READ);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            central.read(level(), CachePolicy::Never, Timeout::Never),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(central.pending_requests(), 1);

        inject(
            &central,
            TransportEvent::ValueUpdated {
                characteristic: level(),
                result: Ok(Some(vec![1])),
            },
        );
        assert_eq!(central.pending_requests(), 0);
        assert_eq!(central.cached_value(&level()).map(|record| record.value), Some(vec![1]));
    }

    #[tokio::test]
    async fn closed_central_rejects_new_requests() {
        let mut transport = MockBleTransport::new();
        transport.expect_disconnect().never();
        let central = central(transport);
        central.close();
        assert_eq!(
            central.disconnect(peripheral(), Timeout::Default).await,
            Err(CentralError::Destroyed)
        );
    }
}
