#![allow(dead_code)]

use ble_central::interfaces::peripheral::{
    CharacteristicInfo, CharacteristicKey, CharacteristicProperties, ConnectOptions, PeripheralId,
    RadioState, ServiceInfo, ServiceKey, WriteType,
};
use ble_central::interfaces::{BleTransport, TransportEvent};
use ble_central::{Central, CentralConfig, Timeout};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const BATTERY: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const CONTROL_POINT: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);

/// A native call as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId, Vec<Uuid>),
    DiscoverCharacteristics(ServiceKey, Vec<Uuid>),
    Read(CharacteristicKey),
    Write(CharacteristicKey, Vec<u8>, WriteType),
    SetNotify(CharacteristicKey, bool),
}

/// Records every native call; outcomes are injected by the test through [`Harness::emit`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    calls: Arc<Mutex<Vec<NativeCall>>>,
}

impl FakeTransport {
    fn record(&self, call: NativeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BleTransport for FakeTransport {
    fn connect(&self, peripheral: PeripheralId, _options: &ConnectOptions) {
        self.record(NativeCall::Connect(peripheral));
    }

    fn disconnect(&self, peripheral: PeripheralId) {
        self.record(NativeCall::Disconnect(peripheral));
    }

    fn discover_services(&self, peripheral: PeripheralId, services: &[Uuid]) {
        self.record(NativeCall::DiscoverServices(peripheral, services.to_vec()));
    }

    fn discover_characteristics(&self, service: ServiceKey, characteristics: &[Uuid]) {
        self.record(NativeCall::DiscoverCharacteristics(
            service,
            characteristics.to_vec(),
        ));
    }

    fn read_value(&self, characteristic: CharacteristicKey) {
        self.record(NativeCall::Read(characteristic));
    }

    fn write_value(&self, characteristic: CharacteristicKey, data: &[u8], write_type: WriteType) {
        self.record(NativeCall::Write(characteristic, data.to_vec(), write_type));
    }

    fn set_notify_value(&self, characteristic: CharacteristicKey, enabled: bool) {
        self.record(NativeCall::SetNotify(characteristic, enabled));
    }
}

pub struct Harness {
    pub central: Central,
    pub peripheral: PeripheralId,
    transport: FakeTransport,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CentralConfig::default())
    }

    pub fn with_config(config: CentralConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = FakeTransport::default();
        let (events, rx) = mpsc::unbounded_channel();
        let central = Central::new(transport.clone(), rx, config).expect("central");
        Self {
            central,
            peripheral: PeripheralId::new(Uuid::from_u128(0xdead_beef)),
            transport,
            events,
        }
    }

    /// Deliver a transport event and let the pump process it.
    pub async fn emit(&self, event: TransportEvent) {
        self.events.send(event).expect("pump alive");
        settle().await;
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.transport.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&NativeCall) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    pub fn clear_calls(&self) {
        self.transport.calls.lock().unwrap().clear();
    }

    pub fn battery(&self) -> ServiceKey {
        ServiceKey::new(self.peripheral, BATTERY)
    }

    pub fn level(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.peripheral, BATTERY, LEVEL)
    }

    pub async fn power_on(&self) {
        self.emit(TransportEvent::StateChanged(RadioState::PoweredOn))
            .await;
    }

    pub async fn connect(&self) {
        let connecting = self
            .central
            .connect(self.peripheral, ConnectOptions::default(), Timeout::Never);
        let (result, ()) = tokio::join!(connecting, async {
            settle().await;
            self.emit(TransportEvent::Connected(self.peripheral)).await;
        });
        result.expect("connect");
    }

    /// Power on, connect and discover the battery service with the given
    /// characteristics. Clears the recorded calls afterwards.
    pub async fn ready(&self, characteristics: &[(Uuid, CharacteristicProperties)]) {
        self.power_on().await;
        self.connect().await;

        let discovering = self
            .central
            .discover_service(self.peripheral, BATTERY, Timeout::Never);
        let (service, ()) = tokio::join!(discovering, async {
            settle().await;
            self.emit(TransportEvent::ServicesDiscovered {
                peripheral: self.peripheral,
                result: Ok(vec![ServiceInfo {
                    uuid: BATTERY,
                    is_primary: true,
                }]),
            })
            .await;
        });
        service.expect("battery service");

        let uuids: Vec<Uuid> = characteristics.iter().map(|(uuid, _)| *uuid).collect();
        let discovering = self
            .central
            .discover_characteristics(self.battery(), &uuids, Timeout::Never);
        let (found, ()) = tokio::join!(discovering, async {
            settle().await;
            self.emit(TransportEvent::CharacteristicsDiscovered {
                service: self.battery(),
                result: Ok(characteristics
                    .iter()
                    .map(|(uuid, properties)| CharacteristicInfo {
                        uuid: *uuid,
                        properties: *properties,
                    })
                    .collect()),
            })
            .await;
        });
        assert!(found.iter().all(Result::is_ok), "characteristics discovered");
        self.clear_calls();
    }
}

/// Let spawned tasks run until they are idle.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub fn ms(millis: u64) -> Timeout {
    Timeout::After(Duration::from_millis(millis))
}
