//! Peripheral, Service and Characteristic Types
//!
//! This module defines the identifiers and the discovered-topology objects that the
//! central hands out to callers, together with the radio/connection state enums the
//! engine mirrors from transport events.
//!
//! Main features:
//! - Opaque, copyable identifiers used as request keys ([`PeripheralId`], [`ServiceKey`],
//!   [`CharacteristicKey`]).
//! - Strongly-typed characteristic capabilities via [`CharacteristicProperties`].
//! - Plain-data [`Service`] and [`Characteristic`] records that compare by value.

use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a remote peripheral as reported by the platform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub Uuid);

impl PeripheralId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<Uuid> for PeripheralId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a service on a given peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub peripheral: PeripheralId,
    pub service: Uuid,
}

impl ServiceKey {
    pub fn new(peripheral: PeripheralId, service: Uuid) -> Self {
        Self {
            peripheral,
            service,
        }
    }

    /// Key of a characteristic that lives inside this service.
    pub fn characteristic(&self, characteristic: Uuid) -> CharacteristicKey {
        CharacteristicKey {
            peripheral: self.peripheral,
            service: self.service,
            characteristic,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peripheral, self.service)
    }
}

/// Identifies a characteristic on a given peripheral and service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub peripheral: PeripheralId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(peripheral: PeripheralId, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            peripheral,
            service,
            characteristic,
        }
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.peripheral, self.service)
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.peripheral, self.service, self.characteristic
        )
    }
}

/// Any key a pending request can be correlated by. Carried by timeout errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Peripheral(PeripheralId),
    Service(ServiceKey),
    Characteristic(CharacteristicKey),
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKey::Peripheral(id) => write!(f, "peripheral {id}"),
            RequestKey::Service(key) => write!(f, "service {key}"),
            RequestKey::Characteristic(key) => write!(f, "characteristic {key}"),
        }
    }
}

/// Power state of the local Bluetooth radio.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

/// Link state of a single peripheral.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

bitflags::bitflags! {
    /// GATT characteristic properties as advertised by the peripheral.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST                   = 0x01;
        const READ                        = 0x02;
        const WRITE_WITHOUT_RESPONSE      = 0x04;
        const WRITE                       = 0x08;
        const NOTIFY                      = 0x10;
        const INDICATE                    = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES         = 0x80;
    }
}

/// A capability an operation requires from a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
}

impl Capability {
    /// Whether `properties` grants this capability. Indications count as notify.
    pub fn is_granted_by(&self, properties: CharacteristicProperties) -> bool {
        match self {
            Capability::Read => properties.contains(CharacteristicProperties::READ),
            Capability::Write => properties.contains(CharacteristicProperties::WRITE),
            Capability::WriteWithoutResponse => {
                properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
            }
            Capability::Notify => properties
                .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::WriteWithoutResponse => "write without response",
            Capability::Notify => "notify",
        };
        f.write_str(name)
    }
}

/// How a value is written to a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Options forwarded to the platform stack on connect.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Ask the platform to alert when the link comes up while suspended.
    pub notify_on_connection: bool,
    /// Ask the platform to alert when the link goes down while suspended.
    pub notify_on_disconnection: bool,
    /// Ask the platform to alert on notifications while suspended.
    pub notify_on_notification: bool,
}

/// Raw service description reported by a discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub is_primary: bool,
}

/// Raw characteristic description reported by a discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub peripheral: PeripheralId,
    pub uuid: Uuid,
    pub is_primary: bool,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.peripheral, self.uuid)
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub peripheral: PeripheralId,
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Whether notifications are currently enabled through this central.
    pub is_notifying: bool,
}

impl Characteristic {
    pub fn key(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.peripheral, self.service, self.uuid)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        capability.is_granted_by(self.properties)
    }
}
