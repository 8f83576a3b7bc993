//! Connection-state gate.
//!
//! Checks run synchronously, before any registry entry, timer or native call.

use crate::engine::topology::Topology;
use crate::errors::CentralError;
use crate::interfaces::peripheral::{
    Capability, Characteristic, CharacteristicKey, ConnectionState, PeripheralId, RadioState,
    Service, ServiceKey,
};

pub(crate) struct Gate<'a> {
    radio: RadioState,
    topology: &'a Topology,
}

impl<'a> Gate<'a> {
    pub(crate) fn new(radio: RadioState, topology: &'a Topology) -> Self {
        Self { radio, topology }
    }

    pub(crate) fn powered_on(&self) -> Result<(), CentralError> {
        if self.radio.is_powered_on() {
            Ok(())
        } else {
            Err(CentralError::InvalidState(self.radio))
        }
    }

    pub(crate) fn connected(&self, peripheral: &PeripheralId) -> Result<(), CentralError> {
        self.powered_on()?;
        match self.topology.connection_state(peripheral) {
            ConnectionState::Connected => Ok(()),
            _ => Err(CentralError::PeripheralNotConnected(*peripheral)),
        }
    }

    pub(crate) fn service(&self, key: &ServiceKey) -> Result<&'a Service, CentralError> {
        self.connected(&key.peripheral)?;
        self.topology
            .service(key)
            .ok_or(CentralError::ServiceNotFound(key.service))
    }

    /// A discovered characteristic that grants `capability`.
    pub(crate) fn characteristic(
        &self,
        key: &CharacteristicKey,
        capability: Capability,
    ) -> Result<&'a Characteristic, CentralError> {
        self.service(&key.service_key())?;
        let characteristic = self
            .topology
            .characteristic(key)
            .ok_or(CentralError::CharacteristicNotFound(key.characteristic))?;
        if characteristic.supports(capability) {
            Ok(characteristic)
        } else {
            Err(CentralError::OperationNotSupported {
                uuid: key.characteristic,
                capability,
            })
        }
    }
}
