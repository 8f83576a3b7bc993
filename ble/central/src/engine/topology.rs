//! Mirrored connection state and discovered GATT topology.
//!
//! Only transport events mutate this state; operations read it to decide whether a
//! native call is needed at all.

use crate::interfaces::peripheral::{
    Characteristic, CharacteristicInfo, CharacteristicKey, ConnectionState, PeripheralId, Service,
    ServiceInfo, ServiceKey,
};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct PeripheralRecord {
    pub(crate) state: ConnectionState,
    pub(crate) name: Option<String>,
    pub(crate) rssi: Option<i16>,
    services: HashMap<Uuid, ServiceRecord>,
    /// `discover_services` calls still waiting for their event.
    pub(crate) service_scans: usize,
}

#[derive(Debug)]
struct ServiceRecord {
    service: Service,
    characteristics: HashMap<Uuid, Characteristic>,
    /// `discover_characteristics` calls still waiting for their event.
    characteristic_scans: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Topology {
    peripherals: HashMap<PeripheralId, PeripheralRecord>,
}

impl Topology {
    pub(crate) fn peripheral(&self, id: &PeripheralId) -> Option<&PeripheralRecord> {
        self.peripherals.get(id)
    }

    pub(crate) fn peripheral_mut(&mut self, id: PeripheralId) -> &mut PeripheralRecord {
        self.peripherals.entry(id).or_default()
    }

    pub(crate) fn connection_state(&self, id: &PeripheralId) -> ConnectionState {
        self.peripherals
            .get(id)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    pub(crate) fn set_state(&mut self, id: PeripheralId, state: ConnectionState) {
        self.peripheral_mut(id).state = state;
    }

    pub(crate) fn service(&self, key: &ServiceKey) -> Option<&Service> {
        self.peripherals
            .get(&key.peripheral)?
            .services
            .get(&key.service)
            .map(|record| &record.service)
    }

    pub(crate) fn characteristic(&self, key: &CharacteristicKey) -> Option<&Characteristic> {
        self.peripherals
            .get(&key.peripheral)?
            .services
            .get(&key.service)?
            .characteristics
            .get(&key.characteristic)
    }

    pub(crate) fn set_notifying(&mut self, key: &CharacteristicKey, enabled: bool) {
        if let Some(characteristic) = self
            .peripherals
            .get_mut(&key.peripheral)
            .and_then(|record| record.services.get_mut(&key.service))
            .and_then(|record| record.characteristics.get_mut(&key.characteristic))
        {
            characteristic.is_notifying = enabled;
        }
    }

    /// Merge discovered services; existing records keep their characteristics.
    pub(crate) fn merge_services(&mut self, id: PeripheralId, services: &[ServiceInfo]) {
        let record = self.peripheral_mut(id);
        for info in services {
            record
                .services
                .entry(info.uuid)
                .and_modify(|existing| existing.service.is_primary = info.is_primary)
                .or_insert_with(|| ServiceRecord {
                    service: Service {
                        peripheral: id,
                        uuid: info.uuid,
                        is_primary: info.is_primary,
                    },
                    characteristics: HashMap::new(),
                    characteristic_scans: 0,
                });
        }
    }

    /// Merge discovered characteristics; existing records keep their notify state.
    pub(crate) fn merge_characteristics(&mut self, key: &ServiceKey, found: &[CharacteristicInfo]) {
        let Some(record) = self
            .peripherals
            .get_mut(&key.peripheral)
            .and_then(|record| record.services.get_mut(&key.service))
        else {
            return;
        };
        for info in found {
            record
                .characteristics
                .entry(info.uuid)
                .and_modify(|existing| existing.properties = info.properties)
                .or_insert_with(|| Characteristic {
                    peripheral: key.peripheral,
                    service: key.service,
                    uuid: info.uuid,
                    properties: info.properties,
                    is_notifying: false,
                });
        }
    }

    pub(crate) fn remove_services(&mut self, id: &PeripheralId, services: &[Uuid]) {
        if let Some(record) = self.peripherals.get_mut(id) {
            for uuid in services {
                record.services.remove(uuid);
            }
        }
    }

    /// Forget everything learnt over the link that just went down.
    ///
    /// Outstanding scans are dropped with it. A discovery result for the old link
    /// that still arrives after a reconnect would be counted against the new link's
    /// scans.
    pub(crate) fn reset_link(&mut self, id: PeripheralId) {
        let record = self.peripheral_mut(id);
        record.state = ConnectionState::Disconnected;
        record.services.clear();
        record.service_scans = 0;
    }

    pub(crate) fn reset_all_links(&mut self) {
        let ids: Vec<PeripheralId> = self.peripherals.keys().copied().collect();
        for id in ids {
            self.reset_link(id);
        }
    }

    pub(crate) fn begin_characteristic_scan(&mut self, key: &ServiceKey) {
        if let Some(record) = self
            .peripherals
            .get_mut(&key.peripheral)
            .and_then(|record| record.services.get_mut(&key.service))
        {
            record.characteristic_scans += 1;
        }
    }

    /// Count one characteristic scan as finished; returns how many remain.
    pub(crate) fn finish_characteristic_scan(&mut self, key: &ServiceKey) -> usize {
        self.peripherals
            .get_mut(&key.peripheral)
            .and_then(|record| record.services.get_mut(&key.service))
            .map(|record| {
                record.characteristic_scans = record.characteristic_scans.saturating_sub(1);
                record.characteristic_scans
            })
            .unwrap_or(0)
    }

    /// Count one service scan as finished; returns how many remain.
    pub(crate) fn finish_service_scan(&mut self, id: PeripheralId) -> usize {
        let record = self.peripheral_mut(id);
        record.service_scans = record.service_scans.saturating_sub(1);
        record.service_scans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::peripheral::CharacteristicProperties;

    const HEART_RATE: Uuid = Uuid::from_u128(0x180d);
    const MEASUREMENT: Uuid = Uuid::from_u128(0x2a37);

    fn peripheral() -> PeripheralId {
        PeripheralId::new(Uuid::from_u128(42))
    }

    #[test]
    fn rediscovery_merges_and_keeps_notify_state() {
        let mut topology = Topology::default();
        let service = ServiceKey::new(peripheral(), HEART_RATE);
        topology.merge_services(
            peripheral(),
            &[ServiceInfo {
                uuid: HEART_RATE,
                is_primary: true,
            }],
        );
        topology.merge_characteristics(
            &service,
            &[CharacteristicInfo {
                uuid: MEASUREMENT,
                properties: CharacteristicProperties::NOTIFY,
            }],
        );
        let key = service.characteristic(MEASUREMENT);
        topology.set_notifying(&key, true);

        topology.merge_services(
            peripheral(),
            &[ServiceInfo {
                uuid: HEART_RATE,
                is_primary: true,
            }],
        );
        topology.merge_characteristics(
            &service,
            &[CharacteristicInfo {
                uuid: MEASUREMENT,
                properties: CharacteristicProperties::NOTIFY | CharacteristicProperties::READ,
            }],
        );

        let characteristic = topology.characteristic(&key).unwrap();
        assert!(characteristic.is_notifying);
        assert!(characteristic
            .properties
            .contains(CharacteristicProperties::READ));
    }

    #[test]
    fn characteristics_need_a_known_service() {
        let mut topology = Topology::default();
        let service = ServiceKey::new(peripheral(), HEART_RATE);
        topology.merge_characteristics(
            &service,
            &[CharacteristicInfo {
                uuid: MEASUREMENT,
                properties: CharacteristicProperties::READ,
            }],
        );
        assert!(topology
            .characteristic(&service.characteristic(MEASUREMENT))
            .is_none());
    }

    #[test]
    fn link_reset_clears_services() {
        let mut topology = Topology::default();
        topology.set_state(peripheral(), ConnectionState::Connected);
        topology.merge_services(
            peripheral(),
            &[ServiceInfo {
                uuid: HEART_RATE,
                is_primary: true,
            }],
        );
        topology.reset_link(peripheral());
        assert_eq!(
            topology.connection_state(&peripheral()),
            ConnectionState::Disconnected
        );
        assert!(topology
            .service(&ServiceKey::new(peripheral(), HEART_RATE))
            .is_none());
    }

    #[test]
    fn link_reset_forgets_outstanding_scans() {
        let mut topology = Topology::default();
        topology.set_state(peripheral(), ConnectionState::Connected);
        topology.peripheral_mut(peripheral()).service_scans += 2;

        topology.reset_link(peripheral());
        topology.set_state(peripheral(), ConnectionState::Connected);
        topology.peripheral_mut(peripheral()).service_scans += 1;

        assert_eq!(topology.finish_service_scan(peripheral()), 0);
        assert_eq!(topology.finish_service_scan(peripheral()), 0, "never underflows");
    }
}
