//! Write/notify characteristic negotiation.
//!
//! Dive computers expose a serial channel as one writable characteristic
//! plus one notifying characteristic, not always inside a service that is
//! advertised or known in advance. Negotiation walks every discovered
//! service in a fixed preference order and takes the first qualifying
//! characteristic of each kind.

use btleplug::api::{CharPropFlags, Characteristic, Service};
use tracing::{debug, trace};

use crate::ble::uuids::{is_excluded_service, is_known_service, is_standard_bluetooth};
use crate::error::{Error, Result};

/// The negotiated characteristic pair of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicPair {
    /// Characteristic written to by the host.
    pub write: Characteristic,
    /// Characteristic delivering data from the dive computer.
    pub notify: Characteristic,
}

impl CharacteristicPair {
    /// Check if the write characteristic accepts writes without response.
    pub fn supports_write_without_response(&self) -> bool {
        self.write
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }
}

/// Check if a characteristic can carry host-to-device data.
pub fn is_write_characteristic(characteristic: &Characteristic) -> bool {
    characteristic
        .properties
        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
}

/// Check if a characteristic can carry device-to-host data.
pub fn is_notify_characteristic(characteristic: &Characteristic) -> bool {
    characteristic
        .properties
        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
}

fn service_rank(service: &Service) -> u8 {
    if is_known_service(&service.uuid) {
        0
    } else if !is_standard_bluetooth(&service.uuid) {
        1
    } else {
        2
    }
}

/// Pick the write/notify pair from a set of discovered services.
///
/// Excluded services are skipped. The remaining services are visited known
/// first, then vendor-specific, then standard SIG services, keeping the
/// discovery order inside each group.
pub fn negotiate(services: &[Service]) -> Result<CharacteristicPair> {
    let mut candidates: Vec<&Service> = services
        .iter()
        .filter(|service| {
            if is_excluded_service(&service.uuid) {
                debug!("Skipping excluded service {}", service.uuid);
                false
            } else {
                true
            }
        })
        .collect();
    candidates.sort_by_key(|service| service_rank(service));

    let mut write = None;
    let mut notify = None;

    for service in candidates {
        for characteristic in &service.characteristics {
            trace!(
                "Characteristic {} in service {}: {:?}",
                characteristic.uuid,
                service.uuid,
                characteristic.properties
            );

            if write.is_none() && is_write_characteristic(characteristic) {
                write = Some(characteristic.clone());
            }
            if notify.is_none() && is_notify_characteristic(characteristic) {
                notify = Some(characteristic.clone());
            }
        }

        if write.is_some() && notify.is_some() {
            break;
        }
    }

    match (write, notify) {
        (Some(write), Some(notify)) => {
            debug!("Negotiated write {} / notify {}", write.uuid, notify.uuid);
            Ok(CharacteristicPair { write, notify })
        }
        (None, _) => Err(Error::NegotiationFailed {
            reason: "no writable characteristic found".to_string(),
        }),
        (_, None) => Err(Error::NegotiationFailed {
            reason: "no notifying characteristic found".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{KNOWN_SERIAL_SERVICES, NORDIC_UPGRADE_SERVICE_UUID};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn characteristic(service: Uuid, uuid: u128, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid: Uuid::from_u128(uuid),
            service_uuid: service,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, characteristics: Vec<Characteristic>) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    #[test]
    fn test_property_qualification() {
        let svc = Uuid::from_u128(1);
        assert!(is_write_characteristic(&characteristic(
            svc,
            2,
            CharPropFlags::WRITE_WITHOUT_RESPONSE
        )));
        assert!(is_notify_characteristic(&characteristic(
            svc,
            3,
            CharPropFlags::INDICATE
        )));
        assert!(!is_write_characteristic(&characteristic(
            svc,
            4,
            CharPropFlags::READ | CharPropFlags::NOTIFY
        )));
    }

    #[test]
    fn test_negotiate_skips_excluded_services() {
        let upgrade = service(
            NORDIC_UPGRADE_SERVICE_UUID,
            vec![characteristic(
                NORDIC_UPGRADE_SERVICE_UUID,
                0x10,
                CharPropFlags::WRITE | CharPropFlags::NOTIFY,
            )],
        );
        let result = negotiate(&[upgrade]);
        assert!(matches!(result, Err(Error::NegotiationFailed { .. })));
    }

    #[test]
    fn test_negotiate_prefers_known_service() {
        let vendor = Uuid::from_u128(0x1234_5678_9abc_def0_1234_56789abcdef0);
        let known = KNOWN_SERIAL_SERVICES[8].uuid;
        let services = vec![
            service(
                vendor,
                vec![characteristic(
                    vendor,
                    0x20,
                    CharPropFlags::WRITE | CharPropFlags::NOTIFY,
                )],
            ),
            service(
                known,
                vec![
                    characteristic(known, 0x30, CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    characteristic(known, 0x31, CharPropFlags::NOTIFY),
                ],
            ),
        ];

        let pair = negotiate(&services).unwrap();
        assert_eq!(pair.write.uuid, Uuid::from_u128(0x30));
        assert_eq!(pair.notify.uuid, Uuid::from_u128(0x31));
        assert!(pair.supports_write_without_response());
    }

    #[test]
    fn test_negotiate_is_stable_across_repeats() {
        let vendor = Uuid::from_u128(0xaaaa_0000_0000_0000_0000_000000000001);
        let services = vec![service(
            vendor,
            vec![
                characteristic(vendor, 0x40, CharPropFlags::WRITE),
                characteristic(vendor, 0x41, CharPropFlags::WRITE | CharPropFlags::NOTIFY),
                characteristic(vendor, 0x42, CharPropFlags::NOTIFY),
            ],
        )];

        let first = negotiate(&services).unwrap();
        let second = negotiate(&services).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.write.uuid, Uuid::from_u128(0x40));
        assert_eq!(first.notify.uuid, Uuid::from_u128(0x41));
    }

    #[test]
    fn test_negotiate_requires_notify() {
        let vendor = Uuid::from_u128(0xbbbb_0000_0000_0000_0000_000000000001);
        let services = vec![service(
            vendor,
            vec![characteristic(vendor, 0x50, CharPropFlags::WRITE)],
        )];
        let err = negotiate(&services).unwrap_err();
        assert!(err.to_string().contains("notifying"));
    }
}
