//! BLE service UUIDs used by dive computers.
//!
//! The known-service table doubles as the scan filter and as the preferred
//! order during characteristic negotiation. Excluded services are firmware
//! upgrade channels that are never touched.

use uuid::Uuid;

/// A vendor serial-over-BLE service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Vendor name.
    pub vendor: &'static str,
    /// Product or chipset name.
    pub product: &'static str,
}

/// Serial services of supported dive computers.
pub const KNOWN_SERIAL_SERVICES: [SerialService; 10] = [
    SerialService {
        uuid: Uuid::from_u128(0x0000_fefb_0000_1000_8000_00805f9b34fb),
        vendor: "Heinrichs-Weikamp",
        product: "Telit/Stollmann",
    },
    SerialService {
        uuid: Uuid::from_u128(0x2456_e1b9_26e2_8f83_e744_f34f01e9d701),
        vendor: "Heinrichs-Weikamp",
        product: "U-Blox",
    },
    SerialService {
        uuid: Uuid::from_u128(0x544e_326b_5b72_c6b0_1c46_41c1bc448118),
        vendor: "Mares",
        product: "BlueLink Pro",
    },
    SerialService {
        uuid: Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e),
        vendor: "Nordic Semi",
        product: "UART",
    },
    SerialService {
        uuid: Uuid::from_u128(0x98ae_7120_e62e_11e3_badd_0002a5d5c51b),
        vendor: "Suunto",
        product: "EON Steel/Core",
    },
    SerialService {
        uuid: Uuid::from_u128(0xcb3c_4555_d670_4670_bc20_b61dbc851e9a),
        vendor: "Pelagic",
        product: "i770R/i200C",
    },
    SerialService {
        uuid: Uuid::from_u128(0xca7b_0001_f785_4c38_b599_c7c5fbadb034),
        vendor: "Pelagic",
        product: "i330R/DSX",
    },
    SerialService {
        uuid: Uuid::from_u128(0xfdcd_eaaa_295d_470e_bf15_04217b7aa0a0),
        vendor: "ScubaPro",
        product: "G2/G3",
    },
    SerialService {
        uuid: Uuid::from_u128(0xfe25_c237_0ece_443c_b0aa_e02033e7029d),
        vendor: "Shearwater",
        product: "Perdix/Teric",
    },
    SerialService {
        uuid: Uuid::from_u128(0x0000_fcef_0000_1000_8000_00805f9b34fb),
        vendor: "Divesoft",
        product: "Freedom",
    },
];

// Firmware upgrade services
/// Nordic Semiconductor legacy DFU service.
pub const NORDIC_UPGRADE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1530_1212_efde_1523_785feabcd123);
/// Broadcom upgrade service #1.
pub const BROADCOM_UPGRADE_SERVICE_1_UUID: Uuid =
    Uuid::from_u128(0x9e5d_1e47_5c13_43a0_8635_82ad38a1386f);
/// Broadcom upgrade service #2.
pub const BROADCOM_UPGRADE_SERVICE_2_UUID: Uuid =
    Uuid::from_u128(0xa86a_bc2d_d44c_442e_99f7_80059a873e36);

/// Services that must never be used for data transfer.
pub const EXCLUDED_SERVICES: [Uuid; 3] = [
    NORDIC_UPGRADE_SERVICE_UUID,
    BROADCOM_UPGRADE_SERVICE_1_UUID,
    BROADCOM_UPGRADE_SERVICE_2_UUID,
];

/// Reserved byte delimiting frames on the serial stream.
pub const FRAME_DELIMITER: u8 = 0x7E;

/// Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Mask covering the 16-bit short-form field of a SIG UUID.
const SHORT_UUID_MASK: u128 = 0x0000_ffff_0000_0000_0000_000000000000;

/// Look up a known serial service by UUID.
pub fn known_serial_service(uuid: &Uuid) -> Option<&'static SerialService> {
    KNOWN_SERIAL_SERVICES.iter().find(|s| s.uuid == *uuid)
}

/// Check if a service UUID is on the known allow-list.
pub fn is_known_service(uuid: &Uuid) -> bool {
    known_serial_service(uuid).is_some()
}

/// Check if a service UUID is a firmware-upgrade channel.
pub fn is_excluded_service(uuid: &Uuid) -> bool {
    EXCLUDED_SERVICES.contains(uuid)
}

/// Check if a UUID is a 16-bit Bluetooth SIG assigned number.
pub fn is_standard_bluetooth(uuid: &Uuid) -> bool {
    uuid.as_u128() & !SHORT_UUID_MASK == BLUETOOTH_BASE_UUID
}

/// UUIDs of all known serial services, for scan filtering.
pub fn known_service_uuids() -> Vec<Uuid> {
    KNOWN_SERIAL_SERVICES.iter().map(|s| s.uuid).collect()
}
