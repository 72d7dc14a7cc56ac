//! Platform-agnostic GATT types for the gattbridge session manager.
//!
//! This crate holds the value types both GATT roles agree on: device
//! identifiers, the peripheral's service definition, characteristic
//! properties as reported by discovery, scan sightings, ATT status codes
//! and the standard UUIDs. Nothing here talks to a radio.
//!
//! # Example
//!
//! ```
//! use gattbridge_types::{ServiceDescriptor, uuids};
//!
//! let service = ServiceDescriptor::parse(
//!     "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
//!     "6e400003-b5a3-f393-e0a9-e50e24dcca9e",
//!     "6e400002-b5a3-f393-e0a9-e50e24dcca9e",
//! )
//! .unwrap();
//! assert_ne!(service.tx_uuid, uuids::CLIENT_CHARACTERISTIC_CONFIG);
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    ATT_HEADER_LEN, AttStatus, CharacteristicProperties, DeviceId, DiscoveredCharacteristic,
    DiscoveredDevice, MAX_ATT_MTU, MIN_ATT_MTU, ServiceDescriptor, WriteType, read_at_offset,
};
pub use uuid as uuids;
