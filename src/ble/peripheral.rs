//! GATT operations used by a link session.
//!
//! [`GattPeripheral`] narrows btleplug's `Peripheral` down to what the
//! session needs, so a session can also run over an in-memory peer.

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, Service, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use futures::Stream;
use std::pin::Pin;

use crate::error::Result;

/// Stream of inbound notifications.
pub type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// A connectable BLE peer.
#[async_trait]
pub trait GattPeripheral: Send + Sync {
    /// Opaque identity of the peer (its address on most platforms).
    fn identifier(&self) -> String;

    /// Check whether the link layer reports a connection.
    async fn is_connected(&self) -> Result<bool>;

    /// Establish the link-layer connection.
    async fn connect(&self) -> Result<()>;

    /// Tear down the link-layer connection.
    async fn disconnect(&self) -> Result<()>;

    /// Discover all services without a filter and return them.
    async fn discover_services(&self) -> Result<Vec<Service>>;

    /// Enable notifications or indications on a characteristic.
    async fn subscribe(&self, characteristic: &Characteristic) -> Result<()>;

    /// Write a value to a characteristic.
    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Stream of notifications from all subscribed characteristics.
    async fn notifications(&self) -> Result<NotificationStream>;
}

#[async_trait]
impl GattPeripheral for Peripheral {
    fn identifier(&self) -> String {
        btleplug::api::Peripheral::id(self).to_string()
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(btleplug::api::Peripheral::is_connected(self).await?)
    }

    async fn connect(&self) -> Result<()> {
        Ok(btleplug::api::Peripheral::connect(self).await?)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(btleplug::api::Peripheral::disconnect(self).await?)
    }

    async fn discover_services(&self) -> Result<Vec<Service>> {
        btleplug::api::Peripheral::discover_services(self).await?;
        Ok(self.services().into_iter().collect())
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<()> {
        Ok(btleplug::api::Peripheral::subscribe(self, characteristic).await?)
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        Ok(btleplug::api::Peripheral::write(self, characteristic, data, write_type).await?)
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        Ok(btleplug::api::Peripheral::notifications(self).await?)
    }
}
