//! Basic example: Discover nearby dive computers
//!
//! Run with: cargo run --example scan_dive_computers

use dive_computer_ble::{
    BleStream, Collaborators, Descriptor, DeviceEvents, DeviceOpener, DeviceStatus, DiveDevice,
    DiveComputerManager, ManagerConfig, Result,
};
use std::sync::Arc;
use std::time::Duration;

/// Scanning needs no protocol driver.
struct NoDriver;

impl DeviceOpener for NoDriver {
    fn open(
        &self,
        _descriptor: &Descriptor,
        _stream: BleStream,
        _events: Arc<DeviceEvents>,
    ) -> std::result::Result<Box<dyn DiveDevice>, DeviceStatus> {
        Err(DeviceStatus::Unsupported)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dive_computer_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for dive computers...");
    println!("Put your dive computer into Bluetooth mode!\n");

    let config = ManagerConfig::default().with_scan_duration(Duration::from_secs(10));
    let manager =
        DiveComputerManager::initialize(config, Collaborators::new(Arc::new(NoDriver))).await?;

    let found = manager.scan().await?;
    if found.is_empty() {
        println!("No dive computers found.");
    }

    for record in &found {
        println!("\nFound dive computer:");
        println!("  Name: {}", record.name.as_deref().unwrap_or("?"));
        println!("  Address: {}", record.identity);
        match record.family {
            Some(family) => println!("  Family: {}", family),
            None => println!("  Family: unknown"),
        }
        println!("  RSSI: {:?} dBm", record.rssi);
    }

    let remembered = manager.devices().list();
    if !remembered.is_empty() {
        println!("\nRemembered dive computers:");
        for device in remembered {
            println!(
                "  {} ({}), last connected {}",
                device.name, device.identity, device.last_connected
            );
        }
    }

    manager.shutdown().await?;
    Ok(())
}
