//! btleplug backend: the real radio behind [`BleAdapter`]
//!
//! Peripherals are addressed by their Bluetooth address as printed by
//! btleplug (`AA:BB:CC:DD:EE:FF`). The first adapter the OS reports is used.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{BleAdapter, LinkEvent, PeerEvent, ScanFilter, ServiceMap};
use crate::error::{AdapterError, Operation};

fn failed(op: Operation) -> impl FnOnce(btleplug::Error) -> AdapterError {
    move |error| match error {
        btleplug::Error::NotConnected => AdapterError::LinkLost,
        other => AdapterError::failed(op, other),
    }
}

pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Open the default Bluetooth adapter
    pub async fn new() -> Result<Self, AdapterError> {
        let manager = Manager::new().await.map_err(failed(Operation::Scan))?;
        let adapters = manager.adapters().await.map_err(failed(Operation::Scan))?;
        let adapter = adapters.into_iter().next().ok_or(AdapterError::NoAdapter)?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "using Bluetooth adapter");
        }
        Ok(Self { adapter })
    }

    async fn find(&self, address: &str) -> Result<Peripheral, AdapterError> {
        let peripherals = self.adapter.peripherals().await.map_err(failed(Operation::Connect))?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| AdapterError::failed(Operation::Connect, format!("{address} not found")))
    }
}

async fn peer_event(adapter: &Adapter, id: &btleplug::platform::PeripheralId) -> Option<PeerEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok().flatten();
    Some(PeerEvent {
        address: peripheral.address().to_string(),
        name: props.as_ref().and_then(|p| p.local_name.clone()),
        rssi: props.and_then(|p| p.rssi),
    })
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    type Link = Peripheral;
    type Characteristic = Characteristic;

    async fn is_powered(&self) -> Result<bool, AdapterError> {
        let state = self.adapter.adapter_state().await.map_err(failed(Operation::Scan))?;
        // some backends never report a state
        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn scan(
        &self,
        _filter: &ScanFilter,
    ) -> Result<BoxStream<'static, PeerEvent>, AdapterError> {
        let events = self.adapter.events().await.map_err(failed(Operation::Scan))?;
        self.adapter
            .start_scan(btleplug::api::ScanFilter::default())
            .await
            .map_err(failed(Operation::Scan))?;

        let adapter = self.adapter.clone();
        let results = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        peer_event(&adapter, &id).await
                    }
                    _ => None,
                }
            }
        });
        Ok(results.boxed())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.adapter.stop_scan().await.map_err(failed(Operation::Scan))
    }

    async fn connect(&self, address: &str) -> Result<Peripheral, AdapterError> {
        let peripheral = self.find(address).await?;
        peripheral.connect().await.map_err(failed(Operation::Connect))?;
        debug!(%address, "connected");
        Ok(peripheral)
    }

    async fn discover_services(
        &self,
        link: &Peripheral,
        service: Uuid,
    ) -> Result<Option<ServiceMap<Characteristic>>, AdapterError> {
        link.discover_services().await.map_err(failed(Operation::DiscoverServices))?;
        let map = link
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.into_iter().map(|c| (c.uuid, c)).collect());
        Ok(map)
    }

    async fn write_characteristic(
        &self,
        link: &Peripheral,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), AdapterError> {
        link.write(characteristic, value, WriteType::WithResponse)
            .await
            .map_err(failed(Operation::Write))
    }

    async fn read_characteristic(
        &self,
        link: &Peripheral,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>, AdapterError> {
        link.read(characteristic).await.map_err(failed(Operation::Read))
    }

    async fn set_notification(
        &self,
        link: &Peripheral,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        let result = if enabled {
            link.subscribe(characteristic).await
        } else {
            link.unsubscribe(characteristic).await
        };
        result.map_err(failed(Operation::SetNotification))
    }

    async fn link_events(
        &self,
        link: &Peripheral,
    ) -> Result<BoxStream<'static, LinkEvent>, AdapterError> {
        let notifications = link
            .notifications()
            .await
            .map_err(failed(Operation::SetNotification))?
            .map(|n| LinkEvent::Notification { uuid: n.uuid, value: n.value });

        let id = link.id();
        let drops = self
            .adapter
            .events()
            .await
            .map_err(failed(Operation::Connect))?
            .filter_map(move |event| {
                let dropped =
                    matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id);
                futures::future::ready(dropped.then_some(LinkEvent::Disconnected))
            });

        Ok(futures::stream::select(notifications, drops).boxed())
    }

    async fn disconnect(&self, link: &Peripheral) -> Result<(), AdapterError> {
        link.disconnect().await.map_err(failed(Operation::Disconnect))
    }
}
