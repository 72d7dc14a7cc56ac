//! Central-role backend on desktop Bluetooth stacks, via `btleplug`.
//!
//! `btleplug` has no GATT server, no client MTU exchange and subscribes
//! through its own CCCD write, so [`BtleplugBackend`] reports none of those
//! capabilities. Device ids are Bluetooth addresses where the stack exposes
//! them, and the stack's peripheral id elsewhere (CoreBluetooth reports an
//! all-zero address).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattbridge_types::{
    CharacteristicProperties, DeviceId, DiscoveredCharacteristic, ServiceDescriptor, WriteType,
};

use crate::backend::{
    AttResponse, BackendCapabilities, BackendError, BackendResult, BleBackend,
    HardwareEventSender, LinkEvent, LinkId, RequestId, ScanEvent,
};

const NO_ADDRESS: &str = "00:00:00:00:00:00";

/// State shared with the adapter event task.
#[derive(Default)]
struct Shared {
    peripherals: RwLock<HashMap<DeviceId, Peripheral>>,
    links: RwLock<HashMap<DeviceId, LinkId>>,
    scanning: AtomicBool,
}

impl Shared {
    async fn device_for(&self, id: &PeripheralId) -> Option<DeviceId> {
        self.peripherals
            .read()
            .await
            .iter()
            .find(|(_, p)| p.id() == *id)
            .map(|(device, _)| device.clone())
    }
}

/// A [`BleBackend`] for the first adapter `btleplug` finds.
pub struct BtleplugBackend {
    adapter: Adapter,
    sender: HardwareEventSender,
    shared: Arc<Shared>,
    /// Connect-and-forward-notifications task per live link.
    link_tasks: Mutex<HashMap<LinkId, JoinHandle<()>>>,
    event_task: JoinHandle<()>,
}

impl BtleplugBackend {
    /// Open the first adapter and start forwarding its events to `sender`.
    pub async fn new(sender: HardwareEventSender) -> BackendResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BackendError::Unavailable)?;

        let shared = Arc::new(Shared::default());
        let event_task = tokio::spawn(forward_adapter_events(
            adapter.clone(),
            shared.clone(),
            sender.clone(),
        ));

        Ok(Self {
            adapter,
            sender,
            shared,
            link_tasks: Mutex::new(HashMap::new()),
            event_task,
        })
    }

    async fn peripheral(&self, device: &DeviceId) -> BackendResult<Peripheral> {
        if let Some(peripheral) = self.shared.peripherals.read().await.get(device) {
            return Ok(peripheral.clone());
        }

        let wanted = device.as_str().to_lowercase();
        for peripheral in self.adapter.peripherals().await? {
            let address = match peripheral.properties().await {
                Ok(Some(props)) => props.address.to_string(),
                _ => continue,
            };
            if create_identifier(&address, &peripheral.id()).to_lowercase() == wanted {
                debug!("Resolved {} from adapter cache", device);
                self.shared
                    .peripherals
                    .write()
                    .await
                    .insert(device.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(BackendError::DeviceNotFound(device.to_string()))
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        self.event_task.abort();
        if let Ok(tasks) = self.link_tasks.try_lock() {
            for task in tasks.values() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            peripheral_role: false,
            server_connection_events: false,
            explicit_cccd_write: false,
            client_mtu_request: false,
        }
    }

    async fn is_powered(&self) -> bool {
        matches!(
            self.adapter.adapter_state().await,
            Ok(CentralState::PoweredOn)
        )
    }

    async fn open_server(&self, _service: &ServiceDescriptor) -> BackendResult<()> {
        Err(BackendError::Unsupported("GATT server"))
    }

    async fn close_server(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn start_advertising(&self, _service_uuid: Uuid) -> BackendResult<()> {
        Err(BackendError::Unsupported("advertising"))
    }

    async fn stop_advertising(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn notify(
        &self,
        _central: &DeviceId,
        _characteristic: Uuid,
        _value: &Bytes,
    ) -> BackendResult<bool> {
        Err(BackendError::Unsupported("GATT server"))
    }

    async fn respond(
        &self,
        _central: &DeviceId,
        _request: RequestId,
        _response: AttResponse,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("GATT server"))
    }

    async fn start_scan(&self, service_filter: Option<Uuid>) -> BackendResult<()> {
        let filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };
        self.adapter.start_scan(filter).await?;
        self.shared.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> BackendResult<()> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await.map_err(BackendError::from)
    }

    async fn resolve_device(&self, device: &DeviceId) -> BackendResult<()> {
        self.peripheral(device).await.map(|_| ())
    }

    async fn connect(&self, link: &LinkId) -> BackendResult<()> {
        let peripheral = self.peripheral(&link.device).await?;
        self.shared
            .links
            .write()
            .await
            .insert(link.device.clone(), link.clone());

        let sender = self.sender.clone();
        let task_link = link.clone();
        let task = tokio::spawn(async move {
            let link = task_link;
            if let Err(e) = peripheral.connect().await {
                sender.send(LinkEvent::ConnectFailed {
                    link,
                    message: e.to_string(),
                });
                return;
            }
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("No notification stream for {}: {}", link, e);
                    sender.send(LinkEvent::Connected { link });
                    return;
                }
            };
            sender.send(LinkEvent::Connected { link: link.clone() });
            while let Some(notification) = notifications.next().await {
                let forwarded = sender.send(LinkEvent::ValueChanged {
                    link: link.clone(),
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                });
                if !forwarded {
                    break;
                }
            }
            debug!("Notification stream for {} ended", link);
        });

        if let Some(previous) = self.link_tasks.lock().await.insert(link.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, link: &LinkId) -> BackendResult<()> {
        let peripheral = self.peripheral(&link.device).await?;
        let link = link.clone();
        tokio::spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => debug!("Link {} closed", link),
                Err(e) => warn!("Disconnecting {} failed: {}", link, e),
            }
        });
        Ok(())
    }

    async fn release(&self, link: &LinkId) {
        {
            let mut links = self.shared.links.write().await;
            if links.get(&link.device) == Some(link) {
                links.remove(&link.device);
            }
        }
        if let Some(task) = self.link_tasks.lock().await.remove(link) {
            task.abort();
        }
    }

    async fn discover_services(&self, link: &LinkId) -> BackendResult<()> {
        let peripheral = self.peripheral(&link.device).await?;
        let sender = self.sender.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered {
                    characteristics: peripheral
                        .characteristics()
                        .iter()
                        .map(to_discovered)
                        .collect(),
                    link,
                },
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", link, e);
                    LinkEvent::DiscoveryFailed { link, status: -1 }
                }
            };
            sender.send(event);
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        enable: bool,
    ) -> BackendResult<()> {
        let peripheral = self.peripheral(&link.device).await?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let link = link.clone();
        tokio::spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            if let Err(e) = result {
                warn!("Changing subscription to {} on {} failed: {}", target.uuid, link, e);
            }
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        _link: &LinkId,
        _characteristic: &DiscoveredCharacteristic,
        _descriptor: Uuid,
        _value: Bytes,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("descriptor writes"))
    }

    async fn write_characteristic(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        value: Bytes,
        write_type: WriteType,
    ) -> BackendResult<()> {
        let peripheral = self.peripheral(&link.device).await?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };
        let sender = self.sender.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let event = match peripheral.write(&target, &value, write_type).await {
                Ok(()) => LinkEvent::WriteCompleted {
                    link,
                    characteristic: target.uuid,
                    status: 0,
                },
                Err(e) => LinkEvent::WriteFailed {
                    link,
                    characteristic: target.uuid,
                    message: e.to_string(),
                },
            };
            sender.send(event);
        });
        Ok(())
    }

    async fn request_mtu(&self, _link: &LinkId, _mtu: u16) -> BackendResult<()> {
        Err(BackendError::Unsupported("MTU exchange"))
    }

    async fn max_write_len(&self, _link: &LinkId, _write_type: WriteType) -> Option<u16> {
        None
    }
}

async fn forward_adapter_events(adapter: Adapter, shared: Arc<Shared>, sender: HardwareEventSender) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Adapter events unavailable: {}", e);
            return;
        }
    };
    info!("Forwarding adapter events");

    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !shared.scanning.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let device = DeviceId::new(create_identifier(&props.address.to_string(), &id));
                shared
                    .peripherals
                    .write()
                    .await
                    .insert(device.clone(), peripheral);
                sender.send(ScanEvent::Result {
                    device,
                    name: props.local_name,
                    rssi: props.rssi.unwrap_or_default(),
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let Some(device) = shared.device_for(&id).await else {
                    continue;
                };
                let link = shared.links.read().await.get(&device).cloned();
                if let Some(link) = link {
                    sender.send(LinkEvent::Disconnected { link, status: 0 });
                }
            }
            CentralEvent::StateUpdate(state) => {
                sender.adapter_state(state == CentralState::PoweredOn);
            }
            _ => {}
        }
        if sender.is_closed() {
            break;
        }
    }
    debug!("Adapter event stream ended");
}

fn find_characteristic(
    peripheral: &Peripheral,
    wanted: &DiscoveredCharacteristic,
) -> BackendResult<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == wanted.uuid && c.service_uuid == wanted.service_uuid)
        .ok_or_else(|| BackendError::Rejected(format!("characteristic {} not cached", wanted.uuid)))
}

fn to_discovered(characteristic: &Characteristic) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic::new(
        characteristic.service_uuid,
        characteristic.uuid,
        CharacteristicProperties::from_bits(characteristic.properties.bits()),
    )
}

impl From<btleplug::Error> for BackendError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => BackendError::DeviceNotFound("unknown".into()),
            btleplug::Error::NotConnected => BackendError::Rejected("not connected".into()),
            btleplug::Error::PermissionDenied => BackendError::Unavailable,
            other => BackendError::Platform(other.to_string()),
        }
    }
}

/// The stack's peripheral id without its debug wrapper.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Device id for a peripheral: its address, or its peripheral id when the
/// stack hides the address.
fn create_identifier(address: &str, id: &PeripheralId) -> String {
    if address == NO_ADDRESS {
        format_peripheral_id(id)
    } else {
        address.to_string()
    }
}
