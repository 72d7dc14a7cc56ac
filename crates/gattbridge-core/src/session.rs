//! The session task and the handle used to drive it.
//!
//! A session owns the peripheral role, the client connection registry, the
//! scanner and the event multiplexer. All of them live inside one tokio task;
//! callers talk to it through a cloneable [`SessionHandle`] and the platform
//! glue talks to it through a [`HardwareEventSender`]. Commands and hardware
//! callbacks are applied strictly one at a time, so no state is ever shared.
//!
//! [`HardwareEventSender`]: crate::backend::HardwareEventSender

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gattbridge_types::{DeviceId, DiscoveredDevice};

use crate::backend::{BleBackend, HardwareEvent, HardwareEventReceiver};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventMultiplexer, EventStream, SessionEvent};
use crate::logging::LogSwitch;
use crate::peripheral::PeripheralSession;
use crate::registry::ConnectionRegistry;
use crate::scan::ScanController;

type Reply<T> = oneshot::Sender<T>;

/// Consecutive hardware callbacks applied before a waiting command.
const HARDWARE_BURST: usize = 64;

/// A request from a [`SessionHandle`] to the session task.
#[derive(Debug)]
enum Command {
    StartPeripheral {
        service_uuid: String,
        tx_uuid: String,
        rx_uuid: String,
        reply: Reply<Result<()>>,
    },
    StopPeripheral {
        reply: Reply<()>,
    },
    SendNotification {
        char_uuid: String,
        value: Bytes,
        reply: Reply<Result<()>>,
    },
    StartScan {
        service_filter: Option<String>,
        reply: Reply<Result<()>>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        device_id: String,
        reply: Reply<Result<()>>,
    },
    Disconnect {
        device_id: String,
        reply: Reply<()>,
    },
    DisconnectAll {
        reply: Reply<()>,
    },
    WriteCharacteristic {
        device_id: String,
        char_uuid: String,
        value: Bytes,
        reply: Reply<Result<()>>,
    },
    RequestMtu {
        device_id: String,
        mtu: u16,
        reply: Reply<Result<()>>,
    },
    ConnectedDevices {
        reply: Reply<Vec<DeviceId>>,
    },
    IsDeviceConnected {
        device_id: String,
        reply: Reply<bool>,
    },
    Mtu {
        device_id: String,
        reply: Reply<Option<u16>>,
    },
    IsBluetoothOn {
        reply: Reply<bool>,
    },
    DiscoveredDevices {
        reply: Reply<Vec<DiscoveredDevice>>,
    },
    Subscribe {
        reply: Reply<EventStream>,
    },
    Unsubscribe {
        reply: Reply<()>,
    },
    StopAll {
        reply: Reply<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::StartPeripheral { .. } => "start_peripheral",
            Command::StopPeripheral { .. } => "stop_peripheral",
            Command::SendNotification { .. } => "send_notification",
            Command::StartScan { .. } => "start_scan",
            Command::StopScan { .. } => "stop_scan",
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::DisconnectAll { .. } => "disconnect_all",
            Command::WriteCharacteristic { .. } => "write_characteristic",
            Command::RequestMtu { .. } => "request_mtu",
            Command::ConnectedDevices { .. } => "connected_devices",
            Command::IsDeviceConnected { .. } => "is_device_connected",
            Command::Mtu { .. } => "mtu",
            Command::IsBluetoothOn { .. } => "is_bluetooth_on",
            Command::DiscoveredDevices { .. } => "discovered_devices",
            Command::Subscribe { .. } => "subscribe_events",
            Command::Unsubscribe { .. } => "unsubscribe_events",
            Command::StopAll { .. } => "stop_all",
        }
    }
}

/// Entry point for starting a session.
pub struct Session;

impl Session {
    /// Validate `config` and spawn the session task on the current runtime.
    ///
    /// `hardware` must be the receiver paired with the sender the backend's
    /// platform glue pushes callbacks into.
    pub fn spawn(
        backend: Arc<dyn BleBackend>,
        hardware: HardwareEventReceiver,
        config: SessionConfig,
    ) -> Result<SessionHandle> {
        config
            .validate()
            .map_err(|e| Error::invalid_config(e.to_string()))?;

        let (commands, command_rx) = mpsc::channel(config.command_buffer);
        let cancel = CancellationToken::new();
        let log_switch = LogSwitch::new(config.logging.enabled);

        let actor = SessionActor {
            peripheral: PeripheralSession::new(backend.clone(), config.unknown_device_name.clone()),
            registry: ConnectionRegistry::new(backend.clone(), config.central.clone()),
            scan: ScanController::new(backend.clone(), config.unknown_device_name.clone()),
            events: EventMultiplexer::new(),
            backend,
        };
        tokio::spawn(actor.run(command_rx, hardware, cancel.clone()));

        Ok(SessionHandle {
            commands,
            cancel,
            log_switch,
        })
    }
}

struct SessionActor {
    backend: Arc<dyn BleBackend>,
    peripheral: PeripheralSession,
    registry: ConnectionRegistry,
    scan: ScanController,
    events: EventMultiplexer,
}

impl SessionActor {
    /// Callbacks are applied before commands, so a command observes every
    /// callback queued ahead of it. Under a sustained flood that ordering
    /// would starve commands; after [`HARDWARE_BURST`] consecutive
    /// callbacks one pending command is let through.
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut hardware: HardwareEventReceiver,
        cancel: CancellationToken,
    ) {
        info!("Session started");
        let mut burst = 0;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Session cancelled");
                    break;
                }
                Some(event) = hardware.recv() => {
                    self.handle_hardware(event).await;
                    burst += 1;
                    if burst >= HARDWARE_BURST {
                        burst = 0;
                        if let Ok(cmd) = commands.try_recv() {
                            debug!("Hardware burst, letting {} through", cmd.name());
                            self.handle_command(cmd).await;
                        }
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        burst = 0;
                        self.handle_command(cmd).await;
                    }
                    None => {
                        info!("All session handles dropped");
                        break;
                    }
                },
            }
        }

        self.stop_all().await;
        self.events.detach();
        info!("Session stopped");
    }

    async fn handle_hardware(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::AdapterState { powered } => {
                info!("Bluetooth adapter {}", if powered { "on" } else { "off" });
                self.events
                    .emit(SessionEvent::BluetoothState { is_on: powered });
            }
            HardwareEvent::Server(event) => self.peripheral.handle_event(event, &mut self.events).await,
            HardwareEvent::Scan(event) => self.scan.handle_event(event, &mut self.events),
            HardwareEvent::Link(event) => self.registry.handle_event(event, &mut self.events).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        debug!("Handling {}", cmd.name());
        let events = &mut self.events;

        // A dropped reply receiver means the caller gave up waiting; the
        // command has still been applied.
        match cmd {
            Command::StartPeripheral {
                service_uuid,
                tx_uuid,
                rx_uuid,
                reply,
            } => {
                let result = self
                    .peripheral
                    .start(&service_uuid, &tx_uuid, &rx_uuid, events)
                    .await;
                let _ = reply.send(result);
            }
            Command::StopPeripheral { reply } => {
                self.peripheral.stop(events).await;
                let _ = reply.send(());
            }
            Command::SendNotification {
                char_uuid,
                value,
                reply,
            } => {
                let result = self.peripheral.send_notification(&char_uuid, value).await;
                let _ = reply.send(result);
            }
            Command::StartScan {
                service_filter,
                reply,
            } => {
                let result = self.scan.start(service_filter.as_deref(), events).await;
                let _ = reply.send(result);
            }
            Command::StopScan { reply } => {
                self.scan.stop(events).await;
                let _ = reply.send(());
            }
            Command::Connect { device_id, reply } => {
                let result = self.registry.connect(&device_id, events).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { device_id, reply } => {
                match DeviceId::parse(&device_id) {
                    Ok(device_id) => self.registry.disconnect(&device_id, events).await,
                    Err(e) => debug!("Disconnect ignored: {}", e),
                }
                let _ = reply.send(());
            }
            Command::DisconnectAll { reply } => {
                self.registry.disconnect_all(events).await;
                let _ = reply.send(());
            }
            Command::WriteCharacteristic {
                device_id,
                char_uuid,
                value,
                reply,
            } => {
                let result = self
                    .registry
                    .write_characteristic(&device_id, &char_uuid, value, events)
                    .await;
                let _ = reply.send(result);
            }
            Command::RequestMtu {
                device_id,
                mtu,
                reply,
            } => {
                let result = self.registry.request_mtu(&device_id, mtu, events).await;
                let _ = reply.send(result);
            }
            Command::ConnectedDevices { reply } => {
                let _ = reply.send(self.registry.connected_devices());
            }
            Command::IsDeviceConnected { device_id, reply } => {
                let _ = reply.send(self.registry.is_connected(device_id.trim()));
            }
            Command::Mtu { device_id, reply } => {
                let _ = reply.send(self.registry.mtu(device_id.trim()));
            }
            Command::IsBluetoothOn { reply } => {
                let _ = reply.send(self.backend.is_powered().await);
            }
            Command::DiscoveredDevices { reply } => {
                let _ = reply.send(self.scan.discovered());
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(events.attach());
            }
            Command::Unsubscribe { reply } => {
                events.detach();
                let _ = reply.send(());
            }
            Command::StopAll { reply } => {
                self.stop_all().await;
                let _ = reply.send(());
            }
        }
    }

    /// Scanner first, then client links, then the server, so nothing new is
    /// admitted once teardown has begun.
    async fn stop_all(&mut self) {
        self.scan.stop(&mut self.events).await;
        self.registry.disconnect_all(&mut self.events).await;
        self.peripheral.stop(&mut self.events).await;
    }
}

/// Cloneable handle to a running session.
///
/// Commands complete as soon as the request is accepted or refused; the
/// radio's answer arrives on the event stream from
/// [`subscribe_events`](Self::subscribe_events).
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    log_switch: LogSwitch,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Run a teardown command. A closed session is already torn down.
    async fn teardown(&self, make: impl FnOnce(Reply<()>) -> Command) {
        if self.request(make).await.is_err() {
            debug!("Session already closed");
        }
    }

    /// Open the GATT server with one service and start advertising it.
    ///
    /// `peripheral_started` follows once advertising is confirmed.
    pub async fn start_peripheral(
        &self,
        service_uuid: &str,
        tx_uuid: &str,
        rx_uuid: &str,
    ) -> Result<()> {
        self.request(|reply| Command::StartPeripheral {
            service_uuid: service_uuid.to_string(),
            tx_uuid: tx_uuid.to_string(),
            rx_uuid: rx_uuid.to_string(),
            reply,
        })
        .await?
    }

    pub async fn stop_peripheral(&self) {
        self.teardown(|reply| Command::StopPeripheral { reply })
            .await;
    }

    /// Notify every subscribed central of a new TX value.
    pub async fn send_notification(&self, char_uuid: &str, value: impl Into<Bytes>) -> Result<()> {
        let value = value.into();
        self.request(|reply| Command::SendNotification {
            char_uuid: char_uuid.to_string(),
            value,
            reply,
        })
        .await?
    }

    /// Start scanning. `None` or an empty filter scans for every device.
    pub async fn start_scan(&self, service_filter: Option<&str>) -> Result<()> {
        self.request(|reply| Command::StartScan {
            service_filter: service_filter.map(str::to_string),
            reply,
        })
        .await?
    }

    pub async fn stop_scan(&self) {
        self.teardown(|reply| Command::StopScan { reply }).await;
    }

    pub async fn connect(&self, device_id: &str) -> Result<()> {
        self.request(|reply| Command::Connect {
            device_id: device_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self, device_id: &str) {
        self.teardown(|reply| Command::Disconnect {
            device_id: device_id.to_string(),
            reply,
        })
        .await;
    }

    pub async fn disconnect_all(&self) {
        self.teardown(|reply| Command::DisconnectAll { reply })
            .await;
    }

    /// Queue a write; `write_result` or `write_error` reports the outcome.
    pub async fn write_characteristic(
        &self,
        device_id: &str,
        char_uuid: &str,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let value = value.into();
        self.request(|reply| Command::WriteCharacteristic {
            device_id: device_id.to_string(),
            char_uuid: char_uuid.to_string(),
            value,
            reply,
        })
        .await?
    }

    /// Ask for an MTU; `mtu_changed` or `mtu_change_failed` follows.
    pub async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<()> {
        self.request(|reply| Command::RequestMtu {
            device_id: device_id.to_string(),
            mtu,
            reply,
        })
        .await?
    }

    /// Devices with an established link. Empty once the session is closed.
    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        self.request(|reply| Command::ConnectedDevices { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        self.request(|reply| Command::IsDeviceConnected {
            device_id: device_id.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Current ATT MTU of a client link, `None` when not connected.
    pub async fn mtu(&self, device_id: &str) -> Option<u16> {
        self.request(|reply| Command::Mtu {
            device_id: device_id.to_string(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn is_bluetooth_on(&self) -> bool {
        self.request(|reply| Command::IsBluetoothOn { reply })
            .await
            .unwrap_or(false)
    }

    /// Every device seen by any scan of this session.
    pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.request(|reply| Command::DiscoveredDevices { reply })
            .await
            .unwrap_or_default()
    }

    /// Attach as the event listener, replacing any previous one.
    pub async fn subscribe_events(&self) -> Result<EventStream> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    pub async fn unsubscribe_events(&self) {
        self.teardown(|reply| Command::Unsubscribe { reply })
            .await;
    }

    /// Turn this crate's verbose logging on or off.
    pub fn enable_logs(&self, enable: bool) {
        self.log_switch.set(enable);
        if enable {
            info!("Verbose logging enabled");
        }
    }

    /// The switch behind [`enable_logs`](Self::enable_logs), for
    /// [`logging::init`](crate::logging::init).
    pub fn log_switch(&self) -> &LogSwitch {
        &self.log_switch
    }

    /// Stop scanning, drop every client link and stop the peripheral.
    pub async fn stop_all(&self) {
        self.teardown(|reply| Command::StopAll { reply }).await;
    }

    /// Tear everything down and end the session task.
    ///
    /// Waits until the task has finished. Other handles see
    /// [`Error::SessionClosed`] afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.commands.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
