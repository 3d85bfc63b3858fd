//! BlueZ central backend
//!
//! Drives the GATT client side through `bluer`. Every request spawns a task
//! that performs the D-Bus round trip and posts its result onto the event
//! queue, so the command machine observes one serialized stream of events.

use crate::transport::traits::{
    Central, CentralEvent, CentralEventSender, CharacteristicHandle, InvalidPeripheralId,
    PeripheralHandle, RadioState, ServiceHandle,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::CharacteristicWriteRequest;
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval for polling BlueZ until remote services are resolved
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

/// Central backend on top of the default BlueZ adapter
pub struct BluerCentral {
    adapter: Option<Adapter>,
    /// Why `adapter` is missing, if it is
    adapter_error: Option<bluer::ErrorKind>,
    events: CentralEventSender,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    /// Forwards adapter power changes as `StateUpdated`
    radio_task: Option<JoinHandle<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BluerCentral {
    /// Connect to bluetoothd and pick the default adapter.
    ///
    /// A missing daemon or adapter is not an error here; it surfaces as an
    /// unsupported or unauthorized radio state.
    pub async fn new(events: CentralEventSender) -> Self {
        let adapter = async {
            let session = bluer::Session::new().await?;
            session.default_adapter().await
        }
        .await;

        let (adapter, adapter_error) = match adapter {
            Ok(adapter) => {
                info!("[BT] Using adapter {}", adapter.name());
                (Some(adapter), None)
            }
            Err(e) => {
                warn!("[BT] No usable adapter: {}", e);
                (None, Some(e.kind))
            }
        };

        let radio_task = adapter
            .as_ref()
            .map(|adapter| tokio::spawn(forward_radio_state(adapter.clone(), events.clone())));

        Self {
            adapter,
            adapter_error,
            events,
            scan_task: Mutex::new(None),
            radio_task,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .as_ref()
            .ok_or_else(|| anyhow!("Bluetooth adapter unavailable"))
    }

    fn device(&self, peripheral: &PeripheralHandle) -> Result<Device> {
        let address = parse_address(&peripheral.id)?;
        Ok(self.adapter()?.device(address)?)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BluerCentral {
    fn drop(&mut self) {
        if let Some(task) = self.radio_task.take() {
            task.abort();
        }
    }
}

/// BlueZ identifies devices by their Bluetooth address
fn parse_address(id: &str) -> Result<Address, InvalidPeripheralId> {
    id.parse().map_err(|_| InvalidPeripheralId(id.to_string()))
}

fn radio_event(property: &AdapterProperty) -> Option<CentralEvent> {
    match property {
        AdapterProperty::Powered(true) => Some(CentralEvent::StateUpdated(RadioState::PoweredOn)),
        AdapterProperty::Powered(false) => Some(CentralEvent::StateUpdated(RadioState::PoweredOff)),
        _ => None,
    }
}

async fn forward_radio_state(adapter: Adapter, events: CentralEventSender) {
    let adapter_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[BT] Adapter state changes unavailable: {}", e);
            return;
        }
    };
    tokio::pin!(adapter_events);
    while let Some(evt) = adapter_events.next().await {
        let AdapterEvent::PropertyChanged(property) = evt else {
            continue;
        };
        if let Some(event) = radio_event(&property) {
            debug!("[BT] Adapter {:?}", property);
            if events.send(event).is_err() {
                break;
            }
        }
    }
}

/// Build a handle for a BlueZ device
async fn peripheral_handle(device: &Device) -> PeripheralHandle {
    PeripheralHandle {
        id: device.address().to_string(),
        name: device.name().await.ok().flatten(),
    }
}

fn radio_state_for(kind: &bluer::ErrorKind) -> RadioState {
    match kind {
        bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
            RadioState::Unauthorized
        }
        _ => RadioState::Unsupported,
    }
}

async fn wait_services_resolved(device: &Device) -> bluer::Result<()> {
    while !device.is_services_resolved().await? {
        tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
    }
    Ok(())
}

async fn matching_services(device: &Device, wanted: &[Uuid]) -> bluer::Result<Vec<ServiceHandle>> {
    wait_services_resolved(device).await?;

    let mut found = Vec::new();
    for service in device.services().await? {
        let uuid = service.uuid().await?;
        if wanted.contains(&uuid) {
            found.push(ServiceHandle {
                uuid,
                id: service.id(),
            });
        }
    }
    Ok(found)
}

async fn matching_characteristics(
    device: &Device,
    service: ServiceHandle,
    wanted: &[Uuid],
) -> bluer::Result<Vec<CharacteristicHandle>> {
    let remote = device.service(service.id).await?;

    let mut found = Vec::new();
    for characteristic in remote.characteristics().await? {
        let uuid = characteristic.uuid().await?;
        if wanted.contains(&uuid) {
            found.push(CharacteristicHandle {
                service,
                uuid,
                id: characteristic.id(),
            });
        }
    }
    Ok(found)
}

async fn write_with_response(
    device: &Device,
    characteristic: CharacteristicHandle,
    value: &[u8],
) -> bluer::Result<()> {
    let remote = device
        .service(characteristic.service.id)
        .await?
        .characteristic(characteristic.id)
        .await?;

    let mut request = CharacteristicWriteRequest::default();
    request.op_type = WriteOp::Request;
    remote.write_ext(value, &request).await
}

#[async_trait]
impl Central for BluerCentral {
    async fn radio_state(&self) -> RadioState {
        let adapter = match &self.adapter {
            Some(adapter) => adapter,
            None => {
                return self
                    .adapter_error
                    .as_ref()
                    .map(radio_state_for)
                    .unwrap_or(RadioState::Unsupported)
            }
        };

        match adapter.is_powered().await {
            Ok(true) => RadioState::PoweredOn,
            Ok(false) => RadioState::PoweredOff,
            Err(e) => radio_state_for(&e.kind),
        }
    }

    async fn retrieve_peripheral(&self, id: &str) -> Result<Option<PeripheralHandle>> {
        let address = parse_address(id)?;
        let adapter = self.adapter()?;

        if !adapter.device_addresses().await?.contains(&address) {
            debug!("[BT] {} not cached by BlueZ", address);
            return Ok(None);
        }

        let device = adapter.device(address)?;
        Ok(Some(peripheral_handle(&device).await))
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        let adapter = self.adapter()?.clone();

        let mut filter = DiscoveryFilter::default();
        filter.uuids = services.iter().copied().collect::<HashSet<_>>();
        filter.transport = DiscoveryTransport::Le;
        adapter.set_discovery_filter(filter).await?;

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let discover = match adapter.discover_devices().await {
                Ok(discover) => discover,
                Err(e) => {
                    warn!("[BT] Discovery failed to start: {}", e);
                    return;
                }
            };
            tokio::pin!(discover);
            while let Some(evt) = discover.next().await {
                if let AdapterEvent::DeviceAdded(addr) = evt {
                    if let Ok(device) = adapter.device(addr) {
                        let handle = peripheral_handle(&device).await;
                        if events.send(CentralEvent::Discovered(handle)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut scan = self.scan_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = scan.replace(task) {
            previous.abort();
        }
        info!("[BT] Scanning for {:?}", services);
        Ok(())
    }

    async fn stop_scan(&self) {
        // Dropping the discovery stream ends the BlueZ discovery session
        let task = self
            .scan_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            debug!("[BT] Scan stopped");
        }
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        let device = self.device(peripheral)?;
        let handle = peripheral.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let event = match device.connect().await {
                Ok(()) => CentralEvent::Connected(handle.clone()),
                Err(e) => CentralEvent::ConnectFailed {
                    peripheral: handle.clone(),
                    error: e.to_string(),
                },
            };
            let connected = matches!(event, CentralEvent::Connected(_));
            if events.send(event).is_err() || !connected {
                return;
            }

            // Report the link going down
            let Ok(device_events) = device.events().await else {
                return;
            };
            tokio::pin!(device_events);
            while let Some(evt) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = evt {
                    let _ = events.send(CentralEvent::Disconnected {
                        peripheral: handle,
                        error: None,
                    });
                    break;
                }
            }
        });

        self.track(task);
        info!("[BT] Connecting to {}", peripheral.id);
        Ok(())
    }

    async fn cancel_connection(&self, peripheral: &PeripheralHandle) {
        self.abort_tasks();

        match self.device(peripheral) {
            Ok(device) => {
                if let Err(e) = device.disconnect().await {
                    debug!("[BT] Disconnect from {}: {}", peripheral.id, e);
                }
            }
            Err(e) => debug!("[BT] Nothing to disconnect: {}", e),
        }
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
        services: &[Uuid],
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        let handle = peripheral.clone();
        let wanted = services.to_vec();
        let events = self.events.clone();

        self.track(tokio::spawn(async move {
            let result = matching_services(&device, &wanted)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(CentralEvent::ServicesDiscovered {
                peripheral: handle,
                result,
            });
        }));
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        let handle = peripheral.clone();
        let service = *service;
        let wanted = characteristics.to_vec();
        let events = self.events.clone();

        self.track(tokio::spawn(async move {
            let result = matching_characteristics(&device, service, &wanted)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(CentralEvent::CharacteristicsDiscovered {
                peripheral: handle,
                service,
                result,
            });
        }));
        Ok(())
    }

    async fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        let handle = peripheral.clone();
        let characteristic = *characteristic;
        let value = value.to_vec();
        let events = self.events.clone();

        self.track(tokio::spawn(async move {
            let result = write_with_response(&device, characteristic, &value)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(CentralEvent::ValueWritten {
                peripheral: handle,
                characteristic,
                result,
            });
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_map_to_unauthorized() {
        assert_eq!(
            radio_state_for(&bluer::ErrorKind::NotAuthorized),
            RadioState::Unauthorized
        );
        assert_eq!(
            radio_state_for(&bluer::ErrorKind::NotAvailable),
            RadioState::Unsupported
        );
    }

    #[test]
    fn test_only_bluetooth_addresses_name_devices() {
        assert_eq!(
            parse_address("ABCD-1234"),
            Err(InvalidPeripheralId("ABCD-1234".into()))
        );
        assert_eq!(
            parse_address("C0:FF:EE:00:11:22").unwrap().to_string(),
            "C0:FF:EE:00:11:22"
        );

        // Survives the anyhow boundary for the command machine to recognize
        let err: anyhow::Error = parse_address("").unwrap_err().into();
        assert!(err.is::<InvalidPeripheralId>());
    }

    #[test]
    fn test_power_changes_become_radio_updates() {
        assert_eq!(
            radio_event(&AdapterProperty::Powered(false)),
            Some(CentralEvent::StateUpdated(RadioState::PoweredOff))
        );
        assert_eq!(
            radio_event(&AdapterProperty::Powered(true)),
            Some(CentralEvent::StateUpdated(RadioState::PoweredOn))
        );
        assert_eq!(radio_event(&AdapterProperty::Discovering(true)), None);
    }
}
