//! Scriptable central for tests

use crate::transport::traits::{
    Central, CentralEvent, CentralEventSender, CharacteristicHandle, InvalidPeripheralId,
    PeripheralHandle, RadioState, ServiceHandle,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use unustasis_shared::profile;
use uuid::Uuid;

pub const SCOOTER_ID: &str = "ABCD-1234";

pub fn scooter() -> PeripheralHandle {
    PeripheralHandle {
        id: SCOOTER_ID.into(),
        name: Some("unu Scooter".into()),
    }
}

pub fn command_service() -> ServiceHandle {
    ServiceHandle {
        uuid: profile::COMMAND_SERVICE_UUID,
        id: 0x10,
    }
}

pub fn status_service() -> ServiceHandle {
    ServiceHandle {
        uuid: profile::STATUS_SERVICE_UUID,
        id: 0x30,
    }
}

pub fn command_characteristic() -> CharacteristicHandle {
    CharacteristicHandle {
        service: command_service(),
        uuid: profile::COMMAND_CHARACTERISTIC_UUID,
        id: 0x11,
    }
}

pub fn status_characteristic() -> CharacteristicHandle {
    CharacteristicHandle {
        service: status_service(),
        uuid: profile::HANDLEBAR_CHARACTERISTIC_UUID,
        id: 0x31,
    }
}

/// Calls made against the fake
#[derive(Debug, Clone, PartialEq)]
pub enum CentralCall {
    RadioState,
    Retrieve(String),
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(String),
    CancelConnection(String),
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics(Uuid, Vec<Uuid>),
    Write(Uuid, Vec<u8>),
}

impl CentralCall {
    /// Whether the call touches the radio beyond reading its state
    pub fn is_wireless(&self) -> bool {
        !matches!(self, CentralCall::RadioState)
    }
}

/// How the fake answers requests
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub radio: RadioState,
    /// Retrieval rejects every id as malformed
    pub malformed_ids: bool,
    /// Returned by direct retrieval
    pub cached: Option<PeripheralHandle>,
    /// Advertised once a scan starts
    pub advertised: Option<PeripheralHandle>,
    /// `None` leaves the connect request unanswered
    pub connect: Option<Result<(), String>>,
    pub services: Option<Result<Vec<ServiceHandle>, String>>,
    pub command_characteristics: Option<Result<Vec<CharacteristicHandle>, String>>,
    pub status_characteristics: Option<Result<Vec<CharacteristicHandle>, String>>,
    /// `None` never acknowledges the write
    pub write: Option<Result<(), String>>,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            radio: RadioState::PoweredOn,
            malformed_ids: false,
            cached: Some(scooter()),
            advertised: None,
            connect: Some(Ok(())),
            services: Some(Ok(vec![command_service(), status_service()])),
            command_characteristics: Some(Ok(vec![command_characteristic()])),
            status_characteristics: Some(Ok(vec![status_characteristic()])),
            write: Some(Ok(())),
        }
    }
}

pub struct FakeCentral {
    events: CentralEventSender,
    script: Mutex<FakeScript>,
    calls: Mutex<Vec<CentralCall>>,
}

impl FakeCentral {
    pub fn new(events: CentralEventSender, script: FakeScript) -> Self {
        Self {
            events,
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Push an event as if the backend delivered it
    pub fn inject(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<CentralCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&CentralCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn wireless_calls(&self) -> usize {
        self.count(CentralCall::is_wireless)
    }

    fn record(&self, call: CentralCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn script(&self) -> FakeScript {
        self.script.lock().unwrap().clone()
    }
}

#[async_trait]
impl Central for FakeCentral {
    async fn radio_state(&self) -> RadioState {
        self.record(CentralCall::RadioState);
        self.script().radio
    }

    async fn retrieve_peripheral(&self, id: &str) -> Result<Option<PeripheralHandle>> {
        self.record(CentralCall::Retrieve(id.to_string()));
        if self.script().malformed_ids {
            return Err(InvalidPeripheralId(id.to_string()).into());
        }
        Ok(self.script().cached.filter(|p| p.id == id))
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.record(CentralCall::StartScan(services.to_vec()));
        if let Some(peripheral) = self.script().advertised {
            self.inject(CentralEvent::Discovered(peripheral));
        }
        Ok(())
    }

    async fn stop_scan(&self) {
        self.record(CentralCall::StopScan);
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.record(CentralCall::Connect(peripheral.id.clone()));
        match self.script().connect {
            Some(Ok(())) => self.inject(CentralEvent::Connected(peripheral.clone())),
            Some(Err(error)) => self.inject(CentralEvent::ConnectFailed {
                peripheral: peripheral.clone(),
                error,
            }),
            None => {}
        }
        Ok(())
    }

    async fn cancel_connection(&self, peripheral: &PeripheralHandle) {
        self.record(CentralCall::CancelConnection(peripheral.id.clone()));
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
        services: &[Uuid],
    ) -> Result<()> {
        self.record(CentralCall::DiscoverServices(services.to_vec()));
        if let Some(result) = self.script().services {
            self.inject(CentralEvent::ServicesDiscovered {
                peripheral: peripheral.clone(),
                result,
            });
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<()> {
        self.record(CentralCall::DiscoverCharacteristics(
            service.uuid,
            characteristics.to_vec(),
        ));
        let script = self.script();
        let result = if service.uuid == profile::COMMAND_SERVICE_UUID {
            script.command_characteristics
        } else {
            script.status_characteristics
        };
        if let Some(result) = result {
            self.inject(CentralEvent::CharacteristicsDiscovered {
                peripheral: peripheral.clone(),
                service: *service,
                result,
            });
        }
        Ok(())
    }

    async fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()> {
        self.record(CentralCall::Write(characteristic.uuid, value.to_vec()));
        if characteristic.uuid != profile::COMMAND_CHARACTERISTIC_UUID {
            return Err(anyhow!("unexpected characteristic {}", characteristic.uuid));
        }
        if let Some(result) = self.script().write {
            self.inject(CentralEvent::ValueWritten {
                peripheral: peripheral.clone(),
                characteristic: *characteristic,
                result,
            });
        }
        Ok(())
    }
}
