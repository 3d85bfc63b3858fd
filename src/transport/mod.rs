pub mod bluetooth;
#[cfg(test)]
pub mod fake;
pub mod traits;

pub use bluetooth::BluerCentral;
pub use traits::{
    event_queue, Central, CentralEvent, CentralEventReceiver, CharacteristicHandle,
    InvalidPeripheralId, PeripheralHandle, RadioState, ServiceHandle,
};
