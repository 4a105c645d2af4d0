// gattlink core: single-peripheral BLE session
//
// Hardware-agnostic. The platform driver plugs in through `radio::RadioBridge`
// and publishes its events into a `radio::RadioEventHub`.

pub mod catalog;
pub mod codec;
pub mod radio;
pub mod registry;
pub mod session;
pub mod settings;

pub use catalog::{AdvertisingData, DeviceCatalog, PeripheralRecord};
pub use codec::CodecError;
pub use radio::{
    ConnectionEvent, PowerState, RadioBridge, RadioError, RadioEvent, RadioEventHub,
    RadioSubscription, ValueUpdate,
};
pub use registry::{
    Capability, CapabilityIndex, CharacteristicDescriptor, CharacteristicRef,
    CharacteristicRegistry, PropertyFlags, RawCharacteristic, ServiceListing,
};
pub use session::{
    BleSession, EventLoopHandle, NullSink, PayloadSink, SessionError, SessionEvent, SessionState,
};
pub use settings::{SessionSettings, SettingsError};

/// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`. Later calls are no-ops.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .try_init();
}
