//! Builds devices from instrument configuration.

use super::{
    Device, Generator, KeysightGen, KeysightM9807A, NetworkAnalyzer, PlanarS50244, Positioner,
    PositionerDriver, Role, TesartRbd,
};
use crate::adapters::{MockTransport, ResourceAddress, StreamTransport, Transport};
use crate::config::{InstrumentConfig, TransportKind};
use crate::error::{BenchError, BenchResult};
use crate::link::InstrumentLink;
use std::time::Duration;
use tracing::info;

/// Models accepted for each role.
pub fn known_models(role: Role) -> &'static [&'static str] {
    match role {
        Role::Positioner => &["tesart"],
        Role::Generator => &["keysight"],
        Role::Analyzer => &["m9807a", "s50244"],
    }
}

/// Open the transport for one address of `config`.
pub async fn open_transport(config: &InstrumentConfig, address: &str) -> BenchResult<Box<dyn Transport>> {
    let terminator = config
        .terminator_char()
        .map_err(|e| BenchError::Configuration(e.to_string()))?;

    match config.transport {
        TransportKind::Mock => Ok(Box::new(MockTransport::new(&config.id))),
        TransportKind::Tcp => {
            let transport = StreamTransport::connect_tcp(address, config.timeout(), terminator).await?;
            Ok(Box::new(transport))
        }
        TransportKind::Serial => open_serial(config, address, terminator),
    }
}

#[cfg(feature = "instrument_serial")]
fn open_serial(config: &InstrumentConfig, address: &str, terminator: char) -> BenchResult<Box<dyn Transport>> {
    let path = match ResourceAddress::parse(address)? {
        ResourceAddress::Serial { path } => path,
        other => {
            return Err(BenchError::Configuration(format!(
                "instrument '{}': '{}' is not a serial resource",
                config.id, other
            )))
        }
    };
    let transport = StreamTransport::open_serial(&path, config.baud_rate, config.timeout(), terminator)?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(config: &InstrumentConfig, address: &str, _terminator: char) -> BenchResult<Box<dyn Transport>> {
    // Validate the address even though the port cannot be opened.
    ResourceAddress::parse(address)?;
    Err(BenchError::Configuration(format!(
        "instrument '{}' needs serial support; rebuild with the 'instrument_serial' feature",
        config.id
    )))
}

/// Connect an instrument and wrap it in its role. Does not initialize it.
pub async fn build_device(config: &InstrumentConfig) -> BenchResult<Device> {
    let model = config.model.to_ascii_lowercase();
    if !known_models(config.role).contains(&model.as_str()) {
        return Err(BenchError::Configuration(format!(
            "unknown {} model '{}'",
            config.role, config.model
        )));
    }

    let link_config = config.link_config();
    let addresses: Vec<String> = match (config.transport, config.addresses()) {
        (TransportKind::Mock, list) if list.is_empty() => {
            let count = if config.role == Role::Positioner {
                config.mock_axes.max(1)
            } else {
                1
            };
            (0..count).map(|i| format!("mock{}", i)).collect()
        }
        (_, list) => list.into_iter().map(str::to_string).collect(),
    };
    if addresses.is_empty() {
        return Err(BenchError::Configuration(format!(
            "instrument '{}' has no address",
            config.id
        )));
    }

    let mut links = Vec::with_capacity(addresses.len());
    for (index, address) in addresses.iter().enumerate() {
        let transport = open_transport(config, address).await?;
        let name = if addresses.len() > 1 {
            format!("{}/{}", config.id, index)
        } else {
            config.id.clone()
        };
        links.push(InstrumentLink::new(name, transport, link_config.clone()));
    }
    info!(device = %config.id, role = %config.role, model = %model, links = links.len(), "instrument connected");

    let device = match config.role {
        Role::Positioner => {
            let default_delay = if config.transport == TransportKind::Mock {
                Duration::ZERO
            } else {
                TesartRbd::new().init_delay()
            };
            let delay = config
                .init_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default_delay);
            let driver = TesartRbd::new().with_init_delay(delay);
            Device::Positioner(Positioner::new(&config.id, links, Box::new(driver)))
        }
        Role::Generator => {
            let link = single_link(config, links)?;
            Device::Generator(Generator::new(&config.id, link, Box::new(KeysightGen)))
        }
        Role::Analyzer => {
            let link = single_link(config, links)?;
            let driver: Box<dyn super::AnalyzerDriver> = match model.as_str() {
                "s50244" => Box::new(PlanarS50244),
                _ => Box::new(KeysightM9807A),
            };
            Device::Analyzer(NetworkAnalyzer::new(&config.id, link, driver))
        }
    };
    Ok(device)
}

fn single_link(config: &InstrumentConfig, mut links: Vec<InstrumentLink>) -> BenchResult<InstrumentLink> {
    if links.len() != 1 {
        return Err(BenchError::Configuration(format!(
            "{} '{}' takes exactly one address, got {}",
            config.role,
            config.id,
            links.len()
        )));
    }
    links
        .pop()
        .ok_or_else(|| BenchError::Configuration(format!("instrument '{}' has no address", config.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Capability, Settable};

    #[tokio::test]
    async fn test_build_mock_positioner_with_axes() {
        let mut config = InstrumentConfig::new("rbd", Role::Positioner, "tesart", TransportKind::Mock, "");
        config.mock_axes = 2;
        let device = build_device(&config).await.unwrap();
        match &device {
            Device::Positioner(p) => assert_eq!(p.axis_count(), 2),
            other => panic!("unexpected device {:?}", other),
        }
        assert!(device.supports(Capability::Stop));
    }

    #[tokio::test]
    async fn test_build_analyzer_models() {
        let config = InstrumentConfig::new("vna", Role::Analyzer, "S50244", TransportKind::Mock, "");
        let device = build_device(&config).await.unwrap();
        assert_eq!(device.model(), "s50244");
        assert!(!device.supports(Capability::Path));

        let config = InstrumentConfig::new("vna", Role::Analyzer, "m9807a", TransportKind::Mock, "");
        let device = build_device(&config).await.unwrap();
        assert!(device.supports(Capability::Path));
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let config = InstrumentConfig::new("gen", Role::Generator, "rohde", TransportKind::Mock, "");
        let err = build_device(&config).await.unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[tokio::test]
    async fn test_generator_rejects_multiple_addresses() {
        let config = InstrumentConfig::new("gen", Role::Generator, "keysight", TransportKind::Mock, "a;b");
        assert!(build_device(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_is_transport_error() {
        // Bind then drop a listener so the port is known to be closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = InstrumentConfig::new(
            "gen",
            Role::Generator,
            "keysight",
            TransportKind::Tcp,
            &format!("127.0.0.1:{}", port),
        );
        let err = build_device(&config).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }
}
