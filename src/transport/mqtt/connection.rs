//! Pure connection configuration for the rumqttc binding
//!
//! This module contains pure functions for broker address parsing and for
//! translating [`ResolvedOptions`] into `rumqttc` options.

use crate::transport::{ResolvedOptions, TransportError};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::time::Duration;
use url::Url;

/// Default WebSocket path, matching what browser MQTT clients use
pub const DEFAULT_WS_PATH: &str = "/mqtt";

/// Largest packet accepted in either direction
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Wire flavour selected by the broker URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// `mqtt://` or `tcp://`
    Tcp,
    /// `mqtts://` or `ssl://`
    Tls,
    Ws,
    Wss,
}

impl BrokerScheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Self::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Tcp => 1883,
            Self::Tls => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Tls | Self::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

/// Parsed broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    /// Only meaningful for WebSocket schemes
    pub path: String,
    /// Credentials embedded as `user:pass@` in the URL
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerAddress {
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidBrokerUrl(broker_url.to_string());

        let url = Url::parse(broker_url.trim()).map_err(|_| invalid())?;
        let scheme = BrokerScheme::parse(url.scheme()).ok_or_else(invalid)?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(invalid)?;
        let port = url.port().unwrap_or(scheme.default_port());

        let path = match url.path() {
            "" | "/" => DEFAULT_WS_PATH.to_string(),
            other => other.to_string(),
        };

        let username = Some(url.username())
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(Self {
            scheme,
            host,
            port,
            path,
            username,
            password,
        })
    }

    /// Host string in the form rumqttc expects for this scheme
    ///
    /// WebSocket transports take the full URL; TCP transports take the bare host.
    pub fn connect_host(&self) -> String {
        match self.scheme {
            BrokerScheme::Ws => format!("ws://{}:{}{}", self.host, self.port, self.path),
            BrokerScheme::Wss => format!("wss://{}:{}{}", self.host, self.port, self.path),
            BrokerScheme::Tcp | BrokerScheme::Tls => self.host.clone(),
        }
    }

    /// Address with any credentials stripped, for logs
    pub fn display_url(&self) -> String {
        let scheme = match self.scheme {
            BrokerScheme::Tcp => "mqtt",
            BrokerScheme::Tls => "mqtts",
            BrokerScheme::Ws => "ws",
            BrokerScheme::Wss => "wss",
        };
        if self.scheme.is_websocket() {
            format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }
}

/// Pure function to configure rumqttc options from a broker address and options
pub fn configure_mqtt_options(
    address: &BrokerAddress,
    options: &ResolvedOptions,
) -> Result<MqttOptions, TransportError> {
    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), address.connect_host(), address.port);

    mqtt_options.set_clean_session(options.clean_session);

    if !options.keep_alive.is_zero() && options.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidOptions(
            "keep alive must be zero or at least one second".to_string(),
        ));
    }
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    // Explicit credentials win over ones embedded in the URL
    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    } else if let Some(username) = &address.username {
        let password = address.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    if let Some(transport) = select_transport(address, options)? {
        mqtt_options.set_transport(transport);
    }

    Ok(mqtt_options)
}

/// Pick the rumqttc transport for the scheme; `None` means plain TCP
fn select_transport(
    address: &BrokerAddress,
    options: &ResolvedOptions,
) -> Result<Option<RumqttcTransport>, TransportError> {
    let tls_config = match &options.ca_file {
        Some(path) if address.scheme.is_secure() => {
            let ca = std::fs::read(path).map_err(|e| {
                TransportError::InvalidOptions(format!(
                    "cannot read CA file {}: {e}",
                    path.display()
                ))
            })?;
            Some(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            })
        }
        _ => None,
    };

    let transport = match (address.scheme, tls_config) {
        (BrokerScheme::Tcp, _) => None,
        (BrokerScheme::Tls, Some(config)) => Some(RumqttcTransport::tls_with_config(config)),
        (BrokerScheme::Tls, None) => Some(RumqttcTransport::tls_with_default_config()),
        (BrokerScheme::Ws, _) => Some(RumqttcTransport::Ws),
        (BrokerScheme::Wss, Some(config)) => Some(RumqttcTransport::wss_with_config(config)),
        (BrokerScheme::Wss, None) => Some(RumqttcTransport::wss_with_default_config()),
    };

    Ok(transport)
}
