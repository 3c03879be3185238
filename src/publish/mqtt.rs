//! MQTT transport: one QoS 1 publish per payload on a fixed topic.
//!
//! - `mqtt://host:port` plain TCP
//! - `mqtts://host:port` TLS, system roots unless a CA is configured
//!
//! Each connect builds a fresh rumqttc client whose event loop runs on a
//! driver thread. The link is usable once the broker's CONNACK arrives and
//! stops being usable as soon as the event loop reports an error.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Event, MqttOptions};

use super::{Link, Transport};

/// MQTT endpoint parsed from the publish URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `mqtt://host:port`, `mqtts://host:port`, `ssl://`, or a bare `host:port`.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder.trim_end_matches('/'))?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

pub(crate) fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// PEM material for MQTT over TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate; system roots when `None`.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Client cert and key must be given together.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<rumqttc::Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but the publish URL is not mqtts://"
                ));
            }
            return Ok(rumqttc::Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(rumqttc::Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(rumqttc::Transport::tls(ca, self.client_auth.clone(), None))
    }
}

/// Broker settings for [`MqttTransport`].
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMaterials,
    pub connect_timeout: Duration,
}

pub struct MqttTransport {
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Result<Self> {
        if settings.topic.trim().is_empty() {
            return Err(anyhow!("MQTT topic must not be empty"));
        }
        // Reject inconsistent TLS settings up front rather than on every reconnect.
        settings.tls.build_transport(&settings.endpoint)?;
        Ok(Self { settings })
    }

    fn options(&self) -> Result<MqttOptions> {
        let s = &self.settings;
        let mut options = MqttOptions::new(&s.client_id, &s.endpoint.host, s.endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if let Some(user) = &s.username {
            options.set_credentials(user, s.password.clone().unwrap_or_default());
        }
        options.set_transport(s.tls.build_transport(&s.endpoint)?);
        Ok(options)
    }
}

impl Transport for MqttTransport {
    fn describe(&self) -> String {
        let e = &self.settings.endpoint;
        let scheme = if e.use_tls { "mqtts" } else { "mqtt" };
        format!("{}://{}:{} topic={}", scheme, e.host, e.port, self.settings.topic)
    }

    fn connect(&mut self) -> Result<Box<dyn Link>> {
        let (client, mut connection) = Client::new(self.options()?, 10);
        let alive = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let driver_alive = alive.clone();
        let driver = std::thread::Builder::new()
            .name("mqtt-driver".to_string())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            driver_alive.store(true, Ordering::SeqCst);
                            let _ = ready_tx.try_send(Ok(()));
                        }
                        Ok(Event::Incoming(Packet::Disconnect(_))) => {
                            log::warn!("MQTT broker closed the session");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = ready_tx.try_send(Err(anyhow!("MQTT connection error: {}", e)));
                            break;
                        }
                    }
                }
                driver_alive.store(false, Ordering::SeqCst);
            })
            .context("failed to spawn MQTT driver thread")?;

        let mut link = MqttLink {
            client,
            topic: self.settings.topic.clone(),
            alive,
            driver: Some(driver),
        };
        match ready_rx.recv_timeout(self.settings.connect_timeout) {
            Ok(Ok(())) => Ok(Box::new(link)),
            Ok(Err(err)) => {
                link.close();
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                link.close();
                Err(anyhow!(
                    "no CONNACK from {} within {:?}",
                    self.describe(),
                    self.settings.connect_timeout
                ))
            }
        }
    }
}

struct MqttLink {
    client: Client,
    topic: String,
    alive: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl Link for MqttLink {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("MQTT connection lost"));
        }
        self.client
            .try_publish(self.topic.clone(), QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))
    }

    fn is_open(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.driver.take() {
            if self.alive.load(Ordering::SeqCst) {
                let _ = handle.join();
            }
        }
    }
}
