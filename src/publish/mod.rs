//! Resilient delivery of occupancy payloads.
//!
//! The publisher thread owns the only connection. It moves through
//! `Disconnected -> Connecting -> Connected`, and any failure sends it to
//! `Backoff`, from which it retries after an exponentially growing delay.
//! Payloads that arrive while not connected are dropped and counted.

mod backoff;
mod mqtt;
mod outbox;
mod payload;
mod publisher;
mod tcp;

use anyhow::Result;
use std::time::Duration;

pub use backoff::Backoff;
pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttSettings, MqttTransport, TlsMaterials};
pub use outbox::{OfferOutcome, Outbox};
pub use payload::{OutgoingPayload, SegmentRecord};
pub use publisher::{ConnectionState, Publisher, PublisherSettings, PublisherStats};
pub use tcp::TcpTransport;

/// Something the publisher can (re)connect to.
pub trait Transport: Send {
    /// Human-readable target for logs.
    fn describe(&self) -> String;

    /// Open a new link. Must give up within the transport's connect timeout.
    fn connect(&mut self) -> Result<Box<dyn Link>>;
}

/// An open connection owned by the publisher loop.
pub trait Link: Send {
    /// Deliver one serialized payload. Must give up within the send timeout.
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// False once the peer has closed the connection.
    fn is_open(&mut self) -> bool {
        true
    }

    fn close(&mut self);
}

/// Options needed to build a transport from a publish URL.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub url: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMaterials,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

/// `mqtt://` and `mqtts://` select MQTT; `tcp://host:port` or a bare
/// `host:port` select newline-delimited JSON over TCP.
pub fn transport_from_url(options: &TransportOptions) -> Result<Box<dyn Transport>> {
    let url = options.url.trim();
    if url.starts_with("mqtt://") || url.starts_with("mqtts://") || url.starts_with("ssl://") {
        let endpoint = parse_mqtt_endpoint(url)?;
        let transport = MqttTransport::new(MqttSettings {
            endpoint,
            topic: options.topic.clone(),
            client_id: options.client_id.clone(),
            username: options.username.clone(),
            password: options.password.clone(),
            tls: options.tls.clone(),
            connect_timeout: options.connect_timeout,
        })?;
        return Ok(Box::new(transport));
    }

    let addr = match url.split_once("://") {
        Some(("tcp", rest)) => rest.trim_end_matches('/'),
        Some((scheme, _)) => return Err(anyhow::anyhow!("unsupported publish scheme: {}", scheme)),
        None => url,
    };
    mqtt::split_host_port(addr)?;
    Ok(Box::new(TcpTransport::new(
        addr,
        options.connect_timeout,
        options.send_timeout,
    )))
}
