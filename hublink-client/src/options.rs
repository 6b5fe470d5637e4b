use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::mqttbytes::QoS;

use crate::credentials::SecTag;

/// PEM material installed into the credential store on first connect.
#[derive(Debug, Clone)]
pub struct Provisioning {
    pub ca_certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub device_certificate: Vec<u8>,
}

/// Settings fixed for the lifetime of a helper instance.
#[derive(Debug, Clone)]
pub struct HelperSettings {
    pub(crate) port: u16,
    pub(crate) static_ip: Option<IpAddr>,
    pub(crate) allow_ipv6: bool,
    pub(crate) sec_tag: SecTag,
    pub(crate) secondary_sec_tag: Option<SecTag>,
    pub(crate) native_tls: bool,
    pub(crate) provisioning: Option<Provisioning>,
    pub(crate) rx_buffer_len: usize,
    pub(crate) tx_buffer_len: usize,
    pub(crate) payload_buffer_len: usize,
    pub(crate) max_packet_size: usize,
    pub(crate) keep_alive: u16,
    pub(crate) connect_timeout_secs: u64,
    pub(crate) send_timeout_secs: Option<u64>,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            port: 8883,
            static_ip: None,
            allow_ipv6: false,
            sec_tag: SecTag(10),
            secondary_sec_tag: None,
            native_tls: false,
            provisioning: None,
            rx_buffer_len: 1024,
            tx_buffer_len: 1024,
            payload_buffer_len: 2048,
            max_packet_size: 1024 * 1024,
            keep_alive: 60,
            connect_timeout_secs: 30,
            send_timeout_secs: Some(60),
        }
    }
}

impl HelperSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker port attached to every resolved address.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connect to this address instead of resolving the hostname.
    ///
    /// The hostname is still used as the TLS server name.
    pub fn static_ip(mut self, ip: IpAddr) -> Self {
        self.static_ip = Some(ip);
        self
    }

    /// Fall back to an IPv6 address when the broker has no IPv4 address.
    pub fn allow_ipv6(mut self, allow: bool) -> Self {
        self.allow_ipv6 = allow;
        self
    }

    /// Set the primary credential tag.
    pub fn sec_tag(mut self, tag: SecTag) -> Self {
        self.sec_tag = tag;
        self
    }

    /// Set an additional credential tag consulted after the primary one.
    pub fn secondary_sec_tag(mut self, tag: SecTag) -> Self {
        self.secondary_sec_tag = Some(tag);
        self
    }

    /// Trust the bundled Mozilla root store next to the provisioned CAs.
    pub fn native_tls(mut self, enabled: bool) -> Self {
        self.native_tls = enabled;
        self
    }

    /// Install these credentials under the primary tag before the first
    /// connection.
    pub fn provisioning(mut self, provisioning: Provisioning) -> Self {
        self.provisioning = Some(provisioning);
        self
    }

    /// Set the socket read chunk size and the initial transmit buffer
    /// capacity.
    ///
    /// The transmit buffer grows to fit larger frames. Outbound frames are
    /// bounded by [`HelperSettings::max_packet_size`], not by `tx_len`.
    pub fn buffers(mut self, rx_len: usize, tx_len: usize) -> Self {
        self.rx_buffer_len = rx_len;
        self.tx_buffer_len = tx_len;
        self
    }

    /// Set the capacity of the inbound payload staging buffer. Inbound
    /// messages larger than this are rejected.
    pub fn payload_buffer_len(mut self, len: usize) -> Self {
        self.payload_buffer_len = len;
        self
    }

    /// Set the largest frame the codec accepts in either direction.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the keep-alive interval in seconds. Zero disables pings.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the TCP connect timeout in seconds.
    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Bound every outbound write, or `None` to let writes block.
    pub fn send_timeout(mut self, seconds: Option<u64>) -> Self {
        self.send_timeout_secs = seconds;
        self
    }

    pub(crate) fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn send_timeout_duration(&self) -> Option<Duration> {
        self.send_timeout_secs.map(Duration::from_secs)
    }
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub(crate) hostname: String,
    pub(crate) device_id: String,
    pub(crate) user_name: String,
}

impl ConnParams {
    /// `device_id` is sent as the MQTT client identifier.
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            user_name: String::new(),
        }
    }

    /// Set the user name. An empty user name is not sent at all.
    pub fn user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct PublishParams {
    pub(crate) topic: String,
    pub(crate) payload: Bytes,
    pub(crate) qos: QoS,
    pub(crate) retain: bool,
    pub(crate) message_id: Option<u16>,
}

impl PublishParams {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            message_id: None,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Use this message id instead of the next one from the session counter.
    pub fn message_id(mut self, id: u16) -> Self {
        self.message_id = Some(id);
        self
    }
}

/// A topic filter to subscribe to.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}
