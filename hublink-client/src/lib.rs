//! Hublink MQTT helper
//!
//! A managed MQTT 3.1.1 connection to a single broker over TLS. The helper
//! owns the connection state machine, a background worker that reads the
//! socket and keeps the connection alive, and the translation of broker
//! packets into application callbacks.
//!
//! # Example
//!
//! ```no_run
//! use hublink_client::{Callbacks, ConnParams, HelperSettings, MqttHelper, PublishParams, QoS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let helper = MqttHelper::new(HelperSettings::new().keep_alive(60));
//!
//!     helper.init(
//!         Callbacks::new()
//!             .on_connack(|code| println!("CONNACK: {:?}", code))
//!             .on_puback(|id, result| println!("PUBACK {}: {:?}", id, result)),
//!     )?;
//!
//!     helper
//!         .connect(&ConnParams::new("hub.example.com", "device-1"))
//!         .await?;
//!
//!     // Once on_connack reported success:
//!     let params = PublishParams::new("devices/device-1/messages", "hello").qos(QoS::AtLeastOnce);
//!     helper.publish(&params).await?;
//!
//!     helper.disconnect().await?;
//!
//!     Ok(())
//! }
//! ```

mod connector;
mod credentials;
mod dispatch;
mod error;
mod event;
mod helper;
mod options;
mod resolver;
mod session;
mod tls;
mod worker;

pub use connector::{Dialer, TlsDialer, TransportHandle};
pub use credentials::{CredentialKind, CredentialStore, SecTag};
pub use error::{HelperError, Result};
pub use event::{AckResult, Callbacks, DisconnectReason, ErrorIndication};
pub use helper::MqttHelper;
pub use options::{ConnParams, HelperSettings, Provisioning, PublishParams, Subscription};
pub use session::{BoxedStream, Stream};

pub use hublink_core::{ConnectionState, StateError};
pub use rumqttc::mqttbytes::v4::ConnectReturnCode;
pub use rumqttc::mqttbytes::QoS;
