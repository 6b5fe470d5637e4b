use std::fmt;

use rumqttc::mqttbytes::v4::ConnectReturnCode;

/// Reason a connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// Client initiated disconnect.
    ClientInitiated,

    /// The broker sent DISCONNECT.
    ServerInitiated,

    /// The broker rejected the CONNECT.
    ConnectionRefused(ConnectReturnCode),

    /// Connection lost (socket closed, reset or failed).
    ConnectionLost(String),

    /// A keep-alive ping could not be sent or was never answered.
    KeepAliveTimeout,

    /// The broker sent something the codec could not decode.
    ProtocolError(String),
}

/// Outcome reported with a PUBACK or SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    Success,
    /// At least one topic filter of a SUBACK was refused.
    Failure,
}

/// Errors reported through [`Callbacks::on_error`] that do not end the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorIndication {
    /// An inbound message did not fit the payload staging buffer and was
    /// dropped without acknowledgment.
    MessageTooLarge,
}

type ConnAckFn = Box<dyn Fn(ConnectReturnCode) + Send + Sync>;
type DisconnectFn = Box<dyn Fn(DisconnectReason) + Send + Sync>;
type PublishFn = Box<dyn Fn(&str, &[u8]) + Send + Sync>;
type AckFn = Box<dyn Fn(u16, AckResult) + Send + Sync>;
type PingRespFn = Box<dyn Fn() + Send + Sync>;
type ErrorFn = Box<dyn Fn(ErrorIndication) + Send + Sync>;

/// Application callbacks. Every slot is optional; events without a
/// registered callback are dropped silently.
///
/// Callbacks run on the connection worker and must not block.
#[derive(Default)]
pub struct Callbacks {
    on_connack: Option<ConnAckFn>,
    on_disconnect: Option<DisconnectFn>,
    on_publish: Option<PublishFn>,
    on_puback: Option<AckFn>,
    on_suback: Option<AckFn>,
    on_pingresp: Option<PingRespFn>,
    on_error: Option<ErrorFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connack(mut self, f: impl Fn(ConnectReturnCode) + Send + Sync + 'static) -> Self {
        self.on_connack = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// The payload slice borrows the staging buffer and is only valid for
    /// the duration of the call.
    pub fn on_publish(mut self, f: impl Fn(&str, &[u8]) + Send + Sync + 'static) -> Self {
        self.on_publish = Some(Box::new(f));
        self
    }

    pub fn on_puback(mut self, f: impl Fn(u16, AckResult) + Send + Sync + 'static) -> Self {
        self.on_puback = Some(Box::new(f));
        self
    }

    pub fn on_suback(mut self, f: impl Fn(u16, AckResult) + Send + Sync + 'static) -> Self {
        self.on_suback = Some(Box::new(f));
        self
    }

    pub fn on_pingresp(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_pingresp = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(ErrorIndication) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub(crate) fn connack(&self, code: ConnectReturnCode) {
        if let Some(cb) = &self.on_connack {
            cb(code);
        }
    }

    pub(crate) fn disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn publish(&self, topic: &str, payload: &[u8]) {
        if let Some(cb) = &self.on_publish {
            cb(topic, payload);
        }
    }

    pub(crate) fn puback(&self, id: u16, result: AckResult) {
        if let Some(cb) = &self.on_puback {
            cb(id, result);
        }
    }

    pub(crate) fn suback(&self, id: u16, result: AckResult) {
        if let Some(cb) = &self.on_suback {
            cb(id, result);
        }
    }

    pub(crate) fn pingresp(&self) {
        if let Some(cb) = &self.on_pingresp {
            cb();
        }
    }

    pub(crate) fn error(&self, indication: ErrorIndication) {
        if let Some(cb) = &self.on_error {
            cb(indication);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connack", &self.on_connack.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_publish", &self.on_publish.is_some())
            .field("on_puback", &self.on_puback.is_some())
            .field("on_suback", &self.on_suback.is_some())
            .field("on_pingresp", &self.on_pingresp.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_missing_callbacks_are_noops() {
        let callbacks = Callbacks::new();
        callbacks.connack(ConnectReturnCode::Success);
        callbacks.disconnect(DisconnectReason::ClientInitiated);
        callbacks.publish("a/b", b"payload");
        callbacks.puback(1, AckResult::Success);
        callbacks.suback(2, AckResult::Failure);
        callbacks.pingresp();
        callbacks.error(ErrorIndication::MessageTooLarge);
    }

    #[test]
    fn test_registered_callback_is_invoked() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let callbacks = Callbacks::new().on_puback(move |id, result| {
            assert_eq!(id, 7);
            assert_eq!(result, AckResult::Success);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        callbacks.puback(7, AckResult::Success);
        callbacks.suback(7, AckResult::Success);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_lists_registered_slots() {
        let callbacks = Callbacks::new().on_pingresp(|| {});
        let debug = format!("{:?}", callbacks);
        assert!(debug.contains("on_pingresp: true"));
        assert!(debug.contains("on_connack: false"));
    }
}
