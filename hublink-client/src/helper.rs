use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use hublink_core::{ConnectionState, StateMachine};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connector::{Connector, Dialer, TlsDialer};
use crate::credentials::CredentialStore;
use crate::error::{HelperError, Result};
use crate::event::{Callbacks, DisconnectReason};
use crate::options::{ConnParams, HelperSettings, PublishParams, Subscription};
use crate::session::Outbound;
use crate::worker::{self, Start};

/// State shared between API callers and the connection worker.
pub(crate) struct Shared {
    pub(crate) state: StateMachine,
    callbacks: RwLock<Arc<Callbacks>>,
    pub(crate) outbound: Mutex<Option<Outbound>>,
    /// Wakes the worker so it re-checks the state.
    pub(crate) wake: Notify,
    disconnect_reported: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: StateMachine::new(),
            callbacks: RwLock::new(Arc::new(Callbacks::default())),
            outbound: Mutex::new(None),
            wake: Notify::new(),
            disconnect_reported: AtomicBool::new(true),
        }
    }

    pub(crate) fn callbacks(&self) -> Arc<Callbacks> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_callbacks(&self, callbacks: Callbacks) {
        *self.callbacks.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(callbacks);
    }

    /// Fire `on_disconnect` unless it already fired for this session.
    pub(crate) fn report_disconnect(&self, reason: DisconnectReason) {
        if self.disconnect_reported.swap(true, Ordering::AcqRel) {
            debug!("Disconnect already reported, dropping {:?}", reason);
            return;
        }

        self.callbacks().disconnect(reason);
    }

    /// Drop a write half whose last write failed and wake the worker, which
    /// then ends the session as lost. Returns true if it was dropped.
    pub(crate) fn release_if_broken(&self, outbound: &mut Option<Outbound>) -> bool {
        if !outbound.as_ref().is_some_and(Outbound::is_broken) {
            return false;
        }

        warn!("Outbound write failed, releasing the transport");
        outbound.take();
        self.wake.notify_one();
        true
    }
}

/// A managed MQTT connection to one broker.
///
/// All calls are checked against the connection state and fail with
/// [`HelperError::State`] when made at the wrong time. Protocol events are
/// delivered through the [`Callbacks`] passed to [`MqttHelper::init`] from a
/// background task started by [`MqttHelper::new`], which therefore has to be
/// called from within a tokio runtime.
pub struct MqttHelper {
    shared: Arc<Shared>,
    connector: Connector,
    start_tx: mpsc::Sender<Start>,
    session_slot: Arc<Mutex<()>>,
    worker: JoinHandle<()>,
}

impl MqttHelper {
    /// Create a helper that reaches the broker over TCP and TLS.
    pub fn new(settings: HelperSettings) -> Self {
        Self::with_dialer(settings, Arc::new(TlsDialer))
    }

    /// Create a helper that opens its transport through `dialer`.
    pub fn with_dialer(settings: HelperSettings, dialer: Arc<dyn Dialer>) -> Self {
        let shared = Arc::new(Shared::new());
        let (start_tx, start_rx) = mpsc::channel(1);
        let worker = tokio::spawn(worker::run(shared.clone(), start_rx));

        Self {
            shared,
            connector: Connector::new(settings, Arc::new(CredentialStore::new()), dialer),
            start_tx,
            session_slot: Arc::new(Mutex::new(())),
            worker,
        }
    }

    /// The credential store consulted when building TLS configurations.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        self.connector.credentials()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Register callbacks. Allowed before the first connection and between
    /// connections; replaces any callbacks registered earlier.
    pub fn init(&self, callbacks: Callbacks) -> Result<()> {
        self.shared
            .state
            .require(&[ConnectionState::Uninitialized, ConnectionState::Disconnected])?;

        self.shared.set_callbacks(callbacks);

        if self
            .shared
            .state
            .transition(ConnectionState::Uninitialized, ConnectionState::Disconnected)
            .is_ok()
        {
            debug!("MQTT helper initialized");
        }

        Ok(())
    }

    /// Open the transport and send CONNECT.
    ///
    /// Returns once the handshake is done and the worker has taken over;
    /// the broker's verdict arrives through `on_connack`.
    pub async fn connect(&self, params: &ConnParams) -> Result<()> {
        self.shared.state.require(&[ConnectionState::Disconnected])?;

        let slot = self.session_slot.clone().lock_owned().await;
        self.shared.state.require(&[ConnectionState::Disconnected])?;

        let handle = self.connector.build(params).await?;

        self.shared
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)?;

        let (inbound, outbound) = match self.connector.connect(&handle).await {
            Ok(halves) => halves,
            Err(e) => {
                self.shared.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.shared.outbound.lock().await = Some(outbound);
        self.shared.disconnect_reported.store(false, Ordering::Release);

        if self.start_tx.send(Start { inbound, slot }).await.is_err() {
            error!("Connection worker is gone");
            self.shared.outbound.lock().await.take();
            self.shared.disconnect_reported.store(true, Ordering::Release);
            self.shared.state.set(ConnectionState::Disconnected);
            return Err(HelperError::WorkerStopped);
        }

        info!(
            "Connecting to {} as {}",
            params.hostname(),
            params.device_id()
        );

        Ok(())
    }

    /// Send DISCONNECT and let the worker wind the session down.
    ///
    /// If DISCONNECT cannot be sent the session is torn down on the spot,
    /// `on_disconnect` fires with the failure and the error is returned.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)?;

        let sent = match self.shared.outbound.lock().await.as_mut() {
            Some(outbound) => outbound.disconnect().await,
            None => Err(HelperError::NotConnected),
        };

        if let Err(e) = sent {
            error!("Failed to disconnect: {}", e);
            if self
                .shared
                .state
                .transition(ConnectionState::Disconnecting, ConnectionState::Disconnected)
                .is_ok()
            {
                self.shared
                    .report_disconnect(DisconnectReason::ConnectionLost(e.to_string()));
            }
            self.shared.wake.notify_one();
            return Err(e);
        }

        debug!("DISCONNECT sent");
        self.shared.wake.notify_one();

        Ok(())
    }

    /// Subscribe to every filter in one SUBSCRIBE. Returns its message id.
    pub async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<u16> {
        self.shared.state.require(&[ConnectionState::Connected])?;

        for subscription in subscriptions {
            debug!("Subscribing to topic: {}", subscription.topic);
        }

        let mut outbound = self.shared.outbound.lock().await;
        let result = match outbound.as_mut() {
            Some(outbound) => outbound.subscribe(subscriptions).await,
            None => Err(HelperError::NotConnected),
        };
        self.shared.release_if_broken(&mut outbound);

        result
    }

    /// Publish a message. Returns the message id it was sent with.
    pub async fn publish(&self, params: &PublishParams) -> Result<u16> {
        self.shared.state.require(&[ConnectionState::Connected])?;

        let mut outbound = self.shared.outbound.lock().await;
        let result = match outbound.as_mut() {
            Some(outbound) => outbound.publish(params).await,
            None => Err(HelperError::NotConnected),
        };
        self.shared.release_if_broken(&mut outbound);
        drop(outbound);

        let id = result?;

        debug!("Published message {} to {}", id, params.topic);

        Ok(id)
    }

    /// Forget callbacks and release the transport. The helper can be
    /// initialized again afterwards.
    pub async fn deinit(&self) -> Result<()> {
        self.shared.state.require(&[ConnectionState::Disconnected])?;

        let _slot = self.session_slot.lock().await;
        self.shared
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Uninitialized)?;

        self.shared.set_callbacks(Callbacks::default());
        self.shared.outbound.lock().await.take();

        debug!("MQTT helper deinitialized");

        Ok(())
    }
}

impl Drop for MqttHelper {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TransportHandle;
    use crate::session::BoxedStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _handle: &TransportHandle) -> io::Result<BoxedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn helper() -> (MqttHelper, Arc<CountingDialer>) {
        let dialer = Arc::new(CountingDialer::default());
        let settings = HelperSettings::new().static_ip([127, 0, 0, 1].into());
        (MqttHelper::with_dialer(settings, dialer.clone()), dialer)
    }

    #[tokio::test]
    async fn test_calls_before_init_are_rejected() {
        let (helper, dialer) = helper();
        assert_eq!(helper.state(), ConnectionState::Uninitialized);

        let params = ConnParams::new("hub.example.com", "device-1");
        assert!(matches!(
            helper.connect(&params).await,
            Err(HelperError::State(_))
        ));
        assert!(matches!(helper.deinit().await, Err(HelperError::State(_))));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_twice_replaces_callbacks() {
        let (helper, _) = helper();
        helper.init(Callbacks::new()).unwrap();
        helper.init(Callbacks::new().on_pingresp(|| {})).unwrap();
        assert_eq!(helper.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_require_connected() {
        let (helper, dialer) = helper();
        helper.init(Callbacks::new()).unwrap();

        let err = helper
            .publish(&PublishParams::new("a/b", Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        match err {
            HelperError::State(e) => {
                assert_eq!(e.current, ConnectionState::Disconnected);
                assert_eq!(e.required, &[ConnectionState::Connected]);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(matches!(
            helper.subscribe(&[]).await,
            Err(HelperError::State(_))
        ));
        assert!(matches!(helper.disconnect().await, Err(HelperError::State(_))));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_reverts_state() {
        let (helper, dialer) = helper();
        helper.init(Callbacks::new()).unwrap();

        let err = helper
            .connect(&ConnParams::new("hub.example.com", "device-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HelperError::Connect(_)));
        assert_eq!(helper.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        helper.deinit().await.unwrap();
        assert_eq!(helper.state(), ConnectionState::Uninitialized);
    }
}
