//! In-memory broker harness shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use hublink_client::{
    AckResult, BoxedStream, Callbacks, ConnParams, ConnectReturnCode, ConnectionState, Dialer,
    DisconnectReason, ErrorIndication, HelperSettings, MqttHelper, TransportHandle,
};
use rumqttc::mqttbytes::v4::{ConnAck, Packet};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const MAX_PACKET: usize = 1024 * 1024;
pub const WAIT: Duration = Duration::from_secs(60);

/// Ordered record of frames written by the client and callbacks fired.
pub type Log = Arc<Mutex<Vec<String>>>;

/// Everything the callbacks report, in the order they fired.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConnAck(ConnectReturnCode),
    Disconnect(DisconnectReason),
    Publish(String, Vec<u8>),
    PubAck(u16, AckResult),
    SubAck(u16, AckResult),
    PingResp,
    Error(ErrorIndication),
}

pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    pub async fn next(&mut self) -> Event {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a callback")
            .expect("callbacks dropped")
    }

    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Callbacks forwarding every event into a channel. `on_publish` also
/// appends to `log` when one is given.
pub fn recording_callbacks(log: Option<Log>) -> (Callbacks, Events) {
    let (tx, rx) = mpsc::unbounded_channel();

    let connack = tx.clone();
    let disconnect = tx.clone();
    let publish = tx.clone();
    let puback = tx.clone();
    let suback = tx.clone();
    let pingresp = tx.clone();
    let error = tx;

    let callbacks = Callbacks::new()
        .on_connack(move |code| {
            let _ = connack.send(Event::ConnAck(code));
        })
        .on_disconnect(move |reason| {
            let _ = disconnect.send(Event::Disconnect(reason));
        })
        .on_publish(move |topic, payload| {
            if let Some(log) = &log {
                log.lock().unwrap().push("on_publish".to_string());
            }
            let _ = publish.send(Event::Publish(topic.to_string(), payload.to_vec()));
        })
        .on_puback(move |id, result| {
            let _ = puback.send(Event::PubAck(id, result));
        })
        .on_suback(move |id, result| {
            let _ = suback.send(Event::SubAck(id, result));
        })
        .on_pingresp(move || {
            let _ = pingresp.send(Event::PingResp);
        })
        .on_error(move |indication| {
            let _ = error.send(Event::Error(indication));
        });

    (callbacks, Events { rx })
}

/// Dialer handing the broker end of an in-memory pipe to the test.
pub struct DuplexDialer {
    brokers: mpsc::UnboundedSender<DuplexStream>,
    log: Option<Log>,
    writes_fail: Arc<AtomicBool>,
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(&self, _handle: &TransportHandle) -> io::Result<BoxedStream> {
        let (client, broker) = duplex(64 * 1024);
        self.brokers
            .send(broker)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no broker"))?;

        Ok(Box::new(Tap {
            inner: client,
            log: self.log.clone(),
            writes_fail: self.writes_fail.clone(),
        }))
    }
}

/// Logs the packet type of every frame the client writes, and fails writes
/// with `BrokenPipe` while `writes_fail` is set.
struct Tap {
    inner: DuplexStream,
    log: Option<Log>,
    writes_fail: Arc<AtomicBool>,
}

impl AsyncRead for Tap {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tap {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }

        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let (Poll::Ready(Ok(n)), Some(log)) = (&result, &self.log) {
            if *n > 0 {
                log.lock().unwrap().push(format!("tx:{:02x}", buf[0] & 0xf0));
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// The broker side of one connection.
pub struct FakeBroker {
    stream: DuplexStream,
    buf: BytesMut,
}

impl FakeBroker {
    pub async fn recv(&mut self) -> Packet {
        timeout(WAIT, async {
            loop {
                if !self.buf.is_empty() {
                    match Packet::read(&mut self.buf, MAX_PACKET) {
                        Ok(packet) => return packet,
                        Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                        Err(e) => panic!("client sent garbage: {:?}", e),
                    }
                }

                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.expect("broker read");
                assert!(n > 0, "client closed the stream");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        packet.write(&mut out, MAX_PACKET).expect("encode");
        self.send_raw(&out).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("broker write");
    }

    /// Wait for the client to close its side of the pipe.
    pub async fn expect_closed(&mut self) {
        timeout(WAIT, async {
            let mut chunk = [0u8; 4096];
            loop {
                match self.stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                }
            }
        })
        .await
        .expect("client never closed the stream")
    }
}

pub struct Harness {
    pub helper: MqttHelper,
    pub events: Events,
    brokers: mpsc::UnboundedReceiver<DuplexStream>,
    writes_fail: Arc<AtomicBool>,
}

impl Harness {
    pub fn new(settings: HelperSettings) -> Self {
        Self::build(settings, None)
    }

    /// Like [`Harness::new`], with client writes and `on_publish` calls
    /// recorded in `log`.
    pub fn with_log(settings: HelperSettings, log: Log) -> Self {
        Self::build(settings, Some(log))
    }

    fn build(settings: HelperSettings, log: Option<Log>) -> Self {
        let (brokers_tx, brokers) = mpsc::unbounded_channel();
        let writes_fail = Arc::new(AtomicBool::new(false));
        let dialer = DuplexDialer {
            brokers: brokers_tx,
            log: log.clone(),
            writes_fail: writes_fail.clone(),
        };
        let helper = MqttHelper::with_dialer(settings, Arc::new(dialer));
        let (callbacks, events) = recording_callbacks(log);
        helper.init(callbacks).expect("init");

        Self {
            helper,
            events,
            brokers,
            writes_fail,
        }
    }

    /// Make every client write fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }

    /// Connect and take the broker end, leaving the CONNECT unread.
    pub async fn dial(&mut self) -> FakeBroker {
        self.helper.connect(&params()).await.expect("connect");
        assert_eq!(self.helper.state(), ConnectionState::Connecting);

        let stream = self.brokers.try_recv().expect("helper did not dial");
        FakeBroker {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Connect and complete the handshake.
    pub async fn connect(&mut self) -> FakeBroker {
        let mut broker = self.dial().await;

        match broker.recv().await {
            Packet::Connect(connect) => assert_eq!(connect.client_id, "device-1"),
            other => panic!("expected CONNECT, got {:?}", other),
        }

        broker
            .send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
            .await;
        assert_eq!(
            self.events.next().await,
            Event::ConnAck(ConnectReturnCode::Success)
        );
        assert_eq!(self.helper.state(), ConnectionState::Connected);

        broker
    }

    pub fn dials_pending(&mut self) -> bool {
        !self.brokers.is_empty()
    }
}

pub fn params() -> ConnParams {
    ConnParams::new("hub.example.com", "device-1")
}

/// Settings that never touch DNS.
pub fn settings() -> HelperSettings {
    HelperSettings::new()
        .static_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .keep_alive(0)
}
