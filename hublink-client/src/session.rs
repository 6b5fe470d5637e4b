//! Framing and keep-alive bookkeeping over a split broker stream.
//!
//! The read half ([`Inbound`]) belongs to the worker while a session runs.
//! The write half ([`Outbound`]) is shared with API callers and also tracks
//! keep-alive, since every frame sent pushes the next ping deadline back.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{Connect, Packet, PubAck, Publish, Subscribe, SubscribeFilter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::error::{HelperError, Result};
use crate::options::{HelperSettings, PublishParams, Subscription};

/// Any bidirectional byte stream the helper can speak MQTT over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Read side of a session.
pub(crate) struct Inbound {
    reader: ReadHalf<BoxedStream>,
    rx_buffer: Box<[u8]>,
    pending: BytesMut,
    payload: Box<[u8]>,
    max_packet_size: usize,
}

impl Inbound {
    pub(crate) fn new(reader: ReadHalf<BoxedStream>, settings: &HelperSettings) -> Self {
        Self {
            reader,
            rx_buffer: vec![0; settings.rx_buffer_len].into_boxed_slice(),
            pending: BytesMut::with_capacity(settings.rx_buffer_len),
            payload: vec![0; settings.payload_buffer_len].into_boxed_slice(),
            max_packet_size: settings.max_packet_size,
        }
    }

    /// Read whatever the socket has into the decode buffer.
    ///
    /// Returns the number of bytes read, zero meaning the peer closed the
    /// stream. Safe to cancel: no bytes are lost if the future is dropped.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let n = self.reader.read(&mut self.rx_buffer).await?;
        self.pending.extend_from_slice(&self.rx_buffer[..n]);
        trace!("Read {} bytes, {} pending", n, self.pending.len());
        Ok(n)
    }

    /// Decode the next complete frame, or `None` if more bytes are needed.
    pub(crate) fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        match Packet::read(&mut self.pending, self.max_packet_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy an inbound payload into the staging buffer.
    ///
    /// The returned slice stays valid until the next call.
    pub(crate) fn stage_payload(&mut self, payload: &[u8]) -> Result<&[u8]> {
        let capacity = self.payload.len();
        if payload.len() > capacity {
            return Err(HelperError::PayloadTooLarge {
                len: payload.len(),
                capacity,
            });
        }

        self.payload[..payload.len()].copy_from_slice(payload);
        Ok(&self.payload[..payload.len()])
    }
}

/// Why a keep-alive check did not send a ping.
#[derive(Debug)]
pub(crate) enum LivenessError {
    /// The deadline has not been reached yet.
    NotYet,
    /// The previous ping was never answered.
    Unanswered,
    /// Sending the ping failed.
    Send(HelperError),
}

struct Liveness {
    keep_alive: Duration,
    last_sent: Instant,
    ping_outstanding: bool,
}

impl Liveness {
    fn new(keep_alive: u16) -> Self {
        Self {
            keep_alive: Duration::from_secs(u64::from(keep_alive)),
            last_sent: Instant::now(),
            ping_outstanding: false,
        }
    }

    fn enabled(&self) -> bool {
        !self.keep_alive.is_zero()
    }

    fn time_left(&self) -> Option<Duration> {
        if !self.enabled() {
            return None;
        }

        Some(self.keep_alive.saturating_sub(self.last_sent.elapsed()))
    }
}

/// Write side of a session.
pub(crate) struct Outbound {
    writer: WriteHalf<BoxedStream>,
    tx: BytesMut,
    max_packet_size: usize,
    send_timeout: Option<Duration>,
    last_pkid: u16,
    liveness: Liveness,
    /// Set once a write fails, since part of a frame may be on the wire.
    broken: bool,
}

impl Outbound {
    pub(crate) fn new(writer: WriteHalf<BoxedStream>, settings: &HelperSettings) -> Self {
        Self {
            writer,
            tx: BytesMut::with_capacity(settings.tx_buffer_len),
            max_packet_size: settings.max_packet_size,
            send_timeout: None,
            last_pkid: 0,
            liveness: Liveness::new(settings.keep_alive),
            broken: false,
        }
    }

    /// Bound every following write by `limit`.
    pub(crate) fn set_send_timeout(&mut self, limit: Option<Duration>) -> io::Result<()> {
        if limit.is_some_and(|d| d.is_zero()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send timeout must be non-zero",
            ));
        }

        self.send_timeout = limit;
        Ok(())
    }

    /// True once a write has failed. The stream can no longer be framed and
    /// the session has to end.
    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        if self.broken {
            return Err(HelperError::NotConnected);
        }

        self.tx.clear();
        packet.write(&mut self.tx, self.max_packet_size)?;

        let limit = self.send_timeout;
        let write = write_frame(&mut self.writer, &self.tx);
        let result = match limit {
            Some(limit) => timeout(limit, write)
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"))),
            None => write.await,
        };

        if let Err(e) = result {
            self.broken = true;
            return Err(e.into());
        }

        self.liveness.last_sent = Instant::now();
        Ok(())
    }

    fn next_pkid(&mut self) -> u16 {
        self.last_pkid = self.last_pkid.wrapping_add(1);
        if self.last_pkid == 0 {
            self.last_pkid = 1;
        }
        self.last_pkid
    }

    /// Send CONNECT. An absent user name leaves the login out entirely.
    pub(crate) async fn connect(&mut self, client_id: &str, user_name: Option<&str>) -> Result<()> {
        let mut connect = Connect::new(client_id);
        connect.keep_alive = self.liveness.keep_alive.as_secs() as u16;
        connect.clean_session = false;

        if let Some(user_name) = user_name {
            connect.set_login(user_name, "");
        }

        self.send(Packet::Connect(connect)).await?;
        self.liveness.ping_outstanding = false;

        debug!("CONNECT sent for client {}", client_id);

        Ok(())
    }

    /// Send PUBLISH and return its message id.
    pub(crate) async fn publish(&mut self, params: &PublishParams) -> Result<u16> {
        let pkid = match params.message_id {
            Some(id) => id,
            None => self.next_pkid(),
        };

        let mut publish = Publish::new(&params.topic, params.qos, params.payload.to_vec());
        publish.retain = params.retain;
        publish.pkid = pkid;

        self.send(Packet::Publish(publish)).await?;

        Ok(pkid)
    }

    /// Send one SUBSCRIBE covering every filter and return its message id.
    pub(crate) async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<u16> {
        let filters = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), s.qos));

        let mut subscribe = Subscribe::new_many(filters);
        subscribe.pkid = self.next_pkid();
        let pkid = subscribe.pkid;

        self.send(Packet::Subscribe(subscribe)).await?;

        Ok(pkid)
    }

    pub(crate) async fn send_publish_ack(&mut self, pkid: u16) -> Result<()> {
        self.send(Packet::PubAck(PubAck::new(pkid))).await
    }

    /// Send DISCONNECT and close the write direction.
    pub(crate) async fn disconnect(&mut self) -> Result<()> {
        self.send(Packet::Disconnect).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Time until the next ping is due, `None` when keep-alive is off.
    pub(crate) fn keepalive_time_left(&self) -> Option<Duration> {
        self.liveness.time_left()
    }

    /// Send PINGREQ if the keep-alive deadline has passed.
    pub(crate) async fn process_liveness(&mut self) -> std::result::Result<(), LivenessError> {
        match self.liveness.time_left() {
            Some(left) if left.is_zero() => {}
            _ => return Err(LivenessError::NotYet),
        }

        if self.liveness.ping_outstanding {
            return Err(LivenessError::Unanswered);
        }

        self.send(Packet::PingReq).await.map_err(LivenessError::Send)?;
        self.liveness.ping_outstanding = true;

        debug!("PINGREQ sent");

        Ok(())
    }

    pub(crate) fn ping_answered(&mut self) {
        self.liveness.ping_outstanding = false;
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
