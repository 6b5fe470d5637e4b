//! Translates decoded broker packets into state changes and callbacks.

use hublink_core::ConnectionState;
use rumqttc::mqttbytes::v4::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::mqttbytes::QoS;
use tracing::{debug, error, info, warn};

use crate::error::HelperError;
use crate::event::{AckResult, DisconnectReason, ErrorIndication};
use crate::helper::Shared;
use crate::session::Inbound;

/// Handle one inbound packet. Returns a reason when the packet ends the
/// session.
pub(crate) async fn dispatch(
    shared: &Shared,
    inbound: &mut Inbound,
    packet: Packet,
) -> Option<DisconnectReason> {
    let callbacks = shared.callbacks();

    match packet {
        Packet::ConnAck(connack) => {
            debug!("CONNACK received, return code: {:?}", connack.code);

            if !shared.state.verify(ConnectionState::Connecting) {
                warn!("Ignoring CONNACK in state {}", shared.state.get());
                return None;
            }

            if connack.code != ConnectReturnCode::Success {
                error!("Connection was rejected with return code {:?}", connack.code);
                shared.state.set(ConnectionState::Disconnected);
                callbacks.connack(connack.code);
                return Some(DisconnectReason::ConnectionRefused(connack.code));
            }

            if let Err(e) = shared
                .state
                .transition(ConnectionState::Connecting, ConnectionState::Connected)
            {
                warn!("CONNACK raced with a state change: {}", e);
                return None;
            }

            info!("MQTT connection accepted by broker");
            callbacks.connack(connack.code);
            None
        }
        Packet::Disconnect => {
            debug!("DISCONNECT received from broker");
            shared.state.set(ConnectionState::Disconnected);
            Some(DisconnectReason::ServerInitiated)
        }
        Packet::Publish(publish) => {
            debug!(
                "PUBLISH received on {}, {} bytes, {:?}",
                publish.topic,
                publish.payload.len(),
                publish.qos
            );

            let payload = match inbound.stage_payload(&publish.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Dropping message on {}: {}", publish.topic, e);
                    callbacks.error(ErrorIndication::MessageTooLarge);
                    return None;
                }
            };

            match publish.qos {
                QoS::AtLeastOnce => {
                    let mut outbound = shared.outbound.lock().await;
                    let sent = match outbound.as_mut() {
                        Some(outbound) => outbound.send_publish_ack(publish.pkid).await,
                        None => Err(HelperError::NotConnected),
                    };
                    if let Err(e) = sent {
                        warn!("Failed to send PUBACK for message {}: {}", publish.pkid, e);
                        if shared.release_if_broken(&mut outbound) {
                            return Some(DisconnectReason::ConnectionLost(e.to_string()));
                        }
                    }
                }
                QoS::ExactlyOnce => {
                    debug!("QoS 2 message {} delivered without PUBREC", publish.pkid)
                }
                QoS::AtMostOnce => {}
            }

            callbacks.publish(&publish.topic, payload);
            None
        }
        Packet::PubAck(ack) => {
            debug!("PUBACK received for message {}", ack.pkid);
            callbacks.puback(ack.pkid, AckResult::Success);
            None
        }
        Packet::SubAck(ack) => {
            let result = if ack
                .return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
            {
                AckResult::Success
            } else {
                AckResult::Failure
            };

            debug!("SUBACK received for message {}: {:?}", ack.pkid, result);
            callbacks.suback(ack.pkid, result);
            None
        }
        Packet::PingResp => {
            debug!("PINGRESP received");
            if let Some(outbound) = shared.outbound.lock().await.as_mut() {
                outbound.ping_answered();
            }
            callbacks.pingresp();
            None
        }
        other => {
            debug!("Ignoring packet: {:?}", other);
            None
        }
    }
}
