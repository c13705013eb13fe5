mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::FleetSim;
use telemetry_relay::envelope::{MsgId, MsgType, Reply, Request, ALL_DEVICES};

/// Parse `DEVICE_IDS` (comma-separated); blanks are skipped.
fn parse_device_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Replies the simulated fleet sends back for one request.
fn respond(fleet: &mut FleetSim, request: &Request) -> Vec<Reply> {
    if request.msg_type != MsgType::Request {
        return Vec::new();
    }

    match request.msg_id.as_str() {
        id if id == MsgId::ReportMeasurements.as_str() => {
            vec![Reply::new(MsgId::ReportMeasurements, ALL_DEVICES, fleet.report())]
        }
        id if id == MsgId::GetLogs.as_str() => fleet
            .log_dumps()
            .into_iter()
            .map(|(_, dump)| Reply::new(MsgId::GetLogs, "", dump))
            .collect(),
        id if id == MsgId::SetCommands.as_str() => {
            let applied = fleet.apply_commands(&request.device_id, &request.command);
            info!(device = %request.device_id, applied, commands = %request.command, "set commands");
            Vec::new()
        }
        id if id == MsgId::SendTelegram.as_str() => {
            // Message text rides in device_id, the level in command.
            info!(level = %request.command, "telegram: {}", request.device_id);
            Vec::new()
        }
        other => {
            debug!(msg_id = other, "unhandled request");
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = match env::var("RELAY_PORT") {
        Ok(p) => p
            .parse()
            .with_context(|| format!("RELAY_PORT is not a valid port: {p}"))?,
        Err(_) => 4222,
    };
    let channel = env::var("RELAY_CHANNEL").unwrap_or_else(|_| "nats_dialog".to_string());
    let device_ids =
        parse_device_ids(&env::var("DEVICE_IDS").unwrap_or_else(|_| "dev-1,dev-2".to_string()));

    let mut fleet = FleetSim::new(&device_ids);
    info!(devices = fleet.device_count(), %channel, "simulating fleet");

    let client_id = format!("relay-device-sim-{}", fastrand::u32(..));
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = eventloop.poll() => ev,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to broker");
                // Subscriptions do not survive a clean-session reconnect.
                client.subscribe(&channel, QoS::AtLeastOnce).await?;
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == channel => {
                // Replies (ours and other peers') do not parse as requests.
                let Ok(request) = serde_json::from_slice::<Request>(&p.payload) else {
                    continue;
                };
                for reply in respond(&mut fleet, &request) {
                    let payload = reply.encode()?;
                    if let Err(e) = client
                        .publish(&channel, QoS::AtLeastOnce, false, payload)
                        .await
                    {
                        warn!("publish error: {e}");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    info!("shutting down");
    if let Err(e) = client.disconnect().await {
        warn!("disconnect failed: {e}");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(msg_id: &str, device_id: &str, command: serde_json::Value) -> Request {
        Request::new(MsgType::Request, msg_id, device_id, command)
    }

    #[test]
    fn device_ids_are_trimmed_and_blanks_skipped() {
        assert_eq!(
            parse_device_ids(" dev-1, ,dev-2,,"),
            vec!["dev-1".to_string(), "dev-2".to_string()]
        );
        assert!(parse_device_ids("").is_empty());
    }

    #[test]
    fn report_request_yields_one_fleet_reply() {
        let mut fleet = FleetSim::new(&["a", "b"]);
        let replies = respond(&mut fleet, &Request::report_measurements());

        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.msg_type, MsgType::Reply);
        assert_eq!(reply.msg_id, "reportMeasurements");
        assert_eq!(reply.device_id, "all");
        assert_eq!(reply.payload.as_object().unwrap().len(), 2);
    }

    #[test]
    fn get_logs_yields_one_reply_per_device() {
        let mut fleet = FleetSim::new(&["a", "b", "c"]);
        let replies = respond(&mut fleet, &request("getLogs", "", json!("")));

        assert_eq!(replies.len(), 3);
        let first = replies[0].payload.as_str().unwrap();
        assert!(first.starts_with("/var/log/a.log\n"));
    }

    #[test]
    fn commands_and_telegrams_get_no_reply() {
        let mut fleet = FleetSim::new(&["a"]);
        assert!(respond(&mut fleet, &request("setCommands", "a", json!({"led": 1}))).is_empty());
        assert!(respond(&mut fleet, &request("sendTelegram", "hello", json!("INFO"))).is_empty());
        assert!(respond(&mut fleet, &request("unknown", "a", json!(0))).is_empty());
    }

    #[test]
    fn replies_are_not_answered() {
        let mut fleet = FleetSim::new(&["a"]);
        let mut req = Request::report_measurements();
        req.msg_type = MsgType::Reply;
        assert!(respond(&mut fleet, &req).is_empty());
    }

    #[test]
    fn reply_envelope_does_not_parse_as_request() {
        let reply = Reply::new(MsgId::ReportMeasurements, "all", json!({}));
        let raw = reply.encode().unwrap();
        assert!(serde_json::from_slice::<Request>(&raw).is_err());
    }
}
