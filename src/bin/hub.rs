//! A stand-in cloud hub for local runs: prints device events and serves twins
//! built from reported properties.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use devicelink::connection::{LinkInbound, LinkOutbound};
use devicelink::{
    DeviceEvent, DevicePath, LinkConfig, RelaySession, ReportedProperties, TwinDocument,
    connect_relay,
};
use futures::StreamExt;
use iot_gateway::config::GatewayConfig;
use moq_lite::{BroadcastConsumer, OriginProducer, Track};
use serde_json::{Map, Value, json};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(
        GatewayConfig::from_env()
            .context("invalid configuration")?
            .link,
    );

    println!("Hub connecting to relay at {}", config.relay_url);

    let RelaySession {
        session: _session,
        producer,
        consumer,
    } = connect_relay(config.relay_url.clone()).await?;
    let producer = Arc::new(producer);

    let device_root = format!("{}/", config.device_prefix);
    let mut announcements = consumer
        .with_root(&device_root)
        .ok_or_else(|| anyhow!("device prefix '{device_root}' not authorized"))?;

    println!("Waiting for devices...");

    loop {
        match announcements.announced().await {
            Some((path, Some(broadcast))) => {
                let device_id = path.to_string();
                if let Err(e) = DevicePath::validate_device_id(&device_id) {
                    eprintln!("[!] Ignoring broadcast: {e}");
                    continue;
                }
                println!("[+] Device online: {device_id}");

                let producer = Arc::clone(&producer);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Err(e) = run_device(&device_id, broadcast, &producer, &config).await {
                        eprintln!("[!] Device {device_id}: {e}");
                    }
                });
            }
            Some((path, None)) => {
                let device_id = path.to_string();
                println!("[-] Device offline: {device_id}");
            }
            None => {
                println!("Announcement stream closed");
                break;
            }
        }
    }

    Ok(())
}

async fn run_device(
    device_id: &str,
    broadcast: BroadcastConsumer,
    producer: &OriginProducer,
    config: &LinkConfig,
) -> Result<()> {
    let cloud_path = config.cloud_path(device_id).to_string();
    let mut cloud = producer
        .create_broadcast(&cloud_path)
        .ok_or_else(|| anyhow!("failed to create cloud broadcast at '{cloud_path}'"))?;
    let mut twin_track = LinkOutbound::new(cloud.create_track(Track::new(&config.twin_track)));

    let mut twin = Twin::new(device_id);
    twin_track.send(&twin.document())?;

    let mut events = Box::pin(
        LinkInbound::new(&broadcast, &config.events_track).decoded::<DeviceEvent>(),
    );
    let mut properties = Box::pin(
        LinkInbound::new(&broadcast, &config.properties_track).decoded::<ReportedProperties>(),
    );

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => println!(
                    "[RX {device_id}] {} ({}): {}",
                    event.message_id,
                    event.content_type,
                    String::from_utf8_lossy(&event.body),
                ),
                Some(Err(e)) => eprintln!("[!] Bad event from {device_id}: {e}"),
                None => break,
            },
            patch = properties.next() => match patch {
                Some(Ok(patch)) => match twin.apply(&patch.json) {
                    Ok(()) => {
                        twin_track.send(&twin.document())?;
                        println!("[TWIN {device_id}] version {}", twin.version);
                    }
                    Err(e) => eprintln!("[!] Rejected properties from {device_id}: {e}"),
                },
                Some(Err(e)) => eprintln!("[!] Bad properties from {device_id}: {e}"),
                None => break,
            },
        }
    }

    println!("[*] Device streams closed for {device_id}");
    Ok(())
}

/// Reported properties accumulated from patches, with a version bumped per patch.
struct Twin {
    device_id: String,
    reported: Map<String, Value>,
    version: u64,
}

impl Twin {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_owned(),
            reported: Map::new(),
            version: 1,
        }
    }

    fn apply(&mut self, patch: &str) -> Result<()> {
        let Value::Object(patch) = serde_json::from_str::<Value>(patch)? else {
            bail!("reported properties must be a JSON object");
        };
        merge(&mut self.reported, patch);
        self.version += 1;
        Ok(())
    }

    fn document(&self) -> TwinDocument {
        let json = json!({
            "deviceId": self.device_id,
            "properties": { "reported": self.reported },
            "version": self.version,
        });
        TwinDocument {
            device_id: self.device_id.clone(),
            json: json.to_string(),
            version: self.version,
        }
    }
}

/// JSON merge patch: nulls remove keys, objects merge recursively.
fn merge(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(&key);
            }
            Value::Object(inner) => match target.get_mut(&key) {
                Some(Value::Object(existing)) => merge(existing, inner),
                _ => {
                    let mut fresh = Map::new();
                    merge(&mut fresh, inner);
                    target.insert(key, Value::Object(fresh));
                }
            },
            other => {
                target.insert(key, other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twin_merges_patches() {
        let mut twin = Twin::new("dev1");
        twin.apply(r#"{"fw":"1.0","net":{"ssid":"lab","rssi":-40}}"#)
            .unwrap();
        twin.apply(r#"{"fw":"1.1","net":{"rssi":-52}}"#).unwrap();

        assert_eq!(twin.version, 3);
        assert_eq!(
            Value::Object(twin.reported.clone()),
            json!({ "fw": "1.1", "net": { "ssid": "lab", "rssi": -52 } })
        );

        let doc = twin.document();
        let parsed: Value = serde_json::from_str(&doc.json).unwrap();
        assert_eq!(parsed["deviceId"], "dev1");
        assert_eq!(parsed["version"], 3);
        assert_eq!(parsed["properties"]["reported"]["fw"], "1.1");
    }

    #[test]
    fn test_null_removes_property() {
        let mut twin = Twin::new("dev1");
        twin.apply(r#"{"fw":"1.0","debug":true}"#).unwrap();
        twin.apply(r#"{"debug":null}"#).unwrap();

        assert_eq!(Value::Object(twin.reported.clone()), json!({ "fw": "1.0" }));
    }

    #[test]
    fn test_non_object_patch_rejected() {
        let mut twin = Twin::new("dev1");
        assert!(twin.apply("[1,2]").is_err());
        assert!(twin.apply("not json").is_err());
        assert_eq!(twin.version, 1);
    }
}
