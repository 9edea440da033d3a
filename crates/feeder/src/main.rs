mod bus;
mod concentrate;
mod config;
mod db;
mod device;
mod feed;
mod gate;
mod level;
mod measure;
mod outlet;
#[cfg(feature = "sim")]
#[cfg_attr(feature = "gpio", allow(dead_code))]
mod sim;
mod state;
mod tasks;
mod twin;
mod web;

#[cfg(not(any(feature = "sim", feature = "gpio")))]
compile_error!("build with either the `sim` or the `gpio` feature");

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bus::RegisterBus;
use config::Config;
use db::Db;
use device::{Device, TwinInbox};
use feed::{FeedController, FeedOptions};
use gate::SharedFlag;
use level::{LevelBank, ProbeSource};
use measure::Measurer;
use outlet::{OutletBank, Outlets, RelayDriver};
use state::{SharedState, SystemState, DEFAULT_MAX_LOG};
use tasks::Persister;
use twin::{ChannelEmitter, Outbound, TwinDocument};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "feeder.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(device = %cfg.device_id, config = %config_path, "feeder starting");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db.url).await?;
    db.migrate().await?;

    // ── Hardware facades ────────────────────────────────────────────
    // Bed outlets come from the restored snapshot (bedNum).
    let outlets = Arc::new(OutletBank::new(
        0,
        RelayDriver::new(&cfg.relay_map(), cfg.relays.active_low)?,
    ));
    let levels = Arc::new(LevelBank::new(cfg.levels.confirm));
    let (bus, probes) = hardware(&cfg, outlets.clone())?;

    // ── Controllers ─────────────────────────────────────────────────
    let (emitter, outbound) = ChannelEmitter::new();
    let emitter = Arc::new(emitter);
    let supply = SharedFlag::new(true);
    let feed = Arc::new(FeedController::new(
        outlets.clone(),
        levels.clone(),
        emitter.clone(),
        supply.reader(),
        FeedOptions {
            make_delay: cfg.make_delay,
        },
    ));
    let measurer = Arc::new(Measurer::new(feed.clone(), bus, emitter, supply));

    let shared = SystemState::shared(DEFAULT_MAX_LOG);
    let device = Arc::new(Device {
        feed,
        measurer,
        outlets,
        levels,
        shared: shared.clone(),
        expose_logs: cfg.web.expose_logs,
        set_clock: cfg.web.set_clock,
    });

    restore(&device, &db).await;
    shared
        .write()
        .await
        .record_operation("feeder started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let web_device = Arc::clone(&device);
    let (web_port, web_tls) = (cfg.web.port, cfg.web.tls.clone());
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_device, web_port, web_tls).await {
            error!(error = %format!("{e:#}"), "local api stopped");
        }
    });

    // ── Periodic tasks ──────────────────────────────────────────────
    let persister = Arc::new(Persister::new(device.clone(), db));
    let _tasks = tasks::spawn_all(device.clone(), probes, persister);

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = format!("hydro-feeder-{}", cfg.device_id);
    let mut mqttoptions = MqttOptions::new(client_id, cfg.mqtt.host.clone(), cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
    tokio::spawn(publish_outbound(
        outbound,
        client.clone(),
        cfg.device_id.clone(),
        shared.clone(),
    ));

    let desired_topic = twin::desired_topic(&cfg.device_id);
    let reported_topic = twin::reported_topic(&cfg.device_id);
    let mut inbox = TwinInbox::default();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_twin(&device, &mut inbox, &p.topic, &p.payload).await;
                // the reported state is restored once; later messages are our own reports
                if p.topic == reported_topic && !inbox.wants_reported() {
                    if let Err(e) = client.try_unsubscribe(reported_topic.as_str()) {
                        warn!(topic = %reported_topic, error = %e, "unsubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %cfg.mqtt.host, "mqtt connected");
                // The session is clean, so subscriptions are renewed on every connect.
                let mut topics = vec![desired_topic.as_str()];
                if inbox.wants_reported() {
                    topics.push(reported_topic.as_str());
                }
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        warn!(topic, error = %e, "subscribe failed");
                    }
                }
                shared.write().await.record_connection(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                shared.write().await.record_connection(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                {
                    let mut st = shared.write().await;
                    st.record_connection(false);
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Reload configuration and the local log saved by a previous run.
async fn restore(device: &Device, db: &Db) {
    match db.load_snapshot().await {
        Ok(Some(snapshot)) => {
            if let Err(e) = device.restore(snapshot).await {
                warn!(error = %format!("{e:#}"), "snapshot restored with errors");
            }
        }
        Ok(None) => info!("no saved snapshot, starting from defaults"),
        Err(e) => warn!(error = %format!("{e:#}"), "snapshot load failed"),
    }
    match db.load_log().await {
        Ok(entries) => {
            debug!(entries = entries.len(), "local log restored");
            device.shared.write().await.restore(entries);
        }
        Err(e) => warn!(error = %format!("{e:#}"), "local log load failed"),
    }
}

async fn handle_twin(device: &Device, inbox: &mut TwinInbox, topic: &str, payload: &[u8]) {
    let Some((_, side)) = twin::parse_twin_topic(topic) else {
        debug!(topic, "unhandled topic");
        return;
    };
    let doc: TwinDocument = match serde_json::from_slice(payload) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(topic, error = %e, "bad twin json");
            device
                .shared
                .write()
                .await
                .record_error(format!("bad twin json: {e}"));
            return;
        }
    };
    if !inbox.accept(side, &doc) {
        return;
    }
    if let Err(e) = device.apply_document(&doc, side).await {
        warn!(topic, error = %format!("{e:#}"), "twin document applied with errors");
    }
}

/// Drain controller output: journal lines go to the local log, everything
/// else is published.
async fn publish_outbound(
    mut rx: UnboundedReceiver<Outbound>,
    client: AsyncClient,
    device_id: String,
    shared: SharedState,
) {
    while let Some(msg) = rx.recv().await {
        if let Outbound::Journal(line) = &msg {
            shared.write().await.record_operation(line.clone());
            continue;
        }
        let Some(p) = twin::to_publish(&msg, &device_id) else {
            continue;
        };
        if let Err(e) = client
            .publish(p.topic.as_str(), QoS::AtLeastOnce, p.retain, p.payload)
            .await
        {
            warn!(topic = %p.topic, error = %e, "publish failed");
        }
    }
}

#[cfg(feature = "gpio")]
fn hardware(
    cfg: &Config,
    _outlets: Arc<dyn Outlets>,
) -> Result<(Arc<dyn RegisterBus>, Box<dyn ProbeSource>)> {
    let pins = |v: &[i64]| v.iter().map(|p| *p as u8).collect::<Vec<u8>>();
    let bus = bus::SerialBus::open(&cfg.serial.path, cfg.serial.baud)?;
    let probes = level::ProbeReader::new(&pins(&cfg.levels.feed_pins), &pins(&cfg.levels.seed_pins))?;
    info!(serial = %cfg.serial.path, "hardware ready");
    Ok((Arc::new(bus), Box::new(probes)))
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
fn hardware(
    _cfg: &Config,
    outlets: Arc<dyn Outlets>,
) -> Result<(Arc<dyn RegisterBus>, Box<dyn ProbeSource>)> {
    info!("no gpio support in this build, running against the simulator");
    let bus = sim::SimBus::new(outlets.clone(), 0.02);
    Ok((Arc::new(bus), Box::new(sim::TankSim::new(outlets))))
}
