use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio::signal;

use soil_matter_sensor::app;
use soil_matter_sensor::config::{Config, load_dotenv};
use soil_matter_sensor::fabric::FabricRuntime;
use soil_matter_sensor::fabric::services::KeyValueStore;
use soil_matter_sensor::matter;
use soil_matter_sensor::sensors::{SensorBridge, SimulatedProbe, SoilMoistureSensor};
use soil_matter_sensor::storage::{FileKvStore, bump_reboot_count};

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/soil-matter-sensor")
        .join("settings.json")
}

#[tokio::main]
async fn main() {
    init_logger();
    load_dotenv();
    info!("Starting Soil Matter Sensor");

    let config = Config::from_env();
    info!("Configuration loaded:");
    info!("  Device Name: {}", config.matter.device_name);
    info!("  Vendor ID: 0x{:04X}", config.matter.vendor_id);
    info!("  Product ID: 0x{:04X}", config.matter.product_id);
    info!("  Discriminator: {}", config.matter.discriminator);
    info!("  Max fabrics: {}", config.guard.max_fabrics);
    info!(
        "  Probe calibration: {} mV dry, {} mV wet",
        config.sensor.dry_millivolts, config.sensor.wet_millivolts
    );

    let kv_store: Arc<dyn KeyValueStore> = FileKvStore::new(settings_path());
    match bump_reboot_count(kv_store.as_ref()) {
        Ok(count) => info!("Boot #{count}"),
        Err(err) => log::error!("Failed to update reboot counter: {err}"),
    }

    let (events_tx, events_rx) = app::event_channel();

    let runtime = FabricRuntime::new(&config.guard, kv_store.clone(), events_tx.clone());

    // Shared measurement cell; written by the sampling task, read by the
    // cluster handler.
    let sensor = Arc::new(SoilMoistureSensor::new());
    let probe = Arc::new(SimulatedProbe::new(&config.sensor));
    let bridge = SensorBridge::new(probe, sensor.clone(), &config.sensor);
    let sensor_task = tokio::spawn(bridge.run());

    // SIGUSR1 presses the reset button, SIGUSR2 releases it.
    app::spawn_signal_listener(events_tx.clone());

    // Start Matter stack in a separate thread. Matter uses blocking I/O
    // internally with embassy, so we run it on a dedicated thread.
    let matter_config = config.matter.clone();
    let matter_sensor = sensor.clone();
    let matter_runtime = runtime.clone();
    let _matter_handle = std::thread::Builder::new()
        .name("matter-stack".into())
        .stack_size(550 * 1024) // 550KB stack for Matter operations (matches rs-matter examples)
        .spawn(move || {
            if let Err(e) = futures_lite::future::block_on(matter::run_matter_stack(
                &matter_config,
                matter_sensor,
                matter_runtime,
            )) {
                log::error!("Matter stack error: {:?}", e);
            }
        })
        .expect("Failed to spawn Matter thread");

    info!("Matter stack started on dedicated thread");
    info!("Soil Matter Sensor is running");
    info!("  - Press Ctrl+C to exit");
    info!("  - kill -USR1 <pid> holds the reset button, -USR2 releases it");

    let app_loop = app::run_app_loop(events_rx, events_tx.clone(), runtime.clone(), kv_store);
    tokio::pin!(app_loop);

    tokio::select! {
        _ = &mut app_loop => {
            // The loop only returns after a completed factory wipe.
            info!("Factory reset complete, restarting required");
            sensor_task.abort();
            std::process::exit(0);
        }
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => log::error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    }

    sensor_task.abort();

    info!("Soil Matter Sensor stopped");
}
