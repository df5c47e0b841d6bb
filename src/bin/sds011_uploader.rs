use std::env;
use std::process;

use anyhow::Context;
use log::{error, info};

use sds011_uploader::config::app;
use sds011_uploader::*;

fn open_sensor(config: &Config) -> anyhow::Result<Sds011<serial::SystemPort>> {
    info!("Attempting to open device at path: {}", config.device_path.display());
    let mut sensor = Sds011::open(&config.device_path, config.serial_timeout)
        .with_context(|| format!("cannot open {}", config.device_path.display()))?;
    sensor.set_frame_timeout(config.serial_timeout);
    sensor.wake().context("sensor did not wake up")?;
    sensor.set_report_mode(config.report_mode)?;
    sensor.set_duty_cycle(config.duty_cycle())?;
    sensor.set_frame_timeout(config.frame_timeout());
    info!(
        "Configured device: {:?} mode, duty cycle {} min",
        config.report_mode,
        config.duty_cycle()
    );
    Ok(sensor)
}

fn open_store(config: &Config) -> anyhow::Result<Box<dyn Store>> {
    let store: Box<dyn Store> = match &config.backend {
        Backend::Firestore {
            credentials,
            project,
        } => Box::new(
            FirestoreStore::connect(
                credentials,
                project.as_deref(),
                &config.collection,
                config.http_timeout,
            )
            .with_context(|| format!("cannot use credentials {}", credentials.display()))?,
        ),
        Backend::Emulator { host, project } => Box::new(FirestoreStore::emulator(
            host,
            project,
            &config.collection,
            config.http_timeout,
        )),
        Backend::Csv(path) => Box::new(
            CsvStore::append(path).with_context(|| format!("cannot open {}", path.display()))?,
        ),
    };
    Ok(store)
}

fn run() -> anyhow::Result<()> {
    let matches = app().get_matches();
    let config = Config::from_matches(&matches, |name| env::var(name).ok())?;

    let store = open_store(&config)?;
    let sensor = open_sensor(&config)?;

    let mut sampler = Sampler::from_config(&config, sensor, store, SystemClock)?;
    let count = sampler.run()?;
    info!("uploaded {} readings", count);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        error!("{:#}", err);
        process::exit(1);
    }
}
