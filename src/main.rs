use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::Builder;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

use rtu_outputs::config::Config;
use rtu_outputs::io::gpio::registry::GPIORegistry;
use rtu_outputs::io::gpio::select_backend;
use rtu_outputs::io::live_data::StatusReport;
use rtu_outputs::logging::{self, LoggingHandle, ReloadLogLevelError};
use rtu_outputs::output::driver::OutputDriver;
use rtu_outputs::output::interlock::InterlockRegistry;
use rtu_outputs::output::OutputConfig;
use rtu_outputs::persistence::database::ActuatorDatabase;
use rtu_outputs::persistence::{ActuatorStateRow, ConfiguredOutputs, ConflictChecker};
use rtu_outputs::time_util::mytime::{RealTimeProvider, TimeProvider};

const CONFIG_FILE: &str = "rtu_outputs.toml";
const PERSIST_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    println!("Preparing...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_FILE.to_owned());
    let config = match read_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    let logging_handle = match logging::init_logging() {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config, &logging_handle) {
        error!("{}", err);
        // Flush the non-blocking writer before exiting.
        drop(logging_handle);
        std::process::exit(1);
    }
}

fn read_config(path: &str) -> Result<Config, String> {
    let config = fs::read_to_string(path).map_err(|err| format!("Unable to read config file {}: {}", path, err))?;
    toml::from_str(&config).map_err(|err| format!("Error reading config file {}: {}", path, err))
}

fn run(config: Config, logging_handle: &LoggingHandle<EnvFilter, impl Subscriber>) -> Result<(), String> {
    let rt = Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .enable_io()
        .build()
        .map_err(|err| format!("Failed to build runtime: {}", err))?;

    let gpio_config = config.get_gpio();
    let backend = select_backend(gpio_config).map_err(|err| format!("No GPIO backend: {}", err))?;
    let gpio = Arc::new(GPIORegistry::new(backend, gpio_config.chip(), gpio_config.max_pins()));
    gpio.init().map_err(|err| format!("Failed to initialise {} GPIO: {}", gpio.backend_name(), err))?;

    let interlocks = Arc::new(InterlockRegistry::new(
        config.get_interlock().max_groups(),
        config.get_interlock().overflow(),
    ));
    let clock: Arc<dyn TimeProvider> = Arc::new(RealTimeProvider::default());

    let database = match config.get_database() {
        Some(db_config) => Some(
            rt.block_on(ActuatorDatabase::open(db_config.get_path()))
                .map_err(|err| format!("Failed to open database {}: {}", db_config.get_path(), err))?,
        ),
        None => None,
    };

    let drivers = rt.block_on(create_drivers(&config, database.as_ref(), &gpio, &interlocks, &clock))?;
    if drivers.is_empty() {
        warn!("No outputs configured");
    }

    let should_exit = Arc::new(AtomicBool::new(false));
    {
        let should_exit = should_exit.clone();
        ctrlc::set_handler(move || {
            println!("Received termination signal.");
            should_exit.store(true, Ordering::Relaxed);
        })
        .map_err(|err| format!("Failed to attach kill handler: {}", err))?;
    }

    info!("Beginning control loop with {} outputs", drivers.len());
    rt.block_on(control_loop(&config, database.as_ref(), &drivers, &clock, &should_exit, logging_handle));

    info!("Stopping safely...");
    for driver in &drivers {
        if let Err(err) = driver.shutdown() {
            error!("{}: failed to switch off: {}", driver.name(), err);
        }
    }
    if let Some(db) = &database {
        rt.block_on(persist_state(db, &drivers, &clock));
        rt.block_on(db.pool().close());
    }
    // Dropping a driver releases its pin.
    drop(drivers);
    gpio.shutdown();
    rt.shutdown_timeout(Duration::from_secs(1));
    info!("Stopped safely.");
    Ok(())
}

async fn create_drivers(
    config: &Config,
    database: Option<&ActuatorDatabase>,
    gpio: &Arc<GPIORegistry>,
    interlocks: &Arc<InterlockRegistry>,
    clock: &Arc<dyn TimeProvider>,
) -> Result<Vec<Arc<OutputDriver>>, String> {
    let outputs: Vec<OutputConfig> = match database {
        Some(db) => db
            .list_actuators(true)
            .await
            .map_err(|err| format!("Failed to load actuators: {}", err))?
            .iter()
            .map(|record| {
                let mut output = OutputConfig::from_record(record);
                if let Some(tuning) = config.get_tuning(record.id) {
                    tuning.apply(&mut output);
                }
                output
            })
            .collect(),
        None => config.get_outputs().to_vec(),
    };

    let configured = ConfiguredOutputs::new(outputs.clone());
    let checker: &dyn ConflictChecker = match database {
        Some(db) => db,
        None => &configured,
    };

    let mut drivers = Vec::with_capacity(outputs.len());
    for output in outputs {
        if let Err(err) = checker.ensure_pin_free(output.pin, &output.chip, Some(output.id)).await {
            error!("Skipping output '{}': {}", output.name, err);
            continue;
        }
        let id = output.id;
        let name = output.name.clone();
        let driver = match OutputDriver::new(output, gpio.clone(), interlocks.clone(), clock.clone()) {
            Ok(driver) => driver,
            Err(err) => {
                error!("Skipping output '{}': {}", name, err);
                continue;
            }
        };
        if let Some(db) = database {
            match db.load_state(id).await {
                Ok(Some(state)) => driver.restore_counters(state.total_on_time_ms, state.cycle_count),
                Ok(None) => {}
                Err(err) => warn!("Failed to load state for '{}': {}", name, err),
            }
        }
        drivers.push(Arc::new(driver));
    }
    Ok(drivers)
}

async fn control_loop(
    config: &Config,
    database: Option<&ActuatorDatabase>,
    drivers: &[Arc<OutputDriver>],
    clock: &Arc<dyn TimeProvider>,
    should_exit: &AtomicBool,
    logging_handle: &LoggingHandle<EnvFilter, impl Subscriber>,
) {
    let control = config.get_control_config();
    let mut ticker = interval((*control.get_process_interval()).max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut persist_ticker = interval(PERSIST_INTERVAL);
    persist_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut hangup = hangup::listen();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if should_exit.load(Ordering::Relaxed) {
                    return;
                }
                for driver in drivers {
                    if let Err(err) = driver.process() {
                        error!("{}: process failed: {}", driver.name(), err);
                    }
                }
                if let Some(path) = control.get_status_file() {
                    let report = StatusReport::collect(clock.get_utc_time(), drivers.iter().map(|driver| driver.as_ref()));
                    if let Err(err) = report.write_to(path) {
                        warn!("{}", err);
                    }
                }
            }
            _ = persist_ticker.tick() => {
                if let Some(db) = database {
                    persist_state(db, drivers, clock).await;
                }
            }
            _ = hangup::next(&mut hangup) => {
                match logging::reload_log_level(logging_handle) {
                    Ok(filter) => info!("Reloaded log level: {}", filter),
                    Err(ReloadLogLevelError::InvalidFilter(err)) => warn!("Keeping log level: {}", err),
                    Err(ReloadLogLevelError::ReloadFailed(err)) => error!("Failed to reload log level: {}", err),
                }
            }
        }
    }
}

async fn persist_state(db: &ActuatorDatabase, drivers: &[Arc<OutputDriver>], clock: &Arc<dyn TimeProvider>) {
    let now = clock.get_utc_time();
    for driver in drivers {
        let row = ActuatorStateRow::from_status(driver.id(), &driver.status(), now);
        if let Err(err) = db.save_state(&row).await {
            warn!("{}: failed to save state: {}", driver.name(), err);
        }
    }
    debug!("Persisted state of {} outputs", drivers.len());
}

#[cfg(unix)]
mod hangup {
    use log::warn;
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub fn listen() -> Option<Signal> {
        signal(SignalKind::hangup())
            .map_err(|err| warn!("SIGHUP log reload unavailable: {}", err))
            .ok()
    }

    pub async fn next(signal: &mut Option<Signal>) {
        match signal {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
mod hangup {
    pub fn listen() -> Option<()> {
        None
    }

    pub async fn next(_: &mut Option<()>) {
        std::future::pending().await
    }
}
