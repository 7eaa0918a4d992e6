// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{process, sync::Arc};
use tokio::{
    signal,
    sync::mpsc,
    time::{interval, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use doppler::{
    config::Config,
    constants::ENVELOPE_QUEUE_CAPACITY,
    event_listener::EventListener,
    heartbeat::HeartbeatTracker,
    instrumentation::Instrumentable,
    sink_manager::SinkManager,
    syslog_sink::{ErrorHandler, SyslogSink},
    syslog_writer::SyslogWriter,
    unmarshaller::Unmarshaller,
};
use tokio_util::sync::CancellationToken;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    let config = Config::from_env();
    let log_level = config
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |config| config.log_level.as_str());

    let env_filter =
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled for level {log_level}");

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on doppler startup: {e}");
            process::exit(1);
        }
    };

    let cancel_token = CancellationToken::new();
    let tracker = Arc::new(HeartbeatTracker::new(
        config.heartbeat_interval,
        config.sink_inactivity_timeout,
        cancel_token.clone(),
    ));
    let (listener, raw_rx) = EventListener::new(config.listener_config(), tracker);
    let listener = Arc::new(listener);
    let unmarshaller = Arc::new(Unmarshaller::new(cancel_token.clone()));
    let manager = Arc::new(SinkManager::new(cancel_token.clone()));

    let error_handler: ErrorHandler = Arc::new(|message: &str, app_id: &str, _drain_url: &str| {
        warn!("{message} (app {app_id})");
    });
    for drain in &config.drains {
        match SyslogWriter::new(&drain.drain_url, drain.app_id.as_str()) {
            Ok(writer) => {
                let sink = SyslogSink::new(config.sink_config(drain), writer, error_handler.clone());
                manager.register(Arc::new(sink));
            }
            Err(e) => error!("Skipping drain for app {}: {e}", drain.app_id),
        }
    }

    let (envelope_tx, envelope_rx) = mpsc::channel(ENVELOPE_QUEUE_CAPACITY);
    {
        let unmarshaller = Arc::clone(&unmarshaller);
        tokio::spawn(async move { unmarshaller.run(raw_rx, envelope_tx).await });
    }
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(envelope_rx).await });
    }
    let mut listener_task = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.start().await })
    };
    info!(
        "doppler: listening on {}:{} with {} drain(s)",
        config.host,
        config.incoming_port,
        manager.sink_count()
    );

    let mut status_interval = interval(STATUS_LOG_INTERVAL);
    status_interval.tick().await; // discard first tick, which is instantaneous

    let mut exit_code = 0;
    let mut listener_running = true;
    loop {
        tokio::select! {
            result = &mut listener_task => {
                listener_running = false;
                match result {
                    Ok(Ok(())) => info!("Listener stopped"),
                    Ok(Err(e)) => {
                        error!("{e}");
                        exit_code = 1;
                    }
                    Err(e) => {
                        error!("Listener task failed: {e}");
                        exit_code = 1;
                    }
                }
                break;
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Unable to listen for shutdown signal: {e}");
                }
                info!("Shutting down doppler");
                break;
            }
            _ = status_interval.tick() => {
                debug!("{:?}", listener.emit());
                debug!("{:?}", unmarshaller.emit());
                debug!("{:?}", manager.emit());
                for context in manager.sink_contexts() {
                    debug!("{:?}", context);
                }
            }
        }
    }

    listener.stop().await;
    if listener_running {
        if let Err(e) = listener_task.await {
            debug!("Listener task ended abnormally: {e}");
        }
    }
    manager.stop_all().await;
    cancel_token.cancel();

    if exit_code != 0 {
        process::exit(exit_code);
    }
}
