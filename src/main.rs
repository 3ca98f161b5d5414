use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use jvb_rtcstats_push::cli::Args;
use jvb_rtcstats_push::logs::{LogCorrelator, LogTailer};
use jvb_rtcstats_push::poller::StatsPoller;
use jvb_rtcstats_push::transport::TransportManager;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    info!(
        bridge = %config.bridge.stats_url(),
        collector = %config.transport.url,
        display_name = %config.display_name,
        log_file = ?config.log_file,
        "starting jvb-rtcstats-push"
    );

    let (manager, handle) = TransportManager::new(config.transport.clone());
    tokio::spawn(manager.run());

    let mut builder = StatsPoller::builder(config.bridge.clone())
        .sink(handle)
        .display_name(config.display_name.clone())
        .poll_interval(config.poll_interval);

    if let Some(path) = config.log_file.clone() {
        let correlator = LogCorrelator::shared();
        builder = builder.logs(Arc::clone(&correlator));
        tokio::spawn(async move {
            if let Err(e) = LogTailer::new(path, correlator).run().await {
                error!(error = %e, "log tailing disabled");
            }
        });
    }

    let poller = match builder.build() {
        Ok(poller) => poller,
        Err(e) => {
            error!(error = %e, "could not build poller");
            std::process::exit(2);
        }
    };

    tokio::select! {
        _ = poller.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, stopping poll loop");
        }
    }
}
