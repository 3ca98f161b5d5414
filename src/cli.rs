use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::bridge::BridgeConfig;
use crate::error::{PushError, Result};
use crate::transport::TransportConfig;

#[derive(Parser, Debug)]
#[command(name = "jvb-rtcstats-push")]
#[command(version)]
#[command(about = "Pushes Jitsi Videobridge conference stats to an rtcstats server")]
pub struct Args {
    /// Base URL of the bridge REST API (e.g. http://127.0.0.1:8080)
    #[arg(long, env = "JVB_ADDRESS")]
    pub jvb_address: String,

    /// Path of the stats endpoint, relative to the bridge address
    #[arg(long, env = "JVB_STATS_PATH", default_value = "stats")]
    pub stats_path: String,

    /// Websocket URL of the rtcstats server (ws:// or wss://)
    #[arg(long, env = "RTCSTATS_SERVER")]
    pub rtcstats_server: String,

    /// Bridge log file to tail and attach to stats sessions
    #[arg(long, env = "JVB_LOG_FILE")]
    pub jvb_log_file: Option<PathBuf>,

    /// Name this agent reports itself as
    #[arg(long, env = "HOSTNAME", default_value = "jvb")]
    pub display_name: String,

    /// Milliseconds between bridge polls
    #[arg(long, default_value = "5000")]
    pub poll_interval_ms: u64,

    /// Milliseconds to wait before reconnecting to the rtcstats server
    #[arg(long, default_value = "5000")]
    pub reconnect_delay_ms: u64,

    /// Milliseconds between websocket keepalive pings
    #[arg(long, default_value = "20000")]
    pub ping_interval_ms: u64,

    /// Default tracing filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bridge: BridgeConfig,
    pub transport: TransportConfig,
    pub display_name: String,
    pub poll_interval: Duration,
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Check the parsed arguments and assemble an [`AgentConfig`].
    ///
    /// # Errors
    /// `PushError::Config` for an empty address, a non-websocket collector
    /// URL, or a zero interval.
    pub fn into_config(self) -> Result<AgentConfig> {
        let jvb_address = self.jvb_address.trim().to_string();
        if jvb_address.is_empty() {
            return Err(PushError::Config("--jvb-address must not be empty".into()));
        }
        if !(jvb_address.starts_with("http://") || jvb_address.starts_with("https://")) {
            return Err(PushError::Config(format!(
                "--jvb-address must be an http(s) URL, got {jvb_address}"
            )));
        }

        let server = self.rtcstats_server.trim().to_string();
        if !(server.starts_with("ws://") || server.starts_with("wss://")) {
            return Err(PushError::Config(format!(
                "--rtcstats-server must be a ws:// or wss:// URL, got {server:?}"
            )));
        }

        for (flag, value) in [
            ("--poll-interval-ms", self.poll_interval_ms),
            ("--reconnect-delay-ms", self.reconnect_delay_ms),
            ("--ping-interval-ms", self.ping_interval_ms),
        ] {
            if value == 0 {
                return Err(PushError::Config(format!("{flag} must be greater than zero")));
            }
        }

        let display_name = match self.display_name.trim() {
            "" => "jvb".to_string(),
            name => name.to_string(),
        };

        let mut bridge = BridgeConfig::new(jvb_address);
        bridge.stats_path = self.stats_path;

        let mut transport = TransportConfig::new(server, display_name.clone());
        transport.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        transport.ping_interval = Duration::from_millis(self.ping_interval_ms);

        Ok(AgentConfig {
            bridge,
            transport,
            display_name,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            log_file: self.jvb_log_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: [&str; 5] = [
        "push",
        "--jvb-address",
        "http://127.0.0.1:8080",
        "--rtcstats-server",
        "ws://collector:3000",
    ];

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(MIN);
        assert_eq!(args.jvb_address, "http://127.0.0.1:8080");
        assert_eq!(args.stats_path, "stats");
        assert_eq!(args.rtcstats_server, "ws://collector:3000");
        assert!(args.jvb_log_file.is_none());
        assert_eq!(args.poll_interval_ms, 5000);
        assert_eq!(args.reconnect_delay_ms, 5000);
        assert_eq!(args.ping_interval_ms, 20000);
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "push",
            "--jvb-address",
            "http://jvb:8080",
            "--stats-path",
            "debug",
            "--rtcstats-server",
            "wss://rtcstats.example.com",
            "--jvb-log-file",
            "/var/log/jitsi/jvb.log",
            "--display-name",
            "jvb-eu-1",
            "--poll-interval-ms",
            "1000",
        ]);
        assert_eq!(args.stats_path, "debug");
        assert_eq!(args.jvb_log_file, Some(PathBuf::from("/var/log/jitsi/jvb.log")));
        assert_eq!(args.display_name, "jvb-eu-1");
        assert_eq!(args.poll_interval_ms, 1000);
    }

    #[test]
    fn test_args_missing_server_is_error() {
        let result = Args::try_parse_from(["push", "--jvb-address", "http://jvb:8080"]);
        // RTCSTATS_SERVER may be set in the environment running the tests.
        if std::env::var_os("RTCSTATS_SERVER").is_none() {
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_into_config_builds_sub_configs() {
        let mut args = Args::parse_from(MIN);
        args.display_name = "jvb-7".to_string();
        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.bridge.stats_url(), "http://127.0.0.1:8080/stats");
        assert_eq!(cfg.transport.url, "ws://collector:3000");
        assert_eq!(cfg.transport.identity, "jvb-7");
        assert_eq!(cfg.display_name, "jvb-7");
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_into_config_rejects_http_collector() {
        let mut args = Args::parse_from(MIN);
        args.rtcstats_server = "http://collector:3000".to_string();
        assert!(matches!(args.into_config(), Err(PushError::Config(_))));
    }

    #[test]
    fn test_into_config_rejects_empty_bridge_address() {
        let mut args = Args::parse_from(MIN);
        args.jvb_address = "  ".to_string();
        assert!(matches!(args.into_config(), Err(PushError::Config(_))));
    }

    #[test]
    fn test_into_config_rejects_zero_interval() {
        let mut args = Args::parse_from(MIN);
        args.ping_interval_ms = 0;
        let err = args.into_config().unwrap_err();
        assert!(err.to_string().contains("--ping-interval-ms"));
    }

    #[test]
    fn test_into_config_blank_display_name_falls_back() {
        let mut args = Args::parse_from(MIN);
        args.display_name = " ".to_string();
        assert_eq!(args.into_config().unwrap().display_name, "jvb");
    }
}
