use anyhow::Context;
use aya::programs::XdpFlags;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::analyzer::Rule;

/// How the XDP program is attached to the interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Let the kernel pick (native if the driver supports it).
    #[default]
    Default,
    /// Generic mode, works on any interface.
    Skb,
    /// Native driver mode.
    Driver,
    /// Offload to the NIC.
    Hardware,
}

impl XdpMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Default => XdpFlags::default(),
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hardware => XdpFlags::HW_MODE,
        }
    }
}

/// Agent configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface to attach the XDP program to.
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default)]
    pub xdp_mode: XdpMode,

    /// Compiled eBPF object built by `cargo xtask build-ebpf`.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Addresses loaded into the denylist at startup.
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Detection rules applied to every exported event, in order. Written as
    /// single-key maps (`- dst_port: 23`).
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub rules: Vec<Rule>,

    /// Sleep between ring buffer drains when it is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-source statistics are dropped after this many idle seconds.
    #[serde(default = "default_source_timeout")]
    pub source_timeout: u64,

    /// Number of recent events kept for the API.
    #[serde(default = "default_recent_events")]
    pub recent_events: usize,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_ebpf_object() -> String {
    "sentinel-ebpf/target/bpfel-unknown-none/release/sentinel".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_source_timeout() -> u64 {
    60
}

fn default_recent_events() -> usize {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            xdp_mode: XdpMode::Default,
            ebpf_object: default_ebpf_object(),
            port: default_port(),
            quiet: false,
            denylist: Vec::new(),
            rules: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            source_timeout: default_source_timeout(),
            recent_events: default_recent_events(),
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("invalid config")?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref interface) = cli.interface {
            self.interface = interface.clone();
        }
        if let Some(mode) = cli.xdp_mode {
            self.xdp_mode = mode;
        }
        if let Some(ref object) = cli.ebpf_object {
            self.ebpf_object = object.clone();
        }
        if cli.port != 3000 {
            self.port = cli.port;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.deny.is_empty() {
            self.denylist.extend(cli.deny.iter().cloned());
        }
        if let Some(n) = cli.block_src_port_multiple {
            self.rules.push(Rule::SrcPortMultipleOf(n));
        }
        if cli.poll_interval_ms != 1 {
            self.poll_interval_ms = cli.poll_interval_ms;
        }
        if cli.source_timeout != 60 {
            self.source_timeout = cli.source_timeout;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    /// Parses the startup denylist. A bad literal is a hard error: silently
    /// skipping it would leave a source unblocked.
    pub fn denylist_addrs(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        self.denylist
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<Ipv4Addr>()
                    .with_context(|| format!("invalid denylist address {s:?}"))
            })
            .collect()
    }
}

use clap::Parser;

/// sentinel: XDP source denylist and TCP telemetry exporter
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to attach the XDP program to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// XDP attach mode.
    #[arg(long, value_enum)]
    pub xdp_mode: Option<XdpMode>,

    /// Path to the compiled eBPF object.
    #[arg(long)]
    pub ebpf_object: Option<String>,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IPv4 address to denylist at startup. Repeat for multiple.
    #[arg(long)]
    pub deny: Vec<String>,

    /// Denylist sources whose TCP source port is a multiple of N.
    #[arg(long, value_name = "N")]
    pub block_src_port_multiple: Option<u16>,

    /// Milliseconds to sleep when the event ring buffer is empty.
    #[arg(long, default_value_t = 1)]
    pub poll_interval_ms: u64,

    /// Idle seconds before per-source statistics are dropped.
    #[arg(long, default_value_t = 60)]
    pub source_timeout: u64,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.xdp_mode, XdpMode::Default);
        assert_eq!(config.port, 3000);
        assert_eq!(config.poll_interval_ms, 1);
        assert_eq!(config.recent_events, 1000);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_yaml_full() {
        let config = Config::from_yaml(
            r#"
interface: ens33
xdp_mode: skb
port: 8080
denylist: ["198.51.100.4", " 203.0.113.9 "]
rules:
  - src_port_multiple_of: 100
  - dst_port: 23
  - source: 192.0.2.1
allowed_ips: ["10.0.0.0/8"]
"#,
        )
        .unwrap();

        assert_eq!(config.interface, "ens33");
        assert_eq!(config.xdp_mode, XdpMode::Skb);
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.denylist_addrs().unwrap(),
            vec![Ipv4Addr::new(198, 51, 100, 4), Ipv4Addr::new(203, 0, 113, 9)]
        );
        assert_eq!(
            config.rules,
            vec![
                Rule::SrcPortMultipleOf(100),
                Rule::DstPort(23),
                Rule::Source(Ipv4Addr::new(192, 0, 2, 1)),
            ]
        );
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_yaml(include_str!("../../sentinel.example.yaml")).unwrap();
        assert_eq!(config.denylist_addrs().unwrap().len(), 1);
        assert_eq!(config.rules, vec![Rule::SrcPortMultipleOf(100)]);
        assert_eq!(config.allowed_ips, vec!["127.0.0.1/32".to_string()]);
    }

    #[test]
    fn test_rules_use_map_form() {
        let config = Config::from_yaml("rules:\n  - dst_port: 23\n").unwrap();
        assert_eq!(config.rules, vec![Rule::DstPort(23)]);

        let config = Config::from_yaml("rules:\n  - source: 198.51.100.9\n").unwrap();
        assert_eq!(config.rules, vec![Rule::Source(Ipv4Addr::new(198, 51, 100, 9))]);

        assert!(Config::from_yaml("rules:\n  - ttl_below: 3\n").is_err());
    }

    #[test]
    fn test_bad_denylist_entry_is_an_error() {
        let config = Config::from_yaml("denylist: [\"10.0.0.0/8\"]").unwrap();
        assert!(config.denylist_addrs().is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config::from_yaml("interface: ens33\nport: 8080").unwrap();
        let cli = CliArgs::parse_from([
            "sentinel",
            "-i",
            "lo",
            "--xdp-mode",
            "driver",
            "--deny",
            "192.0.2.7",
            "--block-src-port-multiple",
            "100",
        ]);
        config.merge_cli(&cli);

        assert_eq!(config.interface, "lo");
        assert_eq!(config.xdp_mode, XdpMode::Driver);
        // CLI default port does not clobber the file value.
        assert_eq!(config.port, 8080);
        assert_eq!(config.denylist, vec!["192.0.2.7".to_string()]);
        assert_eq!(config.rules, vec![Rule::SrcPortMultipleOf(100)]);
    }
}
