use serde_derive::Deserialize;
use sloggers::LoggerConfig;
use std::path::{Path, PathBuf};

/// Daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_instance")]
    pub instance: String,
    /// Base runtime directory; sockets live under `<run_dir>/cpcd/<instance>/`.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    pub transport: Transport,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub link: Link,
    #[serde(default = "default_logging")]
    pub logging: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Uart {
        device: PathBuf,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default)]
        hardware_flow_control: bool,
    },
    Spi {
        device: PathBuf,
        /// Path to the exported GPIO value file of the secondary's IRQ line.
        irq_gpio: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Security {
    #[serde(default)]
    pub enabled: bool,
    pub binding_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Link {
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_window")]
    pub tx_window: u8,
    #[serde(default = "default_rto_ms")]
    pub rto_ms: u64,
    #[serde(default = "default_max_rto_ms")]
    pub max_rto_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,
}

impl Default for Link {
    fn default() -> Link {
        Link {
            mtu: default_mtu(),
            tx_window: default_window(),
            rto_ms: default_rto_ms(),
            max_rto_ms: default_max_rto_ms(),
            max_retries: default_max_retries(),
            ack_delay_ms: default_ack_delay_ms(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path.as_ref())
    }
}

fn default_instance() -> String {
    "cpcd_0".into()
}

fn default_run_dir() -> PathBuf {
    "/run".into()
}

fn default_baud() -> u32 {
    115_200
}

fn default_mtu() -> usize {
    crate::MAX_PAYLOAD
}

fn default_window() -> u8 {
    4
}

fn default_rto_ms() -> u64 {
    100
}

fn default_max_rto_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u8 {
    5
}

fn default_ack_delay_ms() -> u64 {
    50
}

fn default_logging() -> LoggerConfig {
    serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("default logging configuration is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Config = serdeconv::from_toml_str(
            r#"
[transport]
type = "uart"
device = "/dev/ttyACM0"
"#,
        )
        .unwrap();

        assert_eq!(config.instance, "cpcd_0");
        assert_eq!(config.link.mtu, crate::MAX_PAYLOAD);
        assert_eq!(config.link.tx_window, 4);
        assert!(!config.security.enabled);

        match config.transport {
            Transport::Uart { baud, .. } => assert_eq!(baud, 115_200),
            other => panic!("Unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_full_config() {
        let config: Config = serdeconv::from_toml_str(
            r#"
instance = "radio_0"
run_dir = "/tmp/run"

[transport]
type = "spi"
device = "/dev/spidev0.0"
irq_gpio = "/sys/class/gpio/gpio17/value"

[security]
enabled = true
binding_key_file = "/etc/cpcd/binding.key"

[link]
tx_window = 7
rto_ms = 50

[logging]
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();

        assert_eq!(config.instance, "radio_0");
        assert!(config.security.enabled);
        assert_eq!(config.link.tx_window, 7);
        assert_eq!(config.link.rto_ms, 50);
        assert_eq!(config.link.max_retries, 5);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = serdeconv::from_toml_str(
            r#"
surprise = 1

[transport]
type = "uart"
device = "/dev/ttyACM0"
"#,
        );

        assert!(result.is_err());
    }
}
