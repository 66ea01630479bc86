//! Daemon configuration.
//!
//! The ingest section mirrors the keys the WebSDR driver understands;
//! unknown keys are rejected at parse time. Frequencies accept
//! engineering notation (`7050000`, `7.05M`, `7m050`).

use std::net::SocketAddr;

use serde::Deserialize;

pub const DEFAULT_TCP_PORT: u16 = 50001;
pub const DEFAULT_UDP_PORT: u16 = 50100;
pub const DEFAULT_SCALING: u32 = 16;
pub const DEFAULT_SAMPRATE: u32 = 192_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("device is {device:?}, this driver handles only \"cwsl_websdr\"")]
    WrongDevice { device: String },
    #[error("frequency must be specified when receiver is not explicitly set")]
    FrequencyRequired,
    #[error("unparseable frequency {frequency:?}")]
    BadFrequency { frequency: String },
    #[error("status destination {status:?} is not a socket address")]
    BadStatusAddress { status: String },
}

/// Top-level daemon configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub global: GlobalConfig,
    pub input: WebsdrConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// control/status multicast group or unicast socket
    pub status: String,
    /// channel table capacity
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// DSP block duration in milliseconds
    #[serde(default = "default_blocktime_ms")]
    pub blocktime_ms: u32,
}

fn default_channels() -> usize {
    64
}

fn default_blocktime_ms() -> u32 {
    20
}

impl GlobalConfig {
    pub fn status_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.status.parse().map_err(|_| {
            ConfigError::BadStatusAddress {
                status: self.status.clone(),
            }
        })
    }
}

/// The `[input]` section for the WebSDR ingest driver.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsdrConfig {
    pub device: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// -1 selects the receiver automatically from `frequency`
    #[serde(default = "default_receiver")]
    pub receiver: i32,
    #[serde(default = "default_scaling")]
    pub scaling: u32,
    #[serde(default = "default_samprate")]
    pub samprate: u32,
    /// engineering-notation Hz; required when `receiver` is negative
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub calibrate: f64,
}

fn default_host() -> String {
    "localhost".into()
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_receiver() -> i32 {
    -1
}

fn default_scaling() -> u32 {
    DEFAULT_SCALING
}

fn default_samprate() -> u32 {
    DEFAULT_SAMPRATE
}

impl WebsdrConfig {
    /// Operator-facing description: the explicit key, else the
    /// hardware name, else the driver name.
    pub fn effective_description(&self) -> String {
        self.description
            .clone()
            .or_else(|| self.hardware.clone())
            .unwrap_or_else(|| "cwsl-websdr".into())
    }

    /// Check cross-field rules and clamp out-of-range values the way
    /// the operator expects: bad scaling reverts to the default with
    /// a log line, a wrong device is fatal.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.device.eq_ignore_ascii_case("cwsl_websdr") {
            return Err(ConfigError::WrongDevice {
                device: self.device.clone(),
            });
        }

        if self.scaling < 1 || self.scaling > 64 {
            tracing::warn!(
                scaling = self.scaling,
                "scaling factor out of range 1..=64, using default {DEFAULT_SCALING}"
            );
            self.scaling = DEFAULT_SCALING;
        }

        if self.samprate == 0 {
            tracing::warn!("invalid sample rate, reverting to default {DEFAULT_SAMPRATE}");
            self.samprate = DEFAULT_SAMPRATE;
        }

        if self.frequency.is_none() && self.receiver < 0 {
            return Err(ConfigError::FrequencyRequired);
        }
        if let Some(text) = &self.frequency
            && parse_frequency(text).is_none()
        {
            return Err(ConfigError::BadFrequency {
                frequency: text.clone(),
            });
        }

        Ok(())
    }

    /// The configured initial frequency in Hz, if any.
    pub fn initial_frequency(&self) -> Result<Option<f64>, ConfigError> {
        match &self.frequency {
            None => Ok(None),
            Some(text) => {
                parse_frequency(text)
                    .map(Some)
                    .ok_or_else(|| {
                        ConfigError::BadFrequency {
                            frequency: text.clone(),
                        }
                    })
            }
        }
    }
}

pub fn load(text: &str) -> Result<DaemonConfig, ConfigError> {
    let mut config: DaemonConfig = toml::from_str(text)?;
    config.input.validate()?;
    Ok(config)
}

/// Parse a frequency in engineering notation.
///
/// Accepts plain Hz (`7050000`), an SI suffix as a multiplier
/// (`7.05M`, `144k`) or as the decimal point (`7m050`, `147m435`).
/// Suffixes are k (1e3), m (1e6), g (1e9), case-insensitive.
pub fn parse_frequency(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(index) = text.find(|c: char| matches!(c, 'k' | 'K' | 'm' | 'M' | 'g' | 'G')) {
        let multiplier = match text.as_bytes()[index].to_ascii_lowercase() {
            b'k' => 1e3,
            b'm' => 1e6,
            _ => 1e9,
        };
        let whole = &text[..index];
        let fraction = &text[index + 1..];

        let whole: f64 = if whole.is_empty() {
            0.0
        }
        else {
            whole.parse().ok()?
        };
        if fraction.is_empty() {
            return Some(whole * multiplier);
        }
        // suffix acts as the decimal point: 7m050 = 7.050 MHz
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let fraction_value: f64 = fraction.parse().ok()?;
        let scale = 10f64.powi(fraction.len() as i32);
        Some((whole + fraction_value / scale) * multiplier)
    }
    else {
        text.parse().ok()
    }
}
