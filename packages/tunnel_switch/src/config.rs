use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tunnel_core::{
    Endpoint, EndpointId, EscapeSequence, Parity, StopBits, TransportConfig, Tunnel, TunnelId,
    TunnelOptions,
};

// =============================================================================
// File config (figment-deserialized from defaults / config file / env vars)
// =============================================================================
//
// The file keeps the classic tunnel.json shape:
//
//   { "serial": [ { "id": 1, "device": "/dev/ttyUSB0", "speed": 9600, ... } ],
//     "tunnel": [ { "id": 1, "DTE": [1, 2], "DCE": 3,
//                   "EscapeChar1": 27, "EscapeChar2": 84 } ] }
//
// TOML works too (any extension other than .json). Runtime knobs can be set
// from the environment: TUNNEL_RUNTIME__SHUTDOWN_TIMEOUT_MS=500

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("serial id {0} is defined more than once")]
    DuplicateEndpoint(u32),

    #[error("tunnel id {0} is defined more than once")]
    DuplicateTunnel(u32),

    #[error("can't find DCE reference {dce} in tunnel {tunnel}")]
    UnknownDce { tunnel: u32, dce: u32 },

    #[error("serial instance with ID {dte} not found (tunnel {tunnel})")]
    UnknownDte { tunnel: u32, dte: u32 },

    #[error("tunnel {0} has no DTE")]
    NoDtes(u32),

    #[error("tunnel {tunnel} lists its DCE {dce} as a DTE")]
    DceListedAsDte { tunnel: u32, dce: u32 },

    #[error("serial {serial} is used more than once (tunnel {tunnel})")]
    EndpointShared { tunnel: u32, serial: u32 },

    #[error("serial {serial}: invalid parity {value}")]
    InvalidParity { serial: u32, value: String },

    #[error("serial {serial}: invalid stop bits {value}")]
    InvalidStopBits { serial: u32, value: String },

    #[error("serial {serial}: invalid data bits {value} (expected 5-8)")]
    InvalidDataBits { serial: u32, value: u8 },
}

/// Parity as written in the file: a numeric code or a name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParitySetting {
    Code(u8),
    Name(String),
}

impl Default for ParitySetting {
    fn default() -> Self {
        ParitySetting::Code(0)
    }
}

impl ParitySetting {
    fn resolve(&self, serial: u32) -> Result<Parity, ConfigError> {
        match self {
            ParitySetting::Code(0) => Ok(Parity::None),
            ParitySetting::Code(1) => Ok(Parity::Odd),
            ParitySetting::Code(2) => Ok(Parity::Even),
            ParitySetting::Name(name) => match name.to_ascii_lowercase().as_str() {
                "none" | "n" => Ok(Parity::None),
                "odd" | "o" => Ok(Parity::Odd),
                "even" | "e" => Ok(Parity::Even),
                _ => Err(ConfigError::InvalidParity {
                    serial,
                    value: name.clone(),
                }),
            },
            ParitySetting::Code(code) => Err(ConfigError::InvalidParity {
                serial,
                value: code.to_string(),
            }),
        }
    }
}

/// Stop bits as written in the file.
///
/// Numeric codes: 0 is one stop bit, 1 is one
/// and a half, 2 is two.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSetting {
    Code(u8),
    Name(String),
}

impl Default for StopSetting {
    fn default() -> Self {
        StopSetting::Code(0)
    }
}

impl StopSetting {
    fn resolve(&self, serial: u32) -> Result<StopBits, ConfigError> {
        match self {
            StopSetting::Code(0) => Ok(StopBits::One),
            StopSetting::Code(1) => Ok(StopBits::OnePointFive),
            StopSetting::Code(2) => Ok(StopBits::Two),
            StopSetting::Name(name) => match name.to_ascii_lowercase().as_str() {
                "one" => Ok(StopBits::One),
                "one-and-half" => Ok(StopBits::OnePointFive),
                "two" => Ok(StopBits::Two),
                _ => Err(ConfigError::InvalidStopBits {
                    serial,
                    value: name.clone(),
                }),
            },
            StopSetting::Code(code) => Err(ConfigError::InvalidStopBits {
                serial,
                value: code.to_string(),
            }),
        }
    }
}

/// One DTE or DCE interface (lives under `serial` in the config file)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialFileConfig {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    pub device: String,
    #[serde(default = "default_speed")]
    pub speed: u32,
    #[serde(default = "default_bits")]
    pub bits: u8,
    #[serde(default)]
    pub parity: ParitySetting,
    #[serde(default)]
    pub stop: StopSetting,
}

/// A set of DTEs sharing one DCE (lives under `tunnel` in the config file)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelFileConfig {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "DTE")]
    pub dte: Vec<u32>,
    #[serde(rename = "DCE")]
    pub dce: u32,
    #[serde(rename = "EscapeChar1", default = "default_escape_char1")]
    pub escape_char1: u8,
    #[serde(rename = "EscapeChar2", default = "default_escape_char2")]
    pub escape_char2: u8,
}

/// Runtime tunables (lives under `runtime` in the config file)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeFileConfig {
    /// Upper bound on each wait while tearing a tunnel down
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeFileConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub serial: Vec<SerialFileConfig>,
    #[serde(default)]
    pub tunnel: Vec<TunnelFileConfig>,
    #[serde(default)]
    pub runtime: RuntimeFileConfig,
}

fn default_speed() -> u32 {
    9600
}
fn default_bits() -> u8 {
    8
}
fn default_escape_char1() -> u8 {
    0x1B
}
fn default_escape_char2() -> u8 {
    0x54
}
fn default_shutdown_timeout_ms() -> u64 {
    1000
}

/// Load the config file, layering: defaults → file → TUNNEL_* env vars.
///
/// Files ending in `.json` are read as JSON, everything else as TOML.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    use figment::{
        Figment,
        providers::{Env, Format, Json, Serialized, Toml},
    };

    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    debug!("Read config file {}", path.display());

    let base = Figment::from(Serialized::defaults(FileConfig::default()));
    let figment = if path.extension().is_some_and(|ext| ext == "json") {
        base.merge(Json::file(path))
    } else {
        base.merge(Toml::file(path))
    };
    let config: FileConfig = figment
        .merge(Env::prefixed("TUNNEL_").split("__"))
        .extract()?;

    debug!(
        "Parsed {} serials and {} tunnels",
        config.serial.len(),
        config.tunnel.len()
    );
    Ok(config)
}

impl FileConfig {
    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            shutdown_timeout: Duration::from_millis(self.runtime.shutdown_timeout_ms),
        }
    }

    /// Resolve every reference and build the tunnels.
    ///
    /// Any unresolved or conflicting reference aborts the whole build; no
    /// tunnel is returned with partially valid wiring.
    pub fn build(&self) -> Result<Vec<Tunnel>, ConfigError> {
        let mut endpoints: HashMap<u32, Arc<Endpoint>> = HashMap::new();
        for serial in &self.serial {
            if !(5..=8).contains(&serial.bits) {
                return Err(ConfigError::InvalidDataBits {
                    serial: serial.id,
                    value: serial.bits,
                });
            }
            let transport = TransportConfig {
                device: serial.device.clone(),
                speed: serial.speed,
                data_bits: serial.bits,
                parity: serial.parity.resolve(serial.id)?,
                stop_bits: serial.stop.resolve(serial.id)?,
            };
            let endpoint = Endpoint::new(EndpointId(serial.id), &serial.description, transport);
            if endpoints.insert(serial.id, endpoint).is_some() {
                return Err(ConfigError::DuplicateEndpoint(serial.id));
            }
        }

        let mut tunnel_ids = HashSet::new();
        let mut claimed: HashSet<u32> = HashSet::new();
        let mut tunnels = Vec::with_capacity(self.tunnel.len());

        for t in &self.tunnel {
            if !tunnel_ids.insert(t.id) {
                return Err(ConfigError::DuplicateTunnel(t.id));
            }
            let dce = endpoints
                .get(&t.dce)
                .cloned()
                .ok_or(ConfigError::UnknownDce {
                    tunnel: t.id,
                    dce: t.dce,
                })?;
            if t.dte.is_empty() {
                return Err(ConfigError::NoDtes(t.id));
            }

            let mut dtes = Vec::with_capacity(t.dte.len());
            for &dte in &t.dte {
                if dte == t.dce {
                    return Err(ConfigError::DceListedAsDte {
                        tunnel: t.id,
                        dce: t.dce,
                    });
                }
                let endpoint = endpoints.get(&dte).cloned().ok_or(ConfigError::UnknownDte {
                    tunnel: t.id,
                    dte,
                })?;
                dtes.push(endpoint);
            }

            for serial in t.dte.iter().chain(std::iter::once(&t.dce)) {
                if !claimed.insert(*serial) {
                    return Err(ConfigError::EndpointShared {
                        tunnel: t.id,
                        serial: *serial,
                    });
                }
            }

            tunnels.push(Tunnel::new(
                TunnelId(t.id),
                &t.description,
                dtes,
                dce,
                EscapeSequence::new(t.escape_char1, t.escape_char2),
            ));
        }

        for serial in &self.serial {
            if !claimed.contains(&serial.id) {
                warn!(
                    "Serial {} ({}) is not part of any tunnel and will not be opened",
                    serial.id, serial.device
                );
            }
        }

        Ok(tunnels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn serial(id: u32) -> SerialFileConfig {
        SerialFileConfig {
            id,
            description: format!("serial {id}"),
            device: format!("/dev/ttyS{id}"),
            speed: default_speed(),
            bits: default_bits(),
            parity: ParitySetting::default(),
            stop: StopSetting::default(),
        }
    }

    fn tunnel(id: u32, dte: Vec<u32>, dce: u32) -> TunnelFileConfig {
        TunnelFileConfig {
            id,
            description: format!("tunnel {id}"),
            dte,
            dce,
            escape_char1: default_escape_char1(),
            escape_char2: default_escape_char2(),
        }
    }

    fn config(serials: &[u32], tunnels: Vec<TunnelFileConfig>) -> FileConfig {
        FileConfig {
            serial: serials.iter().copied().map(serial).collect(),
            tunnel: tunnels,
            runtime: RuntimeFileConfig::default(),
        }
    }

    #[test]
    fn loads_classic_json_layout() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "serial": [
                    {{ "id": 1, "description": "console A", "device": "/dev/ttyUSB0",
                       "speed": 115200, "bits": 8, "parity": 0, "stop": 0 }},
                    {{ "id": 2, "description": "router", "device": "/dev/ttyUSB1",
                       "speed": 9600, "bits": 7, "parity": 2, "stop": 2 }}
                ],
                "tunnel": [
                    {{ "id": 10, "description": "lab", "DTE": [1], "DCE": 2,
                       "EscapeChar1": 27, "EscapeChar2": 84 }}
                ]
            }}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.serial.len(), 2);
        assert_eq!(config.runtime.shutdown_timeout_ms, 1000);

        let tunnels = config.build().unwrap();
        assert_eq!(tunnels.len(), 1);
        let t = &tunnels[0];
        assert_eq!(t.id(), TunnelId(10));
        assert_eq!(t.escape(), EscapeSequence::new(0x1B, 0x54));
        assert_eq!(t.dtes()[0].id(), EndpointId(1));
        assert_eq!(t.dce().transport().parity, Parity::Even);
        assert_eq!(t.dce().transport().stop_bits, StopBits::Two);
        assert_eq!(t.dce().transport().data_bits, 7);
    }

    #[test]
    fn loads_toml_with_named_settings() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[runtime]
shutdown_timeout_ms = 250

[[serial]]
id = 1
device = "pty"
parity = "odd"
stop = "one-and-half"

[[serial]]
id = 2
device = "tcp:127.0.0.1:7000"

[[tunnel]]
id = 1
DTE = [1]
DCE = 2
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.tunnel_options().shutdown_timeout, Duration::from_millis(250));
        let tunnels = config.build().unwrap();
        let dte = &tunnels[0].dtes()[0];
        assert_eq!(dte.transport().parity, Parity::Odd);
        assert_eq!(dte.transport().stop_bits, StopBits::OnePointFive);
        assert_eq!(dte.transport().speed, 9600);
        assert_eq!(tunnels[0].escape(), EscapeSequence::new(0x1B, 0x54));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_config(Path::new("/nonexistent/tunnel.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn unknown_references_abort_the_build() {
        let err = config(&[1, 2], vec![tunnel(1, vec![1], 9)]).build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDce { tunnel: 1, dce: 9 }));

        let err = config(&[1, 2], vec![tunnel(1, vec![1, 7], 2)]).build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDte { tunnel: 1, dte: 7 }));
    }

    #[test]
    fn structural_errors_are_rejected() {
        let err = config(&[1, 1], vec![]).build().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateEndpoint(1)));

        let err = config(&[1, 2], vec![tunnel(1, vec![], 2)]).build().unwrap_err();
        assert!(matches!(err, ConfigError::NoDtes(1)));

        let err = config(&[1, 2], vec![tunnel(1, vec![1, 2], 2)]).build().unwrap_err();
        assert!(matches!(err, ConfigError::DceListedAsDte { tunnel: 1, dce: 2 }));

        let err = config(&[1, 2, 3], vec![tunnel(1, vec![1], 2), tunnel(1, vec![3], 2)])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTunnel(1)));

        let err = config(&[1, 2, 3], vec![tunnel(1, vec![1], 2), tunnel(2, vec![3], 2)])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EndpointShared { tunnel: 2, serial: 2 }));

        let err = config(&[1, 2], vec![tunnel(1, vec![1, 1], 2)]).build().unwrap_err();
        assert!(matches!(err, ConfigError::EndpointShared { tunnel: 1, serial: 1 }));
    }

    #[test]
    fn line_settings_are_validated() {
        let mut cfg = config(&[1, 2], vec![tunnel(1, vec![1], 2)]);
        cfg.serial[0].parity = ParitySetting::Code(4);
        assert!(matches!(cfg.build(), Err(ConfigError::InvalidParity { serial: 1, .. })));

        let mut cfg = config(&[1, 2], vec![tunnel(1, vec![1], 2)]);
        cfg.serial[1].stop = StopSetting::Name("three".to_string());
        assert!(matches!(cfg.build(), Err(ConfigError::InvalidStopBits { serial: 2, .. })));

        let mut cfg = config(&[1, 2], vec![tunnel(1, vec![1], 2)]);
        cfg.serial[0].bits = 9;
        assert!(matches!(
            cfg.build(),
            Err(ConfigError::InvalidDataBits { serial: 1, value: 9 })
        ));
    }

    #[test]
    fn dtes_keep_configured_order() {
        let tunnels = config(&[1, 2, 3, 4], vec![tunnel(1, vec![3, 1, 4], 2)])
            .build()
            .unwrap();
        let ids: Vec<_> = tunnels[0].dtes().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec![EndpointId(3), EndpointId(1), EndpointId(4)]);
    }
}
