//! Configuration of the signer daemon.

use std::{env, fmt, fs, io};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use log::{error, info, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;
use crate::constants::{
    SIGNER_ENV_AUTH_TOKEN, SIGNER_ENV_LOG_LEVEL, SIGNER_ENV_LOG_TYPE,
    SIGNER_SERVER_APP,
};


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn port() -> u16 {
        5558
    }

    fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    fn log_level() -> LevelFilter {
        match env::var(SIGNER_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        SIGNER_ENV_LOG_LEVEL
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(SIGNER_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(e) => {
                    eprintln!("{e} in env var {SIGNER_ENV_LOG_TYPE}");
                    ::std::process::exit(1);
                }
            },
            _ => LogType::File,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./signer.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn auth_token() -> Option<String> {
        env::var(SIGNER_ENV_AUTH_TOKEN).ok().filter(|token| {
            !token.is_empty()
        })
    }

    fn worker_threads() -> usize {
        4
    }

    fn request_timeout_seconds() -> u64 {
        60
    }

    fn post_limit() -> u64 {
        1024 * 1024
    }

    fn discovery_interval_seconds() -> u64 {
        5
    }

    fn multiple_active_certs() -> bool {
        false
    }

    fn software_token() -> bool {
        true
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the signer daemon.
///
/// Every value has a default, so an empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    /// The bearer token clients have to present, if any.
    #[serde(default = "ConfigDefaults::auth_token")]
    pub auth_token: Option<String>,

    #[serde(default = "ConfigDefaults::worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "ConfigDefaults::request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    #[serde(default = "ConfigDefaults::post_limit")]
    pub post_limit: u64,

    #[serde(default = "ConfigDefaults::discovery_interval_seconds")]
    pub discovery_interval_seconds: u64,

    /// Whether a key may have more than one active certificate.
    #[serde(default = "ConfigDefaults::multiple_active_certs")]
    pub multiple_active_certs: bool,

    #[serde(default = "ConfigDefaults::software_token")]
    pub software_token: bool,

    #[serde(default)]
    pub ocsp: OcspConfig,

    #[serde(default)]
    pub hsm_modules: Vec<HsmModuleConfig>,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    /// The size of the blocking thread pool.
    ///
    /// RPC operations take at most `worker_threads` of them. Discovery and
    /// the name lookups of the OCSP fetcher need a few more.
    pub fn max_blocking_threads(&self) -> usize {
        self.worker_threads + 4
    }
}

impl Config {
    /// Reads, verifies and returns the config in the given file.
    ///
    /// Logging is initialised as soon as the file could be parsed so that
    /// verification failures end up in the configured log.
    pub fn create(config_file: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_config(config_file).map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(), e
            ))
        })?;
        config.init_logging()?;
        info!(
            "{} uses configuration file: {}",
            SIGNER_SERVER_APP, config_file.display()
        );
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(), e
            ))
        })?;
        Ok(config)
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::from)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.port < 1024 {
            return Err(ConfigError::other("Port number must be >1024"));
        }

        if self.worker_threads == 0 {
            return Err(ConfigError::other("worker_threads must be at least 1"));
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::other(
                "request_timeout_seconds must be at least 1"
            ));
        }

        if self.discovery_interval_seconds == 0 {
            return Err(ConfigError::other(
                "discovery_interval_seconds must be at least 1"
            ));
        }

        self.ocsp.verify()?;

        let mut names: Vec<_> = self.hsm_modules.iter().map(|module| {
            module.name.as_str()
        }).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::other(
                "HSM module names must be unique"
            ));
        }
        if !self.software_token && self.hsm_modules.is_empty() {
            return Err(ConfigError::other(
                "at least one of software_token or hsm_modules must be enabled"
            ));
        }

        Ok(())
    }

    /// Returns a config for tests using the given data directory.
    pub fn test(data_dir: &Path) -> Self {
        Config {
            ip: ConfigDefaults::ip(),
            port: ConfigDefaults::port(),
            data_dir: data_dir.to_path_buf(),
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            auth_token: None,
            worker_threads: 2,
            request_timeout_seconds: 10,
            post_limit: ConfigDefaults::post_limit(),
            discovery_interval_seconds: 1,
            multiple_active_certs: false,
            software_token: true,
            ocsp: OcspConfig::default(),
            hsm_modules: Vec::new(),
        }
    }
}


//------------ Logging -------------------------------------------------------

impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            LogType::Syslog => self.syslog_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger().chain(io::stderr()).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init stderr logging: {e}"))
        })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}", path.display(), err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger().chain(file).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init file logging: {e}"))
        })
    }

    /// Creates a syslog logger.
    ///
    /// Tries the local unix socket first, then TCP and UDP on localhost.
    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        let facility = Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("signerd"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => {
                self.fern_logger().chain(logger).apply().map_err(|e| {
                    ConfigError::Other(format!("Failed to init syslog: {e}"))
                })
            }
            Err(err) => {
                Err(ConfigError::Other(
                    format!("Cannot connect to syslog: {err}")
                ))
            }
        }
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        Err(ConfigError::other("syslog is only supported on unix systems"))
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);
        let storage_level = self.log_level.min(LevelFilter::Debug);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("mio", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
            .level_for("cryptoki", framework_level)
            .level_for("tokensigner::commons::file", storage_level)
    }
}


//------------ OcspConfig ----------------------------------------------------

/// Settings of the OCSP cache and its refresh cycle.
#[derive(Clone, Debug, Deserialize)]
pub struct OcspConfig {
    #[serde(default = "OcspConfig::dflt_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,

    #[serde(default = "OcspConfig::dflt_refresh_ahead_seconds")]
    pub refresh_ahead_seconds: u64,

    /// How long after the last successful fetch stale data may be served.
    #[serde(default = "OcspConfig::dflt_staleness_ceiling_seconds")]
    pub staleness_ceiling_seconds: u64,

    /// Validity assumed for responses without a next update time.
    #[serde(default = "OcspConfig::dflt_default_validity_seconds")]
    pub default_validity_seconds: u64,

    #[serde(default = "OcspConfig::dflt_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,

    /// Directory with PEM encoded issuer certificates.
    #[serde(default)]
    pub ca_certs_dir: Option<PathBuf>,
}

impl Default for OcspConfig {
    fn default() -> Self {
        OcspConfig {
            refresh_interval_seconds: Self::dflt_refresh_interval_seconds(),
            refresh_ahead_seconds: Self::dflt_refresh_ahead_seconds(),
            staleness_ceiling_seconds: Self::dflt_staleness_ceiling_seconds(),
            default_validity_seconds: Self::dflt_default_validity_seconds(),
            fetch_timeout_seconds: Self::dflt_fetch_timeout_seconds(),
            ca_certs_dir: None,
        }
    }
}

impl OcspConfig {
    fn dflt_refresh_interval_seconds() -> u64 {
        60
    }

    fn dflt_refresh_ahead_seconds() -> u64 {
        600
    }

    fn dflt_staleness_ceiling_seconds() -> u64 {
        7200
    }

    fn dflt_default_validity_seconds() -> u64 {
        3600
    }

    fn dflt_fetch_timeout_seconds() -> u64 {
        20
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn refresh_ahead(&self) -> chrono::Duration {
        seconds(self.refresh_ahead_seconds)
    }

    pub fn staleness_ceiling(&self) -> chrono::Duration {
        seconds(self.staleness_ceiling_seconds)
    }

    pub fn default_validity(&self) -> chrono::Duration {
        seconds(self.default_validity_seconds)
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_seconds == 0 {
            return Err(ConfigError::other(
                "ocsp.refresh_interval_seconds must be at least 1"
            ));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(ConfigError::other(
                "ocsp.fetch_timeout_seconds must be at least 1"
            ));
        }
        if self.default_validity_seconds == 0 {
            return Err(ConfigError::other(
                "ocsp.default_validity_seconds must be at least 1"
            ));
        }
        if self.staleness_ceiling_seconds < self.refresh_interval_seconds {
            return Err(ConfigError::other(
                "ocsp.staleness_ceiling_seconds must not be shorter than \
                 ocsp.refresh_interval_seconds"
            ));
        }
        Ok(())
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}


//------------ HsmModuleConfig -----------------------------------------------

/// A PKCS#11 library to load hardware tokens from.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct HsmModuleConfig {
    /// The module name, used as the prefix of its token ids.
    pub name: String,

    /// Path to the vendor PKCS#11 library.
    pub library: PathBuf,

    #[serde(default = "HsmModuleConfig::dflt_batch_signing_enabled")]
    pub batch_signing_enabled: bool,

    #[serde(default)]
    pub read_only: bool,
}

impl HsmModuleConfig {
    fn dflt_batch_signing_enabled() -> bool {
        true
    }
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError { }

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{s}\""
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ Tests ---------------------------------------------------------
