use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::density::{validate_threshold, DEFAULT_DENSITY_THRESHOLD};

const DEFAULT_SITE_NAME: &str = "Avenida dos Estados";
const DEFAULT_FIXTURE_DIR: &str = "resources/images/fixtures";
const DEFAULT_LIVE_URL: &str = "https://cameras.santoandre.sp.gov.br/coi04/ID_655";
const DEFAULT_CAMERA_ID: u32 = 655;
const DEFAULT_DEMO_INTERVAL_SECS: u64 = 5;
const DEFAULT_LIVE_INTERVAL_SECS: u64 = 36;
const DEFAULT_REPORT_THROTTLE_SECS: u64 = 36;
const DEFAULT_EMPTY_RETRY_SECS: u64 = 2;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_OPEN_ATTEMPTS: u32 = 3;
const DEFAULT_READ_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_INTERACTIVE_ROOT: &str = "resources/images";
const DEFAULT_MODEL_WEIGHTS: &str = "resources/models/yolov3.onnx";
const DEFAULT_MODEL_INPUT: u32 = 416;
const DEFAULT_CHANNEL: &str = "traffic-alerts";
const DEFAULT_MQTT_CLIENT_ID: &str = "traffic_sentinel";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "traffic";

/// Traffic source selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Cycle through a fixed directory of sample images.
    Demo,
    /// Pull frames from a remote camera feed.
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "demo" => Ok(Self::Demo),
            "live" => Ok(Self::Live),
            other => Err(anyhow!("invalid mode '{}': expected 'demo' or 'live'", other)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demo => write!(f, "demo"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Runtime execution model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionModel {
    /// Long-running loop on an operator's machine.
    Interactive,
    /// Exactly one cycle per invocation (e.g. a serverless trigger).
    SingleShot,
}

impl FromStr for ExecutionModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "interactive" | "local" => Ok(Self::Interactive),
            "single-shot" | "single_shot" | "singleshot" | "oneshot" => Ok(Self::SingleShot),
            other => Err(anyhow!(
                "invalid execution model '{}': expected 'interactive' or 'single-shot'",
                other
            )),
        }
    }
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::SingleShot => write!(f, "single-shot"),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    mode: Option<String>,
    execution: Option<String>,
    capture_interval_secs: Option<u64>,
    report_throttle_secs: Option<u64>,
    empty_retry_secs: Option<u64>,
    density_threshold: Option<f64>,
    site_name: Option<String>,
    fixture_dir: Option<PathBuf>,
    live: Option<LiveConfigFile>,
    scratch: Option<ScratchConfigFile>,
    model: Option<ModelConfigFile>,
    notify: Option<NotifyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveConfigFile {
    url: Option<String>,
    camera_id: Option<u32>,
    probe_timeout_ms: Option<u64>,
    open_attempts: Option<u32>,
    read_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    preview: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ScratchConfigFile {
    interactive_root: Option<PathBuf>,
    single_shot_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    weights: Option<PathBuf>,
    labels: Option<PathBuf>,
    input_size: Option<u32>,
    backend: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    channel: Option<String>,
    audit_log: Option<PathBuf>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: Option<String>,
    tls_ca_path: Option<PathBuf>,
}

/// Startup configuration. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub execution: ExecutionModel,
    pub capture_interval: Duration,
    pub report_throttle: Duration,
    /// Short pause after an empty acquisition.
    pub empty_retry: Duration,
    pub density_threshold: f64,
    pub site_name: String,
    pub fixture_dir: PathBuf,
    pub live: LiveSettings,
    pub scratch: ScratchSettings,
    pub model: ModelSettings,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub url: String,
    pub camera_id: u32,
    pub probe_timeout: Duration,
    pub open_attempts: u32,
    pub read_attempts: u32,
    pub retry_backoff: Duration,
    /// Operator preview on the first successful open (interactive only).
    pub preview: bool,
}

#[derive(Debug, Clone)]
pub struct ScratchSettings {
    pub interactive_root: PathBuf,
    pub single_shot_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub backend: BackendKind,
    pub weights: PathBuf,
    /// Class names, one per line, indexed by class id.
    pub labels: Option<PathBuf>,
    pub input_size: u32,
}

/// Inference engine behind the detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// ONNX model executed with tract.
    Tract,
    /// Deterministic pixel-hash backend for dry runs without model files.
    Stub,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tract" | "onnx" => Ok(Self::Tract),
            "stub" => Ok(Self::Stub),
            other => Err(anyhow!(
                "invalid detector backend '{}': expected 'tract' or 'stub'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// Logical channel name; doubles as the message group key.
    pub channel: String,
    pub audit_log: Option<PathBuf>,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    /// CA bundle for `mqtts://` brokers; platform roots when unset.
    pub tls_ca_path: Option<PathBuf>,
}

/// Selectors taken from the command line. They win over file and environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub mode: Option<Mode>,
    pub execution: Option<ExecutionModel>,
}

impl RunConfig {
    /// Load from `TRAFFIC_CONFIG` (if set), then environment, then `overrides`.
    pub fn load(overrides: Overrides) -> Result<Self> {
        let config_path = std::env::var("TRAFFIC_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        Self::from_layers(file_cfg.unwrap_or_default(), overrides)
    }

    /// Defaults for `mode` with no file or environment input.
    pub fn defaults(mode: Mode, execution: ExecutionModel) -> Result<Self> {
        let mut cfg = Self::from_file(RunConfigFile::default(), mode, execution)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Whether a mode was configured anywhere other than the command line.
    pub fn configured_mode() -> Result<Option<Mode>> {
        if let Ok(mode) = std::env::var("TRAFFIC_MODE") {
            if !mode.trim().is_empty() {
                return Ok(Some(mode.parse()?));
            }
        }
        if let Ok(path) = std::env::var("TRAFFIC_CONFIG") {
            if !path.trim().is_empty() {
                let file = read_config_file(Path::new(&path))?;
                return file.mode.as_deref().map(str::parse).transpose();
            }
        }
        Ok(None)
    }

    fn from_layers(file: RunConfigFile, overrides: Overrides) -> Result<Self> {
        let mode = match overrides.mode {
            Some(mode) => mode,
            None => match env_nonempty("TRAFFIC_MODE") {
                Some(mode) => mode.parse()?,
                None => match file.mode.as_deref() {
                    Some(mode) => mode.parse()?,
                    None => return Err(anyhow!("no mode selected: expected 'demo' or 'live'")),
                },
            },
        };
        let execution = match overrides.execution {
            Some(execution) => execution,
            None => match resolve_env_execution()? {
                Some(execution) => execution,
                None => match file.execution.as_deref() {
                    Some(execution) => execution.parse()?,
                    None => ExecutionModel::Interactive,
                },
            },
        };
        let mut cfg = Self::from_file(file, mode, execution)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile, mode: Mode, execution: ExecutionModel) -> Result<Self> {
        let default_interval = match mode {
            Mode::Demo => DEFAULT_DEMO_INTERVAL_SECS,
            Mode::Live => DEFAULT_LIVE_INTERVAL_SECS,
        };
        let live = file.live.unwrap_or_default();
        let scratch = file.scratch.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let notify = file.notify.unwrap_or_default();

        let mqtt = notify.mqtt.and_then(|mqtt| {
            mqtt.broker_addr.map(|broker_addr| MqttSettings {
                broker_addr,
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                tls_ca_path: mqtt.tls_ca_path,
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            })
        });

        Ok(Self {
            mode,
            execution,
            capture_interval: Duration::from_secs(
                file.capture_interval_secs.unwrap_or(default_interval),
            ),
            report_throttle: Duration::from_secs(
                file.report_throttle_secs
                    .unwrap_or(DEFAULT_REPORT_THROTTLE_SECS),
            ),
            empty_retry: Duration::from_secs(
                file.empty_retry_secs.unwrap_or(DEFAULT_EMPTY_RETRY_SECS),
            ),
            density_threshold: file
                .density_threshold
                .unwrap_or(DEFAULT_DENSITY_THRESHOLD),
            site_name: file
                .site_name
                .unwrap_or_else(|| DEFAULT_SITE_NAME.to_string()),
            fixture_dir: file
                .fixture_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FIXTURE_DIR)),
            live: LiveSettings {
                url: live.url.unwrap_or_else(|| DEFAULT_LIVE_URL.to_string()),
                camera_id: live.camera_id.unwrap_or(DEFAULT_CAMERA_ID),
                probe_timeout: Duration::from_millis(
                    live.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
                ),
                open_attempts: live.open_attempts.unwrap_or(DEFAULT_OPEN_ATTEMPTS),
                read_attempts: live.read_attempts.unwrap_or(DEFAULT_READ_ATTEMPTS),
                retry_backoff: Duration::from_millis(
                    live.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
                preview: live.preview.unwrap_or(true),
            },
            scratch: ScratchSettings {
                interactive_root: scratch
                    .interactive_root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERACTIVE_ROOT)),
                single_shot_root: scratch
                    .single_shot_root
                    .unwrap_or_else(std::env::temp_dir),
            },
            model: ModelSettings {
                backend: match model.backend.as_deref() {
                    Some(value) => value.parse()?,
                    None => BackendKind::Tract,
                },
                weights: model
                    .weights
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_WEIGHTS)),
                labels: model.labels,
                input_size: model.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
            },
            notify: NotifySettings {
                channel: notify
                    .channel
                    .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                audit_log: notify.audit_log,
                mqtt,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(site) = env_nonempty("TRAFFIC_SITE_NAME") {
            self.site_name = site;
        }
        if let Some(dir) = env_nonempty("TRAFFIC_FIXTURE_DIR") {
            self.fixture_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_nonempty("TRAFFIC_LIVE_URL") {
            self.live.url = url;
        }
        if let Some(path) = env_nonempty("TRAFFIC_MODEL_WEIGHTS") {
            self.model.weights = PathBuf::from(path);
        }
        if let Some(backend) = env_nonempty("TRAFFIC_DETECTOR_BACKEND") {
            self.model.backend = backend.parse()?;
        }
        if let Some(secs) = env_nonempty("TRAFFIC_CAPTURE_INTERVAL_SECS") {
            self.capture_interval = Duration::from_secs(secs.parse().map_err(|_| {
                anyhow!("TRAFFIC_CAPTURE_INTERVAL_SECS must be an integer number of seconds")
            })?);
        }
        if let Some(secs) = env_nonempty("TRAFFIC_REPORT_THROTTLE_SECS") {
            self.report_throttle = Duration::from_secs(secs.parse().map_err(|_| {
                anyhow!("TRAFFIC_REPORT_THROTTLE_SECS must be an integer number of seconds")
            })?);
        }
        if let Some(threshold) = env_nonempty("TRAFFIC_DENSITY_THRESHOLD") {
            self.density_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_DENSITY_THRESHOLD must be a number"))?;
        }
        if let Some(addr) = env_nonempty("MQTT_BROKER_ADDR") {
            match self.notify.mqtt.as_mut() {
                Some(mqtt) => mqtt.broker_addr = addr,
                None => {
                    self.notify.mqtt = Some(MqttSettings {
                        broker_addr: addr,
                        client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                        username: None,
                        password: None,
                        topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                        tls_ca_path: None,
                    })
                }
            }
        }
        if let Some(mqtt) = self.notify.mqtt.as_mut() {
            if let Some(user) = env_nonempty("MQTT_USERNAME") {
                mqtt.username = Some(user);
            }
            if let Some(password) = env_nonempty("MQTT_PASSWORD") {
                mqtt.password = Some(password);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (name, interval) in [
            ("capture interval", self.capture_interval),
            ("report throttle", self.report_throttle),
            ("empty retry", self.empty_retry),
        ] {
            if interval.is_zero() {
                return Err(anyhow!("{} must be at least one second", name));
            }
        }
        if self.empty_retry >= self.capture_interval {
            return Err(anyhow!(
                "empty retry ({}s) must be shorter than the capture interval ({}s)",
                self.empty_retry.as_secs(),
                self.capture_interval.as_secs()
            ));
        }
        validate_threshold(self.density_threshold)?;
        self.site_name = self.site_name.trim().to_string();
        if self.site_name.is_empty() {
            return Err(anyhow!("site name must not be empty"));
        }
        if self.live.open_attempts == 0 || self.live.read_attempts == 0 {
            return Err(anyhow!("live open/read attempts must be at least 1"));
        }
        if self.model.input_size == 0 || self.model.input_size % 32 != 0 {
            return Err(anyhow!(
                "model input size must be a positive multiple of 32 (got {})",
                self.model.input_size
            ));
        }
        validate_channel_name(&self.notify.channel)?;
        Ok(())
    }

    /// Root directory for captured frames and filtered artifacts.
    pub fn scratch_root(&self) -> &Path {
        match self.execution {
            ExecutionModel::Interactive => &self.scratch.interactive_root,
            ExecutionModel::SingleShot => &self.scratch.single_shot_root,
        }
    }

    /// Local audit log path for rendered notifications.
    pub fn audit_log_path(&self) -> PathBuf {
        self.notify
            .audit_log
            .clone()
            .unwrap_or_else(|| self.scratch_root().join("traffic_notifications.log"))
    }
}

/// Channel names are used verbatim as group keys and MQTT topic segments.
pub fn validate_channel_name(channel: &str) -> Result<()> {
    static CHANNEL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CHANNEL_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,80}$").expect("channel regex is valid")
    });
    if !re.is_match(channel) {
        return Err(anyhow!(
            "notify channel must match ^[A-Za-z0-9_-]{{1,80}}$ (got '{}')",
            channel
        ));
    }
    Ok(())
}

/// `TRAFFIC_EXECUTION` wins; otherwise `ENVIRONMENT=local` means interactive
/// and any other value means single-shot.
fn resolve_env_execution() -> Result<Option<ExecutionModel>> {
    if let Some(execution) = env_nonempty("TRAFFIC_EXECUTION") {
        return Ok(Some(execution.parse()?));
    }
    Ok(env_nonempty("ENVIRONMENT").map(|env| {
        if env.trim().eq_ignore_ascii_case("local") {
            ExecutionModel::Interactive
        } else {
            ExecutionModel::SingleShot
        }
    }))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RunConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_is_case_insensitive() {
        assert_eq!("DEMO".parse::<Mode>().unwrap(), Mode::Demo);
        assert_eq!(" live ".parse::<Mode>().unwrap(), Mode::Live);
        assert!("replay".parse::<Mode>().is_err());
    }

    #[test]
    fn execution_model_accepts_aliases() {
        assert_eq!(
            "local".parse::<ExecutionModel>().unwrap(),
            ExecutionModel::Interactive
        );
        assert_eq!(
            "single_shot".parse::<ExecutionModel>().unwrap(),
            ExecutionModel::SingleShot
        );
        assert!("batch".parse::<ExecutionModel>().is_err());
    }

    #[test]
    fn defaults_follow_mode_cadence() {
        let demo = RunConfig::defaults(Mode::Demo, ExecutionModel::Interactive).unwrap();
        assert_eq!(demo.capture_interval, Duration::from_secs(5));
        let live = RunConfig::defaults(Mode::Live, ExecutionModel::Interactive).unwrap();
        assert_eq!(live.capture_interval, Duration::from_secs(36));
        assert_eq!(live.report_throttle, Duration::from_secs(36));
        assert!((live.density_threshold - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn scratch_root_depends_on_execution_model() {
        let interactive = RunConfig::defaults(Mode::Live, ExecutionModel::Interactive).unwrap();
        assert_eq!(interactive.scratch_root(), Path::new("resources/images"));
        let single = RunConfig::defaults(Mode::Live, ExecutionModel::SingleShot).unwrap();
        assert_eq!(single.scratch_root(), std::env::temp_dir().as_path());
    }

    #[test]
    fn rejects_negative_threshold() {
        let mut cfg = RunConfig::defaults(Mode::Demo, ExecutionModel::Interactive).unwrap();
        cfg.density_threshold = -0.1;
        assert!(cfg.validate().is_err());
        cfg.density_threshold = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn channel_names_are_restricted() {
        assert!(validate_channel_name("traffic-alerts").is_ok());
        assert!(validate_channel_name("traffic alerts").is_err());
        assert!(validate_channel_name("").is_err());
    }
}
