use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::shared::error::ConfigError;

/// Full runtime configuration, one section per stage.
#[derive(Clone, Debug)]
pub struct Config {
    pub audio: AudioConfig,
    pub hub: HubConfig,
    pub vio: VioConfig,
    pub vad: VadConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
}

impl Config {
    /// Reads every section from the environment and validates the result.
    ///
    /// Invalid regexes, a VAD without hysteresis or an unusable audio geometry are
    /// reported as `ConfigError` so the process refuses to start.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            audio: AudioConfig::from_env(),
            hub: HubConfig::from_env()?,
            vio: VioConfig::from_env()?,
            vad: VadConfig::from_env(),
            asr: AsrConfig::from_env(),
            tts: TtsConfig::from_env(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audio.validate()?;
        self.vad.validate()?;
        self.vio.validate()?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub samples_per_frame: usize,
}

impl AudioConfig {
    fn from_env() -> Self {
        Self {
            sample_rate: env_u32("AUDIO_SAMPLE_RATE", 8000),
            samples_per_frame: env_u64("AUDIO_SAMPLES_PER_FRAME", 160) as usize,
        }
    }

    /// Wall-clock length of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(self.samples_per_frame as u64 * 1_000_000 / self.sample_rate as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.samples_per_frame == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUDIO_SAMPLES_PER_FRAME",
                reason: "must be greater than zero".to_string(),
            });
        }
        // G.711 is the only negotiated codec family
        if self.sample_rate != 8000 {
            return Err(ConfigError::InvalidValue {
                key: "AUDIO_SAMPLE_RATE",
                reason: format!("{} Hz is not supported, use 8000", self.sample_rate),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub main_loop_sleep_time: Duration,
    pub last_period_max_num_calls: u32,
    pub last_period_max_total_time: Duration,
    pub last_period_max_num_short_calls: u32,
    pub blacklist_for: Duration,
    pub limit_reached_message: String,
    pub hard_time_limit: Duration,
    pub hard_turn_limit: u32,
    pub input_timeout: Duration,
    pub call_db: PathBuf,
    pub period: Duration,
    pub short_call_threshold: Duration,
    pub call_back_uri: Option<String>,
    pub call_back_uri_subs: Vec<(Regex, String)>,
    pub wait_time_before_calling_back: Option<Duration>,
    pub ncalls: u32,
}

impl HubConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let call_back_uri_subs = match env_non_empty("HUB_CALL_BACK_URI_SUBS") {
            Some(raw) => parse_substitutions("HUB_CALL_BACK_URI_SUBS", &raw)?,
            None => Vec::new(),
        };
        Ok(Self {
            main_loop_sleep_time: env_duration_ms("HUB_MAIN_LOOP_SLEEP_MS", 10),
            last_period_max_num_calls: env_u32("HUB_LAST_PERIOD_MAX_NUM_CALLS", 100),
            last_period_max_total_time: env_duration_sec(
                "HUB_LAST_PERIOD_MAX_TOTAL_TIME_SEC",
                3 * 60 * 60,
            ),
            last_period_max_num_short_calls: env_u32("HUB_LAST_PERIOD_MAX_NUM_SHORT_CALLS", 15),
            blacklist_for: env_duration_sec("HUB_BLACKLIST_FOR_SEC", 2 * 60 * 60),
            limit_reached_message: env_non_empty("HUB_LIMIT_REACHED_MESSAGE").unwrap_or_else(|| {
                "Thank you for calling. You have reached the limit of calls for today. Goodbye."
                    .to_string()
            }),
            hard_time_limit: env_duration_sec("HUB_HARD_TIME_LIMIT_SEC", 15 * 60),
            hard_turn_limit: env_u32("HUB_HARD_TURN_LIMIT", 120),
            input_timeout: env_duration_sec("HUB_INPUT_TIMEOUT_SEC", 10),
            call_db: PathBuf::from(
                env_non_empty("HUB_CALL_DB").unwrap_or_else(|| "call_db.json".to_string()),
            ),
            period: env_duration_sec("HUB_PERIOD_SEC", 24 * 60 * 60),
            short_call_threshold: env_duration_sec("HUB_SHORT_CALL_SEC", 5),
            call_back_uri: env_non_empty("HUB_CALL_BACK_URI"),
            call_back_uri_subs,
            wait_time_before_calling_back: std::env::var("HUB_WAIT_TIME_BEFORE_CALLING_BACK_SEC")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            ncalls: env_u32("HUB_NCALLS", 0),
        })
    }
}

#[derive(Clone, Debug)]
pub struct VioConfig {
    pub sip_bind_ip: String,
    pub sip_port: u16,
    pub rtp_port: u16,
    pub local_ip: String,
    pub advertised_ip: String,
    pub domain: String,
    pub user: String,
    pub password: Option<String>,
    pub registrar: Option<String>,
    pub register_expires: u32,
    pub allowed_phone_numbers: Option<Regex>,
    pub forbidden_phone_numbers: Option<Regex>,
    pub allowed_users: Option<Regex>,
    pub forbidden_users: Option<Regex>,
    pub allowed_hosts: Option<Regex>,
    pub forbidden_hosts: Option<Regex>,
    pub reject_calls: bool,
    pub sessions_dir: PathBuf,
}

impl VioConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let local_ip = std::env::var("LOCAL_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
        let advertised_ip = std::env::var("ADVERTISED_IP").unwrap_or_else(|_| local_ip.clone());
        Ok(Self {
            sip_bind_ip: std::env::var("SIP_BIND_IP").unwrap_or_else(|_| "0.0.0.0".to_string()),
            sip_port: env_u16("SIP_PORT", 5060),
            rtp_port: env_u16("RTP_PORT", 10000),
            local_ip,
            advertised_ip,
            domain: env_non_empty("VIO_DOMAIN").unwrap_or_default(),
            user: env_non_empty("VIO_USER").unwrap_or_else(|| "voicehub".to_string()),
            password: env_non_empty("VIO_PASSWORD"),
            registrar: env_non_empty("VIO_REGISTRAR"),
            register_expires: env_u32("VIO_REGISTER_EXPIRES", 3600),
            allowed_phone_numbers: env_regex("VIO_ALLOWED_PHONE_NUMBERS")?,
            forbidden_phone_numbers: env_regex("VIO_FORBIDDEN_PHONE_NUMBERS")?,
            allowed_users: env_regex("VIO_ALLOWED_USERS")?,
            forbidden_users: env_regex("VIO_FORBIDDEN_USERS")?,
            allowed_hosts: env_regex("VIO_ALLOWED_HOSTS")?,
            forbidden_hosts: env_regex("VIO_FORBIDDEN_HOSTS")?,
            reject_calls: env_bool("VIO_REJECT_CALLS", false),
            sessions_dir: PathBuf::from(
                env_non_empty("SESSIONS_DIR").unwrap_or_else(|| "sessions".to_string()),
            ),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.registrar.is_some() {
            if self.domain.is_empty() {
                return Err(ConfigError::Missing("VIO_DOMAIN"));
            }
            if self.user.is_empty() {
                return Err(ConfigError::Missing("VIO_USER"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct VadConfig {
    pub decision_frames_speech: usize,
    pub decision_frames_sil: usize,
    pub decision_speech_threshold: f32,
    pub decision_non_speech_threshold: f32,
    pub speech_buffer_frames: usize,
    pub power: PowerVadConfig,
}

#[derive(Clone, Debug)]
pub struct PowerVadConfig {
    pub threshold: f32,
    pub threshold_multiplier: f32,
    pub adaptation_frames: u32,
}

impl VadConfig {
    fn from_env() -> Self {
        Self {
            decision_frames_speech: env_u64("VAD_DECISION_FRAMES_SPEECH", 15) as usize,
            decision_frames_sil: env_u64("VAD_DECISION_FRAMES_SIL", 40) as usize,
            decision_speech_threshold: env_f32("VAD_DECISION_SPEECH_THRESHOLD", 0.7),
            decision_non_speech_threshold: env_f32("VAD_DECISION_NON_SPEECH_THRESHOLD", 0.1),
            speech_buffer_frames: env_u64("VAD_SPEECH_BUFFER_FRAMES", 35) as usize,
            power: PowerVadConfig {
                threshold: env_f32("VAD_POWER_THRESHOLD", 300.0),
                threshold_multiplier: env_f32("VAD_POWER_THRESHOLD_MULTIPLIER", 1.0),
                adaptation_frames: env_u32("VAD_POWER_ADAPTATION_FRAMES", 30),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.decision_frames_speech == 0 || self.decision_frames_sil == 0 {
            return Err(ConfigError::InvalidValue {
                key: "VAD_DECISION_FRAMES_*",
                reason: "decision windows must hold at least one frame".to_string(),
            });
        }
        if self.decision_speech_threshold <= self.decision_non_speech_threshold {
            return Err(ConfigError::Hysteresis {
                up: self.decision_speech_threshold,
                down: self.decision_non_speech_threshold,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AsrConfig {
    pub command: Option<String>,
    pub timeout: Duration,
}

impl AsrConfig {
    fn from_env() -> Self {
        Self {
            command: env_non_empty("ASR_COMMAND"),
            timeout: env_duration_sec("ASR_TIMEOUT_SEC", 10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TtsConfig {
    pub command: Option<String>,
    pub timeout: Duration,
}

impl TtsConfig {
    fn from_env() -> Self {
        Self {
            command: env_non_empty("TTS_COMMAND"),
            timeout: env_duration_sec("TTS_TIMEOUT_SEC", 10),
        }
    }
}

#[derive(Clone, Debug)]
pub enum LogMode {
    Stdout,
    File,
}

#[derive(Clone, Debug)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub mode: LogMode,
    pub format: LogFormat,
    pub dir: Option<String>,
    pub file_name: String,
}

impl LoggingConfig {
    fn from_env() -> Self {
        let dir_env = env_non_empty("LOG_DIR");
        let format = match env_non_empty("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let mode = match env_non_empty("LOG_MODE").as_deref() {
            Some("file") => LogMode::File,
            Some("stdout") => LogMode::Stdout,
            _ if dir_env.is_some() => LogMode::File,
            _ => LogMode::Stdout,
        };
        let dir = match mode {
            LogMode::File => Some(dir_env.unwrap_or_else(|| "logs".to_string())),
            LogMode::Stdout => None,
        };
        Self {
            mode,
            format,
            dir,
            file_name: env_non_empty("LOG_FILE_NAME").unwrap_or_else(|| "voicehub.log".to_string()),
        }
    }
}

static LOGGING: OnceLock<LoggingConfig> = OnceLock::new();

pub fn logging_config() -> &'static LoggingConfig {
    LOGGING.get_or_init(LoggingConfig::from_env)
}

/// Parses `pattern=>replacement` pairs separated by `;`.
fn parse_substitutions(key: &str, raw: &str) -> Result<Vec<(Regex, String)>, ConfigError> {
    let mut subs = Vec::new();
    for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((pattern, replacement)) = pair.split_once("=>") else {
            return Err(ConfigError::InvalidValue {
                key: "HUB_CALL_BACK_URI_SUBS",
                reason: format!("expected pattern=>replacement, got {:?}", pair),
            });
        };
        let re = Regex::new(pattern.trim()).map_err(|source| ConfigError::InvalidRegex {
            key: key.to_string(),
            source,
        })?;
        subs.push((re, replacement.trim().to_string()));
    }
    Ok(subs)
}

fn env_regex(key: &str) -> Result<Option<Regex>, ConfigError> {
    match env_non_empty(key) {
        Some(pattern) => Regex::new(&pattern)
            .map(Some)
            .map_err(|source| ConfigError::InvalidRegex {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_ms))
}

fn env_duration_sec(key: &str, default_sec: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_sec))
}

fn env_bool(key: &str, default_value: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default_value)
}

fn env_u16(key: &str, default_value: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default_value)
}

fn env_u32(key: &str, default_value: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn env_f32(key: &str, default_value: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f32>().ok())
        .unwrap_or(default_value)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deterministic configuration for unit tests, independent of the process environment.
    pub fn test_config() -> Config {
        Config {
            audio: AudioConfig {
                sample_rate: 8000,
                samples_per_frame: 160,
            },
            hub: HubConfig {
                main_loop_sleep_time: Duration::from_millis(10),
                last_period_max_num_calls: 50,
                last_period_max_total_time: Duration::from_secs(3 * 60 * 60),
                last_period_max_num_short_calls: 15,
                blacklist_for: Duration::from_secs(7200),
                limit_reached_message: "Limit reached.".to_string(),
                hard_time_limit: Duration::from_secs(900),
                hard_turn_limit: 120,
                input_timeout: Duration::from_secs(10),
                call_db: PathBuf::from("call_db.json"),
                period: Duration::from_secs(24 * 60 * 60),
                short_call_threshold: Duration::from_secs(5),
                call_back_uri: None,
                call_back_uri_subs: Vec::new(),
                wait_time_before_calling_back: None,
                ncalls: 0,
            },
            vio: VioConfig {
                sip_bind_ip: "127.0.0.1".to_string(),
                sip_port: 0,
                rtp_port: 0,
                local_ip: "127.0.0.1".to_string(),
                advertised_ip: "127.0.0.1".to_string(),
                domain: "example.com".to_string(),
                user: "voicehub".to_string(),
                password: None,
                registrar: None,
                register_expires: 3600,
                allowed_phone_numbers: None,
                forbidden_phone_numbers: None,
                allowed_users: None,
                forbidden_users: None,
                allowed_hosts: None,
                forbidden_hosts: None,
                reject_calls: false,
                sessions_dir: PathBuf::from("sessions"),
            },
            vad: VadConfig {
                decision_frames_speech: 3,
                decision_frames_sil: 5,
                decision_speech_threshold: 0.6,
                decision_non_speech_threshold: 0.2,
                speech_buffer_frames: 4,
                power: PowerVadConfig {
                    threshold: 300.0,
                    threshold_multiplier: 1.0,
                    adaptation_frames: 0,
                },
            },
            asr: AsrConfig {
                command: None,
                timeout: Duration::from_secs(2),
            },
            tts: TtsConfig {
                command: None,
                timeout: Duration::from_secs(2),
            },
        }
    }
}
