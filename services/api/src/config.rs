use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use voxrelay_core::tts::VOICES;
use voxrelay_core::{ListenMode, SessionConfig};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, String),
}

/// Which OpenAI-compatible endpoint answers chat requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: String,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub tts_voice: String,
    pub asr_model: String,
    pub audio_output_dir: PathBuf,
    pub delete_audio: bool,
    pub quick_reply: bool,
    pub quick_reply_words: Vec<String>,
    pub wake_words: Vec<String>,
    pub exit_commands: Vec<String>,
    pub listen_mode: ListenMode,
    pub max_history_turns: usize,
    pub max_tool_rounds: usize,
    pub prompts_path: PathBuf,
    pub functions_path: Option<PathBuf>,
    pub log_level: Level,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn list_var(name: &str, default: Vec<String>) -> Vec<String> {
    match var(name) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        None => default,
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = SessionConfig::default();

        let bind_address = parse_var("BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 8000)))?;

        let provider = match var("LLM_PROVIDER").map(|p| p.to_lowercase()).as_deref() {
            None | Some("openai") => Provider::OpenAI,
            Some("gemini") => Provider::Gemini,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{other}' is not one of openai, gemini"),
                ));
            }
        };

        let openai_api_key =
            var("OPENAI_API_KEY").ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".into()))?;
        let gemini_api_key = var("GEMINI_API_KEY");
        if provider == Provider::Gemini && gemini_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
            ));
        }

        let tts_voice = var("TTS_VOICE").unwrap_or_else(|| "alloy".to_string());
        if !VOICES.contains(&tts_voice.as_str()) {
            return Err(ConfigError::InvalidValue(
                "TTS_VOICE".to_string(),
                format!("'{tts_voice}' is not one of {}", VOICES.join(", ")),
            ));
        }

        let listen_mode = match var("LISTEN_MODE") {
            Some(raw) => serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
                .map_err(|_| {
                    ConfigError::InvalidValue(
                        "LISTEN_MODE".to_string(),
                        format!("'{raw}' is not one of manual, auto, realtime"),
                    )
                })?,
            None => defaults.listen_mode,
        };

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{log_level_str}' is not a valid log level"),
            )
        })?;

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model: var("CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            tts_voice,
            asr_model: var("ASR_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
            audio_output_dir: var("AUDIO_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./tmp")),
            delete_audio: parse_var("DELETE_AUDIO", defaults.delete_audio)?,
            quick_reply: parse_var("QUICK_REPLY", defaults.quick_reply)?,
            quick_reply_words: list_var("QUICK_REPLY_WORDS", defaults.quick_reply_words),
            wake_words: list_var("WAKE_WORDS", defaults.wake_words),
            exit_commands: list_var("EXIT_COMMANDS", defaults.exit_commands),
            listen_mode,
            max_history_turns: parse_var("MAX_HISTORY_TURNS", defaults.max_history_turns)?,
            max_tool_rounds: parse_var("MAX_TOOL_ROUNDS", defaults.max_tool_rounds)?,
            prompts_path: var("PROMPTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./prompts")),
            functions_path: var("FUNCTIONS_PATH").map(PathBuf::from),
            log_level,
        })
    }

    /// Key for chat requests on the configured provider.
    pub fn chat_api_key(&self) -> &str {
        match self.provider {
            Provider::OpenAI => &self.openai_api_key,
            Provider::Gemini => self.gemini_api_key.as_deref().unwrap_or_default(),
        }
    }

    /// Directory holding cached quick-reply audio.
    pub fn quick_reply_dir(&self) -> PathBuf {
        self.audio_output_dir.join("quick_reply")
    }

    /// Per-session settings. `system_prompt` replaces the built-in prompt
    /// when present.
    pub fn session_config(&self, system_prompt: Option<String>) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            system_prompt: system_prompt.unwrap_or(defaults.system_prompt),
            listen_mode: self.listen_mode,
            max_history_turns: self.max_history_turns,
            max_tool_rounds: self.max_tool_rounds,
            delete_audio: self.delete_audio,
            quick_reply: self.quick_reply,
            quick_reply_words: self.quick_reply_words.clone(),
            wake_words: self.wake_words.clone(),
            exit_commands: self.exit_commands.clone(),
        }
    }
}

/// Reads `system_prompt.md` from the prompts directory. A missing file means
/// the built-in prompt is used.
pub fn load_system_prompt(prompts_path: &Path) -> Result<Option<String>, ConfigError> {
    let path = prompts_path.join("system_prompt.md");
    match std::fs::read_to_string(&path) {
        Ok(prompt) if prompt.trim().is_empty() => Ok(None),
        Ok(prompt) => Ok(Some(prompt.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(path, e)),
    }
}
