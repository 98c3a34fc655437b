use crate::models::SeedMessage;
use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};

// --- Settings keys (stored as JSON text in the settings table) ---

pub const KEY_AI_MODEL: &str = "ai_model";
pub const KEY_MAX_OUTPUT_TOKENS: &str = "max_output_tokens";
pub const KEY_TEMPERATURE: &str = "temperature";
pub const KEY_SAFETY_SETTINGS: &str = "safety_settings";
pub const KEY_MAX_CHAT_LENGTH: &str = "max_chat_length";
pub const KEY_INITIAL_MESSAGES: &str = "initial_messages";
pub const KEY_API_KEY_REF: &str = "api_key_ref";

pub const DEFAULT_AI_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_OUTPUT_TOKENS: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

const KEYRING_SERVICE: &str = "rolechat_api_key";
const KEYRING_USER: &str = "gemini";

/// Blocking threshold for one harm category, ordered from most to least permissive.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(from = "String", into = "String")]
pub enum HarmThreshold {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl HarmThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarmThreshold::None => "none",
            HarmThreshold::Low => "low",
            HarmThreshold::Medium => "medium",
            HarmThreshold::High => "high",
        }
    }

    /// Name the upstream API uses for this threshold.
    pub fn api_name(&self) -> &'static str {
        match self {
            HarmThreshold::None => "BLOCK_NONE",
            HarmThreshold::Low => "BLOCK_LOW_AND_ABOVE",
            HarmThreshold::Medium => "BLOCK_MEDIUM_AND_ABOVE",
            HarmThreshold::High => "BLOCK_ONLY_HIGH",
        }
    }
}

// Unrecognized values fall back to the most permissive threshold.
impl From<String> for HarmThreshold {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" | "block_low_and_above" => HarmThreshold::Low,
            "medium" | "block_medium_and_above" => HarmThreshold::Medium,
            "high" | "block_only_high" => HarmThreshold::High,
            _ => HarmThreshold::None,
        }
    }
}

impl From<HarmThreshold> for String {
    fn from(value: HarmThreshold) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SafetySettings {
    #[serde(default)]
    pub harassment: HarmThreshold,
    #[serde(default)]
    pub hate_speech: HarmThreshold,
    #[serde(default)]
    pub sexual: HarmThreshold,
    #[serde(default)]
    pub dangerous: HarmThreshold,
}

/// User-editable application settings as persisted in the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppSettings {
    pub ai_model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub safety_settings: SafetySettings,
    pub max_chat_length: usize,
    pub initial_messages: Vec<SeedMessage>,
    pub api_key_ref: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            ai_model: DEFAULT_AI_MODEL.to_string(),
            max_output_tokens: DEFAULT_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            safety_settings: SafetySettings::default(),
            max_chat_length: 0,
            initial_messages: Vec::new(),
            api_key_ref: None,
        }
    }
}

impl AppSettings {
    /// Builds settings from raw stored values. Anything missing or malformed keeps its default.
    pub fn from_stored<F>(mut lookup: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        fn parse<T: serde::de::DeserializeOwned>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("Ignoring malformed setting '{}': {}", key, e);
                    None
                }
            }
        }

        let defaults = Self::default();
        let ai_model = parse::<String>(KEY_AI_MODEL, lookup(KEY_AI_MODEL))
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(defaults.ai_model);
        let max_output_tokens = parse::<u32>(KEY_MAX_OUTPUT_TOKENS, lookup(KEY_MAX_OUTPUT_TOKENS))
            .filter(|t| *t > 0)
            .unwrap_or(defaults.max_output_tokens);
        let temperature = parse::<f32>(KEY_TEMPERATURE, lookup(KEY_TEMPERATURE))
            .filter(|t| t.is_finite())
            .map(|t| t.clamp(0.0, 1.0))
            .unwrap_or(defaults.temperature);
        let safety_settings = parse(KEY_SAFETY_SETTINGS, lookup(KEY_SAFETY_SETTINGS))
            .unwrap_or(defaults.safety_settings);
        let max_chat_length = parse(KEY_MAX_CHAT_LENGTH, lookup(KEY_MAX_CHAT_LENGTH))
            .unwrap_or(defaults.max_chat_length);
        let initial_messages = parse(KEY_INITIAL_MESSAGES, lookup(KEY_INITIAL_MESSAGES))
            .unwrap_or(defaults.initial_messages);
        let api_key_ref = parse::<Option<String>>(KEY_API_KEY_REF, lookup(KEY_API_KEY_REF))
            .flatten()
            .or(defaults.api_key_ref);

        Self {
            ai_model,
            max_output_tokens,
            temperature,
            safety_settings,
            max_chat_length,
            initial_messages,
            api_key_ref,
        }
    }

    /// Key/JSON pairs ready to be written to the settings table.
    pub fn to_stored(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            (KEY_AI_MODEL, serde_json::to_string(&self.ai_model)?),
            (KEY_MAX_OUTPUT_TOKENS, serde_json::to_string(&self.max_output_tokens)?),
            (KEY_TEMPERATURE, serde_json::to_string(&self.temperature)?),
            (KEY_SAFETY_SETTINGS, serde_json::to_string(&self.safety_settings)?),
            (KEY_MAX_CHAT_LENGTH, serde_json::to_string(&self.max_chat_length)?),
            (KEY_INITIAL_MESSAGES, serde_json::to_string(&self.initial_messages)?),
            (KEY_API_KEY_REF, serde_json::to_string(&self.api_key_ref)?),
        ])
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            model: self.ai_model.clone(),
            max_output_tokens: self.max_output_tokens.max(1),
            temperature: self.temperature.clamp(0.0, 1.0),
            safety: self.safety_settings,
            max_history_length: self.max_chat_length,
        }
    }
}

/// Immutable per-call configuration handed to the generation adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub safety: SafetySettings,
    pub max_history_length: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        AppSettings::default().generation_config()
    }
}

// --- API Key Retrieval ---

/// Resolves the API key referenced by `api_key_ref`.
/// `env:NAME` reads an environment variable, `keyring` reads the OS keyring.
pub fn get_api_key(api_key_ref: Option<&str>) -> Result<String> {
    match api_key_ref {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            entry
                .get_password()
                .context("Failed to get API key from keyring. Please set it again.")
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
        None => Err(anyhow::anyhow!("API key reference not set")),
    }
}

/// Like [`get_api_key`] but collapses every failure into `None`; an empty key counts as missing.
pub fn resolve_credential(api_key_ref: Option<&str>) -> Option<String> {
    match get_api_key(api_key_ref) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        Ok(_) => None,
        Err(e) => {
            log::warn!("No usable API key: {:#}", e);
            None
        }
    }
}

/// Stores an API key in the OS keyring.
pub fn set_api_key_in_keyring(api_key: &str) -> Result<()> {
    if api_key.trim().is_empty() {
        anyhow::bail!("API key cannot be empty");
    }
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
    entry
        .set_password(api_key.trim())
        .context("Failed to set API key in keyring")
}

/// Removes the stored API key, if any.
pub fn remove_api_key_from_keyring() -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .context("Failed to create keyring entry for deleting password")?;
    log::warn!("Removing API key from keyring for service: {}", KEYRING_SERVICE);
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(anyhow::Error::from(e).context("Failed to remove API key from keyring")),
    }
}
