use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Text,
    Vision,
}

impl Profile {
    pub const ALL: [Profile; 2] = [Profile::Text, Profile::Vision];

    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Text => "text",
            Profile::Vision => "vision",
        }
    }

    /// Key under which the profile's config is persisted.
    pub fn storage_key(self) -> &'static str {
        match self {
            Profile::Text => "textConfig",
            Profile::Vision => "visionConfig",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "text" => Some(Profile::Text),
            "vision" => Some(Profile::Vision),
            _ => None,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    #[default]
    Answer,
    Ocr,
}

impl CompletionMode {
    pub fn profile(self) -> Profile {
        match self {
            CompletionMode::Answer => Profile::Text,
            CompletionMode::Ocr => Profile::Vision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(deserialize_with = "deserialize_temperature")]
    pub temperature: f64,
    pub system_prompt: String,
}

impl ModelConfig {
    pub fn default_for(profile: Profile) -> Self {
        match profile {
            Profile::Text => Self {
                base_url: DEFAULT_BASE_URL.to_owned(),
                api_key: String::new(),
                model: "gpt-3.5-turbo".to_owned(),
                temperature: 0.7,
                system_prompt: "You are a helpful assistant. Answer the user's question."
                    .to_owned(),
            },
            Profile::Vision => Self {
                base_url: DEFAULT_BASE_URL.to_owned(),
                api_key: String::new(),
                model: "gpt-4-vision-preview".to_owned(),
                temperature: 0.7,
                system_prompt: "Recognize and extract all text in the images, keeping the original formatting."
                    .to_owned(),
            },
        }
    }
}

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// Settings written by a form may carry the temperature as a string.
fn deserialize_temperature<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid temperature: {text:?}"))),
    }
}
