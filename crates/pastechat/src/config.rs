use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_CHANNEL_LABEL: &str = "chat";
const ICE_SCHEMES: [&str; 3] = ["stun:", "turn:", "turns:"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// Configuration for the peer connection and its data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN/TURN servers. Empty means host candidates only.
    pub ice_servers: Vec<IceServer>,
    pub data_channel_label: String,
    /// Whether the data channel delivers in order
    pub ordered: bool,
    /// Retransmit limit for a partially reliable channel; `None` is reliable
    pub max_retransmits: Option<u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
            max_retransmits: None,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_channel_label.trim().is_empty() {
            return Err(ConfigError::EmptyLabel);
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::MissingIceUrls);
            }
            if let Some(url) = server
                .urls
                .iter()
                .find(|url| !ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)))
            {
                return Err(ConfigError::UnsupportedIceUrl(url.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    ice_servers: Vec<IceServer>,
    data_channel_label: Option<String>,
    ordered: Option<bool>,
    max_retransmits: Option<u16>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: String::new(),
            credential: String::new(),
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = Some(label.into());
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    pub fn max_retransmits(mut self, max_retransmits: u16) -> Self {
        self.max_retransmits = Some(max_retransmits);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let mut config = SessionConfig {
            ice_servers: self.ice_servers,
            ..SessionConfig::default()
        };
        if let Some(label) = self.data_channel_label {
            config.data_channel_label = label;
        }
        if let Some(ordered) = self.ordered {
            config.ordered = ordered;
        }
        config.max_retransmits = self.max_retransmits;
        config.validate()?;
        Ok(config)
    }
}
