use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_DATA_DIR: &str = "./data";

// Runtime settings, environment-driven. Every secret stays in the
// environment; nothing here is written back to disk.
#[derive(Debug, Clone)]
pub struct Settings {
    // Account-service key used by the steam_level and friends endpoints.
    pub steam_api_key: String,
    // Key sent to the downstream write service.
    pub submit_api_key: String,
    // Shared key callers must present on ingress.
    pub ingress_api_key: String,
    // Downstream write endpoint (GET with query parameters).
    pub submit_url: String,
    // Existence-check URL prefix, path-concatenated with "<account_id>/".
    pub existence_check_url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub allow_lan_access: bool,
}

pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn data_dir_from_env() -> PathBuf {
    match std::env::var("STEAMVET_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => PathBuf::from(DEFAULT_DATA_DIR),
    }
}

fn required_var(name: &'static str) -> Result<String, String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(format!("required environment variable {} is not set", name)),
    }
}

impl Settings {
    // Collects every missing/invalid variable instead of stopping at the
    // first, so one startup failure names the whole remediation.
    pub fn from_env() -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        let steam_api_key = required_var("STEAM_API_KEY").unwrap_or_else(|e| {
            errors.push(e);
            String::new()
        });
        let submit_api_key = required_var("SUBMIT_API_KEY").unwrap_or_else(|e| {
            errors.push(e);
            String::new()
        });
        let ingress_api_key = required_var("API_KEY").unwrap_or_else(|e| {
            errors.push(e);
            String::new()
        });
        let submit_url = required_var("SUBMIT_URL").unwrap_or_else(|e| {
            errors.push(e);
            String::new()
        });
        let existence_check_url = required_var("EXISTENCE_CHECK_URL").unwrap_or_else(|e| {
            errors.push(e);
            String::new()
        });

        let port = match required_var("PORT") {
            Ok(raw) => match raw.parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => {
                    errors.push(format!("PORT is not a valid port number: {}", raw));
                    0
                }
            },
            Err(e) => {
                errors.push(e);
                0
            }
        };

        let allow_lan_access = match std::env::var("ALLOW_LAN_ACCESS") {
            Ok(raw) => match parse_env_bool(&raw) {
                Some(parsed) => parsed,
                None => {
                    warn!(
                        "[W-LAN-ACCESS-INVALID] ignoring_invalid_lan_access_value: {}",
                        raw
                    );
                    false
                }
            },
            Err(_) => false,
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        let data_dir = data_dir_from_env();
        info!("Settings loaded (port {}, data dir {:?})", port, data_dir);

        Ok(Self {
            steam_api_key,
            submit_api_key,
            ingress_api_key,
            submit_url,
            existence_check_url,
            port,
            data_dir,
            allow_lan_access,
        })
    }

    pub fn bind_address(&self) -> &'static str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}
