use std::env;

pub const DEFAULT_PORT: u16 = 3000;

/// Server settings read from the environment.
///
/// Store credentials are only checked for presence here; the store itself
/// reads them when it is built.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub supabase_url_set: bool,
    pub supabase_key_set: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    non_empty(value).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_str(name: &str, default: &str) -> String {
    non_empty(env::var(name).ok()).unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    parse_or(env::var(name).ok(), default)
}

fn env_set(name: &str) -> bool {
    !env_str(name, "").is_empty()
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_u16("PORT", DEFAULT_PORT),
            supabase_url_set: env_set("SUPABASE_URL"),
            supabase_key_set: env_set("SUPABASE_KEY"),
        }
    }

    /// A `--port` flag wins over `PORT`.
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn credentials_set(&self) -> bool {
        self.supabase_url_set && self.supabase_key_set
    }
}
