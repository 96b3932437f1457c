//! Process-global configuration: the small set of constants listed in
//! spec section 6. Loaded from `gateway.toml` plus `GATEWAY_*` environment
//! overrides, the same layering `plane-core`/`plane-drone` use for their
//! TOML + env configuration.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Clone)]
pub struct GatewayConfig {
    /// The public TCP port the Minecraft front door listens on.
    #[serde(default = "default_public_port")]
    pub public_port: u16,
    /// The HTTP port the operator UI and WebSocket endpoints are served on.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Root directory scanned for backend subdirectories.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    /// Shared passcode operators authenticate with.
    pub passcode: String,
    /// Cookie HMAC/encryption key material (32+ bytes, `axum-extra`'s
    /// `PrivateCookieJar` derives both the MAC and cipher key from this).
    pub cookie_key: String,
    /// Name of the authentication cookie.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Directory static UI assets are served from.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// When set, static requests are reverse-proxied to this dev server URL
    /// instead of being served from `static_dir` (the "dev forward" toggle).
    pub dev_forward_url: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("public_port", &self.public_port)
            .field("http_port", &self.http_port)
            .field("install_dir", &self.install_dir)
            .field("passcode", &"<redacted>")
            .field("cookie_key", &"<redacted>")
            .field("cookie_name", &self.cookie_name)
            .field("static_dir", &self.static_dir)
            .field("dev_forward_url", &self.dev_forward_url)
            .finish()
    }
}

fn default_public_port() -> u16 {
    25565
}

fn default_http_port() -> u16 {
    8080
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("./servers")
}

fn default_cookie_name() -> String {
    "gateway_session".to_owned()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("./public")
}

impl GatewayConfig {
    /// Loads configuration from `gateway.toml` (if present, relative to the
    /// current directory) layered under `GATEWAY_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("gateway").required(false))
            .add_source(config::Environment::with_prefix("GATEWAY"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
