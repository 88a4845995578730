use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8088";
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 900;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
pub const DEFAULT_DEMO_PASSWORD: &str = "calibra";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub access_ttl: Duration,
    pub lock_ttl: Duration,
    /// Password accepted for every user of the mock lab.
    pub demo_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8088)),
            access_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            demo_password: DEFAULT_DEMO_PASSWORD.to_string(),
        }
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(name: &str, default: u64) -> anyhow::Result<Duration> {
    match env_trimmed(name) {
        Some(raw) => {
            let secs = raw
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("{} must be a number of seconds: {}", name, e))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(default)),
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_trimmed("CALIBRA_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("CALIBRA_BIND_ADDR is not a socket address: {}", e))?;

        Ok(Self {
            bind_addr,
            access_ttl: env_secs("CALIBRA_ACCESS_TTL_SECS", DEFAULT_ACCESS_TTL_SECS)?,
            lock_ttl: env_secs("CALIBRA_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS)?,
            demo_password: env_trimmed("CALIBRA_DEMO_PASSWORD")
                .unwrap_or_else(|| DEFAULT_DEMO_PASSWORD.to_string()),
        })
    }
}
