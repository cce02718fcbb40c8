//! Application configuration loaded from environment variables.

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `DATABASE_URL` — PostgreSQL connection string; the in-memory
///   store is used when unset
/// - `WEBHOOK_SECRET` — shared secret for gateway webhook signatures
/// - `PUBLIC_BASE_URL` — origin used for checkout redirect URLs
/// - `SHIPPING_COST_CENTS` — flat shipping rate (default: `500`)
/// - `SWEEP_INTERVAL_SECS` — reservation sweep cadence (default: `120`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub webhook_secret: String,
    pub public_base_url: String,
    pub shipping_cost_cents: i64,
    pub sweep_interval_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            database_url: std::env::var("DATABASE_URL").ok(),
            webhook_secret: std::env::var("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            public_base_url: std::env::var("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            shipping_cost_cents: std::env::var("SHIPPING_COST_CENTS")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(defaults.shipping_cost_cents),
            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            webhook_secret: "whsec_dev".to_string(),
            public_base_url: "http://localhost:3000".to_string(),
            shipping_cost_cents: 500,
            sweep_interval_secs: 120,
        }
    }
}
