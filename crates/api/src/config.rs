//! Server configuration
//!
//! Loaded once at startup. Missing secrets are fatal here rather than at
//! first use: a server that boots without its JWT secret or database URL
//! must not come up and silently treat every user as free-tier.

use anyhow::{bail, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT is not a valid port number")?;

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            database_url,
            jwt_secret,
            port,
            cors_allowed_origins,
        })
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("{name} is not set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_minimum_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/echodeck_test");
        std::env::set_var("JWT_SECRET", "test-secret");
    }

    fn clear_env() {
        for name in ["DATABASE_URL", "JWT_SECRET", "PORT", "CORS_ALLOWED_ORIGINS"] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn missing_database_url_is_fatal() {
        clear_env();
        std::env::set_var("JWT_SECRET", "test-secret");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn defaults_apply_when_optional_vars_absent() {
        clear_env();
        set_minimum_env();

        let config = Config::from_env().expect("config loads");
        assert_eq!(config.port, 8080);
        assert!(config.cors_allowed_origins.is_empty());
        clear_env();
    }

    #[test]
    #[serial]
    fn cors_origins_are_split_and_trimmed() {
        clear_env();
        set_minimum_env();
        std::env::set_var(
            "CORS_ALLOWED_ORIGINS",
            "https://app.echodeck.app, https://echodeck.app",
        );

        let config = Config::from_env().expect("config loads");
        assert_eq!(
            config.cors_allowed_origins,
            vec![
                "https://app.echodeck.app".to_string(),
                "https://echodeck.app".to_string()
            ]
        );
        clear_env();
    }
}
