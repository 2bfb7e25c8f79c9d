use std::{env, net::SocketAddr, time::Duration};
use crate::error::{config, AppResult};

/// 每房間人數上限（mesh 拓撲的規模限制）
pub const ROOM_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub addr:              SocketAddr,
    pub jwt_secret:        String,
    pub api_base:          String,
    pub cors_origin:       String,
    pub directory_timeout: Duration,
    pub stats_interval:    Duration,
}

impl Config {
    /// Reads the relay settings from the environment (after `.env`).
    pub fn from_env() -> AppResult<Self> {
        let jwt_secret = env::var("JWT_SECRET").map_err(|e| config(format!("JWT_SECRET: {e}")))?;
        let host = var_or("BIND_ADDR", "0.0.0.0");
        let port = var_or("PORT", "5000");
        let addr = format!("{host}:{port}").parse().map_err(config)?;

        Ok(Self {
            addr,
            jwt_secret,
            api_base:          var_or("API_BASE", "http://localhost:8000"),
            cors_origin:       var_or("CORS_ORIGIN", "http://localhost:3000"),
            directory_timeout: Duration::from_secs(secs("DIRECTORY_TIMEOUT_SECS", 5)?),
            stats_interval:    Duration::from_secs(secs("STATS_INTERVAL_SECS", 30)?),
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn secs(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v)  => parse_secs(key, &v),
        Err(_) => Ok(default),
    }
}

/// Whole seconds, at least one.
fn parse_secs(key: &str, raw: &str) -> AppResult<u64> {
    match raw.trim().parse::<u64>() {
        Ok(0)  => Err(config(format!("{key}: must be at least 1"))),
        Ok(n)  => Ok(n),
        Err(e) => Err(config(format!("{key}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_must_be_positive() {
        assert_eq!(parse_secs("STATS_INTERVAL_SECS", "30").unwrap(), 30);
        assert_eq!(parse_secs("STATS_INTERVAL_SECS", " 5 ").unwrap(), 5);
        assert!(parse_secs("STATS_INTERVAL_SECS", "0").is_err());
        assert!(parse_secs("DIRECTORY_TIMEOUT_SECS", "-1").is_err());
        assert!(parse_secs("DIRECTORY_TIMEOUT_SECS", "soon").is_err());
    }
}
