use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Build a `zenoh::Config` from the bridge configuration.
pub fn build_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut zenoh_config = zenoh::Config::default();

    zenoh_config
        .insert_json5("mode", &format!("\"{}\"", config.mode))
        .map_err(|e| Error::Config(format!("Failed to set mode: {}", e)))?;

    insert_endpoints(&mut zenoh_config, "connect/endpoints", &config.connect)?;
    insert_endpoints(&mut zenoh_config, "listen/endpoints", &config.listen)?;

    Ok(zenoh_config)
}

fn insert_endpoints(
    zenoh_config: &mut zenoh::Config,
    key: &str,
    endpoints: &[String],
) -> Result<()> {
    if endpoints.is_empty() {
        return Ok(());
    }

    let endpoints_json = serde_json::to_string(endpoints)?;
    zenoh_config
        .insert_json5(key, &endpoints_json)
        .map_err(|e| Error::Config(format!("Failed to set {}: {}", key, e)))
}

/// Connect to Zenoh using the provided configuration.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = build_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Connected to Zenoh");

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZenohMode;

    #[test]
    fn test_build_client_config() {
        let config = ZenohConfig {
            mode: ZenohMode::Client,
            connect: vec!["tcp/127.0.0.1:7447".to_string()],
            listen: Vec::new(),
        };

        assert!(build_config(&config).is_ok());
    }
}
