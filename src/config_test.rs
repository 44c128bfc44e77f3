use std::time::Duration;

use anyhow::Result;

use crate::config::*;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("METRICS_PORT".into(), "9191".into()),
        ("PIPELINE_SHUTDOWN_TIMEOUT_MS".into(), "5000".into()),
        ("PEER_FORWARDER_ENABLED".into(), "true".into()),
        ("PEER_FORWARDER_PORT".into(), "5000".into()),
        ("PEER_FORWARDER_PATH".into(), "/forward".into()),
        ("PEER_FORWARDER_LOCAL_ADDRESS".into(), "10.0.0.1".into()),
        ("PEER_FORWARDER_STATIC_ENDPOINTS".into(), "10.0.0.1,10.0.0.2,10.0.0.3".into()),
        ("PEER_FORWARDER_VIRTUAL_NODES".into(), "64".into()),
        ("PEER_FORWARDER_REQUEST_TIMEOUT_MS".into(), "2000".into()),
        ("PEER_FORWARDER_BUFFER_SIZE".into(), "1024".into()),
        ("PEER_FORWARDER_BATCH_SIZE".into(), "100".into()),
        ("PEER_FORWARDER_FORWARDING_BATCH_SIZE".into(), "250".into()),
        ("PEER_FORWARDER_DISCOVERY_REFRESH_SECS".into(), "5".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.metrics_port == 9191, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 9191);
    assert!(
        config.pipeline_shutdown_timeout() == Duration::from_secs(5),
        "unexpected value parsed for PIPELINE_SHUTDOWN_TIMEOUT_MS, got {:?}",
        config.pipeline_shutdown_timeout()
    );
    assert!(config.peer_forwarder_enabled, "expected PEER_FORWARDER_ENABLED to be true");
    assert!(config.peer_forwarder_port == 5000, "unexpected value parsed for PEER_FORWARDER_PORT, got {}", config.peer_forwarder_port);
    assert!(config.peer_forwarder_path == "/forward", "unexpected value parsed for PEER_FORWARDER_PATH, got {}", config.peer_forwarder_path);
    assert!(
        config.peer_forwarder_local_address == "10.0.0.1",
        "unexpected value parsed for PEER_FORWARDER_LOCAL_ADDRESS, got {}",
        config.peer_forwarder_local_address
    );
    assert_eq!(
        config.peer_forwarder_static_endpoints,
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string(), "10.0.0.3".to_string()],
        "unexpected value parsed for PEER_FORWARDER_STATIC_ENDPOINTS"
    );
    assert!(
        config.peer_forwarder_virtual_nodes == 64,
        "unexpected value parsed for PEER_FORWARDER_VIRTUAL_NODES, got {}",
        config.peer_forwarder_virtual_nodes
    );
    assert!(
        config.peer_forwarder_buffer_size == 1024,
        "unexpected value parsed for PEER_FORWARDER_BUFFER_SIZE, got {}",
        config.peer_forwarder_buffer_size
    );
    assert!(
        config.peer_forwarder_batch_size == 100,
        "unexpected value parsed for PEER_FORWARDER_BATCH_SIZE, got {}",
        config.peer_forwarder_batch_size
    );
    assert!(
        config.peer_forwarder_forwarding_batch_size == 250,
        "unexpected value parsed for PEER_FORWARDER_FORWARDING_BATCH_SIZE, got {}",
        config.peer_forwarder_forwarding_batch_size
    );
    assert!(
        config.peer_forwarder_discovery_refresh() == Duration::from_secs(5),
        "unexpected value parsed for PEER_FORWARDER_DISCOVERY_REFRESH_SECS, got {:?}",
        config.peer_forwarder_discovery_refresh()
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(Vec::<(String, String)>::new())?;
    config.validate()?;

    assert!(config.rust_log == "info", "unexpected default for RUST_LOG, got {}", config.rust_log);
    assert!(
        config.pipeline_shutdown_timeout() == Duration::from_secs(10),
        "unexpected default shutdown timeout, got {:?}",
        config.pipeline_shutdown_timeout()
    );
    assert!(!config.peer_forwarder_enabled, "expected peer forwarding to be disabled by default");
    assert!(config.peer_forwarder_port == 4994, "unexpected default for PEER_FORWARDER_PORT, got {}", config.peer_forwarder_port);
    assert!(
        config.peer_forwarder_path == DEFAULT_PEER_FORWARDER_PATH,
        "unexpected default for PEER_FORWARDER_PATH, got {}",
        config.peer_forwarder_path
    );
    assert!(config.peer_forwarder_static_endpoints.is_empty(), "expected no static endpoints by default");
    assert!(config.peer_forwarder_buffer_size == 512, "unexpected default for PEER_FORWARDER_BUFFER_SIZE, got {}", config.peer_forwarder_buffer_size);
    assert!(config.peer_forwarder_batch_size == 48, "unexpected default for PEER_FORWARDER_BATCH_SIZE, got {}", config.peer_forwarder_batch_size);

    Ok(())
}

#[test]
fn receive_write_timeout_is_shorter_than_request_timeout() -> Result<()> {
    let config: Config = envy::from_iter(vec![("PEER_FORWARDER_REQUEST_TIMEOUT_MS".to_string(), "1000".to_string())])?;

    let write_timeout = config.peer_forwarder_receive_write_timeout();

    assert_eq!(write_timeout, Duration::from_millis(800), "expected write timeout to be 80% of the request timeout");
    assert!(write_timeout < config.peer_forwarder_request_timeout(), "expected write timeout to be strictly shorter");

    Ok(())
}

#[test]
fn validate_rejects_batch_larger_than_buffer() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("PEER_FORWARDER_BUFFER_SIZE".to_string(), "10".to_string()),
        ("PEER_FORWARDER_BATCH_SIZE".to_string(), "11".to_string()),
    ])?;

    let res = config.validate();

    assert!(res.is_err(), "expected validation to fail when batch size exceeds buffer size");
    Ok(())
}

#[test]
fn validate_rejects_enabled_forwarding_without_endpoints() -> Result<()> {
    let config: Config = envy::from_iter(vec![("PEER_FORWARDER_ENABLED".to_string(), "true".to_string())])?;

    let res = config.validate();

    assert!(res.is_err(), "expected validation to fail when forwarding is enabled without peers");
    Ok(())
}

#[test]
fn validate_rejects_forwarding_batch_larger_than_peer_buffer() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("PEER_FORWARDER_BUFFER_SIZE".to_string(), "512".to_string()),
        ("PEER_FORWARDER_FORWARDING_BATCH_SIZE".to_string(), "513".to_string()),
    ])?;

    let res = config.validate();

    assert!(res.is_err(), "expected validation to fail when forwarded requests can not fit a peer's receive buffer");
    Ok(())
}

#[test]
fn default_forwarding_batch_fits_peer_buffer() -> Result<()> {
    let config: Config = envy::from_iter(Vec::<(String, String)>::new())?;

    assert!(
        config.peer_forwarder_forwarding_batch_size <= config.peer_forwarder_buffer_size,
        "expected default forwarding batch size {} to fit the default buffer size {}",
        config.peer_forwarder_forwarding_batch_size,
        config.peer_forwarder_buffer_size
    );
    Ok(())
}

#[test]
fn receive_write_timeout_saturates_for_huge_request_timeouts() -> Result<()> {
    let config: Config = envy::from_iter(vec![("PEER_FORWARDER_REQUEST_TIMEOUT_MS".to_string(), u64::MAX.to_string())])?;

    let write_timeout = config.peer_forwarder_receive_write_timeout();

    assert_eq!(write_timeout, Duration::from_millis(u64::MAX / 10), "expected the write timeout computation to saturate");
    Ok(())
}
