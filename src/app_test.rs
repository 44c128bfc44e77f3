use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::app::App;
use crate::config::Config;
use crate::engine::Engine;
use crate::peer_forwarder::PeerForwarderContext;
use crate::pipeline::fixtures::{self, CallLog, CollectingSink, TestSource};
use crate::pipeline::{Pipeline, PipelineState};

const WAIT: Duration = Duration::from_secs(10);

/// A config binding every server on an ephemeral port.
fn test_config(peer_forwarding: bool) -> Result<Arc<Config>> {
    let mut config = Config::clone(&*Config::new_test()?);
    config.metrics_port = 0;
    config.peer_forwarder_port = 0;
    if peer_forwarding {
        config.peer_forwarder_enabled = true;
        config.peer_forwarder_local_address = "127.0.0.1:1".into();
        config.peer_forwarder_static_endpoints = vec!["127.0.0.1:1".into()];
        config.peer_forwarder_discovery_refresh_secs = 1;
    }
    config.validate()?;
    Ok(Arc::new(config))
}

fn pipeline(name: &str, records: usize) -> Result<(Arc<Pipeline>, Arc<CollectingSink>)> {
    let log = CallLog::default();
    let sink = Arc::new(CollectingSink::new("sink", log.clone()));
    let source = Arc::new(TestSource::new(fixtures::records(records), log));
    Ok((Pipeline::new(fixtures::parts(name, source, vec![], vec![sink.clone()], 1)?)?, sink))
}

#[tokio::test]
async fn app_runs_pipelines_until_shutdown_is_triggered() -> Result<()> {
    let config = test_config(true)?;
    let context = PeerForwarderContext::from_config(config.clone()).await?;
    let (pipeline, sink) = pipeline("main", 20)?;
    let app = App::new(config, Engine::new(vec![pipeline.clone()])?, Some(context)).await?;
    let shutdown = app.shutdown_tx();

    let handle = app.spawn();
    assert!(sink.wait_for(20, WAIT).await, "expected records to flow, got {}", sink.received_count());
    let _res = shutdown.send(());
    tokio::time::timeout(WAIT, handle).await.context("expected the app to shut down")?.context("error joining app")??;

    assert_eq!(pipeline.state(), PipelineState::Stopped, "expected the pipeline to be stopped");
    Ok(())
}

#[tokio::test]
async fn app_exits_once_every_pipeline_has_stopped() -> Result<()> {
    let (pipeline, _) = pipeline("short-lived", 0)?;
    let engine = Engine::new(vec![pipeline.clone()])?;
    let app = App::new(test_config(false)?, engine.clone(), None).await?;

    let handle = app.spawn();
    for _ in 0..100 {
        if pipeline.state() == PipelineState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.shutdown_pipeline("short-lived").await?;
    tokio::time::timeout(WAIT, handle).await.context("expected the app to exit on its own")?.context("error joining app")??;

    assert!(engine.pipeline_names().is_empty(), "expected no pipeline to remain");
    Ok(())
}
