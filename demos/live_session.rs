//! Demo driving a live conversation session end to end.
//!
//! This example demonstrates:
//! - Wiring the pipeline against the live backends
//! - Subscribing to transcript, caption and error events
//! - Reading session statistics after teardown
//!
//! Requires a working microphone. Point CONFAB_API_URL at a Confab
//! deployment and set CONFAB_API_KEY to persist and analyze the session;
//! without credentials the transcript stays local.
//!
//! To run: cargo run --example live_session

use anyhow::Result;
use confab_live::{
    ApiConfig, ConversationPipeline, PipelineBackends, PipelineConfig, PipelineEvent,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    info!("Confab live session demo starting");

    let mut api = ApiConfig::default();
    if let Ok(url) = std::env::var("CONFAB_API_URL") {
        api.realtime_endpoint = format!("{}/transcribe", url.replacen("http", "ws", 1));
        api.base_url = url;
    }
    api.api_key = std::env::var("CONFAB_API_KEY").ok();

    let config = PipelineConfig {
        session_id: Some(confab_live::utils::generate_session_id()),
        ..PipelineConfig::default()
    };
    let pipeline = ConversationPipeline::new(config, PipelineBackends::live(&api));

    let _events = pipeline.subscribe(|event| match event {
        PipelineEvent::Line(line) => println!("[{}] {}", line.speaker, line.text),
        PipelineEvent::PartialTranscript(text) => println!("... {}", text),
        PipelineEvent::Error(message) => eprintln!("error: {}", message),
        _ => {}
    });

    info!("Recording for 15 seconds; speak into the microphone");
    pipeline.start_session().await?;
    sleep(Duration::from_secs(15)).await;
    pipeline.stop_session().await?;

    let stats = pipeline.stats().await;
    info!("Session finished: {}", stats);

    pipeline.close().await;
    Ok(())
}
