use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use processing_ls::{ConfigSource, LogNotifier, SessionController, StreamBridge};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/processing-ls.toml";
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout은 프로토콜 스트림이므로 로그는 stderr로
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PROCESSING_LS_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::info!("processing-ls {} starting (config: {})", env!("CARGO_PKG_VERSION"), config_path.display());

    let bridge = StreamBridge::stdio();
    let editor_closed = bridge.closed_handle();
    let controller = Arc::new(SessionController::new(Box::new(bridge), Arc::new(LogNotifier)));

    let mut source = ConfigSource::new(config_path);
    match source.load().await {
        Ok(config) => {
            if let Err(e) = controller.reload(config).await {
                tracing::warn!("Initial start failed: {}", e);
            }
        }
        Err(e) => tracing::error!("{:#}", e),
    }

    // 설정 파일 폴링: 내용이 바뀐 경우에만 재시작
    let watcher = controller.clone();
    let poller = tokio::spawn(async move {
        loop {
            tokio::time::sleep(CONFIG_POLL_INTERVAL).await;
            match source.poll().await {
                Some(Ok(config)) => {
                    tracing::info!("Configuration changed, reloading");
                    let ctl = watcher.clone();
                    // 폴링 루프를 막지 않도록 별도 태스크에서 재시작
                    tokio::spawn(async move {
                        if let Err(e) = ctl.reload(config).await {
                            tracing::warn!("Reload failed: {}", e);
                        }
                    });
                }
                Some(Err(e)) => tracing::error!("Ignoring invalid configuration: {:#}", e),
                None => {}
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
        _ = editor_closed.notified() => tracing::info!("Editor disconnected"),
    }

    poller.abort();
    controller.stop().await;
    if let Ok(status) = serde_json::to_string(&controller.status().await) {
        tracing::debug!("Final status: {}", status);
    }
    tracing::info!("processing-ls shutting down");
    Ok(())
}
