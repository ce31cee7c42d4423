/// mysqlbinlog 기반 CDC 엔진 실행 예제
///
/// 변경 이벤트를 한 줄에 하나씩 JSON으로 표준 출력에 씁니다.
/// 설정은 환경 변수(`DB_HOST`, `DB_USER`, `MYSQLBINLOG_PATH`, ...)에서 읽습니다.
use mysqlbinlog_cdc::{CdcConfig, CdcEngine};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화 (RUST_LOG, 기본 info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = CdcConfig::from_env()?;
    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );

    let mut engine = CdcEngine::new(config);
    engine.start().await?;

    let (tx, mut rx) = mpsc::channel(1024);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    });

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            stop.stop();
        }
    });

    let result = engine.run(tx).await;
    engine.stop().await?;
    printer.await?;

    if let Err(e) = &result {
        error!("CDC run ended with error: {}", e);
    }
    result?;
    Ok(())
}
