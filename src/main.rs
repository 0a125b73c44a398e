#![allow(clippy::uninlined_format_args)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use asr_tasks::asr::WhisperAsr;
use asr_tasks::config::AppConfig;
use asr_tasks::utils::logger;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();

    // 初始化日志系统
    let _guard = logger::init(config.log_dir.clone(), &config.log_level)?;
    info!("Starting ASR task service ({})", env!("GIT_HASH"));
    config.log_summary();

    // 初始化 ASR 模型，启动时加载一次
    let model_path = config.model_path();
    info!("Loading whisper model {} from {}", config.model.name(), model_path.display());
    let asr = Arc::new(WhisperAsr::new(&model_path)?);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address))?;

    let app = asr_tasks::bootstrap(config, asr).await?;

    let scheduler = app.scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.run().await {
            error!("Scheduler error: {}", e);
        }
    });

    // 启动 HTTP 服务器
    match asr_tasks::web::start_server(app.ctx.clone(), addr).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e);
        }
    }

    // 未确认的任务会在租约到期后重新投递
    info!("Shutting down...");
    Ok(())
}
