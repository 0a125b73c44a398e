use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub mod error;
pub mod handlers;


pub use error::ApiError;

use crate::AppContext;

pub async fn start_server(ctx: Arc<AppContext>, addr: SocketAddr) -> anyhow::Result<()> {
    info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    serve(ctx, listener).await
}

/// Serve on an already bound listener until ctrl-c.
pub async fn serve(ctx: Arc<AppContext>, listener: TcpListener) -> anyhow::Result<()> {
    let app = handlers::router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
