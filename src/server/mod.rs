//! Distribution endpoint serving shares over HTTP.

pub mod content;
pub mod routes;
pub mod templates;

pub use content::{content_disposition, content_type};
pub use routes::{
    build_router, detect_mode, logging_hook, DistributionError, DistributionState, FetchEvent,
    FetchHook,
};
pub use templates::{SharePageView, TemplateEngine, Templates};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Serve the distribution endpoint on `listener` until `shutdown` resolves.
///
/// In-flight transfers are allowed to finish during graceful shutdown.
pub async fn serve(
    listener: TcpListener,
    state: Arc<DistributionState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Distribution endpoint listening");

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("Distribution endpoint stopped");
    Ok(())
}
