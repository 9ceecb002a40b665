use super::state::AppState;
use std::future::Future;
use std::net::SocketAddr;
use tracing::info;

#[derive(Clone)]
pub struct HttpServer {
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// 运行直到 `shutdown` 完成，已建立的连接在退出前处理完毕
    pub async fn run<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = super::routes::create_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("HTTP server running on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
