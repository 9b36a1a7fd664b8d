use async_trait::async_trait;

/// Sink for relay lifecycle events.
///
/// The registry and backend link report state changes through this trait
/// instead of holding any global reporting state; embedders pass their own
/// implementation at construction time.
#[async_trait]
pub trait RelayEvents: Send + Sync {
    async fn backend_ready(&self, _width: u16, _height: u16, _desktop_name: &str) {}
    async fn backend_closed(&self, _error: &str) {}
    async fn session_opened(&self, _client_id: &str) {}
    async fn session_closed(&self, _client_id: &str) {}
    async fn controller_changed(&self, _controller: Option<&str>) {}
}

/// Default sink that reports events through `tracing`.
pub struct TracingEvents;

#[async_trait]
impl RelayEvents for TracingEvents {
    async fn backend_ready(&self, width: u16, height: u16, desktop_name: &str) {
        tracing::info!(width, height, desktop_name, "backend framebuffer ready");
    }

    async fn backend_closed(&self, error: &str) {
        tracing::error!(error, "backend connection lost");
    }

    async fn session_opened(&self, client_id: &str) {
        tracing::info!(client = %client_id, "viewer connected");
    }

    async fn session_closed(&self, client_id: &str) {
        tracing::info!(client = %client_id, "viewer disconnected");
    }

    async fn controller_changed(&self, controller: Option<&str>) {
        match controller {
            Some(client_id) => tracing::info!(client = %client_id, "control assigned"),
            None => tracing::info!("control released"),
        }
    }
}
