//! In-process hub on an ephemeral port.

use hub_service::actors::{ActorMetrics, HubActor, HubActorHandle};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// A running hub. Dropping it shuts the hub down.
pub struct TestHub {
    addr: SocketAddr,
    handle: HubActorHandle,
    token: CancellationToken,
}

impl TestHub {
    pub async fn start() -> Self {
        let token = CancellationToken::new();
        let (handle, _task) = HubActor::spawn("hub-test".to_string(), token.clone(), 64, ActorMetrics::new());

        let app = hub_service::ws::router(handle.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        let server_token = token.child_token();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await
                .expect("hub server failed");
        });

        Self { addr, handle, token }
    }

    /// WebSocket URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn handle(&self) -> &HubActorHandle {
        &self.handle
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
