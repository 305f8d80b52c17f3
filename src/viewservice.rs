use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tonic::{Request, Response};
use tracing::{debug, info};

use crate::proto::view_service_server::{ViewService, ViewServiceServer};
use crate::proto::{GetViewRequest, GetViewResponse, PingRequest, PingResponse};
use crate::view::ViewTracker;
use crate::PING_INTERVAL;

/// The authoritative view service. Answers pings and view queries, and
/// runs the periodic tick that notices dead servers and reassigns
/// roles.
#[derive(Clone)]
pub struct ViewServer {
    addr: SocketAddr,
    tracker: Arc<Mutex<ViewTracker>>,
    shutdown: watch::Sender<bool>,
}

impl ViewServer {
    pub fn new(addr: SocketAddr) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            addr,
            tracker: Arc::new(Mutex::new(ViewTracker::new())),
            shutdown,
        }
    }

    /// Serve until [`shutdown`](Self::shutdown) is called.
    pub async fn run(self) -> crate::Result<()> {
        info!("view service listening on {}", self.addr);
        let ticker = tokio::spawn(self.clone().tick_loop());
        let mut shutdown = self.shutdown.subscribe();
        let res = tonic::transport::Server::builder()
            .add_service(ViewServiceServer::new(self.clone()))
            .serve_with_shutdown(self.addr, async move {
                let _ = shutdown.changed().await;
            })
            .await;
        ticker.abort();
        Ok(res?)
    }

    /// Stop accepting connections and stop reassigning views.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn tick_loop(self) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut tracker = self.tracker.lock().await;
                    let before = tracker.view();
                    tracker.tick(Instant::now());
                    let after = tracker.view();
                    if before != after {
                        info!(
                            viewnum = after.viewnum,
                            primary = %after.primary,
                            backup = %after.backup,
                            "view changed"
                        );
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[tonic::async_trait]
impl ViewService for ViewServer {
    async fn ping(
        &self,
        req: Request<PingRequest>,
    ) -> tonic::Result<tonic::Response<PingResponse>, tonic::Status> {
        let req = req.into_inner();
        debug!(me = %req.me, viewnum = req.viewnum, "ping");
        let mut tracker = self.tracker.lock().await;
        let view = tracker.ping(&req.me, req.viewnum, Instant::now());
        Ok(Response::new(PingResponse {
            view: Some(view.into()),
        }))
    }

    async fn get(
        &self,
        _req: Request<GetViewRequest>,
    ) -> tonic::Result<tonic::Response<GetViewResponse>, tonic::Status> {
        let tracker = self.tracker.lock().await;
        Ok(Response::new(GetViewResponse {
            view: Some(tracker.view().into()),
        }))
    }
}
