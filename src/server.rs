use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response};
use tracing::{debug, info, warn};

use crate::client::ViewClerk;
use crate::proto::kv_service_client::KvServiceClient;
use crate::proto::kv_service_server::{KvService, KvServiceServer};
use crate::proto::{
    self, FwdStateRequest, FwdStateResponse, GetRequest, GetResponse, PutRequest, PutResponse,
};
use crate::view::View;
use crate::PING_INTERVAL;

/// Handler-visible state, all behind one mutex. `Put` keeps the lock
/// across its forward to the backup, which serialises client writes
/// with view installation and state transfer.
struct KvState {
    /// Last view installed from the view service.
    view: View,
    kv: HashMap<String, String>,
    am_primary: bool,
    /// The backup this server has shipped its state to and forwards
    /// writes to. Lags `view.backup` until a state transfer succeeds.
    installed_backup: Option<String>,
}

/// One replicated KV server. Depending on the current view it serves
/// clients as primary, receives forwarded writes as backup, or idles
/// waiting for a role.
#[derive(Clone)]
pub struct KvServer {
    /// Advertised identity; doubles as the listen address.
    me: String,
    addr: SocketAddr,
    view_addr: String,
    state: Arc<Mutex<KvState>>,
    /// Last view received from the view service, published by the
    /// ticker before it takes the state mutex. A blocked `Put` retry
    /// loop reads this to notice that its backup has been evicted.
    latest_view: watch::Sender<View>,
    /// Viewnum carried in pings. Held back while this server is a
    /// backup that has not yet accepted a state transfer, since the
    /// view service reads the advertised viewnum as that confirmation.
    advertised: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
}

impl KvServer {
    pub fn new(me: String, view_addr: String) -> crate::Result<Self> {
        let addr: SocketAddr = me.parse()?;
        let (latest_view, _) = watch::channel(View::default());
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            me,
            addr,
            view_addr,
            state: Arc::new(Mutex::new(KvState {
                view: View::default(),
                kv: HashMap::new(),
                am_primary: false,
                installed_backup: None,
            })),
            latest_view,
            advertised: Arc::new(AtomicU64::new(0)),
            shutdown,
        })
    }

    /// Serve until [`shutdown`](Self::shutdown) is called. Runs the
    /// ping ticker alongside the listener.
    pub async fn run(self) -> crate::Result<()> {
        info!(me = %self.me, "kv server listening on {}", self.addr);
        let ticker = tokio::spawn(self.clone().tick_loop());
        let mut shutdown = self.shutdown.subscribe();
        let res = tonic::transport::Server::builder()
            .add_service(KvServiceServer::new(self.clone()))
            .serve_with_shutdown(self.addr, async move {
                let _ = shutdown.changed().await;
            })
            .await;
        ticker.abort();
        Ok(res?)
    }

    /// Stop accepting connections and stop pinging the view service.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn tick_loop(self) {
        let mut vs = ViewClerk::new(self.me.clone(), self.view_addr.clone());
        let mut interval = tokio::time::interval(PING_INTERVAL);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(&mut vs).await,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn tick(&self, vs: &mut ViewClerk) {
        let view = match vs.ping(self.advertised.load(Ordering::SeqCst)).await {
            Ok(view) => view,
            Err(err) => {
                debug!(error = %err, "view service unreachable");
                return;
            }
        };

        // A backup holds its previous viewnum until it has accepted a
        // state transfer for the new view; everyone else adopts the
        // received viewnum immediately.
        if !view.is_backup(&self.me) {
            self.advertised.store(view.viewnum, Ordering::SeqCst);
        }
        self.latest_view.send_replace(view.clone());

        // A Put may be holding the lock across its forwarding retries.
        // Skip installation until the next tick rather than stalling
        // the heartbeat.
        let Ok(mut st) = self.state.try_lock() else {
            return;
        };

        let prev = std::mem::replace(&mut st.view, view.clone());
        st.am_primary = view.is_primary(&self.me);
        if prev.viewnum != view.viewnum {
            info!(
                viewnum = view.viewnum,
                primary = %view.primary,
                backup = %view.backup,
                am_primary = st.am_primary,
                "installed view"
            );
            // Role assignments changed, so the forwarding target must
            // be re-established. Without this, a backup that died and
            // rejoined under the same name would be taken for one that
            // already holds our state.
            st.installed_backup = None;
        }
        if !st.am_primary {
            return;
        }

        // A backup we have not installed yet gets the whole map before
        // any write is forwarded to it. One attempt per tick: a failing
        // transfer usually means the candidate itself is unhealthy.
        if view.has_backup() && st.installed_backup.as_deref() != Some(view.backup.as_str()) {
            st.installed_backup = None;
            let snapshot = st.kv.clone();
            match Self::send_state(&view.backup, snapshot).await {
                Ok(proto::Status::Ok) => {
                    info!(backup = %view.backup, "state transfer complete");
                    st.installed_backup = Some(view.backup.clone());
                }
                Ok(status) => {
                    debug!(backup = %view.backup, ?status, "state transfer rejected")
                }
                Err(err) => debug!(backup = %view.backup, error = %err, "state transfer failed"),
            }
        }
    }

    async fn connect(addr: &str) -> crate::Result<KvServiceClient<Channel>> {
        let endpoint =
            Endpoint::from_shared(format!("http://{addr}"))?.connect_timeout(PING_INTERVAL);
        Ok(KvServiceClient::new(endpoint.connect().await?))
    }

    async fn send_state(
        backup: &str,
        kv: HashMap<String, String>,
    ) -> crate::Result<proto::Status> {
        let mut peer = Self::connect(backup).await?;
        let resp = peer.fwd_state(FwdStateRequest { kv }).await?;
        Ok(resp.into_inner().status())
    }

    async fn send_put(backup: &str, key: &str, value: &str) -> crate::Result<proto::Status> {
        let mut peer = Self::connect(backup).await?;
        let resp = peer
            .fwd_put(PutRequest {
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .await?;
        Ok(resp.into_inner().status())
    }
}

#[tonic::async_trait]
impl KvService for KvServer {
    async fn get(
        &self,
        req: Request<GetRequest>,
    ) -> tonic::Result<tonic::Response<GetResponse>, tonic::Status> {
        let req = req.into_inner();
        let st = self.state.lock().await;
        if !st.am_primary {
            return Ok(Response::new(GetResponse {
                status: proto::Status::WrongServer as i32,
                value: String::new(),
            }));
        }
        let resp = match st.kv.get(&req.key) {
            Some(value) => GetResponse {
                status: proto::Status::Ok as i32,
                value: value.clone(),
            },
            None => GetResponse {
                status: proto::Status::NoKey as i32,
                value: String::new(),
            },
        };
        Ok(Response::new(resp))
    }

    async fn put(
        &self,
        req: Request<PutRequest>,
    ) -> tonic::Result<tonic::Response<PutResponse>, tonic::Status> {
        let req = req.into_inner();
        let mut st = self.state.lock().await;
        if !st.am_primary {
            return Ok(Response::new(PutResponse {
                status: proto::Status::WrongServer as i32,
            }));
        }
        st.kv.insert(req.key.clone(), req.value.clone());

        if st.view.has_backup() && st.installed_backup.as_deref() == Some(st.view.backup.as_str())
        {
            let backup = st.view.backup.clone();
            // The lock stays held for the whole forward: nothing may
            // swap the backup underneath an in-flight write.
            loop {
                match Self::send_put(&backup, &req.key, &req.value).await {
                    Ok(proto::Status::Ok) => break,
                    Ok(status) => debug!(%backup, ?status, "forward rejected, retrying"),
                    Err(err) => debug!(%backup, error = %err, "forward failed, retrying"),
                }
                if self.latest_view.borrow().backup != backup {
                    // The view service evicted this backup. Its
                    // replacement receives the write through the next
                    // state transfer instead.
                    warn!(%backup, "abandoning forward to evicted backup");
                    break;
                }
                tokio::time::sleep(PING_INTERVAL).await;
            }
        }
        Ok(Response::new(PutResponse {
            status: proto::Status::Ok as i32,
        }))
    }

    async fn fwd_put(
        &self,
        req: Request<PutRequest>,
    ) -> tonic::Result<tonic::Response<PutResponse>, tonic::Status> {
        let req = req.into_inner();
        let mut st = self.state.lock().await;
        if !st.view.is_backup(&self.me) {
            return Ok(Response::new(PutResponse {
                status: proto::Status::WrongServer as i32,
            }));
        }
        st.kv.insert(req.key, req.value);
        Ok(Response::new(PutResponse {
            status: proto::Status::Ok as i32,
        }))
    }

    async fn fwd_state(
        &self,
        req: Request<FwdStateRequest>,
    ) -> tonic::Result<tonic::Response<FwdStateResponse>, tonic::Status> {
        let req = req.into_inner();
        let mut st = self.state.lock().await;
        if !st.view.is_backup(&self.me) {
            return Ok(Response::new(FwdStateResponse {
                status: proto::Status::WrongServer as i32,
            }));
        }
        st.kv = req.kv;
        // Accepting the snapshot is what entitles this backup to
        // advertise the current viewnum, and so to become promotable.
        self.advertised.store(st.view.viewnum, Ordering::SeqCst);
        info!(viewnum = st.view.viewnum, "accepted state transfer");
        Ok(Response::new(FwdStateResponse {
            status: proto::Status::Ok as i32,
        }))
    }
}
