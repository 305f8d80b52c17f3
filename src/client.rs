use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::proto::kv_service_client::KvServiceClient;
use crate::proto::view_service_client::ViewServiceClient;
use crate::proto::{self, GetRequest, GetViewRequest, PingRequest, PutRequest};
use crate::view::View;
use crate::{Error, Result, PING_INTERVAL};

/// Per-server handle to the view service. Connects lazily and drops
/// the connection after an error so the next call redials.
pub struct ViewClerk {
    me: String,
    addr: String,
    conn: Option<ViewServiceClient<Channel>>,
}

impl ViewClerk {
    pub fn new(me: String, addr: String) -> Self {
        Self {
            me,
            addr,
            conn: None,
        }
    }

    /// Heartbeat carrying the viewnum this server currently holds.
    /// Replies with the view service's current view.
    pub async fn ping(&mut self, viewnum: u64) -> Result<View> {
        let req = PingRequest {
            me: self.me.clone(),
            viewnum,
        };
        let res = async {
            let conn = self.connection().await?;
            let resp = conn.ping(req).await?;
            Ok(resp.into_inner().view.unwrap_or_default().into())
        }
        .await;
        if res.is_err() {
            self.conn = None;
        }
        res
    }

    /// Read the current view without registering a heartbeat.
    pub async fn get(&mut self) -> Result<View> {
        let res = async {
            let conn = self.connection().await?;
            let resp = conn.get(GetViewRequest {}).await?;
            Ok(resp.into_inner().view.unwrap_or_default().into())
        }
        .await;
        if res.is_err() {
            self.conn = None;
        }
        res
    }

    async fn connection(&mut self) -> Result<&mut ViewServiceClient<Channel>> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let endpoint = Endpoint::from_shared(format!("http://{}", self.addr))?
                    .connect_timeout(PING_INTERVAL);
                ViewServiceClient::new(endpoint.connect().await?)
            }
        };
        Ok(self.conn.insert(conn))
    }
}

/// Client-facing handle to the store. Resolves the primary through the
/// view service and retries until a primary accepts the request, so a
/// view change in flight is invisible to the caller.
pub struct Clerk {
    vs: ViewClerk,
    primary: String,
    conn: Option<KvServiceClient<Channel>>,
}

impl Clerk {
    pub fn new(view_addr: String) -> Self {
        Self {
            vs: ViewClerk::new(String::new(), view_addr),
            primary: String::new(),
            conn: None,
        }
    }

    /// Fetch `key` from the current primary. `None` means the key is
    /// unset.
    pub async fn get(&mut self, key: &str) -> Option<String> {
        loop {
            match self.try_get(key).await {
                Ok((proto::Status::Ok, value)) => return Some(value),
                Ok((proto::Status::NoKey, _)) => return None,
                Ok((proto::Status::WrongServer, _)) => {
                    debug!(primary = %self.primary, "not the primary, re-resolving");
                    self.forget_primary();
                }
                Err(err) => {
                    debug!(error = %err, "get failed, re-resolving primary");
                    self.forget_primary();
                }
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
    }

    /// Store `value` under `key`, retrying until the current primary
    /// acknowledges the write.
    pub async fn put(&mut self, key: &str, value: &str) {
        loop {
            match self.try_put(key, value).await {
                Ok(proto::Status::Ok) => return,
                Ok(status) => {
                    debug!(primary = %self.primary, ?status, "put rejected, re-resolving");
                    self.forget_primary();
                }
                Err(err) => {
                    debug!(error = %err, "put failed, re-resolving primary");
                    self.forget_primary();
                }
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
    }

    async fn try_get(&mut self, key: &str) -> Result<(proto::Status, String)> {
        let conn = self.primary_conn().await?;
        let resp = conn
            .get(GetRequest {
                key: key.to_owned(),
            })
            .await?
            .into_inner();
        Ok((resp.status(), resp.value))
    }

    async fn try_put(&mut self, key: &str, value: &str) -> Result<proto::Status> {
        let conn = self.primary_conn().await?;
        let resp = conn
            .put(PutRequest {
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .await?
            .into_inner();
        Ok(resp.status())
    }

    fn forget_primary(&mut self) {
        self.primary.clear();
        self.conn = None;
    }

    async fn primary_conn(&mut self) -> Result<&mut KvServiceClient<Channel>> {
        if self.primary.is_empty() {
            let view = self.vs.get().await?;
            if !view.has_primary() {
                return Err(Error::NoPrimary);
            }
            self.primary = view.primary;
            self.conn = None;
        }
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let endpoint = Endpoint::from_shared(format!("http://{}", self.primary))?
                    .connect_timeout(PING_INTERVAL);
                KvServiceClient::new(endpoint.connect().await?)
            }
        };
        Ok(self.conn.insert(conn))
    }
}
