use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

use rand::Rng;
use vole::proto::kv_service_client::KvServiceClient;
use vole::proto::{GetRequest, PutRequest, Status};
use vole::{Clerk, KvServer, View, ViewClerk, ViewServer, PING_INTERVAL};

static NEXT_PORT: AtomicU16 = AtomicU16::new(22000);

fn next_addr() -> String {
    format!("127.0.0.1:{}", NEXT_PORT.fetch_add(1, Ordering::SeqCst))
}

async fn start_view_service() -> String {
    let addr = next_addr();
    let server = ViewServer::new(addr.parse().unwrap());
    tokio::spawn(server.run());
    addr
}

fn start_kv(view_addr: &str) -> (KvServer, String) {
    let addr = next_addr();
    let server = KvServer::new(addr.clone(), view_addr.to_owned()).unwrap();
    tokio::spawn(server.clone().run());
    (server, addr)
}

async fn wait_for_view<F: Fn(&View) -> bool>(view_addr: &str, cond: F) -> View {
    let mut vs = ViewClerk::new(String::new(), view_addr.to_owned());
    for _ in 0..200 {
        if let Ok(view) = vs.get().await {
            if cond(&view) {
                return view;
            }
        }
        tokio::time::sleep(PING_INTERVAL).await;
    }
    panic!("cluster never reached the expected view");
}

/// Bring up a primary/backup pair and leave time for the state
/// transfer to complete, so writes forward from the first Put on.
async fn start_pair(view_addr: &str) -> (KvServer, String, KvServer, String) {
    let (s1, addr1) = start_kv(view_addr);
    wait_for_view(view_addr, |v| v.primary == addr1).await;
    let (s2, addr2) = start_kv(view_addr);
    wait_for_view(view_addr, |v| v.backup == addr2).await;
    tokio::time::sleep(5 * PING_INTERVAL).await;
    (s1, addr1, s2, addr2)
}

#[tokio::test]
async fn put_then_get() {
    let va = start_view_service().await;
    let (_s1, addr1) = start_kv(&va);
    wait_for_view(&va, |v| v.primary == addr1).await;

    let mut clerk = Clerk::new(va.clone());
    clerk.put("key1", "value1").await;
    assert_eq!(clerk.get("key1").await, Some("value1".to_owned()));
    assert_eq!(clerk.get("missing").await, None);

    // Overwrites take the latest value.
    clerk.put("key1", "value2").await;
    assert_eq!(clerk.get("key1").await, Some("value2".to_owned()));
}

#[tokio::test]
async fn failover_preserves_acknowledged_writes() {
    let va = start_view_service().await;
    let (s1, _addr1, _s2, addr2) = start_pair(&va).await;

    let mut clerk = Clerk::new(va.clone());
    for i in 0..10 {
        clerk.put(&format!("key{i}"), &format!("value{i}")).await;
    }

    // The primary dies; every acknowledged write must survive on the
    // promoted backup.
    s1.shutdown();
    wait_for_view(&va, |v| v.primary == addr2).await;
    for i in 0..10 {
        assert_eq!(
            clerk.get(&format!("key{i}")).await,
            Some(format!("value{i}"))
        );
    }
}

#[tokio::test]
async fn backup_rejects_direct_requests() {
    let va = start_view_service().await;
    let (_s1, _addr1, _s2, addr2) = start_pair(&va).await;

    let mut clerk = Clerk::new(va.clone());
    clerk.put("key1", "value1").await;

    let mut direct = KvServiceClient::connect(format!("http://{addr2}"))
        .await
        .unwrap();
    let resp = direct
        .get(GetRequest {
            key: "key1".to_owned(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status(), Status::WrongServer);
    assert_eq!(resp.value, "");

    let resp = direct
        .put(PutRequest {
            key: "key1".to_owned(),
            value: "sneaky".to_owned(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status(), Status::WrongServer);
}

#[tokio::test]
async fn replacement_backup_receives_state() {
    let va = start_view_service().await;
    let (s1, addr1, s2, _addr2) = start_pair(&va).await;

    let mut clerk = Clerk::new(va.clone());
    clerk.put("stable", "value").await;

    // The backup dies and a fresh server takes its place; the new
    // backup must be brought up to date before it can be promoted.
    s2.shutdown();
    let (_s3, addr3) = start_kv(&va);
    let view = wait_for_view(&va, |v| v.backup == addr3).await;
    assert_eq!(view.primary, addr1);
    tokio::time::sleep(5 * PING_INTERVAL).await;

    s1.shutdown();
    wait_for_view(&va, |v| v.primary == addr3).await;
    assert_eq!(clerk.get("stable").await, Some("value".to_owned()));
}

#[tokio::test]
async fn randomised_retrieval() {
    let va = start_view_service().await;
    let (_s1, addr1) = start_kv(&va);
    wait_for_view(&va, |v| v.primary == addr1).await;

    let mut clerk = Clerk::new(va.clone());
    let mut tracker = HashMap::new();
    let mut rng = rand::thread_rng();
    for i in 0..50 {
        let key = format!("key{}", rng.gen_range(0..10));
        let value = format!("value{i}");
        clerk.put(&key, &value).await;
        tracker.insert(key, value);
    }
    for (key, value) in tracker {
        assert_eq!(clerk.get(&key).await, Some(value));
    }
}
