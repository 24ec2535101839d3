//! 请求分发与应答关联的端到端回归。
//!
//! # 教案式说明
//! - **Why**：调用链跨越清单加载、路由、订阅、发布与挂起表，单元测试只覆盖各段；这里验证拼接后的行为。
//! - **How**：以 `test_stubs` 的内存传输代替真实服务端，手动投递回复；计时相关用例以
//!   `start_paused` 运行，超时瞬时推进。
//! - **What**：断言路径格式、请求载荷、结果/错误还原、超时、订阅合并与重连后的重建。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use spark_mesh::test_stubs::{MemoryClient, MemoryConnection, manifest};
use spark_mesh::{CallParameters, ClientConfig, ConnectionEvent, MeshClient, MeshError};
use tokio::task::JoinHandle;

struct Fixture {
    client: Arc<MemoryClient>,
    connection: Arc<MemoryConnection>,
    mesh: Arc<MeshClient>,
}

fn fixture(secure: bool, config: ClientConfig) -> Fixture {
    let client = MemoryClient::new("SESSION_ID", "SERVER_NAME", secure);
    if secure {
        client.set_username("_ADMIN");
    }
    client.push_description(manifest(
        "DOMAIN_NAME",
        &[("component1", "1.2.4", &["method1", "method2"])],
    ));
    let connection = MemoryConnection::standalone(Arc::clone(&client));
    let mesh = Arc::new(MeshClient::new(connection.clone(), config).expect("valid config"));
    Fixture {
        client,
        connection,
        mesh,
    }
}

fn spawn_request(
    mesh: &Arc<MeshClient>,
    method: &'static str,
    args: Vec<Value>,
) -> JoinHandle<Result<Vec<Value>, MeshError>> {
    let mesh = Arc::clone(mesh);
    tokio::spawn(async move { mesh.request("component1", "^1.0.0", method, args).await })
}

async fn wait_for_sets(client: &MemoryClient, count: usize) {
    while client.sets().len() < count {
        tokio::task::yield_now().await;
    }
}

/// 安全模式：应答路径按 (组件, 方法) 划分，请求来源携带用户名，`set` 带请求超时与不持久化标记。
#[tokio::test(start_paused = true)]
async fn secure_request_round_trip() {
    let Fixture { client, mesh, .. } = fixture(true, ClientConfig::default());

    let call = spawn_request(&mesh, "method1", vec![json!({"params": 1})]);
    wait_for_sets(&client, 1).await;

    let set = client.last_set().expect("request published");
    assert_eq!(set.path, "/_exchange/requests/DOMAIN_NAME/component1/method1");
    assert_eq!(
        set.value,
        json!({
            "callbackAddress": "/_exchange/responses/DOMAIN_NAME/component1/method1/SESSION_ID/1",
            "args": [{"params": 1}],
            "origin": {"id": "SESSION_ID", "username": "_ADMIN"}
        })
    );
    assert_eq!(set.options.timeout, Duration::from_secs(10));
    assert!(set.options.no_store);
    assert_eq!(
        client.subscriptions()[0].path,
        "/_exchange/responses/DOMAIN_NAME/component1/method1/SESSION_ID/*"
    );

    assert_eq!(client.reply_ok(vec![json!({"a": 1}), json!({"b": 2})]), 1);
    let result = call.await.expect("task completes").expect("ok reply");
    assert_eq!(result, vec![json!({"a": 1}), json!({"b": 2})]);
}

/// 非安全模式：一条会话级通配订阅覆盖所有方法，来源不带用户名。
#[tokio::test(start_paused = true)]
async fn insecure_paths_share_one_session_subscription() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());

    let first = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 1).await;
    assert_eq!(
        client.last_set().expect("published").value["callbackAddress"],
        json!("/_exchange/responses/SESSION_ID/DOMAIN_NAME/component1/method1/1")
    );
    client.reply_ok(vec![]);
    first.await.expect("task completes").expect("ok reply");

    let second = spawn_request(&mesh, "method2", vec![]);
    wait_for_sets(&client, 2).await;
    let set = client.last_set().expect("published");
    assert_eq!(set.value["origin"], json!({"id": "SESSION_ID"}));
    client.reply_ok(vec![json!(true)]);
    assert_eq!(second.await.expect("task completes"), Ok(vec![json!(true)]));

    let subscriptions = client.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].path, "/_exchange/responses/SESSION_ID/*");
}

/// 远端错误保留 name 与 message。
#[tokio::test(start_paused = true)]
async fn remote_error_is_rebuilt() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());

    let call = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 1).await;
    client.reply_error("TypeError", "xxx");

    let err = call.await.expect("task completes").expect_err("remote error");
    assert_eq!(err.name(), "TypeError");
    assert_eq!(
        err,
        MeshError::Remote {
            name: "TypeError".into(),
            message: "xxx".into(),
        }
    );
}

/// 应答超时恰好报告一次，之后到达的回复不产生任何效果。
#[tokio::test(start_paused = true)]
async fn response_timeout_then_late_reply_is_ignored() {
    let config = ClientConfig::default().with_response_timeout(Duration::from_secs(5));
    let Fixture { client, mesh, .. } = fixture(false, config);

    let call = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 1).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let err = call.await.expect("task completes").expect_err("timed out");
    assert_eq!(
        err,
        MeshError::ResponseTimeout {
            component: "component1".into(),
            method: "method1".into(),
            sequence: 1,
        }
    );
    assert!(mesh.responses().pending().is_empty());
    // 处理器仍被调用，但挂起表已无该序号。
    assert_eq!(client.reply_ok(vec![json!(1)]), 1);
    assert!(mesh.responses().pending().is_empty());
}

/// 未实现的方法立即失败，且不发布请求。
#[tokio::test(start_paused = true)]
async fn unknown_method_is_not_implemented() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());

    let err = mesh
        .request("component1", "^1.0.0", "method9", vec![])
        .await
        .expect_err("no such method");
    assert_eq!(err.to_string(), "Not implemented component1:^1.0.0:method9");
    assert!(client.sets().is_empty());
    assert!(client.subscriptions().is_empty());
}

/// 未连接时不触发任何传输操作。
#[tokio::test(start_paused = true)]
async fn disconnected_request_fails_fast() {
    let Fixture {
        client,
        connection,
        mesh,
    } = fixture(false, ClientConfig::default());
    connection.set_connected(false);

    let err = mesh
        .request("component1", "^1.0.0", "method1", vec![])
        .await
        .expect_err("not connected");
    assert_eq!(err, MeshError::NotConnected);
    assert_eq!(client.get_count(), 0);
}

/// 发布失败时调用方收到传输错误，挂起表不残留条目。
#[tokio::test(start_paused = true)]
async fn publish_failure_leaves_no_pending_entry() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());
    client.fail("set", "socket closed");

    let err = mesh
        .request("component1", "^1.0.0", "method1", vec![])
        .await
        .expect_err("set fails");
    assert_eq!(err.code(), "mesh.transport");
    assert!(mesh.responses().pending().is_empty());
}

/// 订阅失败向调用方报告 `Subscribe` 错误；恢复后下一次调用重新订阅。
#[tokio::test(start_paused = true)]
async fn subscribe_failure_is_reported_and_retried() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());
    client.fail("on", "forbidden");

    let err = mesh
        .request("component1", "^1.0.0", "method1", vec![])
        .await
        .expect_err("subscribe fails");
    assert!(matches!(err, MeshError::Subscribe { ref path, .. } if path == "/_exchange/responses/SESSION_ID/*"));

    client.clear_failure("on");
    let call = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 1).await;
    client.reply_ok(vec![]);
    call.await.expect("task completes").expect("ok reply");
    assert_eq!(client.subscriptions().len(), 1);
}

/// 并发调用合并为一次清单拉取与一次应答订阅。
#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_load_and_subscription() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());

    let calls: Vec<_> = (0..3)
        .map(|_| spawn_request(&mesh, "method1", vec![]))
        .collect();
    wait_for_sets(&client, 3).await;
    assert_eq!(client.get_count(), 1);
    assert_eq!(client.subscriptions().len(), 1);

    for set in client.sets() {
        let callback = set.value["callbackAddress"]
            .as_str()
            .expect("callback address")
            .to_owned();
        client.deliver(&callback, json!({"status": "ok", "args": [null, callback]}), None);
    }
    for call in calls {
        let result = call.await.expect("task completes").expect("ok reply");
        assert_eq!(result.len(), 1);
    }
}

/// 通用调用缺省版本为 `*`。
#[tokio::test(start_paused = true)]
async fn generic_call_defaults_to_any_version() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());

    let call = {
        let mesh = Arc::clone(&mesh);
        tokio::spawn(async move {
            mesh.call(CallParameters::new("component1", "method2").with_arguments(vec![json!(42)]))
                .await
        })
    };
    wait_for_sets(&client, 1).await;
    assert_eq!(
        client.last_set().expect("published").path,
        "/_exchange/requests/DOMAIN_NAME/component1/method2"
    );
    client.reply_ok(vec![json!("done")]);
    assert_eq!(call.await.expect("task completes"), Ok(vec![json!("done")]));
    assert_eq!(
        mesh.store().routing().candidates("component1", "*", "method2").map(|c| c.len()),
        Some(1)
    );
}

/// 本地重连后会话 ID 变化：清单重新加载，应答订阅按新会话重建。
#[tokio::test(start_paused = true)]
async fn reconnect_rebuilds_session_scoped_state() {
    let Fixture {
        client,
        connection,
        mesh,
    } = fixture(false, ClientConfig::default());
    mesh.start().expect("runtime present");

    let first = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 1).await;
    client.reply_ok(vec![]);
    first.await.expect("task completes").expect("ok reply");

    client.set_session_id("SESSION_ID_2");
    connection.emit(ConnectionEvent::Reconnected);

    let second = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 2).await;
    assert_eq!(
        client.last_set().expect("published").value["callbackAddress"],
        json!("/_exchange/responses/SESSION_ID_2/DOMAIN_NAME/component1/method1/2")
    );
    client.reply_ok(vec![]);
    second.await.expect("task completes").expect("ok reply");

    assert_eq!(client.get_count(), 2);
    let paths: Vec<_> = client.subscriptions().into_iter().map(|s| s.path).collect();
    assert_eq!(
        paths,
        ["/_exchange/responses/SESSION_ID/*", "/_exchange/responses/SESSION_ID_2/*"]
    );
}

/// `light` 档案不拉取清单，域名取自配置，超时采用 60 s / 120 s。
#[tokio::test(start_paused = true)]
async fn light_profile_routes_locally() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::light("LIGHT_DOMAIN"));

    let call = {
        let mesh = Arc::clone(&mesh);
        tokio::spawn(async move { mesh.request("anything", "^9.0.0", "method", vec![]).await })
    };
    wait_for_sets(&client, 1).await;
    let set = client.last_set().expect("published");
    assert_eq!(set.path, "/_exchange/requests/LIGHT_DOMAIN/anything/method");
    assert_eq!(set.options.timeout, Duration::from_secs(60));
    assert_eq!(client.get_count(), 0);

    client.reply_ok(vec![]);
    call.await.expect("task completes").expect("ok reply");
}

/// 停止后监听者被注销，未完成的调用仍由应答计时器收尾。
#[tokio::test(start_paused = true)]
async fn stop_unregisters_and_leaves_pending_to_time_out() {
    let Fixture {
        client,
        connection,
        mesh,
    } = fixture(false, ClientConfig::default());
    mesh.start().expect("runtime present");
    assert_eq!(connection.listener_count(), 1);

    let call = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 1).await;
    mesh.stop();
    assert_eq!(connection.listener_count(), 0);
    assert_eq!(mesh.responses().pending().len(), 1);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(matches!(
        call.await.expect("task completes"),
        Err(MeshError::ResponseTimeout { .. })
    ));
}

/// 发布阶段卡住时调用方放弃请求：挂起条目随请求一起撤销，不会无限残留。
#[tokio::test(start_paused = true)]
async fn abandoned_request_leaves_no_pending_entry() {
    let Fixture { client, mesh, .. } = fixture(false, ClientConfig::default());
    client.stall_sets(true);

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        mesh.request("component1", "^1.0.0", "method1", vec![]),
    )
    .await;
    assert!(outcome.is_err(), "publish never completes");
    assert_eq!(client.sets().len(), 1);
    assert!(mesh.responses().pending().is_empty());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(mesh.responses().pending().is_empty());

    client.stall_sets(false);
    let call = spawn_request(&mesh, "method1", vec![]);
    wait_for_sets(&client, 2).await;
    assert_eq!(mesh.responses().pending().len(), 1);
    client.reply_ok(vec![json!("done")]);
    assert_eq!(call.await.expect("task completes"), Ok(vec![json!("done")]));
}
