//! 字节流桥接的端到端行为：连接建立、双向搬运、背压、accept、半关闭、重置与并发关闭。
//!
//! # 教案级说明
//! - **意图 (Why)**：桥接的正确性体现在客户端句柄上可观察的字节与信号，因此测试只通过
//!   `describe()` 得到的客户端句柄与脚本化端点交互，不触碰桥接内部状态；
//! - **契约 (What)**：所有等待都带有超时，失败时给出等待对象，避免测试挂死。

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use spark_socket_bridge::test_stubs::{MockEndpoint, MockStack};
use spark_socket_bridge::{
    BridgeConfig, Domain, Errno, FullAddress, Handle, HandleError, NetworkStack, ShutdownMode,
    Signals, SocketOption, SocketOptionName, SocketProvider, StreamSocket, StreamSocketProtocol,
    TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

fn provider(config: BridgeConfig) -> (SocketProvider, Arc<MockStack>) {
    let stack = Arc::new(MockStack::new());
    let shared: Arc<dyn NetworkStack> = stack.clone();
    (SocketProvider::new(shared, config).expect("合法配置"), stack)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "等待超时：{what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_signal(handle: &Handle, mask: Signals) -> Signals {
    handle
        .wait(mask, Some(WAIT))
        .await
        .unwrap_or_else(|err| panic!("等待信号 {mask:?} 失败：{err}"))
}

async fn read_exact(handle: &Handle, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 256];
    while out.len() < len {
        match handle.read(&mut buf) {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(HandleError::ShouldWait) => {
                wait_signal(handle, Signals::READABLE | Signals::PEER_CLOSED).await;
            }
            Err(err) => panic!("客户端读取失败：{err}"),
        }
    }
    out
}

async fn write_all(handle: &Handle, mut data: &[u8]) {
    while !data.is_empty() {
        match handle.write(data) {
            Ok(n) => data = &data[n..],
            Err(HandleError::ShouldWait) => {
                wait_signal(handle, Signals::WRITABLE).await;
            }
            Err(err) => panic!("客户端写入失败：{err}"),
        }
    }
}

async fn connected_stream(
    provider: &SocketProvider,
    stack: &MockStack,
) -> (StreamSocket, Arc<MockEndpoint>, Handle) {
    let socket = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .expect("创建字节流套接字");
    let endpoint = stack.last().expect("应已创建端点");
    let client = socket.describe().expect("describe");
    endpoint.establish();
    let observed = wait_signal(&client, Signals::CONNECTED).await;
    assert!(observed.contains(Signals::OUTGOING), "连接建立时应同时发布 OUTGOING");
    (socket, endpoint, client)
}

fn addr(text: &str) -> FullAddress {
    FullAddress::from(text.parse::<SocketAddr>().expect("合法地址"))
}

#[tokio::test(flavor = "multi_thread")]
async fn nonblocking_connect_publishes_outgoing_and_connected() {
    let (provider, stack) = provider(BridgeConfig::default());
    let socket = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    let client = socket.describe().unwrap();
    assert!(
        !client.signals().intersects(Signals::OUTGOING | Signals::CONNECTED),
        "未连接的套接字不得发布连接信号"
    );

    endpoint.fail_connect(TransportError::ConnectStarted);
    let err = socket.connect(&addr("192.0.2.1:80")).unwrap_err();
    assert_eq!(err.errno(), Some(Errno::Einprogress));

    endpoint.establish();
    let observed = wait_signal(&client, Signals::CONNECTED).await;
    assert!(observed.contains(Signals::OUTGOING));
    assert_eq!(
        socket.get_peer_name().unwrap(),
        "192.0.2.1:80".parse::<SocketAddr>().unwrap()
    );
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connect_publishes_outgoing_only() {
    let (provider, stack) = provider(BridgeConfig::default());
    let socket = provider
        .stream_socket(Domain::Ipv6, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    let client = socket.describe().unwrap();

    endpoint.fail_read(TransportError::ConnectionRefused);
    wait_signal(&client, Signals::OUTGOING).await;
    assert!(
        !client.signals().contains(Signals::CONNECTED),
        "被拒绝的连接不得发布 CONNECTED"
    );
    assert_eq!(
        socket.get_sock_opt(SocketOptionName::Error).unwrap(),
        SocketOption::Error(Some(Errno::Econnrefused))
    );
    assert!(!socket.bridge().is_released(), "连接被拒绝后客户端可以重试，桥接不应拆除");
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connect_can_be_retried() {
    let (provider, stack) = provider(BridgeConfig::default());
    let socket = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    let client = socket.describe().unwrap();

    endpoint.fail_read(TransportError::ConnectionRefused);
    wait_signal(&client, Signals::OUTGOING).await;
    endpoint.clear_read_error();

    socket.connect(&addr("192.0.2.1:80")).expect("重新发起连接");
    endpoint.establish();
    wait_signal(&client, Signals::CONNECTED).await;

    endpoint.push_inbound(b"second try");
    assert_eq!(read_exact(&client, 10).await, b"second try");
    assert!(!socket.bridge().is_released());
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_before_connect_counts_as_refusal() {
    let (provider, stack) = provider(BridgeConfig::default());
    let socket = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    let client = socket.describe().unwrap();

    endpoint.fail_read(TransportError::Timeout);
    wait_signal(&client, Signals::OUTGOING).await;
    assert!(!client.signals().contains(Signals::CONNECTED));
    assert_eq!(
        socket.get_sock_opt(SocketOptionName::Error).unwrap(),
        SocketOption::Error(Some(Errno::Etimedout))
    );
    assert!(!socket.bridge().is_released(), "连接建立前超时不拆除桥接");
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_after_connect_tears_down_bridge() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.fail_read(TransportError::Timeout);
    wait_signal(&client, Signals::PEER_CLOSED).await;
    tokio::time::timeout(WAIT, socket.bridge().released())
        .await
        .expect("连接建立后超时等同于重置");
    assert_eq!(
        socket.get_sock_opt(SocketOptionName::Error).unwrap(),
        SocketOption::Error(Some(Errno::Etimedout))
    );
    assert_eq!(endpoint.close_count(), 1);
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn first_hard_error_is_kept_across_loops() {
    let (provider, stack) = provider(BridgeConfig::default());
    let socket = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    let client = socket.describe().unwrap();

    // 读循环先缓存 ECONNREFUSED。
    endpoint.fail_read(TransportError::ConnectionRefused);
    wait_signal(&client, Signals::OUTGOING).await;
    endpoint.clear_read_error();
    endpoint.establish();
    wait_signal(&client, Signals::CONNECTED).await;

    // 写循环随后遇到的硬错误触发拆除，但不覆盖已缓存的错误。
    endpoint.fail_write(TransportError::Timeout);
    write_all(&client, b"doomed").await;
    tokio::time::timeout(WAIT, socket.bridge().released())
        .await
        .expect("写方向硬错误应拆除桥接");
    assert_eq!(
        socket.get_sock_opt(SocketOptionName::Error).unwrap(),
        SocketOption::Error(Some(Errno::Econnrefused)),
        "SO_ERROR 报告第一个硬错误"
    );
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bytes_flow_in_both_directions_in_order() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.push_inbound(b"hello ");
    endpoint.push_inbound(b"world");
    assert_eq!(read_exact(&client, 11).await, b"hello world");
    eventually("moderate_recv_buf 记账", || endpoint.moderated() == 11).await;

    let outbound: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    write_all(&client, &outbound).await;
    eventually("出站数据写入端点", || endpoint.written().len() == outbound.len()).await;
    assert_eq!(endpoint.written(), outbound, "跨越多个写块的数据必须保序");

    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_endpoint_resumes_after_credit() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.limit_writes(5);
    write_all(&client, b"0123456789").await;
    eventually("首批 5 字节写入", || endpoint.written() == b"01234").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoint.written(), b"01234", "额度耗尽后不得继续写入");

    endpoint.grant_credit(5);
    eventually("剩余字节写入", || endpoint.written() == b"0123456789").await;
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_clears_incoming_when_queue_drains() {
    let (provider, stack) = provider(BridgeConfig::default());
    let listener = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    let client = listener.describe().unwrap();

    listener
        .bind(&FullAddress::new(Ipv4Addr::LOCALHOST.into(), 8080))
        .unwrap();
    listener.listen(-1).unwrap();
    assert_eq!(endpoint.backlog(), Some(0), "负的 backlog 应按 0 处理");

    let first = endpoint.push_connection(addr("192.0.2.7:40000"));
    endpoint.push_connection(addr("192.0.2.8:40001"));
    wait_signal(&client, Signals::INCOMING).await;

    let (peer, conn) = listener.accept(true).await.unwrap();
    assert_eq!(peer, Some("192.0.2.7:40000".parse().unwrap()));
    assert!(
        client.signals().contains(Signals::INCOMING),
        "仍有待接受连接时 INCOMING 必须保留"
    );

    let (peer, second) = listener.accept(false).await.unwrap();
    assert_eq!(peer, None, "未请求地址时不返回对端地址");
    assert!(!client.signals().contains(Signals::INCOMING));

    let err = listener.accept(false).await.unwrap_err();
    assert_eq!(err.errno(), Some(Errno::Eagain));

    let conn_client = conn.describe().unwrap();
    wait_signal(&conn_client, Signals::CONNECTED).await;
    first.push_inbound(b"hi");
    assert_eq!(read_exact(&conn_client, 2).await, b"hi");
    assert_eq!(provider.registry().len(), 3);

    conn.close().await;
    second.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_queued_right_after_listen_is_not_lost() {
    let (provider, stack) = provider(BridgeConfig::default());
    let listener = provider
        .stream_socket(Domain::Ipv4, StreamSocketProtocol::Tcp)
        .await
        .unwrap();
    let endpoint = stack.last().unwrap();
    listener.listen(16).unwrap();
    // 构造返回时 IN 通知已注册，紧随其后的入站连接必须被观测到。
    endpoint.push_connection(addr("198.51.100.1:5000"));

    let client = listener.describe().unwrap();
    wait_signal(&client, Signals::INCOMING).await;
    let (_, conn) = listener.accept(false).await.unwrap();
    conn.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn client_shutdown_propagates_to_endpoint() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    assert_eq!(
        socket.shutdown(ShutdownMode::empty()).unwrap_err().errno(),
        Some(Errno::Einval)
    );

    write_all(&client, b"last words").await;
    client.shutdown(ShutdownMode::WRITE).unwrap();
    eventually("端点收到 Shutdown(WRITE)", || {
        endpoint.shutdowns().contains(&ShutdownMode::WRITE)
    })
    .await;
    assert_eq!(endpoint.written(), b"last words", "半关闭前写入的数据必须先送达");

    socket.shutdown(ShutdownMode::READ).unwrap();
    eventually("端点收到 Shutdown(READ)", || {
        endpoint.shutdowns().contains(&ShutdownMode::READ)
    })
    .await;
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_eof_half_closes_client() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.push_inbound(b"tail");
    endpoint.fail_read(TransportError::ClosedForReceive);
    assert_eq!(read_exact(&client, 4).await, b"tail");
    wait_signal(&client, Signals::PEER_WRITE_DISABLED).await;
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf), Err(HandleError::BadState));

    // 读方向结束后写方向仍然可用。
    write_all(&client, b"still writable").await;
    eventually("半关闭后继续写出", || endpoint.written() == b"still writable").await;
    assert!(!socket.bridge().is_released());
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_endpoint_with_cached_error_skips_half_close() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.fail_connect(TransportError::ConnectionRefused);
    let err = socket.connect(&addr("192.0.2.1:80")).unwrap_err();
    assert_eq!(err.errno(), Some(Errno::Econnrefused));

    // 处于错误态的端点两个方向都报告关闭，两个循环都应退出而不半关闭句柄。
    endpoint.fail_read(TransportError::ClosedForReceive);
    endpoint.fail_write(TransportError::ClosedForSend);
    client.write(b"x").unwrap();
    eventually("读写循环注销各自的通知条目", || endpoint.queue().len() == 1).await;

    let signals = client.signals();
    assert!(
        !signals.intersects(Signals::PEER_WRITE_DISABLED | Signals::WRITE_DISABLED),
        "已缓存硬错误时不得半关闭客户端句柄：{signals:?}"
    );
    assert!(!socket.bridge().is_released());
    assert_eq!(
        socket.get_sock_opt(SocketOptionName::Error).unwrap(),
        SocketOption::Error(Some(Errno::Econnrefused))
    );
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_closed_for_send_half_closes_client() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.fail_write(TransportError::ClosedForSend);
    client.write(b"x").unwrap();
    wait_signal(&client, Signals::WRITE_DISABLED).await;
    assert!(!socket.bridge().is_released());
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_while_read_pending_tears_down_bridge() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;
    let bridge = Arc::clone(socket.bridge());

    endpoint.reset(TransportError::ConnectionReset);
    wait_signal(&client, Signals::PEER_CLOSED).await;
    tokio::time::timeout(WAIT, bridge.released())
        .await
        .expect("重置后桥接应自行拆除");

    assert_eq!(
        socket.get_sock_opt(SocketOptionName::Error).unwrap(),
        SocketOption::Error(Some(Errno::Econnreset)),
        "SO_ERROR 应报告缓存的硬错误"
    );
    assert_eq!(endpoint.close_count(), 1);
    assert!(provider.registry().is_empty());

    socket.close().await;
    assert_eq!(endpoint.close_count(), 1, "端点只能被关闭一次");
}

#[tokio::test(flavor = "multi_thread")]
async fn hang_up_tears_down_bridge() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;

    endpoint.hang_up();
    wait_signal(&client, Signals::PEER_CLOSED).await;
    tokio::time::timeout(WAIT, socket.bridge().released())
        .await
        .expect("HUP 后桥接应拆除");
    assert_eq!(endpoint.close_count(), 1);
    socket.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_closes_release_exactly_once() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, client) = connected_stream(&provider, &stack).await;
    let bridge = Arc::clone(socket.bridge());

    let clones: Vec<StreamSocket> = (0..8).map(|_| socket.clone_socket()).collect();
    let mut tasks = Vec::new();
    for clone in clones {
        tasks.push(tokio::spawn(clone.close()));
    }
    for _ in 0..4 {
        let bridge = Arc::clone(&bridge);
        tasks.push(tokio::spawn(async move { bridge.teardown().await }));
    }
    for task in tasks {
        task.await.expect("关闭任务不应 panic");
    }
    assert!(bridge.is_released(), "teardown 返回时资源必须已释放");
    assert_eq!(endpoint.close_count(), 1);

    socket.close().await;
    wait_signal(&client, Signals::PEER_CLOSED).await;
    assert_eq!(endpoint.close_count(), 1);
    assert_eq!(provider.registry().stats().destroyed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_last_socket_releases_in_background() {
    let (provider, stack) = provider(BridgeConfig::default());
    let (socket, endpoint, _client) = connected_stream(&provider, &stack).await;
    let bridge = Arc::clone(socket.bridge());

    drop(socket);
    tokio::time::timeout(WAIT, bridge.released())
        .await
        .expect("drop 后桥接应在后台拆除");
    assert_eq!(endpoint.close_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn outbound_bytes_arrive_in_order_under_small_chunks(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..12),
        chunk_size in 1usize..16,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("构建运行时");
        let expected: Vec<u8> = chunks.concat();
        let written = runtime.block_on(async {
            let config = BridgeConfig {
                stream_write_chunk: chunk_size,
                ..BridgeConfig::default()
            };
            let (provider, stack) = provider(config);
            let (socket, endpoint, client) = connected_stream(&provider, &stack).await;
            for chunk in &chunks {
                write_all(&client, chunk).await;
            }
            eventually("全部字节送达", || endpoint.written().len() == expected.len()).await;
            socket.close().await;
            endpoint.written()
        });
        prop_assert_eq!(written, expected);
    }
}
