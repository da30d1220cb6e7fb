//! 连接契约测试：以内存回环网络驱动。
//!
//! # 教案级导览
//!
//! - **Why**：回环连接完整实现了连接契约，是检验“请求 → 交付 → 释放即发送”、
//!   “数据通知 → 拉取读者 → 确认”以及拆除时序的最小环境，不受操作系统调度干扰；
//! - **How**：每个用例构造独立的调度器与网络，挂接 [`RecordingObserver`]，
//!   每次操作后调用 `execute_all_actions` 推进，然后检查事件序列；
//! - **What**：覆盖发送池背压与恢复、单一未完成流、至少一次读取、接收窗口、
//!   优雅关闭与中止的对端原因、监听/连接工厂与拒绝路径。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use kindle_core::config::{ConnectionLimits, DispatcherConfig};
use kindle_core::connection::{Connection, LinkState};
use kindle_core::dispatcher::EventDispatcher;
use kindle_core::error::{DisconnectReason, codes};
use kindle_core::factory::ConnectFailReason;
use kindle_core::loopback::{LoopbackConnection, LoopbackNetwork};
use kindle_core::test_stubs::{
    ObserverEvent, RecordingClientFactory, RecordingObserver, RecordingServerFactory,
};

fn network(limits: ConnectionLimits) -> LoopbackNetwork {
    let dispatcher = EventDispatcher::new(DispatcherConfig::default());
    LoopbackNetwork::new(dispatcher, limits)
}

fn attached_pair(
    network: &LoopbackNetwork,
    client: &Arc<RecordingObserver>,
    server: &Arc<RecordingObserver>,
) -> (Arc<LoopbackConnection>, Arc<LoopbackConnection>) {
    let (left, right) = network.pair().expect("注册表应有空位");
    left.attach(client.clone());
    right.attach(server.clone());
    network.dispatcher().execute_all_actions();
    (left, right)
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// 挂接后先收到 `Attached`，再收到 `Connected`。
#[test]
fn attach_delivers_attached_then_connected() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::new();
    let server = RecordingObserver::new();
    attached_pair(&network, &client, &server);

    assert_eq!(client.events(), vec![ObserverEvent::Attached, ObserverEvent::Connected]);
    assert_eq!(server.events(), vec![ObserverEvent::Attached, ObserverEvent::Connected]);
}

/// 请求 5 字节、写入 "hello"、释放；对端读取后确认，再次拉取的读者为空。
#[test]
fn hello_round_trip_consumes_window_after_ack() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::new();
    let server = RecordingObserver::passive();
    let (_left, right) = attached_pair(&network, &client, &server);

    client.send(b"hello");
    network.dispatcher().execute_all_actions();

    assert!(client.events().contains(&ObserverEvent::SendStreamAvailable { size: 5 }));
    assert_eq!(server.count(ObserverEvent::DataReceived), 1);

    let mut reader = right.receive_stream();
    assert_eq!(reader.extract_contiguous(usize::MAX), b"hello");
    drop(reader);
    right.ack_received();

    let reader = right.receive_stream();
    assert!(reader.is_empty(), "确认后的字节不应再次出现");
}

/// 未确认前重新拉取的读者内容相同；部分确认只释放读过的前缀。
#[test]
fn unacknowledged_bytes_are_delivered_again() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::new();
    let server = RecordingObserver::passive();
    let (_left, right) = attached_pair(&network, &client, &server);

    client.send(b"at least once");
    network.dispatcher().execute_all_actions();

    let mut first = right.receive_stream();
    let seen = first.extract_contiguous(usize::MAX).to_vec();
    drop(first);

    let mut second = right.receive_stream();
    assert_eq!(second.remaining(), seen.as_slice(), "未确认的读者必须看到相同字节");
    let mut prefix = [0u8; 3];
    second.extract(&mut prefix).expect("可读 3 字节");
    assert_eq!(&prefix, b"at ");
    drop(second);
    right.ack_received();

    let third = right.receive_stream();
    assert_eq!(third.remaining(), b"least once");
}

/// 读者存活期间再次拉取读者是契约违背。
#[test]
#[should_panic(expected = "previous reader is still alive")]
fn second_live_reader_panics() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::new();
    let server = RecordingObserver::passive();
    let (_left, right) = attached_pair(&network, &client, &server);

    let _first = right.receive_stream();
    let _second = right.receive_stream();
}

/// 存在未交付请求时再次请求是契约违背。
#[test]
#[should_panic(expected = "previous request is outstanding")]
fn second_outstanding_request_panics() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::passive();
    let server = RecordingObserver::passive();
    let (left, _right) = attached_pair(&network, &client, &server);

    left.request_send_stream(4);
    left.request_send_stream(4);
}

#[test]
#[should_panic(expected = "exceeds the maximum")]
fn oversized_request_panics() {
    let network = network(ConnectionLimits::default().with_max_send_stream_size(16));
    let client = RecordingObserver::passive();
    let server = RecordingObserver::passive();
    let (left, _right) = attached_pair(&network, &client, &server);

    left.request_send_stream(17);
}

/// 发送池 N 个槽位全部被持有时第 N+1 个请求排队，释放一个后按序交付。
#[test]
fn exhausted_pool_queues_requests_until_a_chunk_returns() {
    let network = network(ConnectionLimits::default().with_send_pool_chunks(2));
    let holders: Vec<_> = (0..3).map(|_| RecordingObserver::passive()).collect();
    let mut connections = Vec::new();
    for holder in &holders {
        let (left, right) = attached_pair(&network, holder, &RecordingObserver::passive());
        connections.push((left, right));
    }

    for (left, _) in &connections {
        left.request_send_stream(8);
    }
    network.dispatcher().execute_all_actions();

    assert!(holders[0].holds_stream());
    assert!(holders[1].holds_stream());
    assert!(!holders[2].holds_stream(), "第三个请求应等待发送池");
    assert_eq!(network.pool().waiting(), 1);
    assert_eq!(network.pool().min_available(), 0);

    drop(holders[0].take_held_stream());
    network.dispatcher().execute_all_actions();

    assert!(holders[2].holds_stream(), "释放后排队请求应被满足");
    assert_eq!(network.pool().waiting(), 0);
    assert_eq!(network.pool().in_use(), 2);
}

/// 槽位归还与排队请求被满足之间插入的新请求只能排在队尾，最早的等待者先拿到槽位。
#[test]
fn released_slot_goes_to_the_oldest_waiter() {
    let network = network(ConnectionLimits::default().with_send_pool_chunks(1));
    let holder = RecordingObserver::passive();
    let oldest = RecordingObserver::passive();
    let newcomer = RecordingObserver::passive();
    let (holding, _) = attached_pair(&network, &holder, &RecordingObserver::passive());
    let (waiting, _) = attached_pair(&network, &oldest, &RecordingObserver::passive());
    let (late, _) = attached_pair(&network, &newcomer, &RecordingObserver::passive());

    holding.request_send_stream(4);
    network.dispatcher().execute_all_actions();
    waiting.request_send_stream(4);
    network.dispatcher().execute_all_actions();
    assert!(holder.holds_stream());
    assert_eq!(network.pool().waiting(), 1);

    let mut stream = holder.take_held_stream().expect("持有发送流");
    stream.insert(b"data").expect("容量足够");
    drop(stream);
    while network.pool().waiting() > 0 {
        assert!(network.dispatcher().execute_first_action(), "槽位应在冲刷后归还");
    }
    assert_eq!(network.pool().in_use(), 1, "归还的槽位直接转交，不回到空闲计数");

    late.request_send_stream(4);
    network.dispatcher().execute_all_actions();
    assert!(oldest.holds_stream(), "最早的等待者必须拿到槽位");
    assert!(!newcomer.holds_stream());
    assert_eq!(network.pool().waiting(), 1);

    drop(oldest.take_held_stream());
    network.dispatcher().execute_all_actions();
    assert!(newcomer.holds_stream(), "后来者在下一次归还时得到槽位");
}

/// 中止时未交付的请求被撤销，之后释放的槽位不会交付给已拆除连接。
#[test]
fn abort_cancels_pending_request() {
    let network = network(ConnectionLimits::default().with_send_pool_chunks(1));
    let holder = RecordingObserver::passive();
    let waiter = RecordingObserver::passive();
    let waiter_peer = RecordingObserver::passive();
    let (holding, _) = attached_pair(&network, &holder, &RecordingObserver::passive());
    let (waiting, _) = attached_pair(&network, &waiter, &waiter_peer);

    holding.request_send_stream(4);
    waiting.request_send_stream(4);
    network.dispatcher().execute_all_actions();
    assert_eq!(network.pool().waiting(), 1);

    waiting.abort_and_destroy();
    drop(holder.take_held_stream());
    network.dispatcher().execute_all_actions();

    assert_eq!(waiter.count(ObserverEvent::SendStreamAvailable { size: 4 }), 0);
    assert_eq!(network.pool().waiting(), 0);
    assert_eq!(network.pool().in_use(), 0);
    assert_eq!(waiter.closing_reason(), None, "观察者自己中止不应收到关闭原因");
    assert!(waiter.is_detached());
    assert_eq!(waiter_peer.closing_reason(), Some(DisconnectReason::PeerReset));
    assert!(waiter_peer.is_detached());
}

/// 接收窗口填满后发送端保留剩余字节，确认后继续投递。
#[test]
fn receive_window_applies_backpressure() {
    let network = network(ConnectionLimits::default().with_receive_buffer_capacity(4));
    let client = RecordingObserver::new();
    let server = RecordingObserver::passive();
    let (left, right) = attached_pair(&network, &client, &server);

    client.send(b"hello world");
    network.dispatcher().execute_all_actions();
    assert_eq!(left.pending_outgoing(), 7);

    let mut reader = right.receive_stream();
    assert_eq!(reader.extract_contiguous(usize::MAX), b"hell");
    drop(reader);
    right.ack_received();
    network.dispatcher().execute_all_actions();

    let reader = right.receive_stream();
    assert_eq!(reader.remaining(), b"o wo");
    assert_eq!(left.pending_outgoing(), 3);
}

/// 多次到达的数据在观察者处理前合并为一次通知。
#[test]
fn data_notifications_coalesce_until_delivered() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::new();
    let server = RecordingObserver::passive();
    let (_left, right) = attached_pair(&network, &client, &server);

    client.send(b"one");
    client.send(b"two");
    network.dispatcher().execute_all_actions();

    let reader = right.receive_stream();
    assert_eq!(reader.remaining(), b"onetwo");
    assert!(server.count(ObserverEvent::DataReceived) <= 2);
    assert!(server.count(ObserverEvent::DataReceived) >= 1);
}

/// 优雅关闭先冲刷待发数据，对端随后收到 `PeerClosed`。
#[test]
fn graceful_close_flushes_then_reports_peer_closed() {
    let network = network(ConnectionLimits::default().with_receive_buffer_capacity(4));
    let client = RecordingObserver::new();
    let server = RecordingObserver::new();
    let (left, _right) = attached_pair(&network, &client, &server);

    client.send(b"goodbye!");
    network.dispatcher().execute_all_actions();
    left.close_and_destroy();
    assert_eq!(left.link_state(), LinkState::Closing);
    network.dispatcher().execute_all_actions();

    assert_eq!(server.received(), b"goodbye!");
    assert_eq!(server.closing_reason(), Some(DisconnectReason::PeerClosed));
    assert!(server.is_detached());
    assert_eq!(client.closing_reason(), None);
    assert!(client.is_detached());
    assert_eq!(left.link_state(), LinkState::Detached);
    assert_eq!(network.live_connections(), 0);
}

/// 中止立即拆除，对端收到 `PeerReset`；重复中止为无操作。
#[test]
fn abort_reports_peer_reset_and_is_idempotent() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::new();
    let server = RecordingObserver::new();
    let (left, _right) = attached_pair(&network, &client, &server);

    left.abort_and_destroy();
    left.abort_and_destroy();
    network.dispatcher().execute_all_actions();

    assert_eq!(client.count(ObserverEvent::Detached), 1);
    assert_eq!(server.closing_reason(), Some(DisconnectReason::PeerReset));
    assert_eq!(server.count(ObserverEvent::Detached), 1);
    assert_eq!(network.live_connections(), 0);
}

/// 拆除后的连接不再交付任何回调，请求被静默忽略。
#[test]
fn requests_after_teardown_are_ignored() {
    let network = network(ConnectionLimits::default());
    let client = RecordingObserver::passive();
    let server = RecordingObserver::passive();
    let (left, _right) = attached_pair(&network, &client, &server);

    left.abort_and_destroy();
    network.dispatcher().execute_all_actions();
    let before = client.events().len();

    left.request_send_stream(4);
    assert!(left.receive_stream().is_empty());
    network.dispatcher().execute_all_actions();
    assert_eq!(client.events().len(), before);
}

#[test]
#[should_panic(expected = "already has an observer attached")]
fn attaching_twice_panics() {
    let network = network(ConnectionLimits::default());
    let (left, _right) = network.pair().expect("注册表应有空位");
    left.attach(RecordingObserver::new());
    left.attach(RecordingObserver::new());
}

/// 监听器经工厂挂接服务端观察者，客户端工厂收到建立通知后双向通信。
#[test]
fn listen_and_connect_through_factories() {
    let network = network(ConnectionLimits::default());
    let server_factory = RecordingServerFactory::new();
    let _listener = network.listen(7000, server_factory.clone()).expect("端口空闲");
    let client = RecordingObserver::new();
    let client_factory = RecordingClientFactory::new(localhost(7000), client.clone());

    network.connect(client_factory.clone());
    network.dispatcher().execute_all_actions();

    assert_eq!(client_factory.outcome(), Some(Ok(())));
    assert_eq!(server_factory.accepted(), 1);
    assert!(client.is_connected());

    client.send(b"ping");
    network.dispatcher().execute_all_actions();
    let observers = server_factory.observers();
    assert_eq!(observers[0].received(), b"ping");

    observers[0].send(b"pong");
    network.dispatcher().execute_all_actions();
    assert_eq!(client.received(), b"pong");
}

#[test]
fn duplicate_listener_is_rejected() {
    let network = network(ConnectionLimits::default());
    let _first = network.listen(7001, RecordingServerFactory::new()).expect("端口空闲");
    let err = network
        .listen(7001, RecordingServerFactory::new())
        .expect_err("重复监听应失败");
    assert_eq!(err.code(), codes::LISTENER_EXISTS);
}

/// 监听句柄释放后端口空出，新的连接被拒绝。
#[test]
fn connect_without_listener_is_refused() {
    let network = network(ConnectionLimits::default());
    let listener = network.listen(7002, RecordingServerFactory::new()).expect("端口空闲");
    drop(listener);

    let client_factory = RecordingClientFactory::new(localhost(7002), RecordingObserver::new());
    network.connect(client_factory.clone());
    network.dispatcher().execute_all_actions();

    assert_eq!(client_factory.outcome(), Some(Err(ConnectFailReason::Refused)));
    assert_eq!(ConnectFailReason::Refused.code(), codes::CONNECT_REFUSED);
    assert_eq!(network.live_connections(), 0);
}

/// 服务端工厂拒绝后客户端连接被拆除，客户端观察者收到 `Declined`。
#[test]
fn declined_connection_tears_down_client() {
    let network = network(ConnectionLimits::default());
    let _listener = network.listen(7003, RecordingServerFactory::declining()).expect("端口空闲");
    let client = RecordingObserver::new();
    let client_factory = RecordingClientFactory::new(localhost(7003), client.clone());

    network.connect(client_factory.clone());
    network.dispatcher().execute_all_actions();

    assert_eq!(client_factory.outcome(), Some(Ok(())));
    assert_eq!(client.closing_reason(), Some(DisconnectReason::Declined));
    assert_eq!(DisconnectReason::Declined.code(), codes::FACTORY_DECLINED);
    assert!(client.is_detached());
    assert!(!client.is_connected());
    assert_eq!(network.live_connections(), 0);
}

/// 注册表满时成对分配失败，客户端工厂收到 `AllocationFailed`。
#[test]
fn full_registry_fails_connect() {
    let network = network(ConnectionLimits::default().with_max_connections(2));
    let _listener = network.listen(7004, RecordingServerFactory::new()).expect("端口空闲");
    let _pair = network.pair().expect("首对连接可以分配");

    let client_factory = RecordingClientFactory::new(localhost(7004), RecordingObserver::new());
    network.connect(client_factory.clone());
    network.dispatcher().execute_all_actions();

    assert_eq!(
        client_factory.outcome(),
        Some(Err(ConnectFailReason::AllocationFailed))
    );
}
