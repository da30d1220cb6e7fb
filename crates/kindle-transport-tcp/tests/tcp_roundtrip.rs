//! 真实回环套接字上的端到端测试。
//!
//! # 教案级导览
//!
//! - **Why**：回环替身验证了契约时序，但边沿触发、短写续传、`SO_LINGER=0` 与
//!   非阻塞 `connect` 的结果判定只有在真实套接字上才能覆盖；
//! - **How**：每个用例构造独立的 [`TcpEventLoop`]，监听 `127.0.0.1:0`，
//!   使用 `kindle_core::test_stubs` 的记录型观察者，并以带截止时间的 `run_while` 推进；
//! - **What**：覆盖双向收发、发送池与接收窗口背压下的大块传输、优雅关闭（含未读入站数据）、
//!   中止触发的对端重置与排队请求的撤销、单一未完成请求、至少一次读取、
//!   连接被拒、撤销连接与监听句柄释放。

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kindle_core::config::ConnectionLimits;
use kindle_core::connection::ConnectionObserver;
use kindle_core::error::DisconnectReason;
use kindle_core::factory::ConnectFailReason;
use kindle_core::test_stubs::{
    ObserverEvent, RecordingClientFactory, RecordingObserver, RecordingServerFactory,
};
use kindle_transport_tcp::{TcpConfig, TcpEventLoop, TcpListenerHandle};

const DEADLINE: Duration = Duration::from_secs(10);

fn event_loop(limits: ConnectionLimits) -> anyhow::Result<TcpEventLoop> {
    let config = TcpConfig::new()
        .with_limits(limits)
        .with_poll_timeout(Some(Duration::from_millis(10)));
    Ok(TcpEventLoop::new(config)?)
}

/// 推进事件循环直到条件成立或超时，返回条件是否成立。
fn drive(event_loop: &mut TcpEventLoop, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    event_loop.run_while(|| !done() && Instant::now() < deadline);
    done()
}

fn listen(
    event_loop: &TcpEventLoop,
    factory: Arc<RecordingServerFactory>,
) -> anyhow::Result<TcpListenerHandle> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    Ok(event_loop.network().listen(address, factory)?)
}

/// 建立一条连接，返回客户端观察者与服务端工厂。
fn connected_pair(
    event_loop: &mut TcpEventLoop,
    client: Arc<RecordingObserver>,
) -> anyhow::Result<(Arc<RecordingServerFactory>, TcpListenerHandle)> {
    let server = RecordingServerFactory::new();
    let listener = listen(event_loop, server.clone())?;
    let factory = RecordingClientFactory::new(listener.local_addr(), client.clone());
    event_loop.network().connect(factory.clone());
    let established = drive(event_loop, || {
        client.is_connected() && server.observers().iter().any(|observer| observer.is_connected())
    });
    anyhow::ensure!(established, "连接应在截止时间内建立");
    Ok((server, listener))
}

#[test]
fn bytes_flow_both_ways() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let client = RecordingObserver::new();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);

    client.send(b"hello over tcp");
    assert!(drive(&mut event_loop, || accepted.received() == b"hello over tcp"));

    accepted.send(b"and back again");
    assert!(drive(&mut event_loop, || client.received() == b"and back again"));

    let subject = client.subject().expect("客户端仍处于挂接状态");
    assert_eq!(subject.peer_address(), accepted.subject().and_then(|s| s.local_address()));
    Ok(())
}

/// 发送池只有 2 块、接收窗口只有 512 字节时，大批数据仍按序完整到达。
#[test]
fn bulk_transfer_survives_pool_and_window_backpressure() -> anyhow::Result<()> {
    let limits = ConnectionLimits::default()
        .with_send_pool_chunks(2)
        .with_receive_buffer_capacity(512);
    let mut event_loop = event_loop(limits)?;
    let client = RecordingObserver::new();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);

    let mut expected = Vec::new();
    for round in 0..64u32 {
        let chunk: Vec<u8> = (0..1000u32).map(|i| ((round * 31 + i) % 251) as u8).collect();
        expected.extend_from_slice(&chunk);
        client.send(&chunk);
    }

    assert!(drive(&mut event_loop, || accepted.received().len() == expected.len()));
    assert_eq!(accepted.received(), expected);
    assert_eq!(event_loop.network().pool().in_use(), 0, "所有块写出后应归还发送池");
    Ok(())
}

/// 客户端优雅关闭后服务端观察到 `PeerClosed`，双方都从注册表移除。
#[test]
fn graceful_close_reports_peer_closed() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let client = RecordingObserver::new();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);

    client.send(b"last words");
    assert!(drive(&mut event_loop, || accepted.received() == b"last words"));
    client.close();
    assert!(drive(&mut event_loop, || accepted.is_detached()));

    assert_eq!(accepted.closing_reason(), Some(DisconnectReason::PeerClosed));
    assert!(client.is_detached());
    assert_eq!(client.closing_reason(), None, "主动关闭的一方只收到 detached");
    assert_eq!(event_loop.network().live_connections(), 0);
    Ok(())
}

/// 关闭方仍有未读的入站字节时，对端看到的依然是有序关闭而不是重置。
#[test]
fn graceful_close_with_unread_input_reports_peer_closed() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default().with_receive_buffer_capacity(256))?;
    let client = RecordingObserver::passive();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);
    let network = event_loop.network().clone();

    for _ in 0..4 {
        accepted.send(&[0x5a; 1000]);
    }
    // 服务端的块全部写入内核后，客户端缓冲已满，其余字节滞留在客户端内核中。
    assert!(drive(&mut event_loop, || {
        accepted.count(ObserverEvent::SendStreamAvailable { size: 1000 }) == 4
            && network.pool().in_use() == 0
            && client.count(ObserverEvent::DataReceived) > 0
    }));
    for _ in 0..5 {
        event_loop.turn();
    }

    client.close();
    assert!(drive(&mut event_loop, || accepted.is_detached()));
    assert_eq!(accepted.closing_reason(), Some(DisconnectReason::PeerClosed));
    assert!(drive(&mut event_loop, || network.live_connections() == 0));
    Ok(())
}

/// 中止发送 RST，服务端观察到 `PeerReset`。
#[test]
fn abort_resets_the_peer() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let client = RecordingObserver::new();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);

    client.abort();
    assert!(drive(&mut event_loop, || accepted.is_detached()));
    assert_eq!(accepted.closing_reason(), Some(DisconnectReason::PeerReset));
    assert_eq!(event_loop.network().live_connections(), 0);
    Ok(())
}

/// 发送池耗尽时排队的请求随中止撤销，之后归还的槽位不会交给已拆除的连接。
#[test]
fn abort_cancels_a_queued_send_request() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default().with_send_pool_chunks(1))?;
    let holder = RecordingObserver::passive();
    let (_holder_server, _holder_listener) = connected_pair(&mut event_loop, holder.clone())?;
    let client = RecordingObserver::passive();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);
    let network = event_loop.network().clone();

    holder.subject().expect("持有者仍处于挂接状态").request_send_stream(4);
    assert!(drive(&mut event_loop, || holder.holds_stream()));
    client.subject().expect("客户端仍处于挂接状态").request_send_stream(4);
    assert_eq!(network.pool().waiting(), 1);

    client.abort();
    assert_eq!(network.pool().waiting(), 0, "中止撤销排队中的请求");
    drop(holder.take_held_stream());
    assert!(drive(&mut event_loop, || accepted.is_detached()));

    assert_eq!(accepted.closing_reason(), Some(DisconnectReason::PeerReset));
    assert_eq!(client.count(ObserverEvent::SendStreamAvailable { size: 4 }), 0);
    assert!(client.is_detached());
    assert_eq!(network.pool().in_use(), 0);
    Ok(())
}

/// 存在未交付请求时再次请求是契约违背。
#[test]
#[should_panic(expected = "previous request is outstanding")]
fn second_outstanding_request_panics() {
    let mut event_loop = event_loop(ConnectionLimits::default()).expect("事件循环可创建");
    let client = RecordingObserver::passive();
    let (_server, _listener) = connected_pair(&mut event_loop, client.clone()).expect("连接应建立");
    let subject = client.subject().expect("客户端仍处于挂接状态");
    subject.request_send_stream(4);
    subject.request_send_stream(4);
}

/// 确认前重新拉取的读者看到相同字节；确认只释放读过的前缀。
#[test]
fn unacknowledged_bytes_are_read_again() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let client = RecordingObserver::passive();
    let (server, _listener) = connected_pair(&mut event_loop, client.clone())?;
    let accepted = server.observers().remove(0);
    let subject = client.subject().expect("客户端仍处于挂接状态");

    accepted.send(b"at least once");
    assert!(drive(&mut event_loop, || subject.receive_stream().available() == 13));

    let mut first = subject.receive_stream();
    let seen = first.extract_contiguous(usize::MAX).to_vec();
    drop(first);

    let mut second = subject.receive_stream();
    assert_eq!(second.remaining(), seen.as_slice(), "未确认的读者必须看到相同字节");
    let mut prefix = [0u8; 3];
    second.extract(&mut prefix)?;
    assert_eq!(&prefix, b"at ");
    drop(second);
    subject.ack_received();

    assert_eq!(subject.receive_stream().remaining(), b"least once");
    Ok(())
}

/// 没有监听者的端口返回 `Refused`。
#[test]
fn connect_to_closed_port_is_refused() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let vacant = StdListener::bind((Ipv4Addr::LOCALHOST, 0))?.local_addr()?;

    let factory = RecordingClientFactory::new(vacant, RecordingObserver::new());
    event_loop.network().connect(factory.clone());
    assert!(drive(&mut event_loop, || factory.outcome().is_some()));
    assert_eq!(factory.outcome(), Some(Err(ConnectFailReason::Refused)));
    assert_eq!(event_loop.network().pending_connects(), 0);
    Ok(())
}

/// 撤销后的连接器不再回调工厂。
#[test]
fn cancelled_connect_never_reports() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let server = RecordingServerFactory::new();
    let listener = listen(&event_loop, server)?;

    let factory = RecordingClientFactory::new(listener.local_addr(), RecordingObserver::new());
    let connector = event_loop
        .network()
        .connect(factory.clone())
        .expect("本地连接应进入进行中状态");
    assert!(event_loop.network().cancel_connect(connector));
    assert!(!event_loop.network().cancel_connect(connector), "重复撤销应返回 false");

    for _ in 0..10 {
        event_loop.turn();
    }
    assert_eq!(factory.outcome(), None);
    assert_eq!(event_loop.network().pending_connects(), 0);
    Ok(())
}

/// 服务端拒绝后客户端要么观察到断开，要么在建立前就收到失败。
#[test]
fn declined_connection_is_torn_down() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let listener = listen(&event_loop, RecordingServerFactory::declining())?;
    let client = RecordingObserver::new();
    let factory = RecordingClientFactory::new(listener.local_addr(), client.clone());

    event_loop.network().connect(factory.clone());
    assert!(drive(&mut event_loop, || {
        client.is_detached() || matches!(factory.outcome(), Some(Err(_)))
    }));
    if factory.outcome() == Some(Ok(())) {
        assert!(matches!(
            client.closing_reason(),
            Some(DisconnectReason::PeerReset | DisconnectReason::PeerClosed)
        ));
    }
    let network = event_loop.network().clone();
    assert!(drive(&mut event_loop, || network.live_connections() == 0));
    Ok(())
}

/// 释放监听句柄后端口不再接受连接。
#[test]
fn dropping_the_listener_stops_accepting() -> anyhow::Result<()> {
    let mut event_loop = event_loop(ConnectionLimits::default())?;
    let listener = listen(&event_loop, RecordingServerFactory::new())?;
    let address = listener.local_addr();
    drop(listener);

    let factory = RecordingClientFactory::new(address, RecordingObserver::new());
    event_loop.network().connect(factory.clone());
    assert!(drive(&mut event_loop, || factory.outcome().is_some()));
    assert_eq!(factory.outcome(), Some(Err(ConnectFailReason::Refused)));
    Ok(())
}

/// 辅助线程推入的动作打断阻塞中的 `poll`。
#[test]
fn foreign_thread_wakes_the_event_loop() -> anyhow::Result<()> {
    let mut event_loop = TcpEventLoop::new(TcpConfig::new().with_poll_timeout(None))?;
    let dispatcher = event_loop.dispatcher().clone();
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let remote = {
        let flag = Arc::clone(&flag);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            dispatcher.schedule(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
        })
    };
    event_loop.run_while(|| !flag.load(std::sync::atomic::Ordering::SeqCst));
    remote.join().expect("辅助线程不应 panic");
    assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    Ok(())
}
