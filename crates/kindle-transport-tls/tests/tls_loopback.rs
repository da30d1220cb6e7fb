//! 回环连接对上的 TLS 装饰器行为。
//!
//! # 教案级导览
//!
//! - **Why**：握手时序、会话复用与失败路径都与底层传输无关，回环替身让每一步都可以在单线程内确定性地推进；
//! - **How**：`rcgen` 现场签发自签名证书，`rustls` 使用 `ring` 提供者；每个用例排空调度器后断言观察者事件；
//! - **What**：覆盖握手前不交付明文、双向数据、证书不受信任、会话复用与失效、`close_notify`、
//!   明文窗口背压、服务端配置热更新与工厂包装。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kindle_core::config::{ConnectionLimits, DispatcherConfig};
use kindle_core::connection::Connection;
use kindle_core::dispatcher::EventDispatcher;
use kindle_core::error::{DisconnectReason, codes};
use kindle_core::loopback::LoopbackNetwork;
use kindle_core::test_stubs::{
    ObserverEvent, RecordingClientFactory, RecordingObserver, RecordingServerFactory,
};
use kindle_transport_tls::{
    SessionKey, TlsClientContext, TlsClientFactory, TlsConfig, TlsConnection, TlsFailure,
    TlsFailureHooks, TlsPhase, TlsServerContext, TlsServerFactory,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

const HOST: &str = "kindle.test";

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 签发一张 `HOST` 的自签名证书并构造服务端配置。
fn server_config() -> anyhow::Result<(Arc<ServerConfig>, CertificateDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec![HOST.to_owned()])?;
    let certificate = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![certificate.clone()], key.into())?;
    Ok((Arc::new(config), certificate))
}

fn client_config(trusted: &[CertificateDer<'static>]) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for certificate in trusted {
        roots.add(certificate.clone())?;
    }
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Default)]
struct CountingHooks {
    init: AtomicUsize,
    read: AtomicUsize,
    write: AtomicUsize,
}

impl TlsFailureHooks for CountingHooks {
    fn tls_init_failure(&self, _peer: Option<SocketAddr>, _failure: &TlsFailure) {
        self.init.fetch_add(1, Ordering::SeqCst);
    }

    fn tls_read_failure(&self, _peer: Option<SocketAddr>, _failure: &TlsFailure) {
        self.read.fetch_add(1, Ordering::SeqCst);
    }

    fn tls_write_failure(&self, _peer: Option<SocketAddr>, _failure: &TlsFailure) {
        self.write.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    dispatcher: EventDispatcher,
    network: LoopbackNetwork,
    server: TlsServerContext,
    client: TlsClientContext,
}

impl Harness {
    fn new(tls: TlsConfig) -> anyhow::Result<Self> {
        let (server_config, certificate) = server_config()?;
        Self::with_configs(tls, server_config, client_config(&[certificate])?)
    }

    fn with_configs(
        tls: TlsConfig,
        server_config: Arc<ServerConfig>,
        client_config: Arc<ClientConfig>,
    ) -> anyhow::Result<Self> {
        let dispatcher = EventDispatcher::new(DispatcherConfig::default());
        let network = LoopbackNetwork::new(dispatcher.clone(), ConnectionLimits::default());
        Ok(Self {
            server: TlsServerContext::new(dispatcher.clone(), server_config, tls),
            client: TlsClientContext::new(dispatcher.clone(), client_config, tls),
            dispatcher,
            network,
        })
    }

    /// 在一对回环连接上挂接 TLS 层与记录型观察者，尚未推进调度器。
    fn session(
        &self,
    ) -> anyhow::Result<(Arc<TlsConnection>, Arc<RecordingObserver>, Arc<TlsConnection>, Arc<RecordingObserver>)>
    {
        let (client_raw, server_raw) = self.network.pair()?;
        let client_raw: Arc<dyn Connection> = client_raw;
        let server_raw: Arc<dyn Connection> = server_raw;
        let server_tls = self.server.wrap(&server_raw)?;
        let client_tls = self.client.wrap(&client_raw, HOST)?;

        let server_app = RecordingObserver::new();
        let client_app = RecordingObserver::new();
        server_tls.attach(server_app.clone());
        client_tls.attach(client_app.clone());
        Ok((client_tls, client_app, server_tls, server_app))
    }

    fn drive(&self) {
        self.dispatcher.execute_all_actions();
    }
}

fn first_index(events: &[ObserverEvent], wanted: impl Fn(&ObserverEvent) -> bool) -> Option<usize> {
    events.iter().position(wanted)
}

#[test]
fn plaintext_flows_only_after_the_handshake() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let (client_tls, client_app, server_tls, server_app) = harness.session()?;

    // 握手开始前就排队的明文要等到握手完成才拿到发送流。
    client_app.send(b"ping over tls");
    assert_eq!(client_app.events(), vec![ObserverEvent::Attached]);
    assert_eq!(client_tls.phase(), TlsPhase::InitialHandshake);

    harness.drive();
    assert_eq!(client_tls.phase(), TlsPhase::Established);
    assert_eq!(server_tls.phase(), TlsPhase::Established);
    assert_eq!(server_app.received(), b"ping over tls");

    let client_events = client_app.events();
    let connected = first_index(&client_events, |event| *event == ObserverEvent::Connected);
    let writer = first_index(&client_events, |event| {
        matches!(event, ObserverEvent::SendStreamAvailable { .. })
    });
    assert!(connected.is_some() && connected < writer, "发送流必须在 connected 之后交付");

    let server_events = server_app.events();
    let connected = first_index(&server_events, |event| *event == ObserverEvent::Connected);
    let data = first_index(&server_events, |event| *event == ObserverEvent::DataReceived);
    assert!(connected.is_some() && connected < data, "明文通知必须在 connected 之后");

    server_app.send(b"pong over tls");
    harness.drive();
    assert_eq!(client_app.received(), b"pong over tls");
    assert_eq!(client_tls.peer_address(), server_tls.local_address());
    Ok(())
}

#[test]
fn untrusted_certificate_fails_the_handshake() -> anyhow::Result<()> {
    let (server_config, _certificate) = server_config()?;
    let harness = Harness::with_configs(TlsConfig::default(), server_config, client_config(&[])?)?;
    let hooks = Arc::new(CountingHooks::default());
    let client = harness.client.clone().with_hooks(hooks.clone());

    let (client_raw, server_raw) = harness.network.pair()?;
    let client_raw: Arc<dyn Connection> = client_raw;
    let server_raw: Arc<dyn Connection> = server_raw;
    let server_tls = harness.server.wrap(&server_raw)?;
    let client_tls = client.wrap(&client_raw, HOST)?;
    let server_app = RecordingObserver::new();
    let client_app = RecordingObserver::new();
    server_tls.attach(server_app.clone());
    client_tls.attach(client_app.clone());
    client_app.send(b"never sent");

    harness.drive();

    assert_eq!(client_tls.phase(), TlsPhase::Failed);
    assert_eq!(hooks.init.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.read.load(Ordering::SeqCst), 0);
    assert_eq!(
        client_app.closing_reason(),
        Some(DisconnectReason::TlsFailure {
            code: codes::TLS_INIT
        })
    );
    assert!(client_app.is_detached());
    assert!(!client_app.is_connected());
    assert!(
        !client.sessions().contains(&SessionKey::for_host(HOST)),
        "握手失败后目标的会话缓存应失效"
    );

    assert!(!server_app.is_connected());
    assert!(server_app.is_detached());
    assert_eq!(server_app.received(), b"");
    assert_eq!(harness.network.live_connections(), 0);
    Ok(())
}

#[test]
fn second_connection_resumes_the_cached_session() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;

    let (first, first_app, _server, server_app) = harness.session()?;
    first_app.send(b"first");
    harness.drive();
    assert_eq!(server_app.received(), b"first");
    assert!(!first.is_resumed());
    first.close_and_destroy();
    harness.drive();

    let (second, second_app, _server, _server_app) = harness.session()?;
    harness.drive();
    assert!(second_app.is_connected());
    assert!(second.is_resumed(), "同一目标的第二次握手应复用会话票据");
    Ok(())
}

#[test]
fn invalidated_target_performs_a_full_handshake() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;

    let (first, first_app, _server, _server_app) = harness.session()?;
    harness.drive();
    assert!(first_app.is_connected());
    first.close_and_destroy();
    harness.drive();

    assert!(harness.client.sessions().invalidate(&SessionKey::for_host(HOST)));
    let (second, second_app, _server, _server_app) = harness.session()?;
    harness.drive();
    assert!(second_app.is_connected());
    assert!(!second.is_resumed());
    Ok(())
}

#[test]
fn close_notify_reaches_the_peer_as_peer_closed() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let (client_tls, client_app, server_tls, server_app) = harness.session()?;
    harness.drive();

    client_app.send(b"goodbye");
    harness.drive();
    client_tls.close_and_destroy();
    harness.drive();

    assert_eq!(server_app.received(), b"goodbye");
    assert_eq!(server_app.closing_reason(), Some(DisconnectReason::PeerClosed));
    assert!(server_app.is_detached());
    assert!(client_app.is_detached());
    assert_eq!(client_app.closing_reason(), None, "主动关闭的一方只收到 detached");
    assert_eq!(client_tls.phase(), TlsPhase::Closed);
    assert_eq!(server_tls.phase(), TlsPhase::Closed);
    assert_eq!(harness.network.live_connections(), 0);
    Ok(())
}

#[test]
fn abort_resets_the_transport_without_close_notify() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let (client_tls, client_app, _server_tls, server_app) = harness.session()?;
    harness.drive();

    client_tls.abort_and_destroy();
    client_tls.abort_and_destroy();
    harness.drive();

    assert_eq!(client_app.count(ObserverEvent::Detached), 1, "重复中止只通知一次");
    assert_eq!(server_app.closing_reason(), Some(DisconnectReason::PeerReset));
    assert_eq!(harness.network.live_connections(), 0);
    Ok(())
}

#[test]
fn small_plaintext_window_still_delivers_everything_in_order() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default().with_plaintext_receive_capacity(256))?;
    let (_client_tls, client_app, _server_tls, server_app) = harness.session()?;

    let mut expected = Vec::new();
    for round in 0..16u32 {
        let chunk: Vec<u8> = (0..1000u32).map(|i| ((round * 7 + i) % 253) as u8).collect();
        expected.extend_from_slice(&chunk);
        client_app.send(&chunk);
    }
    harness.drive();

    assert_eq!(server_app.received(), expected);
    assert_eq!(harness.network.pool().in_use(), 0);
    Ok(())
}

#[test]
fn replaced_server_config_applies_to_new_connections() -> anyhow::Result<()> {
    let (original, _old_certificate) = server_config()?;
    let (rotated, new_certificate) = server_config()?;
    let harness = Harness::with_configs(
        TlsConfig::default(),
        Arc::clone(&original),
        client_config(&[new_certificate])?,
    )?;

    let previous = harness.server.replace_config(rotated);
    assert!(Arc::ptr_eq(&previous, &original));

    let (client_tls, client_app, _server_tls, _server_app) = harness.session()?;
    harness.drive();
    assert!(client_app.is_connected(), "新连接应使用轮换后的证书");
    assert_eq!(client_tls.phase(), TlsPhase::Established);
    Ok(())
}

#[test]
fn factories_layer_tls_over_accepted_and_established_connections() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let server_factory = RecordingServerFactory::new();
    let _listener = harness.network.listen(
        443,
        TlsServerFactory::new(harness.server.clone(), server_factory.clone()),
    )?;

    let client_app = RecordingObserver::new();
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443);
    let inner = RecordingClientFactory::new(target, client_app.clone());
    harness.network.connect(TlsClientFactory::new(
        harness.client.clone(),
        HOST,
        inner.clone(),
    ));
    harness.drive();

    assert_eq!(inner.outcome(), Some(Ok(())));
    assert!(client_app.is_connected());
    let server_app = server_factory.observers().remove(0);
    assert!(server_app.is_connected());

    client_app.send(b"through the factory");
    harness.drive();
    assert_eq!(server_app.received(), b"through the factory");
    Ok(())
}

#[test]
fn declining_server_factory_resets_the_client() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let _listener = harness.network.listen(
        443,
        TlsServerFactory::new(harness.server.clone(), RecordingServerFactory::declining()),
    )?;

    let client_app = RecordingObserver::new();
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443);
    let inner = RecordingClientFactory::new(target, client_app.clone());
    harness.network.connect(TlsClientFactory::new(harness.client.clone(), HOST, inner));
    harness.drive();

    assert!(!client_app.is_connected());
    assert_eq!(client_app.closing_reason(), Some(DisconnectReason::PeerReset));
    assert_eq!(harness.network.live_connections(), 0);
    Ok(())
}

#[test]
fn invalid_server_name_is_an_init_failure() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let hooks = Arc::new(CountingHooks::default());
    let client = harness.client.clone().with_hooks(hooks.clone());

    let failure = client.create("not a host name").expect_err("含空格的名称不合法");
    assert!(matches!(failure, TlsFailure::InvalidServerName(_)));
    assert_eq!(failure.code(), codes::TLS_INIT);
    assert_eq!(hooks.init.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
#[should_panic(expected = "exceeds the maximum")]
fn oversize_plaintext_request_panics() {
    let harness = Harness::new(TlsConfig::default().with_max_plaintext_send(64)).expect("证书签发成功");
    let (client_tls, _client_app, _server_tls, _server_app) = harness.session().expect("回环连接对可用");
    client_tls.request_send_stream(65);
}

#[test]
#[should_panic(expected = "previous request is outstanding")]
fn second_outstanding_plaintext_request_panics() {
    let harness = Harness::new(TlsConfig::default()).expect("证书签发成功");
    let (client_tls, _client_app, _server_tls, _server_app) = harness.session().expect("回环连接对可用");
    harness.drive();
    client_tls.request_send_stream(8);
    client_tls.request_send_stream(8);
}

#[test]
fn requests_after_close_are_ignored() -> anyhow::Result<()> {
    let harness = Harness::new(TlsConfig::default())?;
    let (client_tls, client_app, _server_tls, _server_app) = harness.session()?;
    harness.drive();

    client_tls.close_and_destroy();
    client_tls.request_send_stream(8);
    harness.drive();
    assert_eq!(
        client_app.count(ObserverEvent::SendStreamAvailable { size: 8 }),
        0
    );
    assert!(client_tls.receive_stream().is_empty());
    Ok(())
}
