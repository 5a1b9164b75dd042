//! Integration tests for flowwire.
//!
//! A `FlowSender` and a `FlowServer` talk to each other over loopback; both
//! sides share one `MemoryHost` per test unless stated otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowwire::codec::AttributeMap;
use flowwire::host::{MemoryHost, Outcome, ProvenanceEvent};
use flowwire::send::{BatchOutcome, BatchTracker, ByteRange, FAILURE_CAUSE_ATTRIBUTE};
use flowwire::{
    BatchNotification, ClientAuth, FlowConfig, FlowHost, FlowSender, FlowServer, OutboundArtifact,
    Protocol, SessionNotification, TlsContext,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn outbound(host: &MemoryHost, content: &[u8], attributes: AttributeMap) -> OutboundArtifact {
    let id = host.insert(content.to_vec(), attributes.clone());
    OutboundArtifact::new(id, content.to_vec(), attributes)
}

fn server_config(protocol: Protocol) -> flowwire::FlowConfigBuilder {
    FlowConfig::builder()
        .host("127.0.0.1")
        .port(0)
        .protocol(protocol)
        .worker_threads(1)
        .drain_timeout(Duration::from_millis(500))
}

fn sender_config(protocol: Protocol, port: u16) -> flowwire::FlowConfigBuilder {
    FlowConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .protocol(protocol)
        .worker_threads(2)
        .timeout(Duration::from_secs(5))
        .drain_timeout(Duration::from_millis(500))
}

fn collect_sessions<H: FlowHost>(server: &mut FlowServer<H>, count: usize) -> Vec<SessionNotification> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut all = Vec::new();
    while all.len() < count && Instant::now() < deadline {
        all.extend(server.recv_sessions(Duration::from_millis(100)));
    }
    all
}

fn collect_batches<H: FlowHost>(sender: &mut FlowSender<H>, count: usize) -> Vec<BatchNotification> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut all = Vec::new();
    while all.len() < count && Instant::now() < deadline {
        all.extend(sender.recv_completed(Duration::from_millis(100)));
    }
    all
}

/// A delimited artifact arrives as one artifact per token, attributes intact.
#[test]
fn test_tcp_delimited_round_trip() {
    init_tracing();
    let inbound = Arc::new(MemoryHost::new());
    let mut server =
        FlowServer::bind(server_config(Protocol::Tcp).endpoint_tagging(true).build().unwrap(), inbound.clone())
            .unwrap();

    let outbound_host = Arc::new(MemoryHost::new());
    let config = sender_config(Protocol::Tcp, server.local_addr().port())
        .delimiter("\\n")
        .build()
        .unwrap();
    let mut sender = FlowSender::new(config, outbound_host.clone()).unwrap();

    let artifact = outbound(
        &outbound_host,
        b"alpha\nbeta\n\ngamma\n",
        attrs(&[("filename", "greek.txt"), ("kind", "letters")]),
    );
    let original = artifact.id;
    sender.send(artifact).unwrap();

    let batches = collect_batches(&mut sender, 1);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].artifact, original);
    assert_eq!(batches[0].outcome, BatchOutcome::Sent { messages: 3 });

    let sessions = collect_sessions(&mut server, 3);
    assert_eq!(sessions.len(), 3);
    assert!(sessions.iter().all(SessionNotification::is_committed));

    let mut contents: Vec<Vec<u8>> = inbound.committed().iter().map(|c| c.content.to_vec()).collect();
    contents.sort();
    assert_eq!(contents, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);

    for received in inbound.committed() {
        assert_eq!(received.outcome, Outcome::Success);
        assert_eq!(received.attributes["filename"], "greek.txt");
        assert_eq!(received.attributes["kind"], "letters");
        assert_eq!(received.attributes["tcp.sender"], "127.0.0.1");
        assert_eq!(received.attributes["tcp.receiver_port"], server.local_addr().port().to_string());
    }

    let sent = outbound_host.committed_to(Outcome::Success);
    assert_eq!(sent[0].id, original);
    assert!(matches!(
        &outbound_host.provenance()[..],
        [ProvenanceEvent::Send { details, .. }] if details == "Sent 3 messages"
    ));
    assert_eq!(
        inbound
            .provenance()
            .iter()
            .filter(|e| matches!(e, ProvenanceEvent::Receive { transit_uri, .. } if transit_uri.starts_with("tcp://127.0.0.1:")))
            .count(),
        3
    );
}

/// Header `{"a":"1"}` plus payload `hello`; endpoint attributes only when tagging.
#[test]
fn test_single_message_without_tagging() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(server_config(Protocol::Tcp).build().unwrap(), host.clone()).unwrap();
    let mut sender = FlowSender::new(
        sender_config(Protocol::Tcp, server.local_addr().port()).build().unwrap(),
        host.clone(),
    )
    .unwrap();

    sender.send(outbound(&host, b"hello", attrs(&[("a", "1")]))).unwrap();
    collect_batches(&mut sender, 1);

    let sessions = collect_sessions(&mut server, 1);
    let SessionNotification::Committed { artifact, attributes, size, .. } = &sessions[0] else {
        panic!("expected a committed session, got {:?}", sessions[0]);
    };
    assert_eq!(*size, 5);
    assert_eq!(attributes, &attrs(&[("a", "1")]));

    let received = host.committed().into_iter().find(|c| c.id == *artifact).unwrap();
    assert_eq!(&received.content[..], b"hello");
}

/// Pooled connections are reused across artifacts and pruned once idle.
#[test]
fn test_pooled_connection_reuse_and_idle_pruning() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(server_config(Protocol::Tcp).build().unwrap(), host.clone()).unwrap();
    let config = sender_config(Protocol::Tcp, server.local_addr().port())
        .connection_per_send(false)
        .idle_expiration(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut sender = FlowSender::new(config, host.clone()).unwrap();

    sender.send(outbound(&host, b"first", AttributeMap::new())).unwrap();
    assert_eq!(collect_batches(&mut sender, 1).len(), 1);
    sender.send(outbound(&host, b"second", AttributeMap::new())).unwrap();
    assert_eq!(collect_batches(&mut sender, 1).len(), 1);

    assert_eq!(collect_sessions(&mut server, 2).len(), 2);
    assert_eq!(sender.pool().open_connections(), 1);
    assert_eq!(server.open_connections(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while sender.pool().open_connections() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(sender.pool().open_connections(), 0);
    assert_eq!(sender.prune_idle().closed, 0);
}

#[test]
fn test_udp_round_trip() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(
        server_config(Protocol::Udp).endpoint_tagging(true).build().unwrap(),
        host.clone(),
    )
    .unwrap();
    let config = sender_config(Protocol::Udp, server.local_addr().port())
        .delimiter("|")
        .build()
        .unwrap();
    let mut sender = FlowSender::new(config, host.clone()).unwrap();

    sender
        .send(outbound(&host, b"left|right", attrs(&[("filename", "pair")])))
        .unwrap();
    assert_eq!(collect_batches(&mut sender, 1)[0].outcome, BatchOutcome::Sent { messages: 2 });

    let sessions = collect_sessions(&mut server, 2);
    assert_eq!(sessions.len(), 2);
    for session in &sessions {
        let SessionNotification::Committed { attributes, transit_uri, .. } = session else {
            panic!("expected a committed session, got {:?}", session);
        };
        assert_eq!(attributes["filename"], "pair");
        assert_eq!(attributes["udp.receiver"], "127.0.0.1");
        assert!(transit_uri.starts_with("udp://127.0.0.1:"));
    }
}

/// Shutting down with a send in flight rolls the artifact back.
#[test]
fn test_shutdown_rolls_back_in_flight_send() {
    init_tracing();
    // Accepts (via the backlog) but never reads, so a large write stalls.
    let stalled = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let host = Arc::new(MemoryHost::new());
    let config = sender_config(Protocol::Tcp, stalled.local_addr().unwrap().port())
        .timeout(Duration::from_secs(30))
        .max_socket_buffer_size(64 * 1024)
        .build()
        .unwrap();
    let mut sender = FlowSender::new(config, host.clone()).unwrap();

    let artifact = outbound(&host, &vec![0u8; 32 * 1024 * 1024], AttributeMap::new());
    let id = artifact.id;
    let batch = sender.send(artifact).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sender.active_batches(), vec![batch]);

    sender.shutdown();

    assert_eq!(host.rolled_back(), vec![id]);
    assert!(host.committed().is_empty());
    assert!(sender.active_batches().is_empty());
}

#[test]
fn test_cancel_rolls_back() {
    init_tracing();
    let stalled = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let host = Arc::new(MemoryHost::new());
    let config = sender_config(Protocol::Tcp, stalled.local_addr().unwrap().port())
        .timeout(Duration::from_secs(30))
        .max_socket_buffer_size(64 * 1024)
        .build()
        .unwrap();
    let mut sender = FlowSender::new(config, host.clone()).unwrap();

    let artifact = outbound(&host, &vec![1u8; 32 * 1024 * 1024], AttributeMap::new());
    let id = artifact.id;
    let batch = sender.send(artifact).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    assert!(sender.cancel(batch).unwrap());
    assert!(!sender.cancel(batch).unwrap());
    assert_eq!(host.rolled_back(), vec![id]);
    assert!(sender.poll_completed().is_empty());
}

// Reconciliation scenarios driven directly through the tracker.

#[test]
fn test_scenario_two_of_three_sent() {
    let host = MemoryHost::new();
    let mut tracker = BatchTracker::new();
    let original = host.insert((0u8..30).collect::<Vec<_>>(), attrs(&[("filename", "f")]));
    let batch = tracker.begin_batch(original, "tcp://peer:9000");

    batch.set_message_count(3);
    batch.record_success(ByteRange::new(0, 10));
    batch.record_success(ByteRange::new(10, 20));
    batch.record_failure(ByteRange::new(20, 30), "timed out");

    tracker.try_next_completed().unwrap().finalize(&host).unwrap();

    let success = host.committed_to(Outcome::Success);
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].content.to_vec(), (0u8..20).collect::<Vec<_>>());

    let failure = host.committed_to(Outcome::Failure);
    assert_eq!(failure.len(), 1);
    assert_eq!(failure[0].content.to_vec(), (20u8..30).collect::<Vec<_>>());
    assert!(failure[0].penalized);
    assert_eq!(failure[0].attributes[FAILURE_CAUSE_ATTRIBUTE], "timed out");

    assert_eq!(host.removed(), vec![original]);
    assert!(matches!(
        &host.provenance()[..],
        [ProvenanceEvent::Send { details, .. }] if details == "Sent 2 messages"
    ));
}

#[test]
fn test_scenario_zero_messages() {
    let host = MemoryHost::new();
    let mut tracker = BatchTracker::new();
    let original = host.insert(Vec::new(), AttributeMap::new());
    let batch = tracker.begin_batch(original, "tcp://peer:9000");

    batch.set_message_count(0);
    let notification = tracker.try_next_completed().unwrap().finalize(&host).unwrap();

    assert_eq!(notification.outcome, BatchOutcome::Empty);
    assert_eq!(host.committed_to(Outcome::Success)[0].id, original);
    assert!(host.provenance().is_empty());
}

#[test]
fn test_scenario_all_five_fail() {
    let host = MemoryHost::new();
    let mut tracker = BatchTracker::new();
    let original = host.insert(vec![9u8; 25], AttributeMap::new());
    let batch = tracker.begin_batch(original, "tcp://peer:9000");

    batch.set_message_count(5);
    for i in 0..5u64 {
        batch.record_failure(ByteRange::new(i * 5, i * 5 + 5), format!("refused #{}", i));
    }

    let notification = tracker.try_next_completed().unwrap().finalize(&host).unwrap();

    assert!(matches!(notification.outcome, BatchOutcome::Failed { messages: 5, ref cause } if cause == "refused #4"));
    let failure = host.committed_to(Outcome::Failure);
    assert_eq!(failure.len(), 1);
    assert_eq!(failure[0].id, original);
    assert_eq!(failure[0].content.len(), 25);
    assert!(failure[0].penalized);
    assert!(host.removed().is_empty());
}

// TLS

struct Pki {
    ca: rustls::pki_types::CertificateDer<'static>,
    server: (rustls::pki_types::CertificateDer<'static>, Vec<u8>),
    client: (rustls::pki_types::CertificateDer<'static>, Vec<u8>),
}

fn pki() -> Pki {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf = |name: &str| {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![name.to_string()])
            .unwrap()
            .signed_by(&key, &ca, &ca_key)
            .unwrap();
        (cert.der().clone(), key.serialize_der())
    };

    Pki {
        server: leaf("localhost"),
        client: leaf("flow-client"),
        ca: ca.der().clone(),
    }
}

fn private_key(der: &[u8]) -> rustls::pki_types::PrivateKeyDer<'static> {
    rustls::pki_types::PrivatePkcs8KeyDer::from(der.to_vec()).into()
}

fn server_tls(pki: &Pki, client_auth: ClientAuth) -> TlsContext {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(pki.ca.clone()).unwrap();
    TlsContext::server_with_client_roots(
        vec![pki.server.0.clone()],
        private_key(&pki.server.1),
        roots,
        client_auth,
    )
    .unwrap()
}

fn client_tls(pki: &Pki, present_certificate: bool) -> TlsContext {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = rustls::RootCertStore::empty();
    roots.add(pki.ca.clone()).unwrap();

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
    let config = if present_certificate {
        builder
            .with_client_auth_cert(vec![pki.client.0.clone()], private_key(&pki.client.1))
            .unwrap()
    } else {
        builder.with_no_client_auth()
    };

    TlsContext::client(Arc::new(config), "localhost").unwrap()
}

#[test]
fn test_tls_round_trip_with_client_certificate() {
    init_tracing();
    let pki = pki();
    let host = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(
        server_config(Protocol::Tcp)
            .tls(server_tls(&pki, ClientAuth::Required))
            .build()
            .unwrap(),
        host.clone(),
    )
    .unwrap();
    let mut sender = FlowSender::new(
        sender_config(Protocol::Tcp, server.local_addr().port())
            .tls(client_tls(&pki, true))
            .build()
            .unwrap(),
        host.clone(),
    )
    .unwrap();

    sender
        .send(outbound(&host, b"secret payload", attrs(&[("filename", "s.bin")])))
        .unwrap();
    assert_eq!(collect_batches(&mut sender, 1)[0].outcome, BatchOutcome::Sent { messages: 1 });

    let sessions = collect_sessions(&mut server, 1);
    let SessionNotification::Committed { artifact, .. } = &sessions[0] else {
        panic!("expected a committed session, got {:?}", sessions[0]);
    };
    let received = host.committed().into_iter().find(|c| c.id == *artifact).unwrap();
    assert_eq!(&received.content[..], b"secret payload");
    assert_eq!(received.attributes["filename"], "s.bin");
}

#[test]
fn test_tls_required_rejects_anonymous_client() {
    init_tracing();
    let pki = pki();
    let inbound = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(
        server_config(Protocol::Tcp)
            .tls(server_tls(&pki, ClientAuth::Required))
            .build()
            .unwrap(),
        inbound.clone(),
    )
    .unwrap();

    let outbound_host = Arc::new(MemoryHost::new());
    let mut sender = FlowSender::new(
        sender_config(Protocol::Tcp, server.local_addr().port())
            .tls(client_tls(&pki, false))
            .build()
            .unwrap(),
        outbound_host.clone(),
    )
    .unwrap();

    sender
        .send(outbound(&outbound_host, b"anonymous", AttributeMap::new()))
        .unwrap();
    collect_batches(&mut sender, 1);

    std::thread::sleep(Duration::from_millis(300));
    assert!(server.poll_sessions().is_empty());
    assert!(inbound.committed().is_empty());
}

#[test]
fn test_tls_want_accepts_anonymous_client() {
    init_tracing();
    let pki = pki();
    let inbound = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(
        server_config(Protocol::Tcp)
            .tls(server_tls(&pki, ClientAuth::Want))
            .build()
            .unwrap(),
        inbound.clone(),
    )
    .unwrap();

    let outbound_host = Arc::new(MemoryHost::new());
    let mut sender = FlowSender::new(
        sender_config(Protocol::Tcp, server.local_addr().port())
            .tls(client_tls(&pki, false))
            .build()
            .unwrap(),
        outbound_host.clone(),
    )
    .unwrap();

    sender
        .send(outbound(&outbound_host, b"anonymous", AttributeMap::new()))
        .unwrap();
    assert_eq!(collect_batches(&mut sender, 1)[0].outcome, BatchOutcome::Sent { messages: 1 });

    collect_sessions(&mut server, 1);
    assert_eq!(&inbound.committed()[0].content[..], b"anonymous");
}

#[test]
fn test_bind_failure_reports_address() {
    let host = Arc::new(MemoryHost::new());
    let config = FlowConfig::builder()
        .host("203.0.113.1")
        .port(1)
        .worker_threads(1)
        .build()
        .unwrap();

    match FlowServer::bind(config, host) {
        Err(flowwire::FlowError::Bind { address, .. }) => assert_eq!(address, "203.0.113.1:1"),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("bound an address this host does not own"),
    }
}
