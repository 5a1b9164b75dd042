//! Send a delimited artifact to a local server and print what arrives.
//!
//! ```text
//! RUST_LOG=flowwire=debug cargo run --example loopback
//! ```

use std::sync::Arc;
use std::time::Duration;

use flowwire::codec::AttributeMap;
use flowwire::{FlowConfig, FlowSender, FlowServer, MemoryHost, OutboundArtifact, SessionNotification};
use tracing_subscriber::EnvFilter;

fn main() -> flowwire::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let inbound = Arc::new(MemoryHost::new());
    let mut server = FlowServer::bind(
        FlowConfig::builder()
            .host("127.0.0.1")
            .port(0)
            .endpoint_tagging(true)
            .build()?,
        inbound.clone(),
    )?;

    let outbound = Arc::new(MemoryHost::new());
    let mut sender = FlowSender::new(
        FlowConfig::builder()
            .host("127.0.0.1")
            .port(server.local_addr().port())
            .delimiter("\\n")
            .connection_per_send(false)
            .build()?,
        outbound.clone(),
    )?;

    let content = b"first line\nsecond line\nthird line\n".to_vec();
    let mut attributes = AttributeMap::new();
    attributes.insert("filename".to_string(), "lines.txt".to_string());
    let id = outbound.insert(content.clone(), attributes.clone());
    sender.send(OutboundArtifact::new(id, content, attributes))?;

    for notification in sender.recv_completed(Duration::from_secs(5)) {
        tracing::info!("Batch finished: {}", serde_json::to_string(&notification)?);
    }

    let mut received = 0;
    while received < 3 {
        let sessions = server.recv_sessions(Duration::from_secs(5));
        if sessions.is_empty() {
            break;
        }
        for session in sessions {
            if let SessionNotification::Committed { artifact, .. } = &session {
                received += 1;
                let content = inbound.committed().into_iter().find(|c| c.id == *artifact);
                tracing::info!(
                    "Received {:?}: {}",
                    content.map(|c| String::from_utf8_lossy(&c.content).into_owned()),
                    serde_json::to_string(&session)?
                );
            } else {
                tracing::warn!("Session not stored: {:?}", session);
            }
        }
    }

    sender.shutdown();
    server.shutdown();
    Ok(())
}
