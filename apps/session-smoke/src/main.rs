mod config;
mod logging;

use std::{env, sync::Arc, time::Duration};

use config::GatewayConfig;
use session_core::{DisconnectCause, DisconnectReason, SessionEvent, recv_event};
use session_runtime::{LoopbackTransport, SessionManager};
use session_store::FileCredentialStore;
use tokio::time::timeout;
use tracing::{Instrument, error, info, warn};

const DEFAULT_SMOKE_RECIPIENT: &str = "987654321";
const EVENT_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    let recipient = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SMOKE_RECIPIENT.to_owned());
    info!(
        session_id = %config.session_id,
        auth_dir = %config.auth_dir.display(),
        "starting walink-smoke"
    );

    let span = logging::session_span(&config.session_id);
    if let Err(err) = run(&config, &recipient).instrument(span).await {
        error!(error = %err, "smoke run failed");
        std::process::exit(1);
    }
}

async fn run(config: &GatewayConfig, recipient: &str) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Arc::new(LoopbackTransport::new().with_echo_replies());
    let store = Arc::new(FileCredentialStore::new(config.auth_dir.clone()));
    let manager = SessionManager::spawn(config.manager_config(), transport.clone(), store);
    let mut events = manager.subscribe();

    let diagnostics = manager.diagnose_session();
    info!(
        location = %diagnostics.location,
        has_credentials = diagnostics.has_credentials,
        registered = diagnostics.registered,
        "local session state before connect"
    );

    manager.connect().await?;
    wait_until_connected(&mut events, config.print_qr).await?;

    let outcome = manager.send_message(recipient, "walink smoke ping").await?;
    info!(?outcome, "send finished");
    let inbound = timeout(EVENT_WAIT, async {
        while let Some(event) = recv_event(&mut events).await {
            if let SessionEvent::Message(envelope) = event {
                return Some(envelope);
            }
        }
        None
    })
    .await;
    if let Ok(Some(envelope)) = inbound {
        info!(from = %envelope.remote, body = %envelope.body, "inbound message");
    }

    // Exercise the automatic reconnect path once.
    transport.simulate_close(Some(DisconnectCause::new(
        DisconnectReason::ConnectionLost,
        "simulated network drop",
    )));
    wait_until_connected(&mut events, config.print_qr).await?;

    let status = manager.status().await;
    println!("status: {}", status_line(&status));

    let pairing = manager.request_pairing_code("51987654321").await;
    match pairing {
        Ok(code) => println!("pairing code: {code}"),
        Err(err) => warn!(error = %err, "pairing code request failed"),
    }

    manager.disconnect().await?;
    let diagnostics = manager.diagnose_session();
    println!(
        "session stored at {} (registered: {}, version: {:?})",
        diagnostics.location, diagnostics.registered, diagnostics.credentials_version
    );
    Ok(())
}

async fn wait_until_connected(
    events: &mut session_core::EventStream,
    print_qr: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let wait = async {
        while let Some(event) = recv_event(events).await {
            match event {
                SessionEvent::Connected => return Ok(()),
                SessionEvent::Qr { artifact } => {
                    if print_qr {
                        println!("scan to pair: {artifact}");
                    }
                }
                SessionEvent::Disconnected { policy, cause } => {
                    return Err(format!("session ended ({policy:?}): {cause:?}").into());
                }
                SessionEvent::StateChanged { state } => info!(?state, "lifecycle state"),
                SessionEvent::Message(_) => {}
            }
        }
        Err::<(), Box<dyn std::error::Error>>("event stream closed".into())
    };
    timeout(EVENT_WAIT, wait)
        .await
        .map_err(|_| "timed out waiting for connection")?
}

fn status_line(status: &session_core::ConnectionStatus) -> String {
    format!(
        "connected={} state={:?} attempts={}/{} pending={} retained={}",
        status.connected,
        status.state,
        status.reconnect_attempts,
        status.max_reconnect_attempts,
        status.reconnect_pending,
        status.retained_messages
    )
}
