//! End-to-end session scenarios against a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use streamcore::{
    FieldValue, RequestId, SessionConfig, SessionEngine, SessionEvent, StreamEpoch,
    StreamTransport, SubscriptionId, SubscriptionMode,
};

/// Transport that reports stream opens back to the test and records control
/// sends.
#[derive(Debug, Clone)]
struct ScriptedTransport {
    opens: mpsc::UnboundedSender<(StreamEpoch, String)>,
    controls: Arc<Mutex<Vec<(RequestId, String)>>>,
}

impl ScriptedTransport {
    fn new() -> (Self, mpsc::UnboundedReceiver<(StreamEpoch, String)>) {
        let (opens, rx) = mpsc::unbounded_channel();
        (
            Self {
                opens,
                controls: Arc::new(Mutex::new(Vec::new())),
            },
            rx,
        )
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("streamcore=debug")),
        )
        .with_test_writer()
        .try_init();
}

impl StreamTransport for ScriptedTransport {
    fn open_stream(&self, epoch: StreamEpoch, body: String) {
        let _ = self.opens.send((epoch, body));
    }
    fn send_control(&self, request_id: RequestId, body: String) {
        self.controls.lock().push((request_id, body));
    }
    fn close_stream(&self, _epoch: StreamEpoch) {}
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .context("no event within timeout")?
        .context("event channel closed")
}

async fn next_open(
    opens: &mut mpsc::UnboundedReceiver<(StreamEpoch, String)>,
) -> Result<(StreamEpoch, String)> {
    tokio::time::timeout(Duration::from_secs(2), opens.recv())
        .await
        .context("no stream open within timeout")?
        .context("transport dropped")
}

#[tokio::test]
async fn test_subscribe_update_and_forced_closure() -> Result<()> {
    init_tracing();
    let (transport, mut opens) = ScriptedTransport::new();
    let controls = Arc::clone(&transport.controls);
    let config = SessionConfig {
        adapter_set: Some("DEMO".into()),
        ..SessionConfig::default()
    };
    let (handle, mut events, _task) = SessionEngine::spawn(transport, config);

    assert_ok!(handle.connect());
    let (epoch, body) = next_open(&mut opens).await?;
    assert!(body.contains("LS_op=create_session"));

    handle.on_line(epoch, "CONOK,S1,50000,5000,*")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::Connected {
            session_id: "S1".into(),
            control_link: None,
        }
    );

    handle.subscribe(
        SubscriptionId::new(1),
        None,
        "item1",
        "f1 f2",
        SubscriptionMode::Merge,
        true,
    )?;

    handle.on_line(epoch, "SUBOK,1,2,3")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::Subscribed {
            subscription: SubscriptionId::new(1),
            items: 2,
            fields: 3,
            command_positions: None,
        }
    );

    handle.on_line(epoch, "U,1,1,alpha|beta")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::Update {
            subscription: SubscriptionId::new(1),
            item: 1,
            fields: vec![
                FieldValue::Literal("alpha".into()),
                FieldValue::Literal("beta".into()),
            ],
        }
    );

    // run-length "unchanged" compression reaches the application verbatim
    handle.on_line(epoch, "U,1,1,^2")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::Update {
            subscription: SubscriptionId::new(1),
            item: 1,
            fields: vec![FieldValue::Unchanged, FieldValue::Unchanged],
        }
    );

    handle.on_line(epoch, "END,-1,forced closure")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::ServerError {
            code: -1,
            message: "forced closure".into(),
        }
    );
    assert!(matches!(
        next_event(&mut events).await?,
        SessionEvent::Closed { cause: Some(_) }
    ));

    // the subscribe request went out exactly as encoded
    let sent = controls.lock();
    assert!(sent.iter().any(|(_, body)| body.contains("LS_op=add")));
    Ok(())
}

#[tokio::test]
async fn test_transport_loss_recovers_without_duplicates() -> Result<()> {
    init_tracing();
    let (transport, mut opens) = ScriptedTransport::new();
    let (handle, mut events, _task) =
        SessionEngine::spawn(transport, SessionConfig::default());

    handle.connect()?;
    let (epoch, _) = next_open(&mut opens).await?;
    handle.on_line(epoch, "CONOK,S1,50000,5000,*")?;
    next_event(&mut events).await?; // Connected

    handle.on_line(epoch, "SUBOK,1,1,1")?;
    handle.on_line(epoch, "U,1,1,x")?;
    next_event(&mut events).await?; // Subscribed
    next_event(&mut events).await?; // Update x

    // the stream dies; the engine opens a recovery stream on its own
    handle.on_stream_broken(epoch, "connection reset")?;
    let (recovered, body) = next_open(&mut opens).await?;
    assert!(body.contains("LS_op=recovery"));
    assert!(body.contains("LS_recovery_from=2"));

    // server replays from the beginning; only the new update comes through
    handle.on_line(recovered, "CONOK,S1,50000,5000,*")?;
    handle.on_line(recovered, "PROG,0")?;
    handle.on_line(recovered, "SUBOK,1,1,1")?;
    handle.on_line(recovered, "U,1,1,x")?;
    handle.on_line(recovered, "U,1,1,y")?;

    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::Update {
            subscription: SubscriptionId::new(1),
            item: 1,
            fields: vec![FieldValue::Literal("y".into())],
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_user_message_outcomes() -> Result<()> {
    init_tracing();
    let (transport, mut opens) = ScriptedTransport::new();
    let controls = Arc::clone(&transport.controls);
    let (handle, mut events, _task) =
        SessionEngine::spawn(transport, SessionConfig::default());

    handle.connect()?;
    let (epoch, _) = next_open(&mut opens).await?;
    handle.on_line(epoch, "CONOK,S1,50000,5000,*")?;
    next_event(&mut events).await?; // Connected

    handle.send_message("orders", 1, "buy", true)?;
    handle.on_line(epoch, "MSGDONE,orders,1")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::MessageOk {
            sequence: "orders".into(),
            prog: 1,
        }
    );

    handle.send_message("orders", 2, "sell", true)?;
    handle.on_line(epoch, "MSGFAIL,orders,2,-3,insufficient funds")?;
    assert_eq!(
        next_event(&mut events).await?,
        SessionEvent::MessageDenied {
            sequence: "orders".into(),
            prog: 2,
            code: -3,
            message: "insufficient funds".into(),
        }
    );

    // give the engine a beat to flush control sends
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = controls.lock();
    assert_eq!(
        sent.iter().filter(|(_, b)| b.contains("LS_op=msg")).count(),
        2
    );
    Ok(())
}
