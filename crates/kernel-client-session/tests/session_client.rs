//! Session client behaviour against a scripted in-process kernel.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use kernel_client_core::{
    ChannelConnector, DisplayOrigin, KernelChannel, OutputItem, SessionError, SessionOptions,
    SessionStatus, StreamName, Subscription, Timeouts, TransportError,
};
use kernel_client_session::SessionClient;
use kernel_client_transport::{MemoryKernel, Step};

const WAIT: Duration = Duration::from_secs(5);
const PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

fn scripted() -> MemoryKernel {
    MemoryKernel::new()
        .script("print('x')", [Step::stdout("x\n")])
        .script(
            "1/0",
            [Step::error(
                "ZeroDivisionError",
                "division by zero",
                &[
                    "\u{1b}[0;31m---------------------------------------------------------------------------\u{1b}[0m",
                    "\u{1b}[0;31mZeroDivisionError\u{1b}[0m: division by zero",
                ],
            )],
        )
        .script("show()", [Step::display_png(PNG)])
        .script("2 + 3", [Step::execute_result("5")])
        .script(
            "sleep()",
            [Step::stdout("started\n"), Step::Pause, Step::stdout("done\n")],
        )
}

fn client_with(kernel: &MemoryKernel, options: SessionOptions) -> SessionClient {
    let (api, connector) = kernel.transports();
    SessionClient::with_transport(api, connector, options)
}

fn client(kernel: &MemoryKernel) -> SessionClient {
    client_with(kernel, SessionOptions::default())
}

fn collect(client: &SessionClient) -> (Arc<Mutex<Vec<OutputItem>>>, Subscription) {
    let items = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&items);
    let sub = client.on_output_item(move |item| sink.lock().unwrap().push(item.clone()));
    (items, sub)
}

async fn run(client: &SessionClient, code: &str) -> kernel_client_session::ExecutionOutcome {
    let pending = client.run_code(code).unwrap();
    tokio::time::timeout(WAIT, pending.finished())
        .await
        .expect("execution did not finish")
        .unwrap()
}

/// Opens channels whose writer has already gone away.
struct ClosedWriter;

#[async_trait]
impl ChannelConnector for ClosedWriter {
    async fn open(
        &self,
        _kernel_id: &str,
        _session_id: &str,
    ) -> Result<KernelChannel, TransportError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        Ok(KernelChannel::new(tx, futures::stream::pending()))
    }
}

async fn ready(kernel: &MemoryKernel) -> SessionClient {
    let client = client(kernel);
    client.initiate().await.unwrap();
    client
}

#[tokio::test]
async fn initiate_is_idempotent() {
    let kernel = scripted();
    let client = client(&kernel);
    assert_eq!(client.status(), SessionStatus::Uninitiated);

    let first = client.initiate().await.unwrap();
    let second = client.initiate().await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(kernel.created(), 1);
    assert_eq!(client.kernel_id().as_deref(), Some("kernel-1"));
    assert_eq!(client.status(), SessionStatus::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn print_yields_one_stdout_item() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    let outcome = run(&client, "print('x')").await;

    assert!(!outcome.errored);
    assert_eq!(
        *items.lock().unwrap(),
        vec![OutputItem::Stream {
            name: StreamName::Stdout,
            text: "x\n".to_string()
        }]
    );
    assert_eq!(client.status(), SessionStatus::Idle);
    assert_eq!(kernel.requests(), vec!["print('x')"]);
    client.shutdown().await;
}

#[tokio::test]
async fn exception_is_output_not_failure() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    let outcome = run(&client, "1/0").await;
    assert!(outcome.errored);
    {
        let items = items.lock().unwrap();
        assert_eq!(items.len(), 1);
        let text = items[0].error_text().unwrap();
        assert!(text.contains("ZeroDivisionError"));
        // Escape sequences are kept for the renderer.
        assert!(text.contains('\u{1b}'));
    }

    // The session stays usable.
    let outcome = run(&client, "print('x')").await;
    assert!(!outcome.errored);
    assert_eq!(items.lock().unwrap().len(), 2);
    client.shutdown().await;
}

#[tokio::test]
async fn execute_result_is_classified() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    run(&client, "2 + 3").await;

    assert_eq!(
        *items.lock().unwrap(),
        vec![OutputItem::ExecuteResult {
            text: "5".to_string()
        }]
    );
    client.shutdown().await;
}

#[tokio::test]
async fn run_code_while_busy_is_rejected() {
    let kernel = scripted();
    let client = ready(&kernel).await;

    let pending = client.run_code("sleep()").unwrap();
    let err = client.run_code("print('x')").unwrap_err();
    assert!(matches!(err, SessionError::Busy));
    assert!(!err.is_session_fatal());
    assert_eq!(client.status(), SessionStatus::Busy);

    kernel.release();
    let outcome = tokio::time::timeout(WAIT, pending.finished())
        .await
        .unwrap()
        .unwrap();
    assert!(!outcome.errored);

    run(&client, "print('x')").await;
    assert_eq!(kernel.requests(), vec!["sleep()", "print('x')"]);
    client.shutdown().await;
}

#[tokio::test]
async fn calls_before_initiate_are_not_ready() {
    let kernel = scripted();
    let client = client(&kernel);

    assert!(matches!(
        client.run_code("print('x')"),
        Err(SessionError::NotReady)
    ));
    assert!(matches!(
        client.wait_until_idle().await,
        Err(SessionError::NotReady)
    ));
    assert!(matches!(client.interrupt().await, Err(SessionError::NotReady)));
    assert_eq!(kernel.created(), 0);
}

#[tokio::test]
async fn image_keys_are_fresh_and_addressable() {
    let kernel = scripted();
    let client = client_with(&kernel, SessionOptions {
        retain_images: true,
        ..SessionOptions::default()
    });
    client.initiate().await.unwrap();
    let (items, _sub) = collect(&client);

    run(&client, "show()").await;
    run(&client, "show()").await;

    let keys: Vec<_> = items
        .lock()
        .unwrap()
        .iter()
        .map(|item| match item {
            OutputItem::DisplayImage { key, origin, .. } => {
                assert_eq!(*origin, DisplayOrigin::DisplayData);
                *key
            }
            other => panic!("unexpected item {other:?}"),
        })
        .collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);

    let png = client.images(|arena| arena.decode(&keys[1])).unwrap();
    assert_eq!(&png[..4], b"\x89PNG");
    assert_eq!(
        client.images(|arena| arena.get(&keys[0])).as_deref(),
        Some(PNG)
    );
    client.shutdown().await;
}

#[tokio::test]
async fn images_of_previous_request_are_released() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    run(&client, "show()").await;
    run(&client, "print('x')").await;

    let first = match &items.lock().unwrap()[0] {
        OutputItem::DisplayImage { key, .. } => *key,
        other => panic!("unexpected item {other:?}"),
    };
    assert!(client.images(|arena| arena.get(&first)).is_none());

    client.shutdown().await;
    assert!(client.images(|arena| arena.is_empty()));
}

#[tokio::test]
async fn wait_until_idle_ignores_unrelated_status() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    let pending = client.run_code("sleep()").unwrap();
    kernel.inject_reply("someone-else", Step::stdout("stale\n"));
    kernel.inject_status("someone-else", "idle");

    let early = tokio::time::timeout(Duration::from_millis(200), client.wait_until_idle()).await;
    assert!(early.is_err(), "resolved on a mismatched idle status");
    assert_eq!(client.status(), SessionStatus::Busy);

    kernel.release();
    tokio::time::timeout(WAIT, client.wait_until_idle())
        .await
        .unwrap()
        .unwrap();
    pending.finished().await.unwrap();

    let texts: Vec<String> = items.lock().unwrap().iter().map(OutputItem::render_text).collect();
    assert_eq!(texts, vec!["started\n", "done\n"]);
    client.shutdown().await;
}

#[tokio::test]
async fn output_order_matches_arrival_order() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    for code in ["print('x')", "2 + 3", "show()", "1/0", "print('x')"] {
        run(&client, code).await;
    }

    let kinds: Vec<&str> = items
        .lock()
        .unwrap()
        .iter()
        .map(|item| match item {
            OutputItem::Stream { .. } => "stream",
            OutputItem::ExecuteResult { .. } => "execute_result",
            OutputItem::DisplayImage { .. } => "image",
            OutputItem::Text { .. } => "text",
            OutputItem::Error { .. } => "error",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["stream", "execute_result", "image", "error", "stream"]
    );
    client.shutdown().await;
}

#[tokio::test]
async fn output_stream_sees_items() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let mut stream = client.output_stream();

    run(&client, "print('x')").await;
    let item = tokio::time::timeout(WAIT, stream.next()).await.unwrap();
    assert_eq!(
        item,
        Some(OutputItem::Stream {
            name: StreamName::Stdout,
            text: "x\n".to_string()
        })
    );

    client.shutdown().await;
    assert_eq!(tokio::time::timeout(WAIT, stream.next()).await.unwrap(), None);
}

#[tokio::test]
async fn unsubscribed_callback_is_not_called() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, sub) = collect(&client);

    sub.unsubscribe();
    sub.unsubscribe();
    run(&client, "print('x')").await;

    assert!(items.lock().unwrap().is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn initiate_then_shutdown_invokes_no_callback() {
    let kernel = scripted();
    let client = client(&kernel);
    let (items, _sub) = collect(&client);

    client.initiate().await.unwrap();
    client.shutdown().await;

    assert!(items.lock().unwrap().is_empty());
    assert_eq!(client.status(), SessionStatus::Terminated);
    assert_eq!(kernel.deleted(), vec!["kernel-1"]);
    assert_eq!(kernel.interrupts(), 0);
    assert!(client.kernel_id().is_none());
}

#[tokio::test]
async fn shutdown_twice_is_safe() {
    let kernel = scripted();
    let client = ready(&kernel).await;

    client.shutdown().await;
    client.shutdown().await;
    assert_eq!(kernel.deleted(), vec!["kernel-1"]);

    let (items, _sub) = collect(&client);
    kernel.inject_reply("anything", Step::stdout("late\n"));
    assert!(items.lock().unwrap().is_empty());

    assert!(matches!(
        client.run_code("print('x')"),
        Err(SessionError::Terminated)
    ));
    assert!(matches!(
        client.initiate().await,
        Err(SessionError::Terminated)
    ));
    assert!(matches!(
        client.wait_until_idle().await,
        Err(SessionError::Terminated)
    ));
}

#[tokio::test]
async fn shutdown_swallows_delete_failure() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    kernel.fail_delete();

    tokio::time::timeout(WAIT, client.shutdown()).await.unwrap();
    assert_eq!(client.status(), SessionStatus::Terminated);
}

#[tokio::test]
async fn shutdown_abandons_outstanding_request() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    let pending = client.run_code("sleep()").unwrap();
    // Let the first stdout line through before shutting down.
    tokio::time::timeout(WAIT, async {
        while items.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let waiter = client.wait_until_idle();
    let (_, waited) = tokio::join!(client.shutdown(), waiter);

    assert!(matches!(waited, Err(SessionError::Terminated)));
    assert!(matches!(pending.finished().await, Err(SessionError::Abandoned)));
    assert_eq!(kernel.interrupts(), 1);
    assert_eq!(items.lock().unwrap().len(), 1);
    assert_eq!(client.status(), SessionStatus::Terminated);
}

#[tokio::test]
async fn interrupt_stops_running_code() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    assert!(!client.interrupt().await.unwrap());

    let pending = client.run_code("sleep()").unwrap();
    assert!(client.interrupt().await.unwrap());
    let outcome = tokio::time::timeout(WAIT, pending.finished())
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.errored);
    let last = items.lock().unwrap().last().cloned().unwrap();
    assert!(matches!(last, OutputItem::Error { ref ename, .. } if ename == "KeyboardInterrupt"));
    assert_eq!(client.status(), SessionStatus::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn lost_connection_terminates_session() {
    let kernel = scripted();
    let client = ready(&kernel).await;

    let pending = client.run_code("sleep()").unwrap();
    kernel.drop_connection();

    let err = tokio::time::timeout(WAIT, pending.finished())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::ConnectionLost(_)));
    assert!(err.is_session_fatal());
    assert_eq!(client.status(), SessionStatus::Terminated);

    assert!(matches!(
        client.run_code("print('x')"),
        Err(SessionError::ConnectionLost(_))
    ));
    client.shutdown().await;
    assert_eq!(kernel.deleted(), vec!["kernel-1"]);
}

#[tokio::test]
async fn closed_writer_terminates_session() {
    let kernel = scripted();
    let (api, _) = kernel.transports();
    let client =
        SessionClient::with_transport(api, Arc::new(ClosedWriter), SessionOptions::default());
    client.initiate().await.unwrap();
    let (items, _sub) = collect(&client);

    let err = client.run_code("print('x')").unwrap_err();
    assert!(matches!(err, SessionError::ConnectionLost(_)));
    assert!(err.is_session_fatal());
    assert_eq!(client.status(), SessionStatus::Terminated);
    assert!(matches!(
        client.wait_until_idle().await,
        Err(SessionError::ConnectionLost(_))
    ));
    assert!(matches!(
        client.run_code("print('x')"),
        Err(SessionError::ConnectionLost(_))
    ));

    client.shutdown().await;
    assert!(items.lock().unwrap().is_empty());
    assert_eq!(kernel.deleted(), vec!["kernel-1"]);
}

#[tokio::test]
async fn transport_error_terminates_session() {
    let kernel = scripted();
    let client = ready(&kernel).await;

    kernel.fail_connection();
    let mut status = client.subscribe_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == SessionStatus::Terminated))
        .await
        .unwrap()
        .unwrap();

    let err = client.wait_until_idle().await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectionLost(ref m) if m.contains("connection reset")));
    client.shutdown().await;
}

#[tokio::test]
async fn malformed_envelope_terminates_session() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let pending = client.run_code("sleep()").unwrap();

    kernel.inject("{not json".to_string());

    let err = tokio::time::timeout(WAIT, pending.finished())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
    assert_eq!(client.status(), SessionStatus::Terminated);
    client.shutdown().await;
}

#[tokio::test]
async fn malformed_content_is_dropped() {
    let kernel = scripted();
    let client = ready(&kernel).await;
    let (items, _sub) = collect(&client);

    let pending = client.run_code("sleep()").unwrap();
    kernel.inject(
        serde_json::json!({
            "header": {"msg_id": "bad", "msg_type": "stream"},
            "parent_header": {"msg_id": pending.request_id()},
            "content": {"name": "stdout"},
            "channel": "iopub",
        })
        .to_string(),
    );
    kernel.release();
    tokio::time::timeout(WAIT, pending.finished())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(items.lock().unwrap().len(), 2);
    assert_eq!(client.status(), SessionStatus::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn failed_create_reports_connection_error() {
    let kernel = scripted();
    kernel.fail_create();
    let client = client(&kernel);

    let err = client.initiate().await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(ref m) if m.contains("403")));
    assert_eq!(client.status(), SessionStatus::Terminated);

    // Shutdown of a client that never came up is still fine.
    client.shutdown().await;
    assert!(kernel.deleted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn channel_open_is_bounded() {
    let kernel = scripted();
    kernel.hang_open();
    let client = client_with(&kernel, SessionOptions {
        timeouts: Timeouts {
            channel_open: Duration::from_millis(500),
            ..Timeouts::default()
        },
        ..SessionOptions::default()
    });

    let err = client.initiate().await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    // The kernel created for the failed attempt is cleaned up.
    assert_eq!(kernel.deleted(), vec!["kernel-1"]);
}
