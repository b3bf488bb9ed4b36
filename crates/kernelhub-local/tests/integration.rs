use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use kernelhub_local::Router;
use kernelhub_protocol::{
    ApiRequest, ApiResponse, Channel, KernelRef, SessionModel, WireMessage,
};
use libkernelhub::{
    ChannelHandle, ECHO_KERNEL_NAME, EchoKernel, KernelBroker, KernelRegistry, RESTART_GRACE,
    SessionBroker,
};

async fn harness() -> Router {
    let registry = Arc::new(KernelRegistry::new());
    registry.register(ECHO_KERNEL_NAME, EchoKernel::factory()).await;
    let kernels = KernelBroker::new(registry);
    let sessions = SessionBroker::new(Arc::clone(&kernels));
    Router::new(kernels, sessions)
}

fn body(response: ApiResponse) -> serde_json::Value {
    match response {
        ApiResponse::Ok { data } => data.expect("response body"),
        ApiResponse::Error { message, .. } => panic!("unexpected error: {message}"),
    }
}

async fn start_session(router: &Router, path: &str) -> SessionModel {
    serde_json::from_value(body(
        router
            .handle(ApiRequest::SessionStart {
                path: path.to_string(),
                name: None,
                kernel: Some(KernelRef {
                    id: None,
                    name: Some(ECHO_KERNEL_NAME.to_string()),
                }),
            })
            .await,
    ))
    .expect("session model")
}

async fn next_message(handle: &mut ChannelHandle) -> WireMessage {
    timeout(Duration::from_secs(2), handle.recv_message())
        .await
        .expect("message in time")
        .expect("channel still attached")
}

#[tokio::test]
async fn execute_flow_end_to_end() {
    let router = harness().await;
    let session = start_session(&router, "demo/hello.ipynb").await;
    let kernel_id = session.kernel.clone().expect("bound kernel").id;

    let kernels = router.kernels();
    let url = kernels.endpoint_url(&kernel_id);
    let mut a = kernels
        .open_channel(&format!("{url}?session_id=client-a"))
        .await
        .expect("open channel a");
    let mut b = kernels
        .open_channel(&format!("{url}?session_id=client-b"))
        .await
        .expect("open channel b");

    a.send_message(&WireMessage::request(
        Channel::Shell,
        "execute_request",
        "client-a",
        json!({"code": "print('hi')"}),
    ))
    .expect("submit execute");

    // the requesting client sees the full sequence
    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(next_message(&mut a).await);
    }
    let types: Vec<&str> = seen.iter().map(|m| m.header.msg_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["status", "execute_input", "stream", "execute_reply", "status"]
    );
    assert_eq!(seen[0].content["execution_state"], "busy");
    assert_eq!(seen[4].content["execution_state"], "idle");
    assert_eq!(seen[2].content["text"], "print('hi')");

    // the second client sees the iopub broadcasts but not the shell reply
    let broadcast_types: Vec<String> = [
        next_message(&mut b).await,
        next_message(&mut b).await,
        next_message(&mut b).await,
        next_message(&mut b).await,
    ]
    .iter()
    .map(|m| m.header.msg_type.clone())
    .collect();
    assert_eq!(broadcast_types, vec!["status", "execute_input", "stream", "status"]);
    assert!(timeout(Duration::from_millis(50), b.recv()).await.is_err());

    // shutdown empties both collections
    match router
        .handle(ApiRequest::SessionShutdown {
            session_id: session.id,
        })
        .await
    {
        ApiResponse::Ok { data } => assert!(data.is_none()),
        ApiResponse::Error { message, .. } => panic!("unexpected error: {message}"),
    }
    let sessions: Vec<SessionModel> =
        serde_json::from_value(body(router.handle(ApiRequest::SessionList).await)).unwrap();
    assert!(sessions.is_empty());
    assert!(router.kernels().running().await.is_empty());
}

#[tokio::test]
async fn stdin_replies_reach_the_kernel() {
    // wrap the stock factory so the test can observe the kernel instance
    let spawned: Arc<std::sync::Mutex<Vec<Arc<EchoKernel>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let registry = Arc::new(KernelRegistry::new());
    let slot = Arc::clone(&spawned);
    registry
        .register(
            ECHO_KERNEL_NAME,
            Arc::new(
                move |args| -> futures_util::future::BoxFuture<
                    'static,
                    Result<Arc<dyn libkernelhub::Kernel>, libkernelhub::HubError>,
                > {
                    let slot = Arc::clone(&slot);
                    Box::pin(async move {
                        let kernel = EchoKernel::start(args);
                        slot.lock().unwrap().push(Arc::clone(&kernel));
                        Ok(kernel as Arc<dyn libkernelhub::Kernel>)
                    })
                },
            ),
        )
        .await;
    let kernels = KernelBroker::new(registry);
    let sessions = SessionBroker::new(Arc::clone(&kernels));
    let router = Router::new(kernels, sessions);

    let session = start_session(&router, "demo/input.ipynb").await;
    let kernel_id = session.kernel.expect("bound kernel").id;

    let url = router.kernels().endpoint_url(&kernel_id);
    let a = router
        .kernels()
        .open_channel(&format!("{url}?session_id=client-a"))
        .await
        .expect("open channel");

    a.send_message(&WireMessage::request(
        Channel::Stdin,
        "input_reply",
        "client-a",
        json!({"value": "forty-two"}),
    ))
    .expect("submit input reply");

    let echo = Arc::clone(&spawned.lock().unwrap()[0]);
    timeout(Duration::from_secs(2), async {
        while echo.last_input().as_deref() != Some("forty-two") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("input recorded in time");
}

#[tokio::test]
async fn restart_inside_the_grace_window_keeps_the_session() {
    let router = harness().await;
    let session = start_session(&router, "demo/restart.ipynb").await;
    let kernel_id = session.kernel.expect("bound kernel").id;

    match router
        .handle(ApiRequest::KernelRestart {
            kernel_id: kernel_id.clone(),
        })
        .await
    {
        ApiResponse::Ok { .. } => {}
        ApiResponse::Error { message, .. } => panic!("restart failed: {message}"),
    }
    tokio::time::sleep(RESTART_GRACE * 3).await;

    let sessions: Vec<SessionModel> =
        serde_json::from_value(body(router.handle(ApiRequest::SessionList).await)).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].kernel.as_ref().unwrap().id, kernel_id);
}

#[tokio::test]
async fn kernel_shutdown_cascades_to_the_owning_session() {
    let router = harness().await;
    let session = start_session(&router, "demo/cascade.ipynb").await;
    let kernel_id = session.kernel.expect("bound kernel").id;

    match router.handle(ApiRequest::KernelShutdown { kernel_id }).await {
        ApiResponse::Ok { .. } => {}
        ApiResponse::Error { message, .. } => panic!("shutdown failed: {message}"),
    }
    tokio::time::sleep(RESTART_GRACE * 3).await;

    let sessions: Vec<SessionModel> =
        serde_json::from_value(body(router.handle(ApiRequest::SessionList).await)).unwrap();
    assert!(sessions.is_empty());
}

#[test]
fn binary_answers_json_lines_over_stdio() {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new(assert_cmd::cargo::cargo_bin!("kernelhub-local"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn kernelhub-local");

    let mut stdin = child.stdin.take().expect("stdin handle");
    writeln!(stdin, r#"{{"op":"kernel_list"}}"#).expect("write request");
    writeln!(stdin, r#"{{"op":"session_start","path":"a/b.ipynb"}}"#).expect("write request");
    writeln!(stdin, r#"{{"op":"not_a_thing"}}"#).expect("write request");
    drop(stdin);

    let output = child.wait_with_output().expect("binary exited");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).expect("utf-8 stdout");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains(r#""type":"ok""#));
    assert!(lines[1].contains("a/b.ipynb"));
    assert!(lines[2].contains("invalid_request"));
}
