//! Real Docker integration tests for the execution engine
//! Run with: cargo test --test docker_integration -- --ignored

use fnrun_common::{ErrorKind, Language};
use fnrun_executor::{require_docker, Deployment, DockerRuntime, Engine, EngineConfig};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

const ECHO_HANDLER: &str = r#"import os
import json

payload = json.loads(os.getenv("PAYLOAD", "{}"))
print(json.dumps({"message": "Function executed successfully", "received_payload": payload}))
"#;

async fn engine(dir: &tempfile::TempDir) -> Arc<Engine> {
    let config = EngineConfig {
        functions_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let runtime = Arc::new(DockerRuntime::connect_local().unwrap());
    Arc::new(Engine::in_memory(config, runtime).await.unwrap())
}

async fn deploy(engine: &Engine, name: &str, language: Language, source: &str) -> u64 {
    engine
        .deploy(Deployment {
            name: name.to_string(),
            route: format!("/{name}"),
            language,
            source: source.to_string(),
            timeout_ms: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn test_python_echo_roundtrip() {
    require_docker!();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let id = deploy(&engine, "echo", Language::Python, ECHO_HANDLER).await;

    let response = engine
        .execute(id, json!({"message": "hi"}), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.result["received_payload"], json!({"message": "hi"}));
    assert_eq!(engine.sweep_stranded().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn test_javascript_plain_text_output() {
    require_docker!();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let id = deploy(
        &engine,
        "hello",
        Language::Javascript,
        "console.log('hello ' + JSON.parse(process.env.PAYLOAD).name)",
    )
    .await;

    let response = engine
        .execute(id, json!({"name": "fnrun"}), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.result, json!({"raw_output": "hello fnrun"}));
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn test_crash_and_timeout_leave_nothing_behind() {
    require_docker!();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;

    let crash = deploy(&engine, "crash", Language::Python, "print('{}')\nraise SystemExit(3)").await;
    let response = engine
        .execute(crash, json!({}), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(response.error_kind(), Some(ErrorKind::Crashed));
    assert_eq!(response.error.unwrap().exit_code, Some(3));

    let sleepy = deploy(&engine, "sleepy", Language::Python, "import time\ntime.sleep(30)").await;
    let response = engine
        .execute(sleepy, json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(response.error_kind(), Some(ErrorKind::TimedOut));

    assert_eq!(engine.sweep_stranded().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn test_network_is_disabled() {
    require_docker!();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let id = deploy(
        &engine,
        "net",
        Language::Python,
        "import socket\nsocket.create_connection(('1.1.1.1', 53), timeout=2)\nprint('connected')",
    )
    .await;

    let response = engine
        .execute(id, json!({}), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(!response.success);
}
