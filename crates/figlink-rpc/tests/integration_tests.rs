//! Integration tests for the figlink-rpc binary.
//!
//! Spawns the real binary, connects a fake plugin to the port it reports and
//! drives it through the JSON-RPC endpoint.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Make an RPC call and return the full JSON-RPC payload.
async fn rpc_call_raw(port: u16, method: &str, params: Value) -> Result<Value, String> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/rpc", port))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    response.json::<Value>().await.map_err(|e| e.to_string())
}

/// Make an RPC call to the server.
async fn rpc_call(port: u16, method: &str, params: Value) -> Result<Value, String> {
    let json = rpc_call_raw(port, method, params).await?;
    if let Some(error) = json.get("error") {
        return Err(error.to_string());
    }
    Ok(json.get("result").cloned().unwrap_or(Value::Null))
}

/// Check health endpoint.
async fn check_health(port: u16) -> bool {
    let client = reqwest::Client::new();
    if let Ok(response) = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        if let Ok(json) = response.json::<Value>().await {
            return json.get("status").and_then(|v| v.as_str()) == Some("ok");
        }
    }
    false
}

/// Wait for server to be ready.
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if check_health(port).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

struct RpcServerHandle {
    child: tokio::process::Child,
    rpc_port: u16,
    peer_port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn binary_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_figlink-rpc") {
        return Ok(PathBuf::from(path));
    }

    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("figlink-rpc");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_figlink-rpc not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start the RPC binary and wait until `/health` is ready.
async fn start_rpc_server() -> Result<RpcServerHandle, String> {
    let binary = binary_path()?;

    let mut child = tokio::process::Command::new(&binary)
        .args(["--host", "127.0.0.1", "--port", "0", "--rpc-port", "0"])
        .args(["--heartbeat-secs", "0"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn figlink-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut peer_port: Option<u16> = None;
    let mut rpc_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline && (peer_port.is_none() || rpc_port.is_none()) {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("PEER_PORT=") {
                    peer_port = value.trim().parse().ok();
                } else if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    rpc_port = value.trim().parse().ok();
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read figlink-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let rpc_port = rpc_port.ok_or_else(|| "RPC_PORT line not emitted".to_string())?;
    let peer_port = peer_port.ok_or_else(|| "PEER_PORT line not emitted".to_string())?;
    if !wait_for_server(rpc_port, 15).await {
        return Err(format!("figlink-rpc failed health check on port {rpc_port}"));
    }

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RpcServerHandle {
        child,
        rpc_port,
        peer_port,
        stdout_drain: Some(stdout_drain),
    })
}

#[tokio::test]
async fn test_status_without_plugin() {
    let server = start_rpc_server().await.expect("server should start");

    let status = rpc_call(server.rpc_port, "plugin_status", json!({}))
        .await
        .unwrap();
    assert_eq!(status["connected"], false);
    assert_eq!(status["port"], server.peer_port);

    let error = rpc_call_raw(server.rpc_port, "bogus", json!({})).await.unwrap();
    assert_eq!(error["error"]["code"], -32601);

    server.stop().await;
}

#[tokio::test]
async fn test_command_reaches_plugin_and_back() {
    let server = start_rpc_server().await.expect("server should start");

    let (mut plugin, _) = connect_async(format!("ws://127.0.0.1:{}/", server.peer_port))
        .await
        .expect("plugin should connect");
    plugin
        .send(Message::Text(
            json!({"type": "PLUGIN_HELLO", "payload": {"name": "Integration"}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = rpc_call(server.rpc_port, "plugin_status", json!({}))
            .await
            .unwrap();
        if status["connected"] == true {
            assert_eq!(status["peer"]["name"], "Integration");
            break;
        }
        assert!(std::time::Instant::now() < deadline, "plugin never connected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let rpc_port = server.rpc_port;
    let call = tokio::spawn(async move {
        rpc_call(
            rpc_port,
            "send_command",
            json!({"type": "GET_SELECTION", "payload": {}}),
        )
        .await
    });

    let request: Value = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), plugin.next())
            .await
            .expect("no request reached the plugin")
            .expect("plugin socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == "GET_SELECTION" {
                break frame;
            }
        }
    };
    plugin
        .send(Message::Text(
            json!({"id": request["id"], "success": true, "data": {"selection": []}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["data"], json!({"selection": []}));

    server.stop().await;
}
