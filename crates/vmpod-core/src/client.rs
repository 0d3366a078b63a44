//! Remote clients for talking to the agent inside a sandbox VM.
//!
//! The manager only sees [`RemoteConnector`] and [`RemoteClient`]. The
//! production pair, [`AgentConnector`] and [`AgentClient`], speaks
//! newline-delimited JSON-RPC 2.0 over TCP to the guest address.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Guest port the agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 52;

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on reconnecting after an interrupted call.
const RECONNECT_BUDGET: Duration = Duration::from_secs(5);

/// Timeout for individual RPC calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to a sandbox's guest agent.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Check the agent is responsive.
    async fn ping(&self) -> Result<()>;

    /// Run a shell command in the guest.
    async fn exec(&self, cmd: &str) -> Result<ExecResult>;

    /// Drop the connection. Later calls fail.
    async fn close(&self);
}

/// Opens [`RemoteClient`]s to freshly provisioned VMs.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, ip: IpAddr) -> Result<Arc<dyn RemoteClient>>;
}

/// Connects [`AgentClient`]s on a fixed port.
#[derive(Debug, Clone)]
pub struct AgentConnector {
    port: u16,
    budget: Duration,
}

impl AgentConnector {
    /// `budget` bounds how long to keep retrying while the guest boots.
    pub fn new(port: u16, budget: Duration) -> Self {
        Self { port, budget }
    }
}

#[async_trait]
impl RemoteConnector for AgentConnector {
    async fn connect(&self, ip: IpAddr) -> Result<Arc<dyn RemoteClient>> {
        let client = AgentClient::connect(SocketAddr::new(ip, self.port), self.budget).await?;
        client.ping().await?;
        Ok(Arc::new(client))
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

enum Slot {
    Idle(Connection),
    /// A call was interrupted mid-exchange; reconnect before the next one.
    Broken,
    Closed,
}

/// JSON-RPC client for the guest agent.
///
/// Calls are serialized over one TCP connection. The connection is taken
/// out of its slot for the length of a call, so an interrupted call never
/// leaves an unread reply behind for the next caller.
pub struct AgentClient {
    addr: SocketAddr,
    budget: Duration,
    next_id: AtomicU64,
    conn: Mutex<Slot>,
}

impl AgentClient {
    /// Connect to the agent, retrying every 100ms until `budget` is spent.
    ///
    /// The guest may still be booting when this is called, so refused
    /// connections are expected for a while.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AgentTimeout`] if no connection succeeds in time.
    pub async fn connect(addr: SocketAddr, budget: Duration) -> Result<Self> {
        let conn = dial(addr, budget).await?;
        Ok(Self {
            addr,
            budget,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(Slot::Idle(conn)),
        })
    }

    /// Address of the agent.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn checkout(&self, slot: &mut Slot) -> Result<Connection> {
        match std::mem::replace(slot, Slot::Broken) {
            Slot::Idle(conn) => Ok(conn),
            Slot::Broken => {
                tracing::debug!(addr = %self.addr, "Reconnecting after an interrupted call");
                dial(self.addr, self.budget.min(RECONNECT_BUDGET)).await
            }
            Slot::Closed => {
                *slot = Slot::Closed;
                Err(CoreError::Connection(format!("client for {} is closed", self.addr)))
            }
        }
    }

    /// Send a JSON-RPC request and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed, the request fails or times
    /// out, or the agent answers with an error object.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let mut slot = self.conn.lock().await;
        let mut conn = self.checkout(&mut slot).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %request_str, "RPC request body");

        conn.writer.write_all(request_str.as_bytes()).await?;
        conn.writer.write_all(b"\n").await?;
        conn.writer.flush().await?;

        let response_str = match timeout(RPC_TIMEOUT, read_reply(&mut conn.reader, id)).await {
            Ok(Ok(Some(body))) => body,
            Ok(Ok(None)) => {
                tracing::warn!(method = %method, id, "Agent closed the connection");
                return Err(CoreError::Connection(format!("{} closed the connection", self.addr)));
            }
            Ok(Err(e)) => {
                tracing::warn!(method = %method, id, error = %e, "RPC read error");
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(method = %method, id, timeout_secs = RPC_TIMEOUT.as_secs(), "RPC response timeout");
                return Err(CoreError::AgentTimeout(RPC_TIMEOUT));
            }
        };
        *slot = Slot::Idle(conn);
        drop(slot);

        tracing::trace!(response = %response_str.trim(), "RPC response body");
        parse_response(method, id, &response_str)
    }

    /// Execute a shell command.
    pub async fn exec(&self, cmd: &str) -> Result<ExecResult> {
        tracing::debug!(cmd = %cmd, "Executing command via agent");
        self.call("exec", serde_json::json!({ "cmd": cmd })).await
    }
}

async fn dial(addr: SocketAddr, budget: Duration) -> Result<Connection> {
    let start = std::time::Instant::now();
    tracing::debug!(%addr, "Connecting to agent");

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::info!(
                    %addr,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    attempts,
                    "Connected to agent"
                );
                stream.set_nodelay(true)?;
                let (read_half, write_half) = stream.into_split();
                return Ok(Connection {
                    reader: BufReader::new(read_half),
                    writer: BufWriter::new(write_half),
                });
            }
            Err(e) => {
                if start.elapsed() >= budget {
                    tracing::warn!(
                        %addr,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        error = %e,
                        "Agent connection timeout"
                    );
                    return Err(CoreError::AgentTimeout(budget));
                }
                tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

/// Read lines until the reply to `id` arrives. `None` on EOF.
///
/// Replies carrying another id are stale and skipped. A reply without a
/// numeric id is returned as is for the caller to judge.
async fn read_reply(reader: &mut BufReader<OwnedReadHalf>, id: u64) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let reply_id = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_u64()));
        match reply_id {
            Some(got) if got != id => {
                tracing::debug!(expected = id, got, "Discarding stale RPC response");
            }
            _ => return Ok(Some(line)),
        }
    }
}

fn parse_response<R: DeserializeOwned>(method: &str, id: u64, body: &str) -> Result<R> {
    let response: serde_json::Value = serde_json::from_str(body)?;

    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        tracing::debug!(method = %method, id, code, message = %message, "RPC error response");
        return Err(CoreError::Rpc { code, message });
    }

    let result = response
        .get("result")
        .cloned()
        .ok_or_else(|| CoreError::Rpc {
            code: -1,
            message: "missing result in response".into(),
        })?;

    tracing::debug!(method = %method, id, "RPC call successful");
    serde_json::from_value(result).map_err(CoreError::from)
}

#[async_trait]
impl RemoteClient for AgentClient {
    async fn ping(&self) -> Result<()> {
        let _: PingResponse = self.call("ping", serde_json::json!({})).await?;
        Ok(())
    }

    async fn exec(&self, cmd: &str) -> Result<ExecResult> {
        AgentClient::exec(self, cmd).await
    }

    async fn close(&self) {
        let mut slot = self.conn.lock().await;
        if let Slot::Idle(_) = std::mem::replace(&mut *slot, Slot::Closed) {
            tracing::debug!(addr = %self.addr, "Agent connection closed");
        }
    }
}

/// Result from command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (-1 if the process couldn't be started).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    #[allow(dead_code)]
    pong: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Agent answering each request line with `reply(request)`, sleeping
    /// `delay(request)` first. Every accepted connection is served.
    async fn spawn_agent_with<F, D>(reply: F, delay: D) -> SocketAddr
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
        D: Fn(&serde_json::Value) -> Duration + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handlers = Arc::new((reply, delay));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handlers = Arc::clone(&handlers);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                        tokio::time::sleep((handlers.1)(&request)).await;
                        let mut response = (handlers.0)(request.clone());
                        response["jsonrpc"] = "2.0".into();
                        response["id"] = request["id"].clone();
                        let mut body = serde_json::to_string(&response).unwrap();
                        body.push('\n');
                        if write_half.write_all(body.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_agent<F>(reply: F) -> SocketAddr
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        spawn_agent_with(reply, |_| Duration::ZERO).await
    }

    fn agent(request: serde_json::Value) -> serde_json::Value {
        match request["method"].as_str() {
            Some("ping") => serde_json::json!({ "result": { "pong": true } }),
            Some("exec") => serde_json::json!({
                "result": { "exit_code": 0, "stdout": request["params"]["cmd"], "stderr": "" }
            }),
            _ => serde_json::json!({ "error": { "code": -32601, "message": "method not found" } }),
        }
    }

    #[test]
    fn test_exec_result_success() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "hello".to_string(),
            stderr: String::new(),
        };
        assert!(result.success());
    }

    #[test]
    fn test_exec_result_failure() {
        let result = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error".to_string(),
        };
        assert!(!result.success());
    }

    #[test]
    fn test_parse_response_error_object() {
        let err = parse_response::<PingResponse>(
            "ping",
            1,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"busy"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Rpc { code: -32000, ref message } if message == "busy"));
    }

    #[test]
    fn test_parse_response_missing_result() {
        let err = parse_response::<PingResponse>("ping", 1, r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, CoreError::Rpc { code: -1, .. }));
    }

    #[tokio::test]
    async fn test_connector_pings_and_execs() {
        let addr = spawn_agent(agent).await;
        let connector = AgentConnector::new(addr.port(), Duration::from_secs(2));

        let client = connector.connect(addr.ip()).await.unwrap();
        let result = client.exec("echo hi").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "echo hi");
    }

    #[tokio::test]
    async fn test_unknown_method_is_rpc_error() {
        let addr = spawn_agent(agent).await;
        let client = AgentClient::connect(addr, Duration::from_secs(2)).await.unwrap();

        let err = client
            .call::<_, serde_json::Value>("reboot", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_calls_fail_after_close() {
        let addr = spawn_agent(agent).await;
        let client = AgentClient::connect(addr, Duration::from_secs(2)).await.unwrap();
        RemoteClient::ping(&client).await.unwrap();

        client.close().await;
        let err = RemoteClient::ping(&client).await.unwrap_err();
        assert!(matches!(err, CoreError::Connection(_)));
        // Closing twice is harmless
        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_times_out_without_listener() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = AgentClient::connect(addr, Duration::from_millis(250))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::AgentTimeout(_)));
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_leak_its_reply() {
        // Destructive commands take a while to answer
        let addr = spawn_agent_with(agent, |request| {
            if request["params"]["cmd"] == "rm -rf /data" {
                Duration::from_millis(200)
            } else {
                Duration::ZERO
            }
        })
        .await;
        let client = AgentClient::connect(addr, Duration::from_secs(2)).await.unwrap();

        let abandoned = timeout(Duration::from_millis(50), client.exec("rm -rf /data")).await;
        assert!(abandoned.is_err());

        let result = client.exec("echo hello").await.unwrap();
        assert_eq!(result.stdout, "echo hello");

        // Wait out the slow reply; it must not surface either
        tokio::time::sleep(Duration::from_millis(250)).await;
        let result = client.exec("echo again").await.unwrap();
        assert_eq!(result.stdout, "echo again");
    }

    #[tokio::test]
    async fn test_stale_reply_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            let stale = serde_json::json!({
                "jsonrpc": "2.0",
                "id": 9999,
                "result": { "exit_code": 0, "stdout": "stale", "stderr": "" },
            });
            let fresh = serde_json::json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": { "exit_code": 0, "stdout": "fresh", "stderr": "" },
            });
            let body = format!("{stale}\n{fresh}\n");
            write_half.write_all(body.as_bytes()).await.unwrap();
            // Hold the connection open until the client is done
            let _ = lines.next_line().await;
        });

        let client = AgentClient::connect(addr, Duration::from_secs(2)).await.unwrap();
        let result = client.exec("whoami").await.unwrap();
        assert_eq!(result.stdout, "fresh");
    }
}
