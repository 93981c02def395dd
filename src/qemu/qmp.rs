//! Minimal QEMU Machine Protocol client.
//!
//! QMP is line-delimited JSON over the monitor socket: the server greets,
//! the client negotiates capabilities, then each command gets exactly one
//! `return` or `error` reply. Asynchronous `event` lines may arrive at any
//! point and are skipped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::vmimpl::VmError;

/// Bound on connecting plus each request/response exchange.
pub const QMP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

#[derive(Debug, Serialize)]
struct HmpArguments<'a> {
    #[serde(rename = "command-line")]
    command_line: &'a str,
    #[serde(rename = "cpu-index")]
    cpu_index: usize,
}

#[derive(Debug, Deserialize)]
struct QmpReply {
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<QmpErrorBody>,
    event: Option<String>,
    #[serde(rename = "QMP")]
    greeting: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

/// An open, capability-negotiated QMP connection.
#[derive(Debug)]
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connects to the monitor on `127.0.0.1:port` and negotiates
    /// capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Qmp`] when the socket cannot be reached, the
    /// greeting is malformed or negotiation fails.
    pub async fn connect(port: u16) -> Result<Self, VmError> {
        let stream = tokio::time::timeout(QMP_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| VmError::Qmp(format!("connecting to port {port} timed out")))?
            .map_err(|err| VmError::Qmp(format!("connecting to port {port}: {err}")))?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };
        client.read_greeting().await?;
        client.execute("qmp_capabilities", None).await?;
        debug!(port, "QMP connection ready");
        Ok(client)
    }

    /// Sends one command and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Qmp`] for transport failures, timeouts and error
    /// replies.
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, VmError> {
        let request = encode_command(command, arguments)?;
        tokio::time::timeout(QMP_TIMEOUT, self.exchange(&request))
            .await
            .map_err(|_| VmError::Qmp(format!("{command} timed out")))?
    }

    /// Runs a human monitor command against one vCPU and returns its text
    /// output.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::execute`].
    pub async fn hmp(&mut self, command_line: &str, cpu_index: usize) -> Result<String, VmError> {
        let arguments = serde_json::to_value(HmpArguments {
            command_line,
            cpu_index,
        })
        .map_err(|err| VmError::Qmp(err.to_string()))?;
        let reply = self.execute("human-monitor-command", Some(arguments)).await?;
        Ok(match reply {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }

    async fn read_greeting(&mut self) -> Result<(), VmError> {
        let line = tokio::time::timeout(QMP_TIMEOUT, self.read_reply())
            .await
            .map_err(|_| VmError::Qmp(String::from("no greeting from QEMU")))??;
        if line.greeting.is_none() {
            return Err(VmError::Qmp(String::from("unexpected QMP greeting")));
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Value, VmError> {
        self.writer
            .write_all(request)
            .await
            .map_err(|err| VmError::Qmp(format!("sending request: {err}")))?;
        loop {
            let reply = self.read_reply().await?;
            if let Some(event) = reply.event {
                debug!(%event, "skipping QMP event");
                continue;
            }
            if let Some(error) = reply.error {
                return Err(VmError::Qmp(format!("{}: {}", error.class, error.desc)));
            }
            if let Some(ret) = reply.ret {
                return Ok(ret);
            }
        }
    }

    async fn read_reply(&mut self) -> Result<QmpReply, VmError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|err| VmError::Qmp(format!("reading reply: {err}")))?;
            if read == 0 {
                return Err(VmError::Qmp(String::from("connection closed by QEMU")));
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map_err(|err| VmError::Qmp(format!("malformed reply {:?}: {err}", line.trim())));
        }
    }
}

/// Serialises a QMP command line, including the trailing newline.
///
/// # Errors
///
/// Returns [`VmError::Qmp`] if serialisation fails.
pub fn encode_command(command: &str, arguments: Option<Value>) -> Result<Vec<u8>, VmError> {
    let mut encoded = serde_json::to_vec(&QmpCommand {
        execute: command,
        arguments,
    })
    .map_err(|err| VmError::Qmp(err.to_string()))?;
    encoded.push(b'\n');
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn encodes_capability_negotiation_without_arguments() {
        let encoded = encode_command("qmp_capabilities", None).expect("encode");

        assert_eq!(encoded, b"{\"execute\":\"qmp_capabilities\"}\n");
    }

    #[test]
    fn encodes_human_monitor_command_with_cpu_index() {
        let arguments = serde_json::to_value(HmpArguments {
            command_line: "info registers",
            cpu_index: 1,
        })
        .expect("arguments");
        let encoded = encode_command("human-monitor-command", Some(arguments)).expect("encode");
        let decoded: Value = serde_json::from_slice(&encoded).expect("valid json");

        assert_eq!(
            decoded,
            serde_json::json!({
                "execute": "human-monitor-command",
                "arguments": {"command-line": "info registers", "cpu-index": 1}
            })
        );
    }

    async fn fake_qemu(listener: TcpListener, replies: Vec<&'static str>) -> Vec<String> {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .expect("greeting");
        let mut requests = Vec::new();
        for reply in replies {
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("request");
            requests.push(line.trim().to_owned());
            write.write_all(reply.as_bytes()).await.expect("reply");
        }
        requests
    }

    #[tokio::test]
    async fn hmp_skips_events_and_returns_text() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(fake_qemu(
            listener,
            vec![
                "{\"return\": {}}\n",
                "{\"event\": \"RTC_CHANGE\", \"data\": {}}\n{\"return\": \"RAX=0000000000000001\\n\"}\n",
            ],
        ));

        let mut client = QmpClient::connect(port).await.expect("connect");
        let regs = client.hmp("info registers", 0).await.expect("registers");

        assert_eq!(regs, "RAX=0000000000000001\n");
        let requests = server.await.expect("server");
        assert_eq!(
            requests.first().map(String::as_str),
            Some("{\"execute\":\"qmp_capabilities\"}")
        );
    }

    #[tokio::test]
    async fn error_replies_become_qmp_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(fake_qemu(
            listener,
            vec![
                "{\"return\": {}}\n",
                "{\"error\": {\"class\": \"GenericError\", \"desc\": \"no such cpu\"}}\n",
            ],
        ));

        let mut client = QmpClient::connect(port).await.expect("connect");
        let err = client.hmp("info registers", 7).await.expect_err("error reply");

        assert_eq!(err, VmError::Qmp(String::from("GenericError: no such cpu")));
        server.await.expect("server");
    }
}
