//! Stdio transport: newline-delimited JSON over stdin/stdout.
//!
//! The client spawns the server as a child process, writes framed JSON to
//! its stdin, decodes frames from its stdout, and forwards stderr lines to
//! the receiver as opaque diagnostic bytes. The server reads stdin and
//! writes stdout, with one implicit session. EOF and closed-pipe conditions
//! terminate the read loops cleanly; other errors are logged.

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use peermcp_core::logging::{debug, error, targets};
use peermcp_core::{McpError, McpResult};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    Cell, ClientReceiver, ClientTransport, Codec, ReceiveContext, ServerReceiver, ServerTransport,
    SessionRegistry,
};

const READ_CHUNK: usize = 4096;

/// Client transport that spawns the server as a child process.
pub struct StdioClientTransport {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    receiver: Cell<dyn ClientReceiver>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
}

impl StdioClientTransport {
    /// Creates a transport that will spawn `program` on start.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            receiver: Cell::empty(),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Appends a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an environment variable for the child process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ClientTransport for StdioClientTransport {
    async fn start(&self) -> McpResult<()> {
        let receiver = self.receiver.get()?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| McpError::connection(format!("failed to spawn {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::connection("child stderr not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection("child stdin not captured"))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // stdout: framed JSON-RPC messages.
        {
            let cancel = self.cancel.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                let mut reader = stdout;
                let mut codec = Codec::new();
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    let read = tokio::select! {
                        _ = cancel.cancelled() => return,
                        read = reader.read(&mut chunk) => read,
                    };
                    match read {
                        Ok(0) => {
                            receiver.interrupt(McpError::connection("server stdout closed"));
                            return;
                        }
                        Ok(n) => match codec.decode(&chunk[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    if let Err(err) = receiver.receive(&frame).await {
                                        error!(target: targets::TRANSPORT, "receiver failed: {err}");
                                    }
                                }
                            }
                            Err(err) => {
                                error!(target: targets::TRANSPORT, "client receive decode error: {err}");
                            }
                        },
                        Err(err) => {
                            error!(target: targets::TRANSPORT, "client receive unexpected error reading input: {err}");
                            receiver.interrupt(McpError::connection(err.to_string()));
                            return;
                        }
                    }
                }
            });
        }

        // stderr: opaque diagnostics, forwarded line by line.
        {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    let line = tokio::select! {
                        _ = cancel.cancelled() => return,
                        line = lines.next_line() => line,
                    };
                    match line {
                        Ok(Some(line)) => {
                            if let Err(err) = receiver.receive(line.as_bytes()).await {
                                debug!(target: targets::TRANSPORT, "server stderr: {err}");
                            }
                        }
                        Ok(None) | Err(_) => return,
                    }
                }
            });
        }

        Ok(())
    }

    async fn send(&self, message: &[u8]) -> McpResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::connection("stdio transport not started"))?;
        stdin.write_all(&Codec::frame(message)).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>) {
        self.receiver.set(receiver);
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();

        // Closing stdin signals the server to exit.
        drop(self.stdin.lock().await.take());

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(status) => {
                    status?;
                }
                Err(_) => {
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }
}

/// Server transport over stdin/stdout with one implicit session.
pub struct StdioServerTransport {
    receiver: Cell<dyn ServerReceiver>,
    registry: Cell<dyn SessionRegistry>,
    session_id: OnceLock<String>,
    cancel: CancellationToken,
}

impl Default for StdioServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioServerTransport {
    /// Creates a stdio server transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            receiver: Cell::empty(),
            registry: Cell::empty(),
            session_id: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ServerTransport for StdioServerTransport {
    async fn run(&self) -> McpResult<()> {
        let receiver = self.receiver.get()?;
        let registry = self.registry.get()?;

        let session_id = self
            .session_id
            .get_or_init(|| registry.create_session())
            .clone();

        let stdout = Arc::new(Mutex::new(tokio::io::stdout()));

        // Drain the session's send queue onto stdout.
        {
            let registry = registry.clone();
            let session_id = session_id.clone();
            let stdout = stdout.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = registry.dequeue(&session_id) => message,
                    };
                    match message {
                        Ok(message) => {
                            if write_frame(&stdout, &message).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => return, // send EOF or session gone
                    }
                }
            });
        }

        let mut stdin = tokio::io::stdin();
        let mut codec = Codec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = stdin.read(&mut chunk) => read,
            };
            let frames = match read {
                Ok(0) => return Ok(()), // EOF terminates cleanly
                Ok(n) => match codec.decode(&chunk[..n]) {
                    Ok(frames) => frames,
                    Err(err) => {
                        error!(target: targets::TRANSPORT, "server decode error: {err}");
                        continue;
                    }
                },
                Err(err) => {
                    error!(target: targets::TRANSPORT, "server unexpected error reading input: {err}");
                    return Ok(());
                }
            };

            for frame in frames {
                let ctx = ReceiveContext::for_session(session_id.clone());
                match receiver.receive(ctx, &frame).await {
                    Ok(Some(reply)) => {
                        let stdout = stdout.clone();
                        tokio::spawn(async move {
                            if let Ok(message) = reply.await {
                                let _ = write_frame(&stdout, &message).await;
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(target: targets::TRANSPORT, "receiver failed: {err}");
                    }
                }
            }
        }
    }

    async fn send(&self, session_id: &str, message: Vec<u8>) -> McpResult<()> {
        self.registry.get()?.enqueue(session_id, message).await
    }

    fn set_receiver(&self, receiver: Arc<dyn ServerReceiver>) {
        self.receiver.set(receiver);
    }

    fn set_session_registry(&self, registry: Arc<dyn SessionRegistry>) {
        self.registry.set(registry);
    }

    async fn shutdown(&self, drained: CancellationToken) -> McpResult<()> {
        self.cancel.cancel();
        drained.cancelled().await;
        self.registry.get()?.close_all();
        Ok(())
    }
}

async fn write_frame<W>(writer: &Mutex<W>, message: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(&Codec::frame(message)).await?;
    writer.flush().await
}
