//! Byte-oriented channel to the engine process.
//!
//! The driver is written against the [`Transport`] trait so it can be fed
//! from a real child process ([`ChildTransport`]) or from a scripted
//! [`MockTransport`] in tests.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;
use tracing::warn;

use crate::config::EngineConfig;

/// Input-side event produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes read from the engine's standard output.
    Stdout(Vec<u8>),
    /// Bytes read from the engine's standard error.
    Stderr(Vec<u8>),
    /// The engine process exited with the given code.
    Exited(i32),
}

/// Byte channel to an engine process.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Writes bytes to the engine's standard input.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Waits for the next input event. After [`TransportEvent::Exited`] has
    /// been delivered this never resolves again.
    async fn recv(&mut self) -> TransportEvent;

    /// Process identifier.
    fn pid(&self) -> u32;

    /// Exit code, once the process has exited.
    fn returncode(&self) -> Option<i32>;
}

/// Transport over a real engine child process with piped standard streams.
pub struct ChildTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    pid: u32,
    exited: Option<i32>,
}

impl ChildTransport {
    /// Spawns the configured engine executable with piped stdio. The child
    /// is killed when the transport is dropped.
    pub fn spawn(config: &EngineConfig) -> io::Result<ChildTransport> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(pwd) = &config.pwd {
            command.current_dir(pwd);
        }

        let mut child = command.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "cannot open engine stdin"))?;
        let stdout = child.stdout.take();
        if stdout.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "cannot open engine stdout"));
        }
        let stderr = child.stderr.take();
        if stderr.is_none() {
            warn!("Cannot open engine stderr");
        }
        let pid = child.id().unwrap_or(0);

        Ok(ChildTransport {
            child,
            stdin,
            stdout,
            stderr,
            pid,
            exited: None,
        })
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[async_trait]
impl Transport for ChildTransport {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stdin.write_all(data).await?;
        self.stdin.flush().await
    }

    async fn recv(&mut self) -> TransportEvent {
        if self.exited.is_some() {
            std::future::pending::<()>().await;
        }

        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        loop {
            let stdout_open = self.stdout.is_some();
            let stderr_open = self.stderr.is_some();
            tokio::select! {
                biased;
                read = read_some(&mut self.stdout, &mut out_buf), if stdout_open => {
                    match read {
                        Some(data) => return TransportEvent::Stdout(data),
                        None => self.stdout = None,
                    }
                }
                read = read_some(&mut self.stderr, &mut err_buf), if stderr_open => {
                    match read {
                        Some(data) => return TransportEvent::Stderr(data),
                        None => self.stderr = None,
                    }
                }
                status = self.child.wait() => {
                    let code = match status {
                        Ok(status) => exit_code(status),
                        Err(err) => {
                            warn!(%err, "Failed waiting for engine process");
                            -1
                        }
                    };
                    self.exited = Some(code);
                    return TransportEvent::Exited(code);
                }
            }
        }
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn returncode(&self) -> Option<i32> {
        self.exited
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(buf[..n].to_vec()),
        Err(err) => {
            warn!(%err, "Failed reading from engine");
            None
        }
    }
}

/// Scripted transport for driving the protocol state machines in tests
/// without a real engine binary.
///
/// Expected writes are queued with [`MockController::expect`] together with
/// the canned response lines the fake engine answers with. Writes that do
/// not match the next expectation panic. `ping <n>` lines are answered with
/// the matching `pong <n>` while pings are expected.
pub struct MockTransport {
    state: Arc<MockState>,
}

/// Test-side handle to a [`MockTransport`].
#[derive(Clone)]
pub struct MockController {
    state: Arc<MockState>,
}

struct MockState {
    inner: Mutex<MockInner>,
    notify: Notify,
}

#[derive(Default)]
struct MockInner {
    expectations: VecDeque<(String, Vec<String>)>,
    expected_pings: usize,
    responses: VecDeque<String>,
    stdin: Vec<u8>,
    exit: Option<i32>,
    exit_delivered: bool,
}

impl MockTransport {
    pub fn new() -> (MockTransport, MockController) {
        let state = Arc::new(MockState {
            inner: Mutex::new(MockInner::default()),
            notify: Notify::new(),
        });
        (
            MockTransport { state: state.clone() },
            MockController { state },
        )
    }
}

impl MockController {
    /// Expects `line` to be written next, answering with `responses`.
    pub fn expect(&self, line: &str, responses: &[&str]) {
        self.lock()
            .expectations
            .push_back((line.to_string(), responses.iter().map(|s| s.to_string()).collect()));
    }

    /// Expects one `ping <n>` write, answered automatically with the
    /// matching `pong <n>`.
    pub fn expect_ping(&self) {
        self.lock().expected_pings += 1;
    }

    /// Makes the fake engine emit a line on its own.
    pub fn send_line(&self, line: &str) {
        self.lock().responses.push_back(line.to_string());
        self.state.notify.notify_one();
    }

    /// Makes the fake engine process exit.
    pub fn exit(&self, code: i32) {
        self.lock().exit = Some(code);
        self.state.notify.notify_one();
    }

    /// Panics if scripted expectations are left over.
    pub fn assert_done(&self) {
        let inner = self.lock();
        assert!(
            inner.expectations.is_empty(),
            "pending expectations: {:?}",
            inner.expectations
        );
        assert_eq!(inner.expected_pings, 0, "pending ping expectations");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        match self.state.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = match self.state.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.stdin.extend_from_slice(data);
        while let Some(pos) = inner.stdin.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = inner.stdin.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();

            if line.starts_with("ping ") && inner.expected_pings > 0 {
                inner.expected_pings -= 1;
                inner.responses.push_back(line.replacen("ping", "pong", 1));
            } else {
                let (expected, responses) = inner
                    .expectations
                    .pop_front()
                    .unwrap_or_else(|| panic!("unexpected engine input: {line:?}"));
                assert_eq!(expected, line, "expected {expected:?}, got: {line:?}");
                inner.responses.extend(responses);
            }
        }
        drop(inner);
        self.state.notify.notify_one();
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            let wait_forever = {
                let mut inner = match self.state.inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(line) = inner.responses.pop_front() {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    return TransportEvent::Stdout(bytes);
                }
                if let Some(code) = inner.exit {
                    if !inner.exit_delivered {
                        inner.exit_delivered = true;
                        return TransportEvent::Exited(code);
                    }
                    true
                } else {
                    false
                }
            };
            if wait_forever {
                std::future::pending::<()>().await;
            } else {
                self.state.notify.notified().await;
            }
        }
    }

    fn pid(&self) -> u32 {
        1
    }

    fn returncode(&self) -> Option<i32> {
        self.lock_exit()
    }
}

impl MockTransport {
    fn lock_exit(&self) -> Option<i32> {
        match self.state.inner.lock() {
            Ok(guard) => guard.exit,
            Err(poisoned) => poisoned.into_inner().exit,
        }
    }
}
