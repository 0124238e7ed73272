//! A scripted fail2ban daemon on a real Unix socket.
//!
//! [`FakeDaemon`] speaks the same framing and value encoding as fail2ban and
//! answers `status` queries from an in-memory jail table. It can be stopped
//! and restarted on the same socket path to exercise reconnects.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use f2b_exporter_core::Jail;
use f2b_exporter_core::protocol::transport::{CLOSE_COMMAND, END_COMMAND};
use f2b_exporter_core::protocol::value::{self, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

#[derive(Default)]
struct Shared {
    jails: Mutex<Vec<Jail>>,
    failing: AtomicBool,
    connections: AtomicUsize,
    requests: AtomicUsize,
    closes: AtomicUsize,
}

/// A test-scoped fake daemon with an owned temp directory for its socket.
///
/// The temp directory is deleted when this value is dropped.
pub struct FakeDaemon {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
    _temp_dir: TempDir,
}

impl FakeDaemon {
    /// Start a daemon serving the given jails.
    pub async fn start(jails: Vec<Jail>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let socket_path = temp_dir.path().join("fail2ban.sock");
        let shared = Arc::new(Shared {
            jails: Mutex::new(jails),
            ..Shared::default()
        });

        let mut daemon = Self {
            socket_path,
            shared,
            task: None,
            _temp_dir: temp_dir,
        };
        daemon.bind();
        daemon
    }

    /// A jail with the given counters, in field order.
    pub fn jail(name: &str, counters: [i64; 4]) -> Jail {
        Jail {
            name: name.to_string(),
            currently_failed: counters[0],
            total_failed: counters[1],
            currently_banned: counters[2],
            total_banned: counters[3],
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn set_jails(&self, jails: Vec<Jail>) {
        *self.shared.jails.lock().expect("jail table poisoned") = jails;
    }

    /// Answer every command with return code 1 while set.
    pub fn set_failing(&self, failing: bool) {
        self.shared.failing.store(failing, Ordering::SeqCst);
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Commands answered so far.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Close commands received so far.
    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Drop every client connection and stop listening. The socket file is
    /// removed, so dials fail until [`restart`](Self::restart).
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        debug!(path = %self.socket_path.display(), "fake daemon stopped");
    }

    /// Stop, then listen again on the same path.
    pub async fn restart(&mut self) {
        self.stop().await;
        self.bind();
    }

    fn bind(&mut self) {
        let listener = UnixListener::bind(&self.socket_path).expect("failed to bind fake daemon");
        debug!(path = %self.socket_path.display(), "fake daemon listening");
        self.task = Some(tokio::spawn(accept_loop(listener, Arc::clone(&self.shared))));
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: UnixListener, shared: Arc<Shared>) {
    // Dropping the set (when this task is aborted) aborts every connection.
    let mut connections = JoinSet::new();
    while let Ok((stream, _)) = listener.accept().await {
        shared.connections.fetch_add(1, Ordering::SeqCst);
        connections.spawn(handle_connection(stream, Arc::clone(&shared)));
    }
}

async fn handle_connection(mut stream: UnixStream, shared: Arc<Shared>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let Some(end) = find(&buf, END_COMMAND) else {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
            continue;
        };

        let request: Vec<u8> = buf.drain(..end + END_COMMAND.len()).take(end).collect();
        if request == CLOSE_COMMAND {
            shared.closes.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let reply = match value::decode(&request) {
            Ok(Value::Sequence(args)) => {
                let args: Vec<&str> = args.iter().filter_map(Value::as_text).collect();
                respond(&args, &shared)
            }
            _ => failure("malformed request"),
        };
        shared.requests.fetch_add(1, Ordering::SeqCst);

        let mut msg = value::encode_value(&reply).expect("fake daemon reply encodes");
        msg.extend_from_slice(END_COMMAND);
        if stream.write_all(&msg).await.is_err() {
            return;
        }
    }
}

fn respond(args: &[&str], shared: &Shared) -> Value {
    if shared.failing.load(Ordering::SeqCst) {
        return failure("fail2ban is unhappy");
    }
    let jails = shared.jails.lock().expect("jail table poisoned");

    match args {
        ["status"] => {
            let names: Vec<&str> = jails.iter().map(|j| j.name.as_str()).collect();
            ok(Value::Sequence(vec![
                entry("Number of jail", Value::Integer(jails.len() as i64)),
                entry("Jail list", Value::from(names.join(", "))),
            ]))
        }
        ["status", name] => match jails.iter().find(|j| j.name == *name) {
            Some(jail) => ok(jail_status(jail)),
            None => failure(&format!("Sorry but the jail '{name}' does not exist")),
        },
        _ => failure("Invalid command"),
    }
}

fn jail_status(jail: &Jail) -> Value {
    Value::Sequence(vec![
        entry(
            "Filter",
            Value::Sequence(vec![
                entry("Currently failed", Value::Integer(jail.currently_failed)),
                entry("Total failed", Value::Integer(jail.total_failed)),
                entry("File list", Value::Sequence(vec![Value::from("/var/log/auth.log")])),
            ]),
        ),
        entry(
            "Actions",
            Value::Sequence(vec![
                entry("Currently banned", Value::Integer(jail.currently_banned)),
                entry("Total banned", Value::Integer(jail.total_banned)),
                entry("Banned IP list", Value::Sequence(Vec::new())),
            ]),
        ),
    ])
}

fn entry(label: &str, value: Value) -> Value {
    Value::Sequence(vec![Value::from(label), value])
}

fn ok(payload: Value) -> Value {
    Value::Sequence(vec![Value::Integer(0), payload])
}

fn failure(message: &str) -> Value {
    Value::Sequence(vec![Value::Integer(1), Value::from(message)])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
