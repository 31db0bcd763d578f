//! In-process fake daemon for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

pub enum Reply {
    /// Write these lines, then keep serving the connection.
    Lines(Vec<String>),
    /// Write these lines; close afterwards unless `hold_open`.
    Stream { lines: Vec<String>, hold_open: bool },
}

pub type Handler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

pub struct FakeDaemon {
    pub address: String,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
    _dir: Option<TempDir>,
    task: JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn unix(handler: Handler) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (conns, reqs) = (connections.clone(), requests.clone());
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conns.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, handler.clone(), None, reqs.clone()));
            }
        });
        Self {
            address: format!("unix://{}", path.display()),
            connections,
            requests,
            _dir: Some(dir),
            task,
        }
    }

    pub async fn tcp(handler: Handler, token: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (conns, reqs) = (connections.clone(), requests.clone());
        let token = token.map(str::to_string);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conns.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, handler.clone(), token.clone(), reqs.clone()));
            }
        });
        Self {
            address: format!("tcp://{addr}"),
            connections,
            requests,
            _dir: None,
            task,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(stream: S, handler: Handler, token: Option<String>, log: Arc<Mutex<Vec<Value>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    if let Some(token) = token {
        let Ok(Some(first)) = lines.next_line().await else {
            return;
        };
        if first.trim() != format!("AUTH {token}") {
            let _ = writer.write_all(b"unauthorized\n").await;
            return;
        }
        if writer.write_all(b"OK\n").await.is_err() {
            return;
        }
    }

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        log.lock().unwrap().push(request.clone());
        match handler(&request) {
            Reply::Lines(out) => {
                for line in out {
                    if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            Reply::Stream { lines: out, hold_open } => {
                for line in out {
                    if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
                if hold_open {
                    while let Ok(Some(_)) = lines.next_line().await {}
                }
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

pub fn ok(payload: Value) -> Reply {
    let mut body = json!({"success": true});
    if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), payload) {
        obj.extend(extra);
    }
    Reply::Lines(vec![body.to_string()])
}

pub fn fail(message: &str) -> Reply {
    Reply::Lines(vec![json!({"success": false, "error": message}).to_string()])
}

pub fn wire_task(id: &str, status: &str) -> Value {
    let mut task = json!({
        "id": id,
        "tool_name": "sleep",
        "args": "{\"seconds\":1}",
        "working_dir": "/tmp",
        "session_id": "sess-1",
        "call_id": "call-1",
        "origin": "tui",
        "status": status,
        "created_at": "2024-05-01T10:00:00.123456789Z",
        "updated_at": "2024-05-01T10:00:01.000000001Z",
    });
    if matches!(status, "completed" | "failed" | "deleted") {
        task["completed_at"] = json!("2024-05-01T10:00:02.5Z");
        task["result"] = json!("slept 1s");
    }
    task
}

pub fn processes(names: &[&str]) -> Reply {
    let list: Vec<Value> = names
        .iter()
        .map(|n| json!({"name": n, "status": "running", "pid": 42}))
        .collect();
    ok(json!({ "processes": list }))
}
