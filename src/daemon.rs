//! Control-plane daemon: hosts exactly one supervision tree and exposes it
//! over a unix socket, one newline-terminated JSON command per connection.
//!
//! Socket I/O is decoupled from the tree: each connection runs in its own
//! task that reads the command line (bounded by a timeout) and forwards it
//! over a channel into the select loop, so a slow or idle client never
//! stalls the supervision tick or other clients.
//!
//! The `shutdown` command and termination signals run the identical
//! sequence: stop the tree, delete the socket and PID files, exit 0.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{self, Request, Response};
use crate::tree::SupervisionTree;

/// A connection that never sends its line gets dropped after this long.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DaemonOpts {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub log_dir: PathBuf,
    pub shutdown_timeout_ms: Option<u64>,
}

struct Command {
    req: Request,
    reply: oneshot::Sender<Response>,
}

pub async fn run(opts: DaemonOpts) -> Result<()> {
    // A fresh daemon assumes sole ownership of the socket path.
    if opts.socket_path.exists() {
        let _ = fs::remove_file(&opts.socket_path);
    }
    let listener = UnixListener::bind(&opts.socket_path)
        .with_context(|| format!("failed to bind {}", opts.socket_path.display()))?;

    fs::write(&opts.pid_file, process::id().to_string())
        .with_context(|| format!("failed to write {}", opts.pid_file.display()))?;

    let mut tree = SupervisionTree::new(opts.log_dir.clone(), opts.shutdown_timeout_ms, None)?;
    tree.start()?;
    tracing::info!(socket = %opts.socket_path.display(), pid = process::id(), "daemon ready");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let (commands, mut inbox) = mpsc::channel::<Command>(32);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tree.tick();
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received");
                break;
            }
            cmd = inbox.recv() => {
                let Some(Command { req, reply }) = cmd else {
                    continue;
                };
                match dispatch(req, &mut tree).await {
                    Some(resp) => {
                        let _ = reply.send(resp);
                    }
                    None => {
                        tracing::info!("shutdown command received");
                        break;
                    }
                }
            }
            accept = listener.accept() => {
                if let Ok((stream, _)) = accept {
                    tokio::spawn(handle_connection(stream, commands.clone()));
                }
            }
        }
    }

    tree.stop().await;
    let _ = fs::remove_file(&opts.socket_path);
    let _ = fs::remove_file(&opts.pid_file);
    tracing::info!("daemon stopped");
    Ok(())
}

async fn handle_connection(stream: UnixStream, commands: mpsc::Sender<Command>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    let read = tokio::time::timeout(
        CLIENT_READ_TIMEOUT,
        BufReader::new(read_half).read_line(&mut line),
    )
    .await;
    if !matches!(read, Ok(Ok(_))) || line.trim().is_empty() {
        return;
    }

    let response = match protocol::parse_line(line.trim_end()) {
        Err(resp) => resp,
        Ok(req) => {
            let (reply, inbox) = oneshot::channel();
            if commands.send(Command { req, reply }).await.is_err() {
                return;
            }
            match inbox.await {
                Ok(resp) => resp,
                // Shutdown: the connection drops, the process exits before replying.
                Err(_) => return,
            }
        }
    };

    if let Ok(mut body) = serde_json::to_string(&response) {
        body.push('\n');
        let _ = write_half.write_all(body.as_bytes()).await;
    }
}

/// Per-command errors become failure responses; one bad command never
/// crashes the daemon or any other supervised service. `None` means the
/// daemon should shut down.
async fn dispatch(req: Request, tree: &mut SupervisionTree) -> Option<Response> {
    let resp = match req {
        Request::Add { name, cmd, cwd } => {
            match tree.add(&name, &cmd, cwd.as_deref().map(std::path::Path::new)) {
                Ok(()) => Response::message(format!("added {name}")),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::Remove { name } => match tree.remove(&name).await {
            Ok(()) => Response::message(format!("removed {name}")),
            Err(e) => Response::error(e.to_string()),
        },
        Request::Status => Response::services(tree.status()),
        Request::Ping => Response::message("pong"),
        Request::Shutdown => return None,
    };
    Some(resp)
}
