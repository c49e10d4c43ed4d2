//! Socket client utilities: send one command, await one response, and poll
//! for socket readiness with a bounded timeout.

use anyhow::{Context, Result, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::protocol::{Request, Response};

pub const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

pub fn send(socket_path: &Path, req: &Request) -> Result<Response> {
    let mut stream = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let mut line = serde_json::to_string(req)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;

    let mut buf = String::new();
    BufReader::new(stream).read_line(&mut buf)?;
    if buf.trim().is_empty() {
        bail!("connection closed without a response");
    }
    Ok(serde_json::from_str(buf.trim_end())?)
}

/// The daemon exits on `shutdown` without replying, so the dropped
/// connection is the expected outcome here.
pub fn send_shutdown(socket_path: &Path) -> Result<()> {
    let mut stream = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let mut line = serde_json::to_string(&Request::Shutdown)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    let mut buf = String::new();
    let _ = BufReader::new(stream).read_line(&mut buf);
    Ok(())
}

/// Polls the socket with a small growing delay until a ping round-trips,
/// failing once `timeout` has elapsed.
pub fn wait_ready(socket_path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let mut delay = Duration::from_millis(30);

    while start.elapsed() < timeout {
        if let Ok(resp) = send(socket_path, &Request::Ping)
            && resp.ok
        {
            return Ok(());
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(250));
    }

    bail!("daemon failed to start within {}ms", timeout.as_millis())
}
