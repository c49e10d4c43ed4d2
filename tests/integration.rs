use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use tend::client;
use tend::protocol::{Request, Response, StatusMap};
use tend::state::Lifecycle;
use tend::tree::{SupervisionTree, TreeEvent};

fn tend_bin() -> PathBuf {
    PathBuf::from(assert_cmd::cargo::cargo_bin!("tend"))
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("timeout waiting for condition");
}

struct DaemonUnderTest {
    _tmp: TempDir,
    root: PathBuf,
    child: Child,
}

impl DaemonUnderTest {
    fn spawn() -> Self {
        Self::spawn_with_shutdown_timeout(1000)
    }

    fn spawn_with_shutdown_timeout(timeout_ms: u64) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let child = Command::new(tend_bin())
            .arg("daemon")
            .arg("--socket")
            .arg(root.join("tend.sock"))
            .arg("--pid-file")
            .arg(root.join("tend.pid"))
            .arg("--log-dir")
            .arg(root.join("log"))
            .arg("--shutdown-timeout-ms")
            .arg(timeout_ms.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");

        let me = Self {
            _tmp: tmp,
            root,
            child,
        };
        client::wait_ready(&me.socket(), Duration::from_millis(5000)).expect("daemon ready");
        me
    }

    fn socket(&self) -> PathBuf {
        self.root.join("tend.sock")
    }

    fn pid_file(&self) -> PathBuf {
        self.root.join("tend.pid")
    }

    fn service_log(&self, name: &str) -> PathBuf {
        self.root.join("log").join(format!("{name}.log"))
    }

    fn send(&self, req: &Request) -> Response {
        client::send(&self.socket(), req).expect("send")
    }

    fn add(&self, name: &str, cmd: &str) -> Response {
        self.send(&Request::Add {
            name: name.to_string(),
            cmd: cmd.to_string(),
            cwd: None,
        })
    }

    fn remove(&self, name: &str) -> Response {
        self.send(&Request::Remove {
            name: name.to_string(),
        })
    }

    fn status(&self) -> StatusMap {
        self.send(&Request::Status).services.expect("services map")
    }

    /// Bypasses the typed client to exercise the raw line protocol.
    fn send_raw(&self, line: &str) -> Response {
        let mut stream = UnixStream::connect(self.socket()).expect("connect");
        stream.write_all(line.as_bytes()).expect("write");
        stream.write_all(b"\n").expect("write newline");
        let mut buf = String::new();
        BufReader::new(stream).read_line(&mut buf).expect("read");
        serde_json::from_str(buf.trim_end()).expect("parse response")
    }
}

impl Drop for DaemonUnderTest {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[test]
fn ping_round_trips_within_the_ready_window() {
    let daemon = DaemonUnderTest::spawn();
    let resp = daemon.send(&Request::Ping);
    assert!(resp.ok);
    assert_eq!(resp.message.as_deref(), Some("pong"));
}

#[test]
fn status_on_empty_tree_is_ok_and_empty() {
    let daemon = DaemonUnderTest::spawn();
    let resp = daemon.send(&Request::Status);
    assert!(resp.ok);
    assert!(resp.services.expect("services map").is_empty());
}

#[test]
fn add_remove_lifecycle_is_reflected_in_status() {
    let daemon = DaemonUnderTest::spawn();

    let resp = daemon.add("svc", "sleep 30");
    assert!(resp.ok);
    assert_eq!(resp.message.as_deref(), Some("added svc"));

    let status = daemon.status();
    let st = status.get("svc").expect("svc in status");
    assert_eq!(st.state, Lifecycle::Up);
    assert!(st.pid.is_some());
    assert_eq!(st.restart_count, 0);

    let resp = daemon.remove("svc");
    assert!(resp.ok);
    assert_eq!(resp.message.as_deref(), Some("removed svc"));
    assert!(daemon.status().is_empty());
}

#[test]
fn duplicate_add_is_rejected_without_duplicating_the_entry() {
    let daemon = DaemonUnderTest::spawn();

    assert!(daemon.add("svc", "sleep 30").ok);
    let second = daemon.add("svc", "sleep 30");
    assert!(!second.ok);
    assert_eq!(second.error.as_deref(), Some("already added: svc"));

    assert_eq!(daemon.status().len(), 1);
}

#[test]
fn remove_unknown_name_fails_and_leaves_status_unchanged() {
    let daemon = DaemonUnderTest::spawn();
    assert!(daemon.add("svc", "sleep 30").ok);

    let resp = daemon.remove("ghost");
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some("not found: ghost"));

    let status = daemon.status();
    assert_eq!(status.len(), 1);
    assert!(status.contains_key("svc"));
}

#[test]
fn malformed_input_yields_invalid_json() {
    let daemon = DaemonUnderTest::spawn();
    let resp = daemon.send_raw("definitely not json");
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some("Invalid JSON"));
}

#[test]
fn unknown_command_is_echoed_in_the_error() {
    let daemon = DaemonUnderTest::spawn();
    let resp = daemon.send_raw(r#"{"command":"dance"}"#);
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some("unknown command: dance"));
}

#[test]
fn add_with_missing_fields_is_reported_not_fatal() {
    let daemon = DaemonUnderTest::spawn();
    let resp = daemon.send_raw(r#"{"command":"add","name":"x"}"#);
    assert!(!resp.ok);
    assert_eq!(resp.error.as_deref(), Some("add requires name and cmd"));

    // The daemon survived the bad command.
    assert!(daemon.send(&Request::Ping).ok);
}

#[test]
fn idle_connection_does_not_stall_the_daemon() {
    let daemon = DaemonUnderTest::spawn();

    // Connect and send nothing; the daemon must keep serving regardless.
    let _idle = UnixStream::connect(daemon.socket()).expect("connect");

    let (tx, rx) = std::sync::mpsc::channel();
    let socket = daemon.socket();
    thread::spawn(move || {
        let _ = tx.send(client::send(&socket, &Request::Ping));
    });
    let resp = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("ping behind an idle connection")
        .expect("ping");
    assert!(resp.ok);

    // The supervision tick keeps running too.
    assert!(daemon.add("crash", "exit 1").ok);
    wait_for(Duration::from_secs(10), || {
        daemon
            .status()
            .get("crash")
            .is_some_and(|st| st.restart_count >= 1)
    });
}

#[test]
fn crash_looping_service_enters_backoff_and_counts_restarts() {
    let daemon = DaemonUnderTest::spawn();
    assert!(daemon.add("crash", "exit 1").ok);

    wait_for(Duration::from_secs(10), || {
        daemon
            .status()
            .get("crash")
            .is_some_and(|st| st.restart_count >= 2)
    });

    let status = daemon.status();
    let st = status.get("crash").expect("crash in status");
    assert_eq!(st.last_exit_code, Some(1));
    assert!(st.restart_count >= 2, "restarts: {}", st.restart_count);
    // No live pid while waiting out the backoff delay.
    if st.state == Lifecycle::Backoff {
        assert_eq!(st.pid, None);
    }
}

#[test]
fn graceful_remove_escalates_to_sigkill_after_the_timeout() {
    let daemon = DaemonUnderTest::spawn_with_shutdown_timeout(1000);
    assert!(daemon.add("stubborn", "trap '' TERM; sleep 30").ok);

    let status = daemon.status();
    let pid = status.get("stubborn").and_then(|st| st.pid).expect("pid");

    let begin = Instant::now();
    let resp = daemon.remove("stubborn");
    assert!(resp.ok);
    assert!(
        begin.elapsed() >= Duration::from_millis(900),
        "remove should wait out the graceful window"
    );
    assert!(daemon.status().is_empty());

    wait_for(Duration::from_secs(2), || !pid_alive(pid));
}

#[test]
fn service_output_is_captured_in_its_log_file() {
    let daemon = DaemonUnderTest::spawn();
    assert!(daemon.add("echoer", "echo hello-from-echoer").ok);

    let log = daemon.service_log("echoer");
    wait_for(Duration::from_secs(5), || {
        fs::read_to_string(&log)
            .map(|s| s.contains("hello-from-echoer"))
            .unwrap_or(false)
    });
}

#[test]
fn shutdown_command_stops_listening_and_removes_files() {
    let mut daemon = DaemonUnderTest::spawn();
    assert!(daemon.add("svc", "sleep 30").ok);

    client::send_shutdown(&daemon.socket()).expect("shutdown");

    wait_for(Duration::from_secs(5), || {
        !daemon.socket().exists() && !daemon.pid_file().exists()
    });
    assert!(client::send(&daemon.socket(), &Request::Ping).is_err());

    let status = daemon.child.wait().expect("daemon exit");
    assert!(status.success(), "daemon should exit 0 after shutdown");
}

#[test]
fn sigterm_runs_the_identical_cleanup_sequence() {
    let mut daemon = DaemonUnderTest::spawn();
    assert!(daemon.add("svc", "sleep 30").ok);
    let child_pid = daemon.status().get("svc").and_then(|st| st.pid).expect("pid");

    kill(Pid::from_raw(daemon.child.id() as i32), Signal::SIGTERM).expect("signal daemon");

    wait_for(Duration::from_secs(5), || {
        !daemon.socket().exists() && !daemon.pid_file().exists()
    });
    let status = daemon.child.wait().expect("daemon exit");
    assert!(status.success(), "daemon should exit 0 on SIGTERM");
    wait_for(Duration::from_secs(5), || !pid_alive(child_pid));
}

#[tokio::test]
async fn tree_crash_cycle_is_observable_through_status() {
    let tmp = TempDir::new().expect("tempdir");
    let mut tree = SupervisionTree::new(tmp.path().join("log"), Some(500), None).expect("tree");
    tree.start().expect("start");
    tree.add("boom", "exit 7", None).expect("add");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        tree.tick();
        let status = tree.status();
        let st = status.get("boom").expect("boom in status");
        if st.state == Lifecycle::Backoff {
            assert!(st.restart_count >= 1);
            assert_eq!(st.last_exit_code, Some(7));
            assert_eq!(st.pid, None);
            break;
        }
        assert!(Instant::now() < deadline, "never entered backoff");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The backoff deadline passes and the child is respawned.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        tree.tick();
        let status = tree.status();
        if status.get("boom").is_some_and(|st| st.is_running()) {
            break;
        }
        assert!(Instant::now() < deadline, "never restarted");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    tree.stop().await;
    assert!(tree.status().is_empty());
}

#[tokio::test]
async fn tree_resets_restart_count_after_the_stability_window() {
    let tmp = TempDir::new().expect("tempdir");
    let mut tree =
        SupervisionTree::new(tmp.path().join("log"), None, Some(200)).expect("tree");
    tree.start().expect("start");

    // Crashes exactly once: the marker only exists on the first run.
    let marker = tmp.path().join("first-run");
    fs::write(&marker, "").expect("marker");
    let cmd = format!(
        "if [ -e {marker} ]; then rm {marker}; exit 1; else sleep 30; fi",
        marker = marker.display()
    );
    tree.add("flaky", &cmd, None).expect("add");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        tree.tick();
        let status = tree.status();
        let st = status.get("flaky").expect("flaky in status");
        if st.restart_count >= 1 {
            break;
        }
        assert!(Instant::now() < deadline, "never crashed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The respawned child outlives the window and the count resets.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        tree.tick();
        let status = tree.status();
        let st = status.get("flaky").expect("flaky in status");
        if st.is_running() && st.restart_count == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "restart count never reset");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    tree.stop().await;
}

#[tokio::test]
async fn tree_remove_succeeds_when_the_child_already_exited() {
    let tmp = TempDir::new().expect("tempdir");
    let mut tree = SupervisionTree::new(tmp.path().join("log"), None, None).expect("tree");
    tree.start().expect("start");
    tree.add("quick", "exit 0", None).expect("add");

    // Let the child exit without a tick, so removal meets a dead process.
    tokio::time::sleep(Duration::from_millis(300)).await;
    tree.remove("quick").await.expect("remove");
    assert!(tree.status().is_empty());
}

#[tokio::test]
async fn tree_notifies_observers_of_start_and_stop() {
    let tmp = TempDir::new().expect("tempdir");
    let mut tree = SupervisionTree::new(tmp.path().join("log"), None, None).expect("tree");
    let mut events = tree.subscribe();

    tree.start().expect("start");
    assert_eq!(events.try_recv().expect("started event"), TreeEvent::Started);

    tree.stop().await;
    assert_eq!(events.try_recv().expect("stopped event"), TreeEvent::Stopped);
}

#[tokio::test]
async fn tree_rejects_spawn_failure_without_registering() {
    let tmp = TempDir::new().expect("tempdir");
    let mut tree = SupervisionTree::new(tmp.path().join("log"), None, None).expect("tree");
    tree.start().expect("start");

    // The log directory path is taken by a file, so the spawn setup fails.
    let blocked = tmp.path().join("log").join("blocked.log");
    fs::create_dir_all(&blocked).expect("block log path");
    assert!(tree.add("blocked", "sleep 30", None).is_err());
    assert!(tree.status().is_empty());
}

struct OrchestratedStack {
    _tmp: TempDir,
    root: PathBuf,
}

impl OrchestratedStack {
    fn new(services_toml: &str) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().to_path_buf();
        fs::write(root.join("services.toml"), services_toml).expect("write config");
        Self { _tmp: tmp, root }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(tend_bin())
            .args(args)
            .arg("--dir")
            .arg(&self.root)
            .output()
            .expect("run tend")
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let out = self.run(args);
        if !out.status.success() {
            panic!(
                "command failed {:?}\nstdout={}\nstderr={}",
                args,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        String::from_utf8_lossy(&out.stdout).to_string()
    }

    fn order_file(&self) -> PathBuf {
        self.root.join("order.txt")
    }

    fn order(&self) -> Vec<String> {
        fs::read_to_string(self.order_file())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn socket(&self) -> PathBuf {
        self.root.join("tend.sock")
    }
}

impl Drop for OrchestratedStack {
    fn drop(&mut self) {
        // Best effort: leave no daemon behind if a test failed mid-way.
        if self.socket().exists() {
            let _ = client::send_shutdown(&self.socket());
        }
    }
}

fn oneshot_stack(root: &std::path::Path, names: &[&str]) -> String {
    let order = root.join("order.txt");
    names
        .iter()
        .map(|name| {
            format!(
                r#"
[[service]]
name = "{name}"
kind = "oneshot"
up = "echo up-{name} >> {order}"
down = "echo down-{name} >> {order}"
"#,
                order = order.display()
            )
        })
        .collect()
}

#[test]
fn start_to_target_then_full_stop_mirrors_declared_order() {
    // Spec scenario: services [a, b, c, d]; start("b") starts [a, b];
    // a later stop() stops [d, c, b, a].
    let stack = OrchestratedStack::new("");
    let toml = oneshot_stack(&stack.root, &["a", "b", "c", "d"]);
    fs::write(stack.root.join("services.toml"), toml).expect("write config");

    stack.run_ok(&["start", "b"]);
    assert_eq!(stack.order(), vec!["up-a", "up-b"]);

    stack.run_ok(&["stop"]);
    assert_eq!(
        stack.order(),
        vec!["up-a", "up-b", "down-d", "down-c", "down-b", "down-a"]
    );
    wait_for(Duration::from_secs(5), || !stack.socket().exists());
}

#[test]
fn mixed_stack_supervises_longruns_and_runs_oneshots_inline() {
    let stack = OrchestratedStack::new("");
    let order = stack.order_file();
    let toml = format!(
        r#"
[[service]]
name = "setup"
kind = "oneshot"
up = "echo up-setup >> {order}"
down = "echo down-setup >> {order}"

[[service]]
name = "web"
kind = "longrun"
command = "sleep 30"

[[service]]
name = "worker"
kind = "longrun"
command = "sleep 30"
"#,
        order = order.display()
    );
    fs::write(stack.root.join("services.toml"), toml).expect("write config");

    stack.run_ok(&["start"]);
    assert_eq!(stack.order(), vec!["up-setup"]);

    let status = client::send(&stack.socket(), &Request::Status)
        .expect("status")
        .services
        .expect("services map");
    assert_eq!(status.len(), 2);
    assert!(status.get("web").is_some_and(|st| st.is_running()));
    assert!(status.get("worker").is_some_and(|st| st.is_running()));

    // Starting again re-runs oneshot ups; duplicate longrun adds are benign.
    stack.run_ok(&["start"]);
    assert_eq!(stack.order(), vec!["up-setup", "up-setup"]);

    let out = stack.run_ok(&["status", "web"]);
    assert!(out.contains("web"), "status output: {out}");
    assert!(!out.contains("worker"), "status output: {out}");

    let unknown = stack.run(&["status", "nope"]);
    assert!(!unknown.status.success());
    assert!(
        String::from_utf8_lossy(&unknown.stderr).contains("unknown service: nope"),
        "stderr: {}",
        String::from_utf8_lossy(&unknown.stderr)
    );

    stack.run_ok(&["stop"]);
    assert_eq!(stack.order(), vec!["up-setup", "up-setup", "down-setup"]);
    wait_for(Duration::from_secs(5), || !stack.socket().exists());
    assert!(client::send(&stack.socket(), &Request::Ping).is_err());
}
