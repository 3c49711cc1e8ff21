//! Real re-exec: a running `molt-server` gets `SIGHUP`, its successor takes
//! over the echo connections, the old process exits.

#![cfg(target_os = "linux")]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn spawn_server(dir: &Path, control_port: u16) -> (Child, PathBuf, PathBuf) {
    let pid_file = dir.join("main.pid");
    let socket = dir.join("echo.sock");
    let child = Command::new(env!("CARGO_BIN_EXE_molt-server"))
        .arg("--pid-file")
        .arg(&pid_file)
        .current_dir(dir)
        .env("MOLT_CONTROL_ADDR", format!("127.0.0.1:{control_port}"))
        .env("MOLT_ECHO_NETWORK", "unix")
        .env("MOLT_ECHO_ADDR", &socket)
        .env("MOLT_PROBE_TIMEOUT_MS", "300")
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap();
    (child, pid_file, socket)
}

/// Wait until the pid file holds a pid other than `not`.
async fn wait_for_pid(pid_file: &Path, not: Option<u32>, within: Duration) -> u32 {
    let deadline = Instant::now() + within;
    loop {
        if let Ok(contents) = std::fs::read_to_string(pid_file) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if Some(pid) != not {
                    return pid;
                }
            }
        }
        assert!(Instant::now() < deadline, "pid file not updated in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(rc, 0, "kill({pid}, {signal}) failed");
}

struct Client {
    io: BufReader<UnixStream>,
}

impl Client {
    async fn connect(socket: &Path) -> Self {
        Self {
            io: BufReader::new(UnixStream::connect(socket).await.unwrap()),
        }
    }

    async fn exchange(&mut self, text: &str) -> Result<u32, String> {
        self.io
            .get_mut()
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| format!("write: {e}"))?;
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(10), self.io.read_line(&mut line))
            .await
            .map_err(|_| "read timed out".to_string())?
            .map_err(|e| format!("read: {e}"))?;
        if n == 0 {
            return Err("connection closed".to_string());
        }
        let (tag, rest) = line
            .strip_prefix('[')
            .and_then(|l| l.split_once(']'))
            .ok_or_else(|| format!("untagged reply {line:?}"))?;
        if rest != format!("echo {text}\n") {
            return Err(format!("wrong reply {line:?}"));
        }
        tag.parse().map_err(|_| format!("bad tag in {line:?}"))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sighup_moves_connections_to_successor() {
    let dir = tempfile::tempdir().unwrap();
    let (mut first, pid_file, socket) = spawn_server(dir.path(), unused_port());

    let pid_a = wait_for_pid(&pid_file, None, Duration::from_secs(20)).await;
    assert_eq!(Some(pid_a), first.id());

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = Client::connect(&socket).await;
        assert_eq!(client.exchange(&format!("c{i}-hello")).await, Ok(pid_a));
        clients.push(client);
    }

    send_signal(pid_a, libc::SIGHUP);

    // Keep talking through the switch.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut round = 0u32;
    let mut switched = [false; 3];
    let pid_b = loop {
        for (i, client) in clients.iter_mut().enumerate() {
            let tag = client
                .exchange(&format!("c{i}-{round}"))
                .await
                .expect("client saw an I/O error during the upgrade");
            if tag != pid_a {
                switched[i] = true;
            } else {
                assert!(!switched[i], "client {i} went back to the old generation");
            }
        }
        round += 1;

        if let Ok(Some(_)) = first.try_wait() {
            break wait_for_pid(&pid_file, Some(pid_a), Duration::from_secs(5)).await;
        }
        assert!(Instant::now() < deadline, "old generation did not exit");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_ne!(pid_b, pid_a);

    let status = first.wait().await.unwrap();
    assert!(status.success(), "old generation exited with {status}");

    for (i, client) in clients.iter_mut().enumerate() {
        assert_eq!(client.exchange(&format!("c{i}-after")).await, Ok(pid_b));
    }

    // A plain stop drops the connections without handing them anywhere.
    send_signal(pid_b, libc::SIGTERM);
    let mut line = String::new();
    let n = tokio::time::timeout(Duration::from_secs(10), clients[0].io.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}
