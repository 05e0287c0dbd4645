//! End-to-end tests that drive the daemon against a live X session.
//!
//! These need an X server and `xclip` on the PATH; run them explicitly with
//! `cargo test -- --ignored`.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

const SOCKET: &str = "/tmp/clipclop-test.sock";

struct Daemon(Child);

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_daemon() -> Daemon {
    let child = Command::new(env!("CARGO_BIN_EXE_clipclop"))
        .args(["--socket", SOCKET, "-n", "50"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start daemon");
    // Give it a moment to claim the socket and register with the X server.
    thread::sleep(Duration::from_millis(500));
    Daemon(child)
}

fn send_command(command: &str) -> String {
    let mut conn = UnixStream::connect(SOCKET).expect("failed to connect to socket");
    conn.write_all(command.as_bytes()).unwrap();
    let mut out = String::new();
    conn.read_to_string(&mut out).unwrap();
    out.trim_matches('\n').to_owned()
}

fn copy_with_xclip(value: &str) {
    let mut child = Command::new("xclip")
        .args(["-i", "-selection", "clipboard"])
        .stdin(Stdio::piped())
        .spawn()
        .expect("failed to run xclip");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(value.as_bytes())
        .unwrap();
    assert!(child.wait().unwrap().success());
    // Wait for the selection events to trickle through.
    thread::sleep(Duration::from_secs(1));
}

fn paste_with_xclip() -> String {
    let out = Command::new("xclip")
        .args(["-o", "-selection", "primary"])
        .output()
        .expect("failed to run xclip");
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
#[ignore = "requires a live X session and xclip"]
fn captures_and_selects_clips() {
    let _daemon = start_daemon();

    copy_with_xclip("bla"); // below the minimum clip size, discarded
    copy_with_xclip("blaa");
    copy_with_xclip("hello world");
    copy_with_xclip("wee %*21");

    let listing = send_command("GET\n");
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("wee %*21"));
    assert!(lines[1].contains("hello world"));
    assert!(lines[2].contains("blaa"));

    // Selecting the second line makes its clip the one pasted everywhere,
    // including through the primary selection.
    assert_eq!(send_command(&format!("SEL {}\n", lines[1])), "OK");
    assert_eq!(paste_with_xclip(), "hello world");
}

#[test]
#[ignore = "requires a live X session and xclip"]
fn a_new_copy_overrides_the_selected_clip() {
    let _daemon = start_daemon();

    copy_with_xclip("hello world");
    copy_with_xclip("another world");

    let listing = send_command("GET\n");
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(send_command(&format!("SEL {}\n", lines[1])), "OK");

    copy_with_xclip("third world");
    assert_eq!(paste_with_xclip(), "third world");
}

#[test]
#[ignore = "requires a live X session and xclip"]
fn large_clips_round_trip_through_incr() {
    let _daemon = start_daemon();

    let value = "1234567890".repeat(100 * 1024);
    copy_with_xclip(&value);

    let listing = send_command("GET\n");
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 1);

    assert_eq!(send_command(&format!("SEL {}\n", lines[0])), "OK");
    assert_eq!(paste_with_xclip(), value);
}
