use std::{
    borrow::Cow,
    fs,
    io::ErrorKind,
    os::fd::{AsFd, OwnedFd},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::SystemTime,
};

use log::{error, info, warn};
use rustix::{
    io::{read, write, Errno},
    net::{accept, bind_unix, listen, socket, AddressFamily, SocketAddrUnix, SocketType},
};

use crate::{format, history::History, x::X, CliError, IoErr};

/// Creates the daemon's listening socket, replacing any stale file left
/// behind by a previous run.
pub fn bind(socket_file: &Path) -> Result<OwnedFd, CliError> {
    let addr = {
        match fs::remove_file(socket_file) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            r => r,
        }
        .map_io_err(|| format!("Failed to remove old socket: {socket_file:?}"))?;

        SocketAddrUnix::new(socket_file)
            .map_io_err(|| format!("Failed to make socket address: {socket_file:?}"))?
    };

    let socket = socket(AddressFamily::UNIX, SocketType::STREAM, None)
        .map_io_err(|| format!("Failed to create socket: {socket_file:?}"))?;
    bind_unix(&socket, &addr).map_io_err(|| format!("Failed to bind socket: {socket_file:?}"))?;
    listen(&socket, -1).map_io_err(|| format!("Failed to listen for clients: {socket_file:?}"))?;

    info!("Listening on socket {socket_file:?}.");
    Ok(socket)
}

/// Serves connections one at a time until the listener is shut down. Each
/// connection carries a single newline-terminated command and gets a single
/// textual reply.
pub fn serve(listener: &OwnedFd, history: &History, x: &X, shutdown: &AtomicBool) {
    loop {
        let conn = match accept(listener) {
            Ok(conn) => conn,
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    info!("IPC listener closed.");
                } else {
                    error!("Failed to accept IPC connection: {e}");
                }
                return;
            }
        };

        if let Err(e) = handle_connection(&conn, history, x) {
            warn!("Error handling IPC connection: {e}");
        }
    }
}

fn handle_connection(conn: &OwnedFd, history: &History, x: &X) -> Result<(), CliError> {
    let mut buf = [0; 256];
    let n = loop {
        match read(conn, &mut buf) {
            Err(Errno::INTR) => {}
            r => break r.map_io_err(|| "Failed to read from IPC connection.")?,
        }
    };

    let newline = buf[..n]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(CliError::Internal {
            context: "No newline terminator in IPC command.".into(),
        })?;
    let reply = dispatch(&buf[..newline], history, x);
    write_all(conn, reply.as_bytes())
}

enum Command<'a> {
    Get,
    Sel(Cow<'a, str>),
    Invalid,
    Unknown,
}

fn parse(command: &[u8]) -> Command {
    // Commands are named by their first three bytes.
    if command.len() < 3 {
        return Command::Invalid;
    }
    match &command[..3] {
        b"GET" => Command::Get,
        b"SEL" => Command::Sel(String::from_utf8_lossy(&command[3..])),
        _ => Command::Unknown,
    }
}

fn dispatch(command: &[u8], history: &History, x: &X) -> String {
    match parse(command) {
        Command::Get => get_response(history, SystemTime::now()),
        Command::Sel(line) => match history.find(&line, SystemTime::now()) {
            Ok(clip) => {
                history.set_selected(clip);
                match x.become_selection_owner() {
                    Ok(()) => "OK".to_owned(),
                    Err(e) => format!("ERR Could not become owner: {e}"),
                }
            }
            Err(e) => format!("ERR Not found: {e}"),
        },
        Command::Invalid => "ERR Invalid command".to_owned(),
        Command::Unknown => "ERR Unknown command".to_owned(),
    }
}

fn get_response(history: &History, now: SystemTime) -> String {
    let mut response = history.format(|clip| format::line(clip, now)).join("\n");
    response.push('\n');
    response
}

fn write_all(fd: impl AsFd, mut buf: &[u8]) -> Result<(), CliError> {
    while !buf.is_empty() {
        match write(&fd, buf) {
            Ok(0) => {
                return Err(CliError::Internal {
                    context: "IPC connection closed mid-write.".into(),
                });
            }
            Ok(n) => buf = &buf[n..],
            Err(Errno::INTR) => {}
            Err(e) => return Err(e).map_io_err(|| "Failed to write to IPC connection."),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Clip, ClipFormat};

    #[test]
    fn parses_commands_by_their_first_three_bytes() {
        assert!(matches!(parse(b"GET"), Command::Get));
        assert!(matches!(parse(b"GET extra"), Command::Get));
        assert!(matches!(parse(b"SEL [ 0s ago] x"), Command::Sel(_)));
        assert!(matches!(parse(b"GE"), Command::Invalid));
        assert!(matches!(parse(b""), Command::Invalid));
        assert!(matches!(parse(b"NOPE"), Command::Unknown));
    }

    #[test]
    fn sel_keeps_the_rest_of_the_line() {
        let Command::Sel(line) = parse(b"SEL [ 0s ago] body") else {
            panic!("expected SEL");
        };
        assert_eq!(line, " [ 0s ago] body");
    }

    #[test]
    fn get_lists_every_entry_with_a_trailing_newline() {
        let history = History::new(4, vec!["always".to_owned()]);
        let now = SystemTime::now();
        history.append(Clip::new(now, b"content".as_slice(), ClipFormat::String, "test"));

        let response = get_response(&history, now);
        assert!(response.ends_with('\n'));

        let lines: Vec<&str> = response.split_terminator('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.len() == format::LINE_LEN));
        assert!(lines[0].contains("content"));
        assert!(lines[1].contains("always"));
    }

    #[test]
    fn empty_history_yields_a_bare_newline() {
        let history = History::new(4, Vec::new());
        assert_eq!(get_response(&history, SystemTime::now()), "\n");
    }
}
