//! Line-based host shell. Commands come in on stdin; events go out on stdout
//! as one JSON object per line.

use std::path::PathBuf;

use anyhow::Context;
use chatblue_core::Event;
use chatblue_link::Supervisor;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

const HELP: &str = "commands: /scan /stop /peers /clear /connect <id> /disconnect \
/server [uuid] /unserve /status /file <path> /quit; anything else is sent as text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    StopScan,
    Peers,
    ClearPeers,
    Connect(String),
    Disconnect,
    Serve(Option<String>),
    StopServe,
    Status,
    SendFile(PathBuf),
    SendText(String),
    Help,
    Quit,
}

/// Parse one input line. `None` for blank lines.
pub fn parse(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(Command::SendText(line.to_string())));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    let arg = (!arg.is_empty()).then(|| arg.to_string());
    let cmd = match (name, arg) {
        ("scan", None) => Command::Scan,
        ("stop", None) => Command::StopScan,
        ("peers", None) => Command::Peers,
        ("clear", None) => Command::ClearPeers,
        ("connect", Some(id)) => Command::Connect(id),
        ("disconnect", None) => Command::Disconnect,
        ("server", identity) => Command::Serve(identity),
        ("unserve", None) => Command::StopServe,
        ("status", None) => Command::Status,
        ("file", Some(path)) => Command::SendFile(PathBuf::from(path)),
        ("help", _) => Command::Help,
        ("quit" | "exit", None) => Command::Quit,
        ("connect" | "file", None) => return Some(Err(format!("/{name} needs an argument"))),
        _ => return Some(Err(format!("unknown command: /{name}"))),
    };
    Some(Ok(cmd))
}

fn print_line(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{s}"),
        Err(e) => warn!("could not encode output: {e}"),
    }
}

/// Forward every supervisor event to stdout until the sink closes.
pub async fn print_events(mut events: UnboundedReceiver<Event>) {
    while let Some(ev) = events.recv().await {
        print_line(&ev);
    }
}

/// Execute one command. Returns false when the shell should exit.
pub async fn execute(sup: &Supervisor, cmd: Command) -> bool {
    match cmd {
        Command::Scan => sup.start_discovery(),
        Command::StopScan => sup.stop_discovery(),
        Command::Peers => print_line(&json!({ "peers": sup.known_peers() })),
        Command::ClearPeers => sup.clear_peers(),
        Command::Connect(id) => sup.connect(&id),
        Command::Disconnect => sup.disconnect(),
        Command::Serve(identity) => sup.start_server(identity.as_deref()),
        Command::StopServe => sup.stop_server(),
        Command::Status => print_line(&json!({
            "state": sup.state(),
            "connected": sup.is_connected(),
        })),
        Command::SendFile(path) => match tokio::fs::read(&path).await {
            Ok(bytes) => {
                info!(path = %path.display(), len = bytes.len(), "sending file");
                sup.send_binary(bytes);
            }
            Err(e) => print_line(&json!({
                "event": "shellError",
                "message": format!("{}: {e}", path.display()),
            })),
        },
        Command::SendText(text) => sup.send_text(&text),
        Command::Help => print_line(&json!({ "help": HELP })),
        Command::Quit => return false,
    }
    true
}

/// Read commands from stdin until EOF or `/quit`.
pub async fn run(sup: Supervisor) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match parse(&line) {
            None => {}
            Some(Ok(cmd)) => {
                if !execute(&sup, cmd).await {
                    break;
                }
            }
            Some(Err(msg)) => print_line(&json!({ "event": "shellError", "message": msg })),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_text() {
        assert_eq!(parse("/scan"), Some(Ok(Command::Scan)));
        assert_eq!(
            parse("/connect 192.168.1.5:8988"),
            Some(Ok(Command::Connect("192.168.1.5:8988".into())))
        );
        assert_eq!(parse("/server"), Some(Ok(Command::Serve(None))));
        assert_eq!(
            parse("/server 3f4d0001-8b99-4fdd-a17b-9b0a4a97d0c7"),
            Some(Ok(Command::Serve(Some(
                "3f4d0001-8b99-4fdd-a17b-9b0a4a97d0c7".into()
            ))))
        );
        assert_eq!(
            parse("/file  /tmp/a b.png"),
            Some(Ok(Command::SendFile(PathBuf::from("/tmp/a b.png"))))
        );
        assert_eq!(
            parse("hello there  "),
            Some(Ok(Command::SendText("hello there  ".into())))
        );
        assert_eq!(parse("   "), None);
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(matches!(parse("/connect"), Some(Err(_))));
        assert!(matches!(parse("/bogus"), Some(Err(m)) if m.contains("bogus")));
    }
}
