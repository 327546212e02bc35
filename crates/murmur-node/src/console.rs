//! Line-oriented command console on stdin.
//!
//! Each line maps to one [`NodeHandle`] call. Events are printed elsewhere,
//! the console only reports command errors.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use murmur_net::NodeHandle;
use murmur_shared::types::SessionId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect(Target),
    Send { session: SessionId, text: String },
    Files { session: SessionId, paths: Vec<PathBuf> },
    Respond { session: SessionId, accept: bool },
    Cancel(SessionId),
    Name(String),
    Avatar(Option<PathBuf>),
    Contact { session: SessionId, name: String },
    Verify(SessionId),
    Forget(SessionId),
    Clear(SessionId),
    Seen(SessionId),
    Focus(Option<SessionId>),
    Foreground(bool),
    List,
    History { session: SessionId, offset: usize },
    Open { file: Uuid, dir: PathBuf },
    PeerAvatar { session: SessionId, path: PathBuf },
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Ip(IpAddr),
    Addr(SocketAddr),
}

const HELP: &str = "commands: connect <ip>[:port] | send <id> <text> | files <id> <path>... | \
accept <id> | refuse <id> | cancel <id> | name <name> | avatar <path>|none | \
contact <id> <name> | verify <id> | forget <id> | clear <id> | seen <id> | \
focus <id>|none | fg on|off | list | history <id> [offset] | open <file-id> [dir] | \
face <id> <path> | quit";

/// Records printed per `history` call.
const HISTORY_PAGE: usize = 20;

fn session(arg: Option<&str>) -> Result<SessionId, String> {
    let raw = arg.ok_or("missing session id")?;
    raw.parse::<u64>()
        .map(SessionId)
        .map_err(|_| format!("invalid session id: {raw}"))
}

fn rest(arg: &str) -> Result<String, String> {
    let text = arg.trim();
    if text.is_empty() {
        Err("missing argument".to_string())
    } else {
        Ok(text.to_string())
    }
}

/// Parse one console line.
pub fn parse_line(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (verb, tail) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let tail = tail.trim_start();

    // commands taking "<id> <free text>"
    let id_and_text = || -> Result<(SessionId, String), String> {
        let (id, text) = tail.split_once(char::is_whitespace).unwrap_or((tail, ""));
        Ok((session(Some(id))?, rest(text)?))
    };
    let id_only = || session(tail.split_whitespace().next());

    match verb {
        "connect" => {
            let target = rest(tail)?;
            if let Ok(addr) = target.parse::<SocketAddr>() {
                Ok(ConsoleCommand::Connect(Target::Addr(addr)))
            } else if let Ok(ip) = target.parse::<IpAddr>() {
                Ok(ConsoleCommand::Connect(Target::Ip(ip)))
            } else {
                Err(format!("invalid address: {target}"))
            }
        }
        "send" => {
            let (session, text) = id_and_text()?;
            Ok(ConsoleCommand::Send { session, text })
        }
        "files" => {
            let mut parts = tail.split_whitespace();
            let session = session(parts.next())?;
            let paths: Vec<PathBuf> = parts.map(PathBuf::from).collect();
            if paths.is_empty() {
                return Err("no files given".to_string());
            }
            Ok(ConsoleCommand::Files { session, paths })
        }
        "accept" => Ok(ConsoleCommand::Respond { session: id_only()?, accept: true }),
        "refuse" => Ok(ConsoleCommand::Respond { session: id_only()?, accept: false }),
        "cancel" => Ok(ConsoleCommand::Cancel(id_only()?)),
        "name" => Ok(ConsoleCommand::Name(rest(tail)?)),
        "avatar" => match rest(tail)?.as_str() {
            "none" => Ok(ConsoleCommand::Avatar(None)),
            path => Ok(ConsoleCommand::Avatar(Some(PathBuf::from(path)))),
        },
        "contact" => {
            let (session, name) = id_and_text()?;
            Ok(ConsoleCommand::Contact { session, name })
        }
        "verify" => Ok(ConsoleCommand::Verify(id_only()?)),
        "forget" => Ok(ConsoleCommand::Forget(id_only()?)),
        "clear" => Ok(ConsoleCommand::Clear(id_only()?)),
        "seen" => Ok(ConsoleCommand::Seen(id_only()?)),
        "focus" => match tail.trim() {
            "none" | "" => Ok(ConsoleCommand::Focus(None)),
            id => Ok(ConsoleCommand::Focus(Some(session(Some(id))?))),
        },
        "fg" => match tail.trim() {
            "on" => Ok(ConsoleCommand::Foreground(true)),
            "off" => Ok(ConsoleCommand::Foreground(false)),
            other => Err(format!("expected on|off, got {other:?}")),
        },
        "list" => Ok(ConsoleCommand::List),
        "history" => {
            let mut parts = tail.split_whitespace();
            let session = session(parts.next())?;
            let offset = match parts.next() {
                Some(raw) => raw.parse::<usize>().map_err(|_| format!("invalid offset: {raw}"))?,
                None => 0,
            };
            Ok(ConsoleCommand::History { session, offset })
        }
        "open" => {
            let mut parts = tail.split_whitespace();
            let raw = parts.next().ok_or("missing file id")?;
            let file = Uuid::parse_str(raw).map_err(|_| format!("invalid file id: {raw}"))?;
            let dir = parts.next().map_or_else(|| PathBuf::from("."), PathBuf::from);
            Ok(ConsoleCommand::Open { file, dir })
        }
        "face" => {
            let (session, path) = id_and_text()?;
            Ok(ConsoleCommand::PeerAvatar { session, path: PathBuf::from(path) })
        }
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "" => Err(HELP.to_string()),
        other => Err(format!("unknown command {other:?}\n{HELP}")),
    }
}

/// Run one command. Returns `false` once the console should stop.
pub async fn execute(handle: &NodeHandle, command: ConsoleCommand) -> anyhow::Result<bool> {
    match command {
        ConsoleCommand::Connect(Target::Ip(ip)) => handle.connect(ip).await?,
        ConsoleCommand::Connect(Target::Addr(addr)) => handle.connect_addr(addr).await?,
        ConsoleCommand::Send { session, text } => handle.send_text(session, text).await?,
        ConsoleCommand::Files { session, paths } => handle.send_files(session, paths).await?,
        ConsoleCommand::Respond { session, accept } => {
            handle.respond_large_files(session, accept).await?
        }
        ConsoleCommand::Cancel(session) => handle.cancel_transfer(session).await?,
        ConsoleCommand::Name(name) => handle.change_name(name).await?,
        ConsoleCommand::Avatar(None) => handle.change_avatar(None).await?,
        ConsoleCommand::Avatar(Some(path)) => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading avatar {}", path.display()))?;
            handle.change_avatar(Some(data)).await?
        }
        ConsoleCommand::Contact { session, name } => handle.set_as_contact(session, name).await?,
        ConsoleCommand::Verify(session) => handle.set_verified(session).await?,
        ConsoleCommand::Forget(session) => handle.remove_contact(session).await?,
        ConsoleCommand::Clear(session) => handle.delete_conversation(session).await?,
        ConsoleCommand::Seen(session) => handle.mark_seen(session).await?,
        ConsoleCommand::Focus(session) => handle.set_focus(session).await?,
        ConsoleCommand::Foreground(on) => handle.set_foreground(on).await?,
        ConsoleCommand::List => {
            for summary in handle.list_sessions().await? {
                println!("{}", serde_json::to_string(&summary)?);
            }
        }
        ConsoleCommand::History { session, offset } => {
            for record in handle.load_history(session, offset, HISTORY_PAGE).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        ConsoleCommand::Open { file, dir } => {
            let (name, content) = handle
                .open_file(file)
                .await?
                .with_context(|| format!("no file {file}"))?;
            let path = save_target(&dir, &name);
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "File saved");
        }
        ConsoleCommand::PeerAvatar { session, path } => {
            let data = handle
                .peer_avatar(session)
                .await?
                .with_context(|| format!("session {session} has no avatar"))?;
            tokio::fs::write(&path, data)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Where a received file lands: only the final component of the peer's name is used.
fn save_target(dir: &Path, name: &str) -> PathBuf {
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "file".into());
    dir.join(file_name)
}

/// Read commands from stdin until EOF, `quit`, or the node stops.
pub async fn run(handle: NodeHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(msg) => {
                eprintln!("{msg}");
                continue;
            }
        };
        match execute(&handle, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(error = %e, "Command failed");
                if matches!(
                    e.downcast_ref::<murmur_net::NetError>(),
                    Some(murmur_net::NetError::NodeStopped)
                ) {
                    break;
                }
            }
        }
    }

    Ok(())
}
