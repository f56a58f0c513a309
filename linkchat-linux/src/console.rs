//! Line-oriented console: commands on stdin, events on stdout.

use std::path::PathBuf;

use linkchat_core::{Event, MacAddr};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::engine::{ChatTarget, Engine};

const HELP: &str = "\
commands:
  /list                      known peers
  /msg <n> <text>            private message to peer n
  /send <n> <path>           offer a file to peer n
  /sendfolder <n> <path>     offer a folder to peer n
  /accept <mac>              accept a pending offer
  /reject <mac>              drop a pending offer
  /alias <n> <name>          rename peer n
  /transfers                 receptions in progress
  /quit
  anything else is broadcast to every peer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    List,
    Transfers,
    Quit,
    Broadcast(String),
    Msg { position: usize, text: String },
    Send { position: usize, path: PathBuf },
    SendFolder { position: usize, path: PathBuf },
    Accept(MacAddr),
    Reject(MacAddr),
    Alias { position: usize, name: String },
}

/// Parse one input line. Blank lines yield `Ok(None)`; errors carry a usage hint.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Broadcast(line.to_string())));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    let cmd = match name {
        "help" => Command::Help,
        "list" => Command::List,
        "transfers" => Command::Transfers,
        "quit" | "exit" => Command::Quit,
        "msg" => {
            let (position, text) = position_and_rest(args, "/msg <n> <text>")?;
            Command::Msg { position, text }
        }
        "send" => {
            let (position, path) = position_and_rest(args, "/send <n> <path>")?;
            Command::Send {
                position,
                path: PathBuf::from(path),
            }
        }
        "sendfolder" => {
            let (position, path) = position_and_rest(args, "/sendfolder <n> <path>")?;
            Command::SendFolder {
                position,
                path: PathBuf::from(path),
            }
        }
        "alias" => {
            let (position, name) = position_and_rest(args, "/alias <n> <name>")?;
            Command::Alias { position, name }
        }
        "accept" => Command::Accept(
            args.parse()
                .map_err(|_| "usage: /accept <mac>".to_string())?,
        ),
        "reject" => Command::Reject(
            args.parse()
                .map_err(|_| "usage: /reject <mac>".to_string())?,
        ),
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(cmd))
}

fn position_and_rest(args: &str, usage: &str) -> Result<(usize, String), String> {
    let (n, rest) = args
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("usage: {usage}"))?;
    let position = n.parse().map_err(|_| format!("usage: {usage}"))?;
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(format!("usage: {usage}"));
    }
    Ok((position, rest.to_string()))
}

/// Read commands until /quit or end of input. Events print concurrently.
pub async fn run_console(engine: Engine, events: mpsc::UnboundedReceiver<Event>) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_events(engine.clone(), events));
    println!("link-chat on {} ({:?} mode). /help for commands.", engine.local_address(), engine.settings().accept_mode);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(cmd)) => {
                if let Err(e) = execute(&engine, cmd).await {
                    println!("error: {e}");
                }
            }
            Err(usage) => println!("{usage}"),
        }
    }
    printer.abort();
    Ok(())
}

async fn execute(engine: &Engine, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Help => println!("{HELP}"),
        Command::List => {
            let peers = engine.list_peers();
            if peers.is_empty() {
                println!("no peers yet");
            }
            for p in peers {
                println!("[{}] {} ({}) {}", p.position, p.alias, p.address, p.id);
            }
        }
        Command::Transfers => {
            let receptions = engine.receptions();
            if receptions.is_empty() {
                println!("no receptions in progress");
            }
            for r in receptions {
                let pct = if r.total == 0 {
                    100
                } else {
                    r.received * 100 / r.total
                };
                println!(
                    "'{}' from {}: {}/{} bytes ({pct}%)",
                    r.name,
                    engine.alias_of(&r.from),
                    r.received,
                    r.total
                );
            }
        }
        Command::Quit => {}
        Command::Broadcast(text) => engine.send_chat(ChatTarget::Broadcast, &text).await?,
        Command::Msg { position, text } => {
            engine.send_chat(ChatTarget::Peer(position), &text).await?
        }
        Command::Send { position, path } => {
            engine.send_file(position, &path).await?;
            println!("offered {}", path.display());
        }
        Command::SendFolder { position, path } => {
            engine.send_folder(position, &path).await?;
            println!("offered folder {}", path.display());
        }
        Command::Accept(from) => engine.accept_transfer(from).await?,
        Command::Reject(from) => engine.reject_transfer(from)?,
        Command::Alias { position, name } => engine.set_alias(position, &name)?,
    }
    Ok(())
}

async fn print_events(engine: Engine, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        println!("{}", render(&engine, &event));
    }
}

fn render(engine: &Engine, event: &Event) -> String {
    match event {
        Event::PeerDiscovered { id, address } => format!("* new peer {address} ({id})"),
        Event::ChatMessage {
            from,
            private,
            text,
        } => {
            let scope = if *private { "private" } else { "all" };
            format!("<{}> [{scope}] {text}", engine.alias_of(from))
        }
        Event::FileOffered {
            from,
            name,
            size,
            is_folder,
        } => format!(
            "* {} offers {} '{name}' ({size} bytes). /accept {from} or /reject {from}",
            engine.alias_of(from),
            if *is_folder { "folder" } else { "file" }
        ),
        Event::TransferStarted { peer, name } => {
            format!("* transfer of '{name}' with {} started", engine.alias_of(peer))
        }
        Event::FileReceived { from, name, path } => format!(
            "* received '{name}' from {} -> {}",
            engine.alias_of(from),
            path.display()
        ),
        Event::FolderReceived { from, name, path } => format!(
            "* received folder '{name}' from {} -> {}",
            engine.alias_of(from),
            path.display()
        ),
        Event::FileSent { to, name } => format!("* sent '{name}' to {}", engine.alias_of(to)),
        Event::Error(msg) => format!("! {msg}"),
        Event::LinkDown(msg) => format!("! link down: {msg}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_text_is_broadcast() {
        assert_eq!(
            parse("  hello all ").unwrap(),
            Some(Command::Broadcast("hello all".into()))
        );
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn commands_with_arguments() {
        assert_eq!(
            parse("/msg 2 see you at noon").unwrap(),
            Some(Command::Msg {
                position: 2,
                text: "see you at noon".into()
            })
        );
        assert_eq!(
            parse("/send 0 /tmp/My File.pdf").unwrap(),
            Some(Command::Send {
                position: 0,
                path: PathBuf::from("/tmp/My File.pdf")
            })
        );
        assert_eq!(
            parse("/sendfolder 1 photos").unwrap(),
            Some(Command::SendFolder {
                position: 1,
                path: PathBuf::from("photos")
            })
        );
        assert_eq!(
            parse("/accept 02-00-00-00-00-ee").unwrap(),
            Some(Command::Accept(MacAddr::new([2, 0, 0, 0, 0, 0xee])))
        );
        assert_eq!(
            parse("/alias 0 lab bench").unwrap(),
            Some(Command::Alias {
                position: 0,
                name: "lab bench".into()
            })
        );
        assert_eq!(parse("/quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn bad_input_yields_usage() {
        assert!(parse("/msg two hi").unwrap_err().contains("usage"));
        assert!(parse("/msg 2").unwrap_err().contains("usage"));
        assert!(parse("/accept nope").unwrap_err().contains("usage"));
        assert!(parse("/reject").unwrap_err().contains("usage"));
        assert!(parse("/frobnicate").unwrap_err().contains("unknown"));
    }
}
