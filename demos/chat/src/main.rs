use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use switchyard::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Line-based chat over a switchyard broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Default log level when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Broker {
        #[arg(short, long, default_value = "127.0.0.1:7700")]
        bind: String,
    },

    /// Join a broker and chat from stdin
    Client {
        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "127.0.0.1:7700")]
        connect: String,
    },
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub text: String,
}

impl Message for Chat {
    const TYPE_NAME: &'static str = "chat.Chat";
}

/// Prints incoming chat lines and membership changes.
struct Printer;

impl PacketListener<Client> for Printer {
    fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<Client>) {
        bindings
            .on::<Chat>(|_, source, chat| println!("<{source}> {}", chat.text))
            .on::<MemberUpdate>(|_, _, update| {
                let verb = if update.connected { "joined" } else { "left" };
                println!("* {} {verb}", update.name);
            });
    }
}

/// Answers messages addressed to the broker itself.
struct Desk;

impl PacketListener<BrokerHandle> for Desk {
    fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<BrokerHandle>) {
        bindings.on::<Chat>(|broker, source, _| {
            let names: Vec<String> = broker.members().iter().map(ToString::to_string).collect();
            let reply = Chat {
                text: format!("online: {}", names.join(", ")),
            };
            if let Err(e) = broker.send_packet(&reply, [source.clone()]) {
                eprintln!("reply to {source} failed: {e}");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Line {
    /// `/quit`
    Quit,
    /// `/who`
    Who,
    /// `@name text`
    Direct(String, String),
    Say(String),
    Empty,
}

fn parse_line(line: &str) -> Line {
    let line = line.trim();
    match line {
        "" => Line::Empty,
        "/quit" => Line::Quit,
        "/who" => Line::Who,
        _ => match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
            Some((name, text)) => Line::Direct(name.to_owned(), text.trim().to_owned()),
            None => Line::Say(line.to_owned()),
        },
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

async fn run_broker(bind: &str) -> Result<(), Box<dyn std::error::Error>> {
    let broker = BrokerBuilder::new()
        .bind(bind)
        .listener(Arc::new(Desk))
        .build()
        .await?;
    eprintln!("broker listening on {}", broker.local_addr()?);

    broker
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn run_client(name: &str, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = ClientBuilder::new(name)
        .listener(Arc::new(Printer))
        .connect(addr)
        .await?;
    eprintln!("connected as {}; `@name text` to whisper, /who, /quit", client.member());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match parse_line(&line) {
            Line::Empty => continue,
            Line::Quit => break,
            Line::Who => {
                let names: Vec<String> = client.members().iter().map(ToString::to_string).collect();
                println!("* {}", names.join(", "));
                continue;
            }
            Line::Direct(to, text) => match client.get_member(&to) {
                Ok(member) => client.send_packet(&Chat { text }, [member]).await,
                Err(e) => {
                    eprintln!("{e}");
                    continue;
                }
            },
            Line::Say(text) => client.send_packet(&Chat { text }, []).await,
        };
        if let Err(e) = sent {
            eprintln!("send failed: {e}");
            break;
        }
    }

    client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    switchyard::logging::init(&cli.log_level)?;

    match cli.command {
        Commands::Broker { bind } => run_broker(&bind).await,
        Commands::Client { name, connect } => run_client(&name, &connect).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_line_commands_and_whispers() {
        assert_eq!(parse_line("  "), Line::Empty);
        assert_eq!(parse_line("/quit"), Line::Quit);
        assert_eq!(parse_line("/who"), Line::Who);
        assert_eq!(
            parse_line("@bob  see you"),
            Line::Direct("bob".into(), "see you".into())
        );
        assert_eq!(parse_line("@bob"), Line::Say("@bob".into()));
        assert_eq!(parse_line("hello"), Line::Say("hello".into()));
    }

    struct Capture(mpsc::UnboundedSender<(String, String)>);

    impl PacketListener<Client> for Capture {
        fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<Client>) {
            bindings.on::<Chat>(move |_, source, chat| {
                let _ = self.0.send((source.to_string(), chat.text.clone()));
            });
        }
    }

    #[tokio::test]
    async fn test_desk_replies_with_online_members() {
        let broker = BrokerBuilder::new()
            .bind("127.0.0.1:0")
            .listener(Arc::new(Desk))
            .build()
            .await
            .unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = broker.run().await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ClientBuilder::new("alice")
            .listener(Arc::new(Capture(tx)))
            .connect(&addr)
            .await
            .unwrap();
        client
            .send_packet(&Chat { text: "/who".into() }, [Member::broker()])
            .await
            .unwrap();

        let (source, text) = tokio::time::timeout(std::time::Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source, Member::BROKER_NAME);
        assert_eq!(text, "online: alice");
    }
}
