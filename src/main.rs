use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamchat::{
    api,
    auth::{Credentials, EndpointResolver, HttpEndpointResolver, LocalSigner},
    client::ChatClient,
    config::{history_dir_from_env, ConnectionConfig, ServiceConfig},
    connection::WebSocketTransport,
    document::{DocumentSource, PageRange, TextDocument},
    session::{ConversationSession, FileTurnStore},
    types::{Role, Turn, TurnId},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "streamchat", about = "Streaming chat client for websocket LLM services")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat in the terminal (default)
    Chat {
        /// Conversation to open
        #[arg(long, default_value = "1")]
        conversation: String,
        /// Start a fresh conversation with a generated id
        #[arg(long, conflicts_with = "conversation")]
        new: bool,
        /// Plain-text document for /interpret and /goto (pages split by form feed)
        #[arg(long)]
        document: Option<PathBuf>,
    },
    /// Run the URL-signing and one-shot chat service
    Serve {
        #[arg(long, default_value = "0.0.0.0:6574")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamchat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Chat {
        conversation: "1".to_string(),
        new: false,
        document: None,
    }) {
        Command::Chat {
            conversation,
            new,
            document,
        } => {
            let conversation = if new {
                ulid::Ulid::new().to_string()
            } else {
                conversation
            };
            run_chat(conversation, document).await
        }
        Command::Serve { addr } => serve(addr).await,
    }
}

async fn serve(addr: SocketAddr) -> Result<(), BoxError> {
    let app = api::router(api::ApiState::new(
        Credentials::from_env(),
        ServiceConfig::from_env(),
        Arc::new(WebSocketTransport),
    ));

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_chat(conversation: String, document: Option<PathBuf>) -> Result<(), BoxError> {
    let config = ServiceConfig::from_env();
    let resolver: Arc<dyn EndpointResolver> = match &config.resolver_url {
        Some(url) => Arc::new(HttpEndpointResolver::new(url.clone())),
        None => Arc::new(LocalSigner::new(Credentials::from_env())),
    };
    let document = match document {
        Some(path) => Some(TextDocument::load(&path).await?),
        None => None,
    };

    let client = ChatClient::new(
        config,
        resolver,
        Arc::new(WebSocketTransport),
        ConnectionConfig::from_env(),
        Arc::new(FileTurnStore::new(history_dir_from_env())),
    );
    let session = client.open_session(&conversation).await?;
    if let Err(e) = client.start().await {
        eprintln!("Could not connect: {}", e);
    }

    println!("Conversation {} ({} turns)", session.id(), session.turns().len());
    print_history(&session.turns());
    let printer = tokio::spawn(print_replies(session.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let result: Result<(), BoxError> = match words.next() {
            Some("/quit") => break,
            Some("/history") => {
                print_history(&session.turns());
                Ok(())
            }
            Some("/goto") => match (&document, words.next().map(str::parse::<u32>)) {
                (Some(doc), Some(Ok(page))) => doc.jump_to_page(page).await.map_err(Into::into),
                (None, _) => Err("no document loaded".into()),
                _ => Err("usage: /goto PAGE".into()),
            },
            Some("/interpret") => {
                let range = words.next().map(str::parse::<PageRange>);
                let label = words.collect::<Vec<_>>().join(" ");
                match (&document, range) {
                    (Some(doc), Some(Ok(range))) => session
                        .interpret(doc, range, &label)
                        .await
                        .map_err(Into::into),
                    (None, _) => Err("no document loaded".into()),
                    _ => Err("usage: /interpret START-END LABEL".into()),
                }
            }
            _ => session.send(line).await.map_err(Into::into),
        };
        if let Err(e) = result {
            eprintln!("error: {}", e);
        }
    }

    printer.abort();
    client.shutdown().await;
    Ok(())
}

fn print_history(turns: &[Turn]) {
    for turn in turns {
        let who = match turn.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{}> {}", who, turn.content);
    }
}

/// Echo assistant text as it streams in, plus any session errors
async fn print_replies(session: Arc<ConversationSession>) {
    let mut turns = session.subscribe();
    let mut status = session.subscribe_status();
    let mut printed: Option<(TurnId, usize)> = session
        .turns()
        .last()
        .map(|turn| (turn.id, turn.content.len()));
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            changed = turns.changed() => {
                if changed.is_err() {
                    return;
                }
                let last = turns.borrow_and_update().last().cloned();
                let Some(turn) = last else { continue };
                if turn.role != Role::Assistant {
                    printed = Some((turn.id, turn.content.len()));
                    continue;
                }
                let text = match printed {
                    Some((id, len)) if id == turn.id => {
                        turn.content.get(len..).unwrap_or_default().to_string()
                    }
                    _ => format!("assistant> {}", turn.content),
                };
                printed = Some((turn.id, turn.content.len()));
                let mut out = text;
                if turn.is_complete {
                    out.push('\n');
                }
                let _ = stdout.write_all(out.as_bytes()).await;
                let _ = stdout.flush().await;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let error = status.borrow_and_update().error.clone();
                if let Some(error) = error {
                    eprintln!("\nerror: {}", error);
                }
            }
        }
    }
}
