//! chatwire - terminal client for a streaming chat server.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::Receiver;

use chatwire_core::event_bus::SessionOutcome;
use chatwire_core::session::{CredentialStore, FileCredentialStore};
use chatwire_core::stream::DeltaChannel;
use chatwire_core::{
    ChatClient, ClientConfig, ConversationId, HttpApi, HttpTransport, MarkdownRenderer,
    MessageType, StreamBus, StreamController, StreamOptions, StreamUpdate, ThinkingMode,
};

type Client = ChatClient<HttpApi, HttpTransport>;
type CliResult<T = ()> = Result<T, Box<dyn Error>>;

const POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "chatwire")]
#[command(about = "Terminal client for a streaming AI chat server")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/chatwire/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API base URL, e.g. http://localhost:8080/api/v1
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Ask the model not to stream its reasoning
    #[arg(long, global = true)]
    no_thinking: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and remember the credential
    Login {
        #[arg(long)]
        email: String,

        /// Read from stdin when omitted
        #[arg(long, env = "CHATWIRE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored credential
    Logout,
    /// List conversations
    Conversations {
        /// Only show conversations matching this text
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Print the messages of a conversation
    History { id: u64 },
    /// Send one prompt and stream the answer
    Ask {
        prompt: String,

        /// Continue this conversation instead of starting a new one
        #[arg(short, long)]
        conversation: Option<u64>,
    },
    /// Interactive chat; `/new` starts over, `/quit` exits
    Chat {
        #[arg(short, long)]
        conversation: Option<u64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.base_url {
        config.base_url = url;
    }
    if cli.no_thinking {
        config.thinking = false;
    }
    let options = StreamOptions {
        thinking: ThinkingMode::from(config.thinking),
    };

    let store = config
        .credential_path()
        .map(FileCredentialStore::new)
        .ok_or("cannot determine where to store credentials (set HOME)")?;
    log::debug!("Credential store at {}", store.path().display());

    let mut client = build_client(&config);

    match cli.command {
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_line("Password: ")?,
            };
            client.login(&email, &password)?;
            if let Some(credential) = client.state().credential() {
                store.save(credential)?;
            }
            let name = client
                .state()
                .user()
                .map(|u| u.display_name().to_string())
                .unwrap_or_else(|| email.clone());
            println!("Logged in as {}", name);
        }
        Commands::Logout => {
            store.clear()?;
            println!("Logged out");
        }
        Commands::Conversations { query } => {
            restore(&mut client, &store)?;
            let conversations = client.refresh_conversations(query.as_deref())?;
            if conversations.is_empty() {
                println!("No conversations");
            }
            for conversation in conversations {
                let updated = conversation
                    .updated_at
                    .or(conversation.created_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:>6}  {:<16}  {}", conversation.id.0, updated, conversation.name);
            }
        }
        Commands::History { id } => {
            restore(&mut client, &store)?;
            client.open_conversation(ConversationId(id))?;
            for message in client.transcript().messages() {
                let who = match message.message_type {
                    MessageType::User => "you",
                    MessageType::Assistant => "assistant",
                    MessageType::System => "system",
                };
                println!("[{}] {}\n{}\n", message.created_at.format("%H:%M"), who, message.content);
            }
        }
        Commands::Ask {
            prompt,
            conversation,
        } => {
            restore(&mut client, &store)?;
            if let Some(id) = conversation {
                client.open_conversation(ConversationId(id))?;
            }
            let mut updates = client.bus().subscribe();
            ask(&mut client, &mut updates, &prompt, options)?;
        }
        Commands::Chat { conversation } => {
            restore(&mut client, &store)?;
            if let Some(id) = conversation {
                client.open_conversation(ConversationId(id))?;
            }
            chat(&mut client, options)?;
        }
    }

    Ok(())
}

fn build_client(config: &ClientConfig) -> Client {
    let api = HttpApi::new(config.base_url(), config.request_timeout());
    let transport = HttpTransport::new(config.base_url(), config.request_timeout());
    let controller = StreamController::new(transport, MarkdownRenderer::new(), Arc::new(StreamBus::new()))
        .with_idle_timeout(config.idle_timeout())
        .with_log_dir(config.log_dir.clone());
    ChatClient::new(api, controller)
}

fn restore(client: &mut Client, store: &FileCredentialStore) -> CliResult {
    let credential = store
        .load()?
        .ok_or("not logged in; run `chatwire login --email <email>` first")?;
    if let Err(e) = client.restore(credential) {
        if !client.state().is_authenticated() {
            store.clear()?;
        }
        return Err(e.into());
    }
    Ok(())
}

fn chat(client: &mut Client, options: StreamOptions) -> CliResult {
    let mut updates = client.bus().subscribe();
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                client.new_chat();
                println!("(new conversation)");
            }
            prompt => {
                if let Err(e) = ask(client, &mut updates, prompt, options) {
                    eprintln!("error: {}", e);
                }
            }
        }
    }
    Ok(())
}

/// Submit `prompt` and print the answer as it streams.
fn ask(
    client: &mut Client,
    updates: &mut Receiver<StreamUpdate>,
    prompt: &str,
    options: StreamOptions,
) -> CliResult {
    let epoch = client.submit(prompt, options)?;
    let mut in_reasoning = false;
    let mut outcome = None;

    while outcome.is_none() {
        client.pump(POLL);

        while let Ok(update) = updates.try_recv() {
            if update.epoch() != epoch {
                continue;
            }
            match update {
                StreamUpdate::Delta {
                    channel: DeltaChannel::Reasoning,
                    text,
                    ..
                } => {
                    in_reasoning = true;
                    eprint!("{}", text);
                }
                StreamUpdate::Delta {
                    channel: DeltaChannel::Content,
                    text,
                    ..
                } => {
                    if in_reasoning {
                        eprintln!();
                        in_reasoning = false;
                    }
                    print!("{}", text);
                    io::stdout().flush()?;
                }
                StreamUpdate::Status { notice, .. } => {
                    println!();
                    eprintln!("[{}]", notice.text);
                }
                StreamUpdate::Ended { outcome: ended, .. } => outcome = Some(ended),
                _ => {}
            }
        }

        if outcome.is_none() && !client.is_generating() {
            break;
        }
    }

    if matches!(outcome, Some(SessionOutcome::Finished)) {
        println!();
    }
    Ok(())
}

fn prompt_line(label: &str) -> CliResult<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}
