use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memchat::commands::{get_help_text, parse_slash_command, SlashCommand};
use memchat::search;
use memchat::{
    BackendFactory, ChatEvent, ChatSession, Config, ConversationStore, FileStore, GeminiClient,
    Message, MessageStatus, RemoteChat, Role, SendOutcome,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "memchat")]
#[command(version)]
#[command(about = "Chat with Gemini from the terminal, with a memory that survives restarts", long_about = None)]
struct Cli {
    /// Use this config file instead of ~/.memchat/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the streamed reply
    Send {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Show saved messages containing a phrase
    Search { query: String },
    /// Print the saved conversation
    History,
    /// Forget the saved conversation
    New,
    /// Generate an image and write it to disk
    Image {
        #[arg(required = true)]
        prompt: Vec<String>,
        /// Directory the image files are written to
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    memchat::logging::init(&config.log_level);

    match cli.command {
        None => run_repl(&config).await,
        Some(Commands::Send { text }) => send_once(&config, &text.join(" ")).await,
        Some(Commands::Search { query }) => {
            let conversation = FileStore::new(config.session_path())
                .load()
                .context("Failed to read saved conversation")?
                .unwrap_or_default();
            print_search(conversation.messages(), &query);
            Ok(())
        }
        Some(Commands::History) => {
            match FileStore::new(config.session_path())
                .load()
                .context("Failed to read saved conversation")?
            {
                Some(conversation) => print_conversation(conversation.messages()),
                None => println!("📭 No saved conversation yet. Run 'memchat' to start one!"),
            }
            Ok(())
        }
        Some(Commands::New) => {
            FileStore::new(config.session_path())
                .clear()
                .context("Failed to clear saved conversation")?;
            println!("🧹 Saved conversation cleared.");
            Ok(())
        }
        Some(Commands::Image { prompt, out }) => {
            let mut session = open_session(&config);
            let message = session
                .generate_image(&prompt.join(" "))
                .await
                .context("Image generation failed")?
                .clone();
            print_message(&message, "");
            for path in save_images(&message, &out)? {
                println!("💾 Saved {}", path.display());
            }
            Ok(())
        }
    }
}

fn open_session(config: &Config) -> ChatSession<FileStore> {
    let backend_config = config.clone();
    let factory: BackendFactory = Box::new(move || {
        Ok(Arc::new(GeminiClient::new(backend_config.clone())) as Arc<dyn RemoteChat>)
    });
    ChatSession::open(
        config.greeting.clone(),
        FileStore::new(config.session_path()),
        factory,
    )
}

async fn send_once(config: &Config, text: &str) -> Result<()> {
    let mut session = open_session(config);
    let mut events = session.subscribe();
    if let Some(error) = session.error() {
        eprintln!("❌ {}", error);
    }

    match send_and_print(&mut session, &mut events, text).await {
        SendOutcome::Completed { .. } => Ok(()),
        SendOutcome::Ignored => {
            println!("Nothing to send.");
            Ok(())
        }
        SendOutcome::Failed { error, .. } => Err(error).context("Reply failed"),
    }
}

async fn run_repl(config: &Config) -> Result<()> {
    let mut session = open_session(config);
    let mut events = session.subscribe();

    print_conversation(session.messages());
    if let Some(error) = session.error() {
        eprintln!("❌ {}", error);
    }
    session.dismiss_error();
    println!("Type /help for commands.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("👤 > ");
        let _ = io::stdout().flush();

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(parsed) = parse_slash_command(line) else {
            send_and_print(&mut session, &mut events, line).await;
            continue;
        };

        match parsed.command {
            SlashCommand::Bye => break,
            SlashCommand::Help => println!("{}", get_help_text()),
            SlashCommand::History => print_conversation(session.messages()),
            SlashCommand::New => {
                if session.new_chat().is_ok() {
                    print_conversation(session.messages());
                }
            }
            SlashCommand::Search => match parsed.argument() {
                Some(query) => print_search(session.messages(), query),
                None => println!("Usage: /search <text>"),
            },
            SlashCommand::Image => match parsed.argument() {
                Some(prompt) => match session.generate_image(prompt).await {
                    Ok(message) => {
                        let message = message.clone();
                        print_message(&message, "");
                        match save_images(&message, Path::new(".")) {
                            Ok(paths) => {
                                for path in paths {
                                    println!("💾 Saved {}", path.display());
                                }
                            }
                            Err(e) => eprintln!("❌ {:#}", e),
                        }
                    }
                    Err(e) => eprintln!("❌ {}", e),
                },
                None => println!("Usage: /image <prompt>"),
            },
        }
        drain_events(&mut events);
    }

    println!("👋 Bye!");
    Ok(())
}

/// Send `text`, printing the reply as it streams in
async fn send_and_print(
    session: &mut ChatSession<FileStore>,
    events: &mut UnboundedReceiver<ChatEvent>,
    text: &str,
) -> SendOutcome {
    let outcome = {
        let send = session.send(text);
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                outcome = &mut send => break outcome,
                Some(event) = events.recv() => print_event(&event),
            }
        }
    };
    // events sent after the last poll of `send`
    drain_events(events);
    outcome
}

fn drain_events(events: &mut UnboundedReceiver<ChatEvent>) {
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::StreamStarted => print!("🤖 "),
        ChatEvent::Fragment(fragment) => print!("{}", fragment),
        ChatEvent::StreamFinished { .. } => println!("\n"),
        ChatEvent::StreamFailed { partial, .. } => {
            if partial.is_empty() {
                println!();
            } else {
                println!(" [interrupted]\n");
            }
        }
        ChatEvent::Notice(message) => eprintln!("❌ Error: {}", message),
        ChatEvent::ConversationReset => println!("🧹 Started a new chat.\n"),
    }
    let _ = io::stdout().flush();
}

fn print_conversation(messages: &[Message]) {
    for message in messages {
        print_message(message, "");
    }
}

fn print_search(messages: &[Message], query: &str) {
    let hits = search::filter(messages, query);
    if hits.is_empty() {
        println!("No Results Found");
        println!("Your search for \"{}\" did not match any messages.", query);
        return;
    }

    let total: usize = hits
        .iter()
        .map(|message| search::match_count(&message.text(), query))
        .sum();
    println!(
        "🔎 {} message(s), {} match(es) for \"{}\"\n",
        hits.len(),
        total,
        query
    );
    for message in hits {
        print_message(message, query);
    }
}

fn print_message(message: &Message, query: &str) {
    let icon = match message.role {
        Role::User => "👤 You",
        Role::Model => "🤖 Model",
    };
    let marker = match message.status {
        MessageStatus::Complete => "",
        MessageStatus::Streaming => " (streaming)",
        MessageStatus::Failed => " (failed)",
    };
    println!(
        "{}{} · {}",
        icon,
        marker,
        message.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
    );

    let text = message.text();
    if !text.is_empty() {
        println!("{}", highlighted(&text, query));
    }
    for image in message.images() {
        println!("[image: {}, {} base64 chars]", image.mime_type, image.data.len());
    }
    println!();
}

/// `text` with matches of `query` in reverse video
fn highlighted(text: &str, query: &str) -> String {
    search::highlight(text, query)
        .into_iter()
        .map(|span| {
            if span.is_match {
                format!("\x1b[7m{}\x1b[0m", span.text)
            } else {
                span.text.to_string()
            }
        })
        .collect()
}

fn save_images(message: &Message, out: &Path) -> Result<Vec<PathBuf>> {
    let mut saved = Vec::new();
    for (index, image) in message.images().enumerate() {
        fs::create_dir_all(out)
            .with_context(|| format!("Failed to create {}", out.display()))?;
        let bytes = image.decode()?;
        let path = out.join(format!(
            "memchat-{}-{}.{}",
            message.timestamp.format("%Y%m%d-%H%M%S"),
            index,
            image.extension()
        ));
        fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        saved.push(path);
    }
    Ok(saved)
}
