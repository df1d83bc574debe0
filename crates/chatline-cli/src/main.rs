use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chatline_core::{
    ApiClient, AttachmentStore, EngineConfig, Navigator, SavedPromptStore, SendOutcome,
    SessionController, SessionUpdate, StreamStatus, UploadFile,
};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

#[derive(Parser)]
#[command(name = "chatline")]
#[command(about = "Talk to a streaming chat backend from the terminal")]
struct Cli {
    /// Config file (defaults to <config_dir>/chatline/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the backend base URL
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Override the API token
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations
    Chats,
    /// Print the messages of a conversation
    Show { chat_id: String },
    /// Send a message and stream the reply
    Send {
        message: String,
        /// Continue this conversation instead of starting a new one
        #[arg(short, long)]
        chat: Option<String>,
        /// Attachment id to include (repeatable)
        #[arg(short, long = "attach")]
        attachments: Vec<String>,
        /// System prompt to store on the conversation before sending
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Manage the files of a conversation
    Attachments {
        #[command(subcommand)]
        command: AttachmentCommands,
    },
    /// Manage the saved system prompt library
    Prompts {
        #[command(subcommand)]
        command: PromptCommands,
    },
    /// Set the system prompt of a conversation
    SystemPrompt {
        chat_id: String,
        /// Prompt text
        #[arg(conflicts_with = "saved", required_unless_present = "saved")]
        prompt: Option<String>,
        /// Use a saved prompt by id
        #[arg(long)]
        saved: Option<i64>,
    },
    /// Write the effective configuration to the config file
    Init,
}

#[derive(Subcommand)]
enum AttachmentCommands {
    List { chat_id: String },
    Upload { chat_id: String, path: PathBuf },
    Rm { chat_id: String, attachment_id: String },
}

#[derive(Subcommand)]
enum PromptCommands {
    List,
    Create { title: String, prompt: String },
    Update { id: i64, title: String, prompt: String },
}

/// Reports newly assigned conversation ids on stderr.
struct StderrNavigator;

impl Navigator for StderrNavigator {
    fn navigate_to_chat(&self, chat_id: &str) {
        eprintln!("[conversation {}]", chat_id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    run(Cli::parse()).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    debug!(?config, "Loaded configuration");

    let Cli {
        config: config_path,
        command,
        ..
    } = cli;

    match command {
        Commands::Init => init_config(config_path, &config),
        Commands::Chats => list_chats(&connect(config)?).await,
        Commands::Show { chat_id } => show_chat(connect(config)?, &chat_id).await,
        Commands::Send {
            message,
            chat,
            attachments,
            system_prompt,
        } => {
            send_message(
                connect(config)?,
                &message,
                chat.as_deref(),
                &attachments,
                system_prompt,
            )
            .await
        }
        Commands::Attachments { command } => run_attachments(connect(config)?, command).await,
        Commands::Prompts { command } => run_prompts(connect(config)?, command).await,
        Commands::SystemPrompt {
            chat_id,
            prompt,
            saved,
        } => set_system_prompt(connect(config)?, &chat_id, prompt, saved).await,
    }
}

fn connect(config: EngineConfig) -> Result<ApiClient> {
    ApiClient::new(config).context("Failed to set up the API client")
}

fn init_config(path: Option<PathBuf>, config: &EngineConfig) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => EngineConfig::default_path()?,
    };
    config.save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = EngineConfig::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => EngineConfig::load()?,
    };
    if let Some(url) = &cli.base_url {
        config.base_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.token = token.clone();
    }
    Ok(config)
}

async fn list_chats(api: &ApiClient) -> Result<()> {
    let chats = api.list_conversations().await?;
    if chats.is_empty() {
        println!("No conversations yet.");
    }
    for chat in chats {
        println!("{:>6}  {}", chat.id, chat.title);
    }
    Ok(())
}

async fn show_chat(api: ApiClient, chat_id: &str) -> Result<()> {
    let controller = SessionController::open(api, Arc::new(StderrNavigator), chat_id).await?;
    let system_prompt = controller.system_prompt();
    if !system_prompt.is_empty() {
        println!("[system] {}\n", system_prompt);
    }
    for message in controller.messages() {
        println!("[{:?}] {}\n", message.role, message.content);
    }
    Ok(())
}

async fn send_message(
    api: ApiClient,
    message: &str,
    chat_id: Option<&str>,
    attachments: &[String],
    system_prompt: Option<String>,
) -> Result<()> {
    let navigator = Arc::new(StderrNavigator);
    let controller = match chat_id {
        Some(id) => SessionController::open(api, navigator, id).await?,
        None => SessionController::new(api, navigator),
    };
    if let Some(prompt) = system_prompt {
        controller.set_system_prompt(&prompt);
        controller.persist_system_prompt().await?;
    }

    let mut updates = controller.subscribe();
    let send = controller.send(message, attachments);
    tokio::pin!(send);

    let result = loop {
        tokio::select! {
            result = &mut send => {
                while let Ok(update) = updates.try_recv() {
                    print_update(update);
                }
                break result;
            }
            update = updates.recv() => match update {
                Ok(update) => print_update(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Output fell behind the stream");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => controller.cancel(),
        }
    };

    match result? {
        SendOutcome::Completed => Ok(()),
        SendOutcome::Cancelled => bail!("Cancelled"),
    }
}

fn print_update(update: SessionUpdate) {
    match update {
        SessionUpdate::AssistantDelta { text } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        SessionUpdate::StreamEnded { status } => match status {
            StreamStatus::Completed => println!(),
            StreamStatus::Cancelled => println!("\n[cancelled]"),
            StreamStatus::Failed(reason) => eprintln!("\n[failed: {}]", reason),
        },
        SessionUpdate::UserMessageAppended { .. } | SessionUpdate::ChatAssigned { .. } => {}
    }
}

async fn run_attachments(api: ApiClient, command: AttachmentCommands) -> Result<()> {
    let store = AttachmentStore::new(api.clone());
    match command {
        AttachmentCommands::List { chat_id } => {
            for attachment in store.list(&chat_id).await? {
                println!(
                    "{:>6}  {}  {}",
                    attachment.id,
                    attachment.name,
                    api.attachment_content_url(&attachment.id)
                );
            }
        }
        AttachmentCommands::Upload { chat_id, path } => {
            let file = UploadFile::from_path(&path).await?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let progress = tokio::spawn(async move {
                while let Some(percent) = rx.recv().await {
                    eprint!("\ruploading {:>3}%", percent);
                }
                eprintln!();
            });
            let uploaded = store.upload(&chat_id, file, Some(tx)).await;
            progress.await.context("Progress reporter failed")?;
            let attachment = uploaded?;
            println!("{}  {}", attachment.id, attachment.name);
        }
        AttachmentCommands::Rm {
            chat_id,
            attachment_id,
        } => {
            store.list(&chat_id).await?;
            if store.get(&attachment_id).is_none() {
                bail!("Attachment {} is not part of conversation {}", attachment_id, chat_id);
            }
            store.remove(&attachment_id).await?;
            println!("Removed {}; {} remaining", attachment_id, store.attachments().len());
        }
    }
    Ok(())
}

async fn run_prompts(api: ApiClient, command: PromptCommands) -> Result<()> {
    let store = SavedPromptStore::new(api);
    match command {
        PromptCommands::List => {
            for prompt in store.list().await? {
                println!("{:>4}  {}\n      {}", prompt.id, prompt.title, prompt.prompt);
            }
        }
        PromptCommands::Create { title, prompt } => {
            let created = store.create(&title, &prompt).await?;
            println!("Saved prompt {}", created.id);
        }
        PromptCommands::Update { id, title, prompt } => {
            store.update(id, &title, &prompt).await?;
            println!("Updated prompt {}", id);
        }
    }
    Ok(())
}

async fn set_system_prompt(
    api: ApiClient,
    chat_id: &str,
    prompt: Option<String>,
    saved: Option<i64>,
) -> Result<()> {
    let controller =
        SessionController::open(api.clone(), Arc::new(StderrNavigator), chat_id).await?;

    match (prompt, saved) {
        (Some(prompt), _) => controller.set_system_prompt(&prompt),
        (None, Some(id)) => {
            let store = SavedPromptStore::new(api);
            store.list().await?;
            let saved = store
                .get(id)
                .with_context(|| format!("No saved prompt with id {}", id))?;
            controller.select_saved_prompt(&saved);
        }
        (None, None) => bail!("Provide a prompt or --saved <id>"),
    }

    controller.persist_system_prompt().await?;
    println!("System prompt updated for conversation {}", chat_id);
    Ok(())
}
