use clap::{Parser, Subcommand};
use std::sync::Arc;

use lib::chat::ChatService;
use lib::conversation::{Conversation, ConversationStore, MemoryConversationStore};
use lib::events::{topics, ChannelBroadcaster};
use lib::llm::{AnthropicAdapter, OpenAiAdapter, ProviderRouter, SendOptions};
use lib::message::Message;
use lib::settings::{default_settings_path, init_settings_file, FileSettingsStore, SettingsStore};
use lib::tools::NoTools;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the settings file with empty provider entries.
    Init {
        /// Settings file path (default: PARLEY_SETTINGS_PATH or ~/.parley/settings.json)
        #[arg(long, short, value_name = "PATH")]
        settings: Option<std::path::PathBuf>,
    },

    /// List every model from every configured provider.
    Models {
        /// Settings file path (default: PARLEY_SETTINGS_PATH or ~/.parley/settings.json)
        #[arg(long, short, value_name = "PATH")]
        settings: Option<std::path::PathBuf>,
    },

    /// Chat with a model (interactive).
    Chat {
        /// Settings file path (default: PARLEY_SETTINGS_PATH or ~/.parley/settings.json)
        #[arg(long, short, value_name = "PATH")]
        settings: Option<std::path::PathBuf>,

        /// Model id (default: first available model).
        #[arg(long, short, value_name = "ID")]
        model: Option<String>,

        /// System prompt for the conversation.
        #[arg(long, value_name = "TEXT")]
        system: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { settings }) => {
            if let Err(e) = run_init(settings) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Models { settings }) => {
            if let Err(e) = run_models(settings).await {
                log::error!("models failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            settings,
            model,
            system,
        }) => {
            if let Err(e) = run_chat(settings, model, system).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(settings_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = init_settings_file(settings_path)?;
    println!("initialized settings at {}", path.display());
    Ok(())
}

async fn build_router(settings_path: Option<std::path::PathBuf>) -> Arc<ProviderRouter> {
    let path = settings_path.unwrap_or_else(default_settings_path);
    let store: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::new(path));
    let tools = Arc::new(NoTools);

    let router = Arc::new(ProviderRouter::new());
    router
        .register_provider(Arc::new(OpenAiAdapter::new(store.clone(), tools.clone())))
        .await;
    router
        .register_provider(Arc::new(AnthropicAdapter::new(store, tools)))
        .await;
    router.reload_all_settings().await;
    router
}

async fn run_models(settings_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let router = build_router(settings_path).await;
    for model in router.all_supported_models().await {
        let availability = if model.available { "" } else { " (no api key)" };
        let thinking = if model.capabilities.thinking {
            " [thinking]"
        } else {
            ""
        };
        println!(
            "{:<12} {:<32} {}{}{}",
            model.provider, model.id, model.name, thinking, availability
        );
    }
    Ok(())
}

async fn run_chat(
    settings_path: Option<std::path::PathBuf>,
    model: Option<String>,
    system: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let router = build_router(settings_path).await;
    let model = match model {
        Some(m) => m,
        None => router
            .all_supported_models()
            .await
            .into_iter()
            .find(|m| m.available)
            .map(|m| m.id)
            .ok_or_else(|| anyhow::anyhow!("no available model; run `parley init` and add an api key"))?,
    };

    let store: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
    let (broadcaster, mut events) = ChannelBroadcaster::new();
    let service = Arc::new(ChatService::new(router, store.clone(), Arc::new(broadcaster)));

    let conversation = Conversation::new("New conversation");
    let conversation_id = conversation.id.clone();
    store.create_conversation(conversation).await?;

    // Printer runs beside the REPL so tool activity shows up as it happens.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event.topic != topics::MESSAGE {
                continue;
            }
            let role = event.payload["message"]["role"].as_str().unwrap_or_default();
            match role {
                "assistant" => {
                    if let Ok(message) =
                        serde_json::from_value::<Message>(event.payload["message"].clone())
                    {
                        let text = message.text();
                        if !text.is_empty() {
                            println!("< {}", text.trim());
                        }
                        for (_, name, _) in message.tool_uses() {
                            println!("  [tool: {}]", name);
                        }
                    }
                }
                "tool_result" => println!("  [tool result]"),
                _ => {}
            }
        }
    });

    println!("chatting with {} (/exit to quit)", model);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut first_turn = true;

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        if let Err(e) = service
            .append_user_message(&conversation_id, Message::user(input))
            .await
        {
            eprintln!("chat error: {}", e);
            continue;
        }
        if first_turn {
            first_turn = false;
            let service = service.clone();
            let conversation_id = conversation_id.clone();
            let message = input.to_string();
            let model = model.clone();
            tokio::spawn(async move {
                service.generate_title(&conversation_id, &message, &model).await;
            });
        }

        let mut options = SendOptions::model(model.as_str());
        options.system_prompt = system.clone();
        if let Err(e) = service.start_chat(&conversation_id, options).await {
            eprintln!("chat error: {}", e);
        }
    }

    service.stop_all().await;
    Ok(())
}
