use clap::Parser;
use log::{info, warn};
use ollama_session::commands::{parse_command, Command, HELP};
use ollama_session::config::{resolve_model, Args};
use ollama_session::models::{Conversation, ConversationId};
use ollama_session::{ConversationStore, OllamaClient, SessionManager, SessionUpdate, SqliteStore};
use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

type Manager = SessionManager<SqliteStore, OllamaClient>;

enum Input {
    Update(Option<SessionUpdate>),
    Interrupt,
    Line(Option<String>),
}

fn print_flush(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

fn render(manager: &Manager, update: SessionUpdate) {
    match update {
        SessionUpdate::Delta(text) => print_flush(&text),
        SessionUpdate::ResponseCommitted { .. } => println!(),
        SessionUpdate::ResponseInterrupted { repaired: true, .. } => println!("\n[cancelled]"),
        SessionUpdate::ResponseInterrupted { repaired: false, .. } => println!("[cancelled before any output]"),
        SessionUpdate::GenerationFailed(e) => eprintln!("\n{}", e),
        SessionUpdate::TitleFinished => {
            if let Some(conversation) = manager.conversation() {
                println!("[{}]", conversation.name);
            }
        }
        SessionUpdate::TitleFailed(e) => warn!("{}", e),
        SessionUpdate::TitleChanged(_) | SessionUpdate::Discarded => {}
    }
}

fn print_history(manager: &Manager) {
    for (i, message) in manager.messages().iter().enumerate() {
        println!("[{}] > {}", i + 1, message.prompt);
        match &message.response {
            Some(response) => println!("{}\n", response),
            None => println!("(no response)\n"),
        }
    }
}

async fn new_conversation(manager: &mut Manager, model: &str, system: Option<&String>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut conversation = Conversation::new(model);
    conversation.system_prompt = system.cloned();
    manager.store().create_conversation(&conversation).await?;
    println!("new conversation {}", conversation.id);
    manager.load(conversation).await?;
    Ok(())
}

/// Stops any running stream and applies its final events so partial output is kept.
async fn shut_down(manager: &mut Manager) {
    if manager.is_streaming() {
        manager.cancel();
        for update in manager.run_until_idle().await {
            render(manager, update);
        }
    }
}

/// Runs one command; returns false when the user asked to quit.
async fn handle(
    command: Command,
    manager: &mut Manager,
    client: &OllamaClient,
    args: &Args,
) -> Result<bool, Box<dyn Error + Send + Sync>> {
    match command {
        Command::Generate(prompt) => manager.generate(prompt).await?,
        Command::Regenerate => manager.regenerate().await?,
        Command::RegenerateAt(index) => manager.regenerate_at(index).await?,
        Command::Edit(index) => {
            let prompt = manager.generate_at(index).await?;
            println!("removed from history, edit and resend:\n{}", prompt);
        }
        Command::Cancel => manager.cancel(),
        Command::History => print_history(manager),
        Command::New => {
            let model = manager
                .conversation()
                .map(|c| c.model.clone())
                .unwrap_or_default();
            new_conversation(manager, &model, args.system.as_ref()).await?;
        }
        Command::List => {
            for conversation in manager.store().fetch_conversations().await? {
                println!(
                    "{}  {}  {}",
                    conversation.id,
                    conversation.modified_at.format("%Y-%m-%d %H:%M"),
                    conversation.name
                );
            }
        }
        Command::Open(id) => {
            let conversation = manager.store().fetch_conversation(&ConversationId(id)).await?;
            manager.load(conversation).await?;
            print_history(manager);
        }
        Command::Delete(id) => {
            let id = ConversationId(id);
            if manager.conversation().map(|c| &c.id) == Some(&id) {
                return Err("cannot delete the open conversation".into());
            }
            manager.store().delete_conversation(&id).await?;
            println!("deleted {}", id);
        }
        Command::Models => {
            for model in client.list_models().await? {
                println!("{}", model);
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

// application entry point
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let client = OllamaClient::new(Some(args.host.clone()));

    if args.list_models {
        for model in client.list_models().await? {
            println!("{}", model);
        }
        return Ok(());
    }

    let db_path = args.db_path();
    info!("using database {}", db_path.display());
    let store = SqliteStore::open(&db_path)?;

    let model = match resolve_model(&args, &store).await? {
        Some(model) => model,
        None => client
            .list_models()
            .await?
            .into_iter()
            .next()
            .ok_or("no model available; pass --model")?,
    };
    info!("chatting with {} at {}", model, client.base_url());

    let mut manager = SessionManager::new(store, Arc::new(client.clone()));

    match &args.conversation {
        Some(id) => {
            let conversation = manager
                .store()
                .fetch_conversation(&ConversationId(id.clone()))
                .await?;
            manager.load(conversation).await?;
            print_history(&manager);
        }
        None => new_conversation(&mut manager, &model, args.system.as_ref()).await?,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_flush("> ");

    loop {
        let streaming = manager.is_streaming();
        let input = if streaming {
            tokio::select! {
                update = manager.next_event() => Input::Update(update),
                _ = tokio::signal::ctrl_c() => Input::Interrupt,
                line = lines.next_line() => Input::Line(line?),
            }
        } else {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Input::Interrupt,
                line = lines.next_line() => Input::Line(line?),
            }
        };

        match input {
            Input::Update(Some(update)) => {
                render(&manager, update);
                if !manager.is_streaming() {
                    print_flush("> ");
                }
            }
            Input::Update(None) => break,
            Input::Interrupt if streaming => manager.cancel(),
            Input::Interrupt | Input::Line(None) => {
                shut_down(&mut manager).await;
                break;
            }
            Input::Line(Some(line)) => match parse_command(&line) {
                None => print_flush("> "),
                Some(Err(e)) => {
                    eprintln!("{}", e);
                    print_flush("> ");
                }
                Some(Ok(command)) => match handle(command, &mut manager, &client, &args).await {
                    Ok(true) => {
                        if !manager.is_streaming() {
                            print_flush("> ");
                        }
                    }
                    Ok(false) => {
                        shut_down(&mut manager).await;
                        break;
                    }
                    Err(e) => {
                        eprintln!("{}", e);
                        print_flush("> ");
                    }
                },
            },
        }
    }

    Ok(())
}
