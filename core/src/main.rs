/// chatsync - open one live view and stream it to the terminal
use chatsync_core::identity;
use chatsync_core::local_store::LocalStore;
use chatsync_core::watermark::ReadWatermarks;
use chatsync_core::{Channel, Config, Id, LiveView, RestClient, SendOutcome, ViewState};
use colored::*;
use std::collections::HashSet;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let (config, positional) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let Some(channel) = parse_channel(&positional) else {
        print_usage();
        return Ok(());
    };

    let store = LocalStore::open(&config.data_dir)?;
    let me = identity::load(&store)?;
    let backend = RestClient::new(
        &config.api_base,
        Some(me.token.clone()),
        config.request_timeout,
    )?;

    info!("Opening {:?} ({:?} feed)", channel, config.feed_mode);
    let view = LiveView::from_config(
        &config,
        channel,
        backend,
        me.clone(),
        ReadWatermarks::new(store.clone()),
    );

    let mut updates = view.subscribe();
    if let Err(e) = view.activate().await {
        eprintln!("{} {}", "✗".red().bold(), e.user_message().red());
    }

    let mut seen = Seen::default();
    let state = updates.borrow_and_update().clone();
    render(&state, &mut seen, me.user_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                render(&state, &mut seen, me.user_id());
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) => match view.send(&text).await {
                    Ok(SendOutcome::Sent(item)) => debug!("Sent item {}", item.id),
                    Ok(SendOutcome::Ignored) => {}
                    Err(e) => eprintln!("{} {}", "✗".red().bold(), e.user_message().red()),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    view.close().await;
    Ok(())
}

fn parse_channel(positional: &[String]) -> Option<Channel> {
    match positional {
        [kind, id] => match kind.as_str() {
            "conversation" | "chat" => Some(Channel::Conversation(Id::parse(id))),
            "event" | "questions" => Some(Channel::EventQuestions(Id::parse(id))),
            _ => None,
        },
        _ => None,
    }
}

fn print_usage() {
    println!("{}", "chatsync".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  chatsync [flags] {} <id>", "conversation".cyan());
    println!("  chatsync [flags] {} <id>", "event".cyan());
    println!();
    println!("Each line typed on stdin is sent to the open view.");
    println!(
        "Flags: --api --ws --data-dir --mode push|poll --poll-ms --reconnect --timeout-ms --max-len"
    );
}

/// What has already been printed
#[derive(Default)]
struct Seen {
    items: HashSet<Id>,
    pending: HashSet<Uuid>,
    error: Option<String>,
}

/// Print items, pending sends and errors not printed before
fn render(state: &ViewState, seen: &mut Seen, me: &Id) {
    for item in &state.items {
        if !seen.items.insert(item.id.clone()) {
            continue;
        }
        let who = match &item.sender_id {
            Some(sender) if sender == me => "me".green().to_string(),
            Some(sender) => sender.to_string().cyan().to_string(),
            None => "?".dimmed().to_string(),
        };
        println!("{} {} {}", item.created_at.dimmed(), who, item.content);
    }
    for pending in &state.pending {
        if seen.pending.insert(pending.key) {
            println!("{} {} {}", "sending".dimmed(), "me".green(), pending.content.dimmed());
        }
    }
    if state.error != seen.error {
        if let Some(error) = &state.error {
            eprintln!("{} {}", "✗".red().bold(), error.red());
        }
        seen.error = state.error.clone();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
