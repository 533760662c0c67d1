use crate::config::Config;
use crate::directory::DirectoryPoller;
use crate::error::SyncError;
use crate::identity::{self, Identity};
use crate::local_store::LocalStore;
use crate::model::{CurrentUser, Id, Item};
use crate::normalize::normalize;
use crate::rest::{Backend, RestClient};
use crate::routes::Channel;
use crate::view::{LiveView, SendOutcome};
use crate::watermark::ReadWatermarks;
use colored::*;

/// One-shot commands over the same local state the live view uses.
pub fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("cli")
        .to_string();

    let (config, positional) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let Some(command) = positional.first() else {
        print_usage(&bin);
        return Ok(());
    };
    let rest = &positional[1..];

    let runtime = tokio::runtime::Runtime::new()?;
    let store = LocalStore::open(&config.data_dir)?;

    let outcome = match command.as_str() {
        "login" => {
            if rest.len() < 2 {
                eprintln!(
                    "{}",
                    format!("Usage: {} login <user_id> <token> [username]", bin).yellow()
                );
                return Ok(());
            }
            login(&store, rest)
        }
        "logout" => logout(&store),
        "whoami" => whoami(&store),
        "conversations" => runtime.block_on(conversations(&config, &store)),
        "history" => match parse_channel(rest) {
            Some(channel) => runtime.block_on(history(&config, &store, channel)),
            None => {
                eprintln!(
                    "{}",
                    format!("Usage: {} history conversation|event <id>", bin).yellow()
                );
                return Ok(());
            }
        },
        "send" => match (parse_channel(rest), rest.get(2..)) {
            (Some(channel), Some(words)) if !words.is_empty() => {
                runtime.block_on(send(&config, &store, channel, &words.join(" ")))
            }
            _ => {
                eprintln!(
                    "{}",
                    format!("Usage: {} send conversation|event <id> <text>", bin).yellow()
                );
                return Ok(());
            }
        },
        "read" => {
            let Some(conversation) = rest.first() else {
                eprintln!("{}", format!("Usage: {} read <conversation_id>", bin).yellow());
                return Ok(());
            };
            mark_read(&store, conversation)
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
            return Ok(());
        }
    };

    if let Err(e) = outcome {
        eprintln!("{} Error: {}", "✗".red().bold(), e.to_string().red());
        std::process::exit(1);
    }
    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ chatsync CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [flags] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!(
        "  {} <user_id> <token> [username]   Store the signed-in identity",
        "login".cyan()
    );
    println!("  {}                               Forget the identity", "logout".cyan());
    println!("  {}                               Show the identity", "whoami".cyan());
    println!(
        "  {}                        List conversations with unread flags",
        "conversations".cyan()
    );
    println!(
        "  {} conversation|event <id>       Print a collection in order",
        "history".cyan()
    );
    println!(
        "  {} conversation|event <id> <text>   Send one item",
        "send".cyan()
    );
    println!(
        "  {} <conversation_id>                Mark a conversation read",
        "read".cyan()
    );
}

fn parse_channel(args: &[String]) -> Option<Channel> {
    let (kind, id) = (args.first()?, args.get(1)?);
    match kind.as_str() {
        "conversation" | "chat" => Some(Channel::Conversation(Id::parse(id))),
        "event" | "questions" => Some(Channel::EventQuestions(Id::parse(id))),
        _ => None,
    }
}

fn client(config: &Config, me: &Identity) -> Result<RestClient, SyncError> {
    RestClient::new(
        &config.api_base,
        Some(me.token.clone()),
        config.request_timeout,
    )
}

fn login(store: &LocalStore, args: &[String]) -> Result<(), SyncError> {
    let token = args[1].trim();
    if token.is_empty() {
        return Err(SyncError::Validation("Token cannot be empty".to_string()));
    }
    let me = Identity {
        user: CurrentUser {
            id: Id::parse(&args[0]),
            username: args.get(2).cloned(),
        },
        token: token.to_string(),
    };
    identity::save(store, &me)?;
    println!("{} Signed in as {}", "✓".green().bold(), display_user(&me.user).cyan());
    Ok(())
}

fn logout(store: &LocalStore) -> Result<(), SyncError> {
    identity::clear(store)?;
    println!("{} Signed out", "✓".green().bold());
    Ok(())
}

fn whoami(store: &LocalStore) -> Result<(), SyncError> {
    let me = identity::load(store)?;
    println!("{}", display_user(&me.user).cyan());
    Ok(())
}

fn display_user(user: &CurrentUser) -> String {
    match &user.username {
        Some(name) => format!("{} (id {})", name, user.id),
        None => format!("id {}", user.id),
    }
}

async fn conversations(config: &Config, store: &LocalStore) -> Result<(), SyncError> {
    let me = identity::load(store)?;
    let poller = DirectoryPoller::new(
        client(config, &me)?,
        &me,
        store.clone(),
        config.directory_poll_interval,
    );

    let entries = match poller.poll_once().await {
        Ok(entries) => entries,
        Err(e) if !e.is_transient() => return Err(e),
        Err(e) => {
            // Backend unreachable: show the flags from the last successful scan.
            let previous = poller.stored_unread().unwrap_or_default();
            if previous.is_empty() {
                return Err(e);
            }
            eprintln!("{} {}", "!".yellow().bold(), e.user_message().yellow());
            println!("{}", "Last known unread flags:".bright_white().bold());
            for (peer, unread) in previous {
                println!("  peer {} {}", peer.cyan(), unread_mark(unread));
            }
            return Ok(());
        }
    };

    if entries.is_empty() {
        println!("{}", "No conversations".yellow());
        return Ok(());
    }
    let unread = entries.iter().filter(|e| e.unread).count();
    println!(
        "{}",
        format!("Conversations ({}, {} unread)", entries.len(), unread)
            .bright_cyan()
            .bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for entry in entries {
        let peer = entry
            .peer_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  #{} with {} {}",
            entry.conversation_id.to_string().cyan(),
            peer.green(),
            unread_mark(entry.unread)
        );
    }
    Ok(())
}

fn unread_mark(unread: bool) -> ColoredString {
    if unread {
        "● unread".yellow().bold()
    } else {
        "read".dimmed()
    }
}

async fn history(config: &Config, store: &LocalStore, channel: Channel) -> Result<(), SyncError> {
    let me = identity::load(store)?;
    let raw = client(config, &me)?.fetch(&channel.collection_path()).await?;
    let items = normalize(&raw);

    if items.is_empty() {
        println!("{}", "Nothing here yet".yellow());
        return Ok(());
    }
    for item in &items {
        print_item(item, &me);
    }
    if let (Some(conversation), Some(latest)) = (
        channel.watermark_id(),
        items.iter().filter_map(Item::timestamp).max(),
    ) {
        ReadWatermarks::new(store.clone()).advance(&conversation, latest)?;
    }
    Ok(())
}

fn print_item(item: &Item, me: &Identity) {
    let who = match &item.sender_id {
        Some(sender) if sender == me.user_id() => "me".green(),
        Some(sender) => sender.to_string().cyan(),
        None => "?".dimmed(),
    };
    let votes = item
        .upvote_count()
        .map(|n| format!(" [+{}]", n))
        .unwrap_or_default();
    println!(
        "  {} {}: {}{}",
        item.created_at.dimmed(),
        who,
        item.content,
        votes.yellow()
    );
}

async fn send(
    config: &Config,
    store: &LocalStore,
    channel: Channel,
    text: &str,
) -> Result<(), SyncError> {
    let me = identity::load(store)?;
    let view = LiveView::from_config(
        config,
        channel,
        client(config, &me)?,
        me.clone(),
        ReadWatermarks::new(store.clone()),
    );

    let sent = view.send(text).await;
    view.close().await;
    match sent? {
        SendOutcome::Sent(item) => {
            println!(
                "{} Sent! ID: {}",
                "✓".green().bold(),
                item.id.to_string().cyan()
            );
        }
        SendOutcome::Ignored => println!("{}", "Nothing to send".yellow()),
    }
    Ok(())
}

fn mark_read(store: &LocalStore, conversation: &str) -> Result<(), SyncError> {
    let at = ReadWatermarks::new(store.clone()).force_now(conversation)?;
    println!(
        "{} Conversation {} read up to {}",
        "✓".green().bold(),
        conversation.cyan(),
        at.to_rfc3339().dimmed()
    );
    Ok(())
}
