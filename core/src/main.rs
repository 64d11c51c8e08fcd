/// marketchat - terminal client for marketplace chat
use marketchat_core::conversation_store::PageLoad;
use marketchat_core::messenger_types::{ChatEvent, MessageEntry};
use marketchat_core::{AuthContext, ChatClient, Config};
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let token = env::var("MARKETCHAT_TOKEN")
        .map_err(|_| anyhow::anyhow!("MARKETCHAT_TOKEN must be set"))?;
    let user_id = config
        .user_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--user or MARKETCHAT_USER must be set"))?;
    let auth = AuthContext::with_session(token, user_id.clone())?;

    let client = ChatClient::new(config, auth)?;
    let mut events = client.connection().subscribe();
    client.start().await?;
    info!("Signed in as {}", user_id);

    let printer = {
        let me = user_id.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ChatEvent::Inbound { message } if message.sender_id != me => {
                        println!("[{}] {}: {}", message.conversation_id, message.sender_id, message.content);
                    }
                    ChatEvent::Ack { response } => {
                        if let Some(reason) = response.message {
                            println!("! {}", reason);
                        }
                    }
                    ChatEvent::Connected { .. } => println!("* connected"),
                    ChatEvent::Disconnected { reason } => println!("* disconnected ({})", reason),
                    _ => {}
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let result = match parts.next() {
            Some("/quit") => break,
            Some("/list") => list(&client).await,
            Some("/open") => match parts.next() {
                Some(id) => client.open(id).await.map(report),
                None => {
                    println!("usage: /open <conversation-id>");
                    Ok(())
                }
            },
            Some("/with") => match parts.next() {
                Some(other) => client.open_with(other, parts.next()).await.map(|c| {
                    println!("* opened {}", c.id);
                }),
                None => {
                    println!("usage: /with <user-id> [item-id]");
                    Ok(())
                }
            },
            Some("/more") => client.store().load_older().await.map(report),
            Some("/show") => {
                show(&client).await;
                Ok(())
            }
            Some("/retry") => match parts.next() {
                Some(local_id) => client.composer().retry(local_id).await,
                None => {
                    println!("usage: /retry <local-id>");
                    Ok(())
                }
            },
            Some(_) => client.send(line).await.map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!("{}", e);
            println!("! {}", e.user_message());
        }
    }

    client.stop().await;
    printer.abort();
    Ok(())
}

async fn list(client: &ChatClient) -> marketchat_core::Result<()> {
    client.store().load_conversations().await?;
    for c in client.store().conversations().await {
        println!(
            "{}  unread={}  {}",
            c.id,
            c.unread_count,
            c.last_message_preview.unwrap_or_default()
        );
    }
    Ok(())
}

async fn show(client: &ChatClient) {
    for entry in client.store().messages().await {
        let marker = match &entry {
            MessageEntry::Pending { failed: true, .. } => "!",
            MessageEntry::Pending { .. } => "~",
            MessageEntry::Confirmed(_) => " ",
        };
        let m = entry.message();
        println!("{} {} {}: {}", marker, entry.id(), m.sender_id, m.content);
    }
}

fn report(load: PageLoad) {
    match load {
        PageLoad::Loaded { count, has_more } => {
            println!("* {} messages{}", count, if has_more { " (more: /more)" } else { "" })
        }
        PageLoad::Stale => {}
    }
}
