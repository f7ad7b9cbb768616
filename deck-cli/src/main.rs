//! Headless client for collaborative slide decks.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deck_collab::{
    CatalogClient, CatalogConfig, ChannelEvent, ConnectionState, Session, SessionConfig,
    SessionEvent, StoreView,
};

/// Follow and edit shared slide decks from the terminal.
#[derive(Parser, Debug)]
#[command(name = "deck")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// WebSocket URL of the presentation authority
    #[arg(long, global = true, env = "DECK_SERVER_URL", default_value = "ws://127.0.0.1:3000")]
    server_url: String,

    /// Base URL of the presentation catalog
    #[arg(long, global = true, env = "DECK_API_URL", default_value = "http://127.0.0.1:3000")]
    api_url: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List presentations
    List,

    /// Create a presentation
    Create {
        /// Presentation title
        #[arg(short, long)]
        title: String,

        /// Nickname of the creator
        #[arg(short, long, env = "DECK_NICKNAME")]
        nickname: String,
    },

    /// Join a presentation and print its outline on every change
    Follow {
        presentation_id: String,

        #[arg(short, long, env = "DECK_NICKNAME")]
        nickname: String,
    },

    /// Join a presentation, apply edits, then leave
    Edit {
        presentation_id: String,

        #[arg(short, long, env = "DECK_NICKNAME")]
        nickname: String,

        /// Append a new slide (becomes the current slide)
        #[arg(long)]
        add_slide: bool,

        /// Add a text block to the current slide with this Markdown content
        #[arg(long, value_name = "MARKDOWN")]
        add_block: Option<String>,

        /// Show this slide, on every client if permitted
        #[arg(long, value_name = "SLIDE_ID")]
        navigate: Option<String>,

        /// How long to wait for the snapshot, in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match &cli.command {
        Command::List => list(&cli).await,
        Command::Create { title, nickname } => create(&cli, title, nickname).await,
        Command::Follow {
            presentation_id,
            nickname,
        } => follow(session_config(&cli, presentation_id, nickname)).await,
        Command::Edit {
            presentation_id,
            nickname,
            add_slide,
            add_block,
            navigate,
            timeout,
        } => {
            let edits = Edits {
                add_slide: *add_slide,
                add_block: add_block.clone(),
                navigate: navigate.clone(),
            };
            edit(
                session_config(&cli, presentation_id, nickname),
                edits,
                Duration::from_secs(*timeout),
            )
            .await
        }
    }
}

fn catalog(cli: &Cli) -> Result<CatalogClient> {
    let config = CatalogConfig {
        base_url: cli.api_url.clone(),
        ..CatalogConfig::default()
    };
    CatalogClient::new(config).context("Failed to build catalog client")
}

fn session_config(cli: &Cli, presentation_id: &str, nickname: &str) -> SessionConfig {
    SessionConfig {
        server_url: cli.server_url.clone(),
        ..SessionConfig::new(nickname, presentation_id)
    }
}

async fn list(cli: &Cli) -> Result<()> {
    let presentations = catalog(cli)?
        .list_presentations()
        .await
        .context("Failed to list presentations")?;

    if presentations.is_empty() {
        println!("No presentations.");
        return Ok(());
    }
    for p in presentations {
        println!(
            "{}  {:<30}  {:>3} slides  by {}",
            p.id,
            p.title,
            p.slide_count(),
            p.creator_nickname().unwrap_or("?")
        );
    }
    Ok(())
}

async fn create(cli: &Cli, title: &str, nickname: &str) -> Result<()> {
    let presentation = catalog(cli)?
        .create_presentation(title, nickname)
        .await
        .context("Failed to create presentation")?;
    println!("{}", presentation.id);
    Ok(())
}

async fn follow(config: SessionConfig) -> Result<()> {
    let mut session = Session::connect(config).context("Failed to start session")?;
    let mut printed = 0;

    loop {
        let event = tokio::select! {
            event = session.next() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            None => break,
            Some(SessionEvent::Channel(ChannelEvent::Failed { attempts })) => {
                bail!("Connection lost after {attempts} reconnect attempts");
            }
            Some(_) => {}
        }

        let version = session.store().version();
        if version != printed {
            printed = version;
            print!("{}", render_outline(&session.store().view()));
        }
    }

    session.close();
    Ok(())
}

#[derive(Debug, Default)]
struct Edits {
    add_slide: bool,
    add_block: Option<String>,
    navigate: Option<String>,
}

async fn edit(config: SessionConfig, edits: Edits, wait: Duration) -> Result<()> {
    let mut session = Session::connect(config).context("Failed to start session")?;

    tokio::time::timeout(wait, async {
        while session.store().snapshot().is_none() {
            match session.next().await {
                None | Some(SessionEvent::Channel(ChannelEvent::Failed { .. })) => {
                    bail!("Connection closed before the presentation arrived")
                }
                Some(_) => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("Timed out waiting for the presentation")??;

    if edits.add_slide {
        let slide = session.add_slide()?;
        log::info!("Added slide {}", slide.id);
    }

    if let Some(content) = &edits.add_block {
        let slide_id = session
            .store()
            .current_slide()
            .map(|s| s.id)
            .context("No current slide")?;
        let block = session.add_block(&slide_id)?;
        session.update_block_content(&slide_id, &block.id, content)?;
        log::info!("Added block {} to slide {slide_id}", block.id);
    }

    if let Some(slide_id) = &edits.navigate {
        if session.navigate_slide(slide_id)? {
            log::info!("Navigated every client to {slide_id}");
        } else {
            log::info!("Navigated locally to {slide_id}");
        }
    }

    session.flush();
    print!("{}", render_outline(&session.store().view()));
    session.close();

    // Give the transport task time to write what was flushed.
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while session.channel().state() != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        log::warn!("Transport did not shut down cleanly");
    }
    Ok(())
}

/// Plain-text outline of the presentation, current slide marked with `>`.
fn render_outline(view: &StoreView) -> String {
    let mut out = String::new();
    let Some(presentation) = view.presentation.as_deref() else {
        out.push_str("(no presentation loaded)\n");
        return out;
    };

    let role = view
        .current_role()
        .map_or_else(|| "unresolved".to_string(), |r| r.to_string());
    let _ = writeln!(out, "{} [{}] as {} ({role})", presentation.title, presentation.id, view.nickname);

    let current = view.selection.current_slide_id.as_deref();
    for (i, slide) in presentation.slides.iter().enumerate() {
        let marker = if Some(slide.id.as_str()) == current { '>' } else { ' ' };
        let _ = writeln!(out, "{marker} {:>2}. {} ({} blocks)", i + 1, slide.title, slide.blocks.len());
        for block in &slide.blocks {
            let first_line = block.content.lines().next().unwrap_or("");
            let _ = writeln!(out, "       - {first_line}");
        }
    }

    let users: Vec<String> = presentation
        .users
        .iter()
        .map(|u| format!("{} ({})", u.nickname, u.role))
        .collect();
    let _ = writeln!(out, "  users: {}", users.join(", "));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use deck_core::{Presentation, Role, TextBlock, User};
    use std::sync::Arc;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_edit_args_parse() {
        let cli = Cli::try_parse_from([
            "deck",
            "edit",
            "p1",
            "--nickname",
            "alice",
            "--add-block",
            "# Hello",
            "--navigate",
            "s2",
        ])
        .unwrap();
        match cli.command {
            Command::Edit {
                presentation_id,
                add_block,
                navigate,
                add_slide,
                ..
            } => {
                assert_eq!(presentation_id, "p1");
                assert_eq!(add_block.as_deref(), Some("# Hello"));
                assert_eq!(navigate.as_deref(), Some("s2"));
                assert!(!add_slide);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_outline_marks_current_slide() {
        let mut p = Presentation::new("Roadmap", User::new("alice", Role::Creator));
        p.slides[0]
            .blocks
            .push(TextBlock::new("Goals\nmore", 0.0, 0.0));
        let current = p.slides[0].id.clone();
        let mut view = StoreView {
            presentation: Some(Arc::new(p)),
            nickname: "alice".into(),
            ..StoreView::default()
        };
        view.selection.current_slide_id = Some(current);

        let outline = render_outline(&view);
        assert!(outline.contains(">  1. New Slide (1 blocks)"));
        assert!(outline.contains("- Goals\n"));
        assert!(outline.contains("alice (CREATOR)"));
    }

    #[test]
    fn test_outline_without_presentation() {
        assert_eq!(render_outline(&StoreView::default()), "(no presentation loaded)\n");
    }
}
