//! `vidqa run`: a headless host
//!
//! Reads one command per line from stdin, plays it against a simulated page
//! and the projector, and prints the resulting view.
//!
//! ```text
//! open <url> [title]      in-page navigation
//! retitle <url> [title]   navigation only the title change reveals
//! goto <url> [title]      navigation only the location poll reveals
//! ask <question>
//! switch <video>          clear <video>          delete <video> yes
//! jump <seconds>          reingest               show          quit
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use vidqa_core::content::content_id_from_url;
use vidqa_core::format::format_offset;
use vidqa_core::{
    Config, ContentId, PageLocation, PlayerControl, Projector, ServiceClient, SessionStore,
    SimulatedPage, Synchronizer,
};

use crate::render;

const NAVIGATION_WAIT: Duration = Duration::from_secs(3);

/// Prints seeks instead of moving a real player
struct ConsolePlayer;

impl PlayerControl for ConsolePlayer {
    fn seek(&self, seconds: f64) -> vidqa_core::Result<()> {
        println!("player> seek to {}", format_offset(seconds));
        Ok(())
    }
}

pub async fn run(config: &Config, store: SessionStore, json: bool) -> Result<()> {
    let service = ServiceClient::new(&config.service).context("failed to create service client")?;
    let page = SimulatedPage::new();
    let sync = Synchronizer::start(
        config,
        store,
        Arc::new(service),
        page.clone(),
        Arc::new(ConsolePlayer),
    )
    .context("failed to start synchronizer")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        match execute(&sync, &page, line).await {
            Ok(()) => print_view(sync.projector(), json)?,
            Err(e) => println!("error: {:#}", e),
        }
    }

    sync.shutdown().await;
    Ok(())
}

fn print_view(projector: &Projector, json: bool) -> Result<()> {
    projector.refresh();
    let view = projector.current();
    if json {
        println!("{}", serde_json::to_string(&view)?);
    } else {
        print!("{}", render::view(&view));
    }
    Ok(())
}

fn split_word(input: &str) -> (&str, &str) {
    match input.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (input, ""),
    }
}

async fn execute(sync: &Synchronizer, page: &SimulatedPage, line: &str) -> Result<()> {
    let (command, rest) = split_word(line);
    let projector = sync.projector();

    match command {
        "open" | "retitle" | "goto" => {
            let (url, title) = split_word(rest);
            if url.is_empty() {
                bail!("usage: {} <url> [title]", command);
            }
            let location = PageLocation::new(url, title);
            match command {
                "open" => page.navigate(location),
                "retitle" => page.navigate_then_retitle(location),
                _ => page.navigate_silently(location),
            }
            wait_for_url(projector, url).await
        }
        "ask" => {
            projector.ask(rest).await?;
            Ok(())
        }
        "switch" => Ok(projector.switch_session(&ContentId::from(rest))?),
        "clear" => Ok(projector.clear_conversation(&ContentId::from(rest))?),
        "delete" => {
            let (id, confirm) = split_word(rest);
            if confirm != "yes" {
                bail!("confirm with: delete {} yes", id);
            }
            if !projector.delete_session(&ContentId::from(id))? {
                println!("no session {}", id);
            }
            Ok(())
        }
        "jump" => {
            let seconds: f64 = rest.parse().context("usage: jump <seconds>")?;
            Ok(projector.jump_to_time(seconds).await?)
        }
        "reingest" => {
            let location = sync
                .store()
                .location()?
                .context("no page has been observed yet")?;
            sync.ingest().reingest(&location)?;
            Ok(())
        }
        "show" => Ok(()),
        other => bail!("unknown command: {}", other),
    }
}

/// Block until the navigation has been handled by the background context
async fn wait_for_url(projector: &Projector, url: &str) -> Result<()> {
    let content_id = content_id_from_url(url);
    let mut view = projector.subscribe();
    tokio::time::timeout(
        NAVIGATION_WAIT,
        view.wait_for(|v| {
            v.page_url.as_deref() == Some(url)
                && (content_id.is_none() || v.active_session_id == content_id)
        }),
    )
    .await
    .context("navigation was not observed in time")?
    .context("projector stopped")?;
    Ok(())
}
