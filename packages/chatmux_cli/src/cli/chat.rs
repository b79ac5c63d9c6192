use anyhow::{Context, Result};
use chatmux::SessionId;
use std::path::PathBuf;

use super::{Client, check_model, run_loop};
use crate::config::FileConfig;
use crate::history::JsonHistory;
use crate::render::Renderer;

/// Single-session chat on stdin/stdout.
pub async fn chat_command(
    config: &FileConfig,
    url: Option<&str>,
    session: Option<String>,
    history: Option<PathBuf>,
) -> Result<()> {
    check_model(config);

    let mut client = Client::connect(config, url);
    let mut renderer = Renderer::streaming();
    let id = client
        .registry
        .create_session(session.map(SessionId::from), config.run_options())
        .id()
        .clone();
    eprintln!("[chatmux: session {id}]");

    if let Some(path) = history {
        let source = JsonHistory::new(&path);
        let session = client
            .registry
            .get_mut(&id)
            .context("Session disappeared before history load")?;
        let loaded = session
            .hydrate(&source)
            .await
            .with_context(|| format!("Failed to load history from {}", path.display()))?;
        if loaded > 0 {
            renderer.print_history(&session.snapshot(), &mut std::io::stdout())?;
        }
    }

    let result = run_loop(&mut client, &mut renderer, |registry, text| {
        let Some(session) = registry.get_mut(&id) else {
            return Vec::new();
        };
        let options = session.options().clone();
        match session.start_run(text, options) {
            Ok(started) => vec![started],
            Err(e) => {
                eprintln!("[chatmux: {e}]");
                Vec::new()
            }
        }
    })
    .await;

    client.shutdown();
    result
}
