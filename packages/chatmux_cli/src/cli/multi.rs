use anyhow::{Result, bail};
use chatmux::SessionEvent;

use super::{Client, check_model, run_loop};
use crate::config::FileConfig;
use crate::render::Renderer;

/// Fan each prompt out to `sessions` independent conversations.
pub async fn multi_command(config: &FileConfig, url: Option<&str>, sessions: usize) -> Result<()> {
    if sessions == 0 {
        bail!("--sessions must be at least 1");
    }
    check_model(config);

    let mut client = Client::connect(config, url);
    let mut renderer = Renderer::buffered();
    for n in 1..=sessions {
        let id = client
            .registry
            .create_session(None, config.run_options())
            .id()
            .clone();
        renderer.set_label(id, n.to_string());
    }
    eprintln!("[chatmux: {sessions} sessions]");

    let result = run_loop(&mut client, &mut renderer, |registry, text| {
        let started = registry.broadcast_run(text);
        if started.len() < registry.len() {
            eprintln!(
                "[chatmux: started {} of {} sessions, the rest are busy]",
                started.len(),
                registry.len()
            );
        }
        started
            .into_iter()
            .map(|session_id| SessionEvent::Started { session_id })
            .collect()
    })
    .await;

    client.shutdown();
    result
}
