mod chat;
mod multi;

pub use chat::chat_command;
pub use multi::multi_command;

use anyhow::{Context, Result};
use chatmux::{Catalog, ConnectionState, ProtocolMessage, SessionEvent, SessionRegistry, ws};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::FileConfig;
use crate::render::Renderer;

#[derive(Debug, PartialEq, Eq)]
enum InputLine {
    Quit,
    Reset,
    Prompt(String),
    Empty,
}

fn parse_line(line: &str) -> InputLine {
    match line.trim() {
        "" => InputLine::Empty,
        "/quit" | "/exit" => InputLine::Quit,
        "/reset" | "/stop" => InputLine::Reset,
        _ => InputLine::Prompt(line.to_string()),
    }
}

/// One shared connection plus the sessions multiplexed over it.
struct Client {
    registry: SessionRegistry,
    inbound: mpsc::Receiver<ProtocolMessage>,
    state: watch::Receiver<ConnectionState>,
    driver: JoinHandle<()>,
}

impl Client {
    fn connect(config: &FileConfig, url: Option<&str>) -> Self {
        let ws_config = config.connection.ws_config(url);
        let (connection, inbound, driver) = ws::spawn(ws_config);
        let state = connection.subscribe_state();
        Self {
            registry: SessionRegistry::new(Arc::new(connection)),
            inbound,
            state,
            driver,
        }
    }

    fn shutdown(self) {
        self.driver.abort();
    }
}

/// Warn early about a model the run requests would be rejected for.
fn check_model(config: &FileConfig) {
    let options = config.run_options();
    let Some(model) = options.model else {
        warn!("no model configured; set [model] provider and name");
        return;
    };
    match config.catalog().list_available_models() {
        Ok(models) if !models.is_empty() => {
            if !models
                .iter()
                .any(|m| m.provider == model.provider && m.name == model.name)
            {
                warn!(%model, "configured model is not in the catalog");
            }
        }
        Ok(_) => debug!("catalog is empty, skipping model check"),
        Err(e) => warn!(error = %e, "could not list models"),
    }
}

/// Drive stdin and the connection until `/quit`, EOF or the driver stops.
async fn run_loop<F>(client: &mut Client, renderer: &mut Renderer, mut on_prompt: F) -> Result<()>
where
    F: FnMut(&mut SessionRegistry, &str) -> Vec<SessionEvent>,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_line(&line) {
                    InputLine::Quit => break,
                    InputLine::Empty => {}
                    InputLine::Reset => {
                        for id in client.registry.session_ids().to_vec() {
                            if client.registry.reset(&id) {
                                eprintln!("[chatmux: stopped waiting on {id}]");
                            }
                        }
                    }
                    InputLine::Prompt(text) => {
                        for event in on_prompt(&mut client.registry, &text) {
                            renderer.render(&event, &mut stdout)?;
                        }
                    }
                }
            }

            message = client.inbound.recv() => {
                let Some(message) = message else {
                    warn!("connection driver stopped");
                    break;
                };
                for event in client.registry.dispatch(&message) {
                    renderer.render(&event, &mut stdout)?;
                }
            }

            changed = client.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *client.state.borrow_and_update();
                eprintln!("[chatmux: connection {state}]");
            }
        }
    }
    Ok(())
}
