//! AnoGram - Bluetooth LE Mesh Chat
//!
//! Headless node: lines typed on stdin are sent to the mesh, lines starting
//! with `/` are commands, received messages are printed to stdout.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use anogram_mesh::bluetooth::BleRadio;
use anogram_mesh::{MeshConfig, MeshEvent, MeshService};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    Scan,
    Stop,
    Peers,
    Connect(String),
    Disconnect(String),
    Pending,
    Status,
    Name(String),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(command) = line.strip_prefix('/') else {
            return Some(Command::Send(line.to_string()));
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };

        let command = match (name, argument) {
            ("scan", _) => Command::Scan,
            ("stop", _) => Command::Stop,
            ("peers", _) => Command::Peers,
            ("pending", _) => Command::Pending,
            ("status", _) => Command::Status,
            ("quit" | "exit", _) => Command::Quit,
            ("connect", address) if !address.is_empty() => Command::Connect(address.to_string()),
            ("disconnect", address) if !address.is_empty() => {
                Command::Disconnect(address.to_string())
            }
            ("name", name) if !name.is_empty() => Command::Name(name.to_string()),
            _ => Command::Help,
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("=== AnoGram: Bluetooth LE Mesh Chat ===");

    let config = MeshConfig::load().context("Failed to load configuration")?;
    let device_id = config.device_id.clone();

    let (radio, radio_events) = BleRadio::open(&config)
        .await
        .context("Failed to open Bluetooth radio")?;
    let service = MeshService::spawn(config, Arc::new(radio), radio_events);

    tokio::spawn(print_events(service.subscribe_events()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(command) => {
                        if let Err(e) = run_command(&service, &device_id, command).await {
                            warn!("Command failed: {:#}", e);
                        }
                    }
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    service.shutdown().await?;
    Ok(())
}

async fn run_command(service: &MeshService, device_id: &str, command: Command) -> Result<()> {
    match command {
        Command::Send(content) => {
            let message = service.send_message(content).await?;
            let pending = service.get_pending_messages().await?;
            if pending.iter().any(|m| m.id == message.id) {
                println!("(queued, no peers connected)");
            }
        }
        Command::Scan => service.start_scan(),
        Command::Stop => service.stop_scan(),
        Command::Peers => {
            let peers = service.get_peer_list();
            if peers.is_empty() {
                println!("No peers discovered");
            }
            for peer in peers {
                println!(
                    "{} {:<20} {:>4} dBm {:>3.0}%{}",
                    peer.address,
                    peer.name,
                    peer.rssi,
                    peer.signal_quality() * 100.0,
                    if peer.is_connected { "  connected" } else { "" }
                );
            }
        }
        Command::Connect(address) => service.connect_peer(address),
        Command::Disconnect(address) => service.disconnect_peer(address),
        Command::Pending => {
            for message in service.get_pending_messages().await? {
                println!("{} {}", message.id, message.get_summary(60));
            }
        }
        Command::Status => {
            let status = service.get_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Name(name) => service.set_device_info(device_id, name),
        Command::Help => {
            println!("/scan /stop /peers /connect <addr> /disconnect <addr> /pending /status /name <name> /quit");
        }
        Command::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<MeshEvent>) {
    loop {
        match events.recv().await {
            Ok(MeshEvent::MessageReceived(message)) => {
                let via = if message.is_relayed {
                    format!(" (via {} hops)", message.hop_count)
                } else {
                    String::new()
                };
                println!(
                    "<{}> {}{}",
                    message.get_sender_display_name(),
                    message.content,
                    via
                );
            }
            Ok(MeshEvent::PeerConnected(address)) => println!("* connected to {}", address),
            Ok(MeshEvent::PeerDisconnected(address)) => println!("* disconnected from {}", address),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} mesh events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(Command::parse("  hello there "), Some(Command::Send("hello there".into())));
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(Command::parse("/scan"), Some(Command::Scan));
        assert_eq!(
            Command::parse("/connect AA:BB:CC:DD:EE:FF"),
            Some(Command::Connect("AA:BB:CC:DD:EE:FF".into()))
        );
        assert_eq!(Command::parse("/name  Bob "), Some(Command::Name("Bob".into())));
        assert_eq!(Command::parse("/connect"), Some(Command::Help));
        assert_eq!(Command::parse("/bogus"), Some(Command::Help));
    }
}
