//! Simple IRC client example
//!
//! Connects over TLS, registers, joins a channel and answers server PINGs
//! until the connection closes. Keepalive PINGs and dead-server detection
//! are handled by the library.
//!
//! ```text
//! RUST_LOG=slirc_link=debug cargo run --example simple_client -- irc.libera.chat 6697 '#example'
//! ```

use std::sync::Arc;

use anyhow::Context;
use slirc_link::{Backend, Connection, ConnectionConfig, Error, Handler, TlsConfig};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Forwards every line to the main task, which owns the protocol logic.
struct Forwarder {
    lines: mpsc::UnboundedSender<String>,
}

impl Handler for Forwarder {
    fn on_connect(&self) {
        info!("connected");
    }

    fn on_message(&self, line: &str) {
        let _ = self.lines.send(line.to_string());
    }

    fn on_close(&self) {
        info!("connection closed");
    }

    fn on_error(&self, error: &Error) {
        error!(%error, "connection error");
    }
}

async fn handle_line(
    conn: &Connection,
    channel: &str,
    joined: &mut bool,
    line: &str,
) -> anyhow::Result<()> {
    println!("← {line}");

    let mut words = line.split(' ');
    let first = words.next().unwrap_or_default();
    if first == "PING" {
        let token = line.trim_start_matches("PING").trim_start();
        conn.send_line(&format!("PONG {token}")).await?;
        return Ok(());
    }

    let command = if first.starts_with(':') {
        words.next().unwrap_or_default()
    } else {
        first
    };
    match command {
        "001" if !*joined => {
            *joined = true;
            conn.send_line(&format!("JOIN {channel}")).await?;
            conn.send_line(&format!("PRIVMSG {channel} :Hello from slirc-link!"))
                .await?;
        }
        "ERROR" => conn.abort().await,
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "irc.libera.chat".to_string());
    let port = match args.next() {
        Some(port) => port.parse::<u16>().context("invalid port")?,
        None => 6697,
    };
    let channel = args.next().unwrap_or_else(|| "#example".to_string());

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    let backend = Backend::new(
        tokio::runtime::Handle::current(),
        ConnectionConfig::default(),
        Arc::new(Forwarder { lines: lines_tx }),
    );

    let conn = match backend
        .connect(&host, port, None, Some(&TlsConfig::default()))
        .await
    {
        Ok(conn) => conn,
        Err(e) if e.is_certificate_mismatch() => {
            // nothing on this host can be trusted; do not retry
            error!("certificate does not match {host}, giving up");
            std::process::exit(2);
        }
        Err(e) => return Err(anyhow::Error::new(e).context("connect failed")),
    };

    conn.send_line("NICK example_bot").await?;
    conn.send_line("USER example 0 * :Example Bot").await?;

    let mut joined = false;
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                handle_line(&conn, &channel, &mut joined, &line).await?;
            }
            _ = conn.closed() => break,
            _ = tokio::signal::ctrl_c() => {
                conn.send_line("QUIT :Goodbye!").await?;
                conn.close().await;
                break;
            }
        }
    }

    Ok(())
}
