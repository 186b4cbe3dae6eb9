//! dirwire-probe: check that a directory server answers an anonymous bind.
//!
//! Run with: `cargo run -p dirwire-probe -- ldap.example.org --port 389`

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dirwire_core::{
    Connection, ConnectionConfig, RequestOptions, TcpSocketFactory, TracingWireTrace,
};

/// `BindRequest { version 3, name "", simple "" }`
const ANONYMOUS_BIND: [u8; 9] = [0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00];

#[derive(Parser)]
#[command(name = "dirwire-probe")]
#[command(about = "Bind anonymously to a directory server and print the result code")]
struct Cli {
    /// Server host name or address
    host: String,
    /// Server port
    #[arg(long, default_value_t = 389)]
    port: u16,
    /// Connect timeout in milliseconds (0 for none)
    #[arg(long)]
    connect_timeout_ms: Option<i64>,
    /// Read timeout in milliseconds (0 for none)
    #[arg(long)]
    read_timeout_ms: Option<i64>,
    /// Dump every frame at trace level
    #[arg(long)]
    trace_wire: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = ConnectionConfig::from_env(cli.host.clone(), cli.port);
    if let Some(ms) = cli.connect_timeout_ms {
        config.connect_timeout = dirwire_core::timeout_from_millis(ms);
    }
    if let Some(ms) = cli.read_timeout_ms {
        config.read_timeout = dirwire_core::timeout_from_millis(ms);
    }
    if config.read_timeout.is_none() {
        config.read_timeout = Some(Duration::from_secs(30));
    }
    if cli.trace_wire {
        config = config.with_trace(Arc::new(TracingWireTrace));
    }
    tracing::debug!(?config, "probing");

    let conn = Connection::open(config, Arc::new(TcpSocketFactory), None).await?;
    let bind = conn
        .write_request(&ANONYMOUS_BIND, RequestOptions::default())
        .await?;
    let reply = match conn.read_reply(&bind).await {
        Ok(reply) => reply,
        Err(e) => {
            if e.requires_abandon() {
                conn.abandon_request(&bind, &[]).await;
            }
            conn.close(&[]).await;
            return Err(e.into());
        }
    };
    let code = reply.result_code()?;
    if code == 0 {
        conn.set_bound(true);
    }
    println!("{}:{} bind result code {code}", cli.host, cli.port);

    conn.close(&[]).await;
    Ok(())
}
