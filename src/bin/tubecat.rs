//! tubecat
//!
//! Opens one tube over UDP and pipes it to stdin/stdout:
//! - `--connect` plays the client role and creates the tube
//! - `--listen` plays the server role and accepts the first tube

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use tubemux::{
    config::{generate_example_config, Config},
    transport::{MsgConn, UdpMsgConn},
    Muxer, Role, Tube, TubeError, TubeType,
};

/// Pipe stdin/stdout through a tube
#[derive(Parser, Debug)]
#[command(name = "tubecat")]
#[command(about = "Pipe stdin/stdout through a tube over UDP")]
#[command(version)]
struct Args {
    /// Wait for a peer on this address
    #[arg(short, long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Connect to a listening peer
    #[arg(short, long)]
    connect: Option<String>,

    /// Local address when connecting
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Configuration file path
    #[arg(long)]
    config: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Open an unreliable tube instead
    #[arg(short, long)]
    unreliable: bool,

    /// Tube type sent with the open request
    #[arg(short, long, default_value_t = TubeType::EXEC.0)]
    tube_type: u8,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        println!("{}", example);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    init_logging(&config, args.log_level.as_deref());

    let (conn, role) = match (&args.listen, &args.connect) {
        (Some(local), None) => {
            let conn = UdpMsgConn::accept(local)
                .await
                .with_context(|| format!("Failed to listen on {}", local))?;
            (conn, Role::Server)
        }
        (None, Some(remote)) => {
            let conn = UdpMsgConn::connect(&args.bind, remote)
                .await
                .with_context(|| format!("Failed to connect to {}", remote))?;
            (conn, Role::Client)
        }
        _ => bail!("exactly one of --listen or --connect is required"),
    };

    let conn: Arc<dyn MsgConn> = Arc::new(conn);
    let muxer = Muxer::new(conn, role, config.clone()).context("Invalid configuration")?;

    let tube = match role {
        Role::Client => {
            let tube_type = TubeType(args.tube_type);
            let created = if args.unreliable {
                muxer.create_unreliable_tube(tube_type).await
            } else {
                muxer.create_reliable_tube(tube_type).await
            };
            created.context("Failed to open tube")?
        }
        Role::Server => muxer.accept().await.context("Failed to accept tube")?,
    };
    info!("piping {:?}", tube);

    let chunk = if tube.is_reliable() {
        config.tube.max_frame_payload * 4
    } else {
        config.tube.max_frame_payload
    };

    let upload = tokio::spawn(stdin_to_tube(tube.clone(), chunk));
    let download = tube_to_stdout(tube.clone(), config.tube.max_frame_payload).await;

    if let Err(e) = &download {
        warn!("receive side ended: {}", e);
    }
    if !upload.is_finished() {
        upload.abort();
    } else {
        match upload.await {
            Ok(Err(e)) => warn!("send side ended: {}", e),
            Err(e) => warn!("send task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    muxer.stop().await;
    download
}

fn init_logging(config: &Config, level: Option<&str>) {
    let level = level.unwrap_or(config.logging.level.as_str());
    // Logs go to stderr so stdout carries only tube data
    let builder = tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr);
    if config.logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

async fn stdin_to_tube(tube: Tube, chunk: usize) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; chunk.max(1)];

    loop {
        let n = stdin.read(&mut buf).await.context("Failed to read stdin")?;
        if n == 0 {
            debug!("stdin closed, closing tube {}", tube.id());
            break;
        }
        tube.write_all(&buf[..n])
            .await
            .map_err(|e| anyhow!("Failed to write tube {}: {}", tube.id(), e))?;
    }

    match tube.close().await {
        Ok(()) | Err(TubeError::EndOfStream) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn tube_to_stdout(tube: Tube, max_message: usize) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; max_message.max(1) * 4];

    loop {
        let n = match tube.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(TubeError::EndOfStream | TubeError::MuxerStopped) => break,
            Err(e) => return Err(e.into()),
        };
        stdout
            .write_all(&buf[..n])
            .await
            .context("Failed to write stdout")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }

    info!("tube {} finished", tube.id());
    Ok(())
}
