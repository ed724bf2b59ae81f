//! Demo harness: mounts the in-memory backend and exercises the full
//! operation surface, optionally with an injected transport fault so the
//! reconnection and handle-recovery machinery can be watched in the logs.
//! Real deployments plug a protocol client in through
//! `sharefs::client::ShareClient` + `sharefs::session::Connector`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use sharefs::client::memshare::{MemConnector, OpKind};
use sharefs::client::FaultKind;
use sharefs::config::MountOptions;
use sharefs::ops::ShareFs;
use sharefs::session::Prompter;

#[derive(Parser)]
#[command(name = "sharefs", about = "Resilient network-share filesystem layer (demo)")]
struct Cli {
    /// Server name.
    #[arg(long, default_value = "demo")]
    server: String,
    /// Share name.
    #[arg(long, default_value = "public")]
    share: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    /// Fixed volume label (default: server-share).
    #[arg(long)]
    volume: Option<String>,
    /// Restrict the mount to a subdirectory of the share.
    #[arg(long)]
    subtree: Option<String>,
    #[arg(long)]
    read_only: bool,
    /// Never prompt for a missing password.
    #[arg(long)]
    no_password_prompt: bool,
    /// Disable transparent re-open of stream handles after reconnects.
    #[arg(long)]
    no_handle_recovery: bool,
    /// Ask to reconnect (and retry) after transport faults.
    #[arg(long)]
    reconnect: bool,
    /// Inject a transport fault mid-read to demonstrate recovery.
    #[arg(long)]
    inject_fault: bool,
}

/// Line-based prompter on stdin/stdout.
struct StdioPrompter;

#[async_trait]
impl Prompter for StdioPrompter {
    async fn request_password(&self, user: &str, server: &str) -> Option<String> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("password for {user}@{server}: ").as_bytes())
            .await
            .ok()?;
        stdout.flush().await.ok()?;
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }

    async fn confirm_reconnect(&self, server: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        if stdout
            .write_all(format!("connection to {server} lost; reconnect? [y/N] ").as_bytes())
            .await
            .is_err()
        {
            return false;
        }
        let _ = stdout.flush().await;
        let mut line = String::new();
        if BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .is_err()
        {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut opts = MountOptions::new(cli.server, cli.share);
    opts.user = cli.user;
    opts.password = cli.password.or(Some("demo".into()));
    opts.domain = cli.domain;
    opts.volume = cli.volume;
    opts.subtree = cli.subtree;
    opts.read_only = cli.read_only;
    opts.prompt_password = !cli.no_password_prompt;
    opts.handle_recovery = !cli.no_handle_recovery;
    opts.reconnect = cli.reconnect;

    let connector = MemConnector::new();
    {
        let mut store = connector.store().lock().unwrap();
        store.add_dir("docs");
        store.add_file("docs/readme.txt", b"welcome to the demo share\n");
        store.add_symlink("docs/latest", "readme.txt");
    }
    if cli.inject_fault {
        // second read chunk of the large file below will fault
        connector
            .faults()
            .inject(OpKind::Read, 1, FaultKind::ConnectionReset);
    }

    let mut fs = ShareFs::mount(connector, StdioPrompter, opts)
        .await
        .context("mount failed")?;
    println!("mounted volume {:?}", fs.volume_name());

    let stat = fs.statfs("/").await.map_err(errno)?;
    println!(
        "statfs: {} blocks of {} bytes, namemax {}",
        stat.blocks, stat.frsize, stat.namemax
    );

    let entries = {
        let fi = fs.opendir("/docs").await.map_err(errno)?;
        let entries = fs.readdir("/docs", &fi).await.map_err(errno)?;
        let mut fi = fi;
        fs.releasedir("/docs", &mut fi).await.map_err(errno)?;
        entries
    };
    println!(
        "docs: {}",
        entries
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    );

    println!("latest -> {}", fs.readlink("/docs/latest").await.map_err(errno)?);

    if !cli.read_only {
        let mut fi = fs.create("/docs/big.bin").await.map_err(errno)?;
        let payload = vec![0xabu8; 300 * 1024];
        let written = fs.write("/docs/big.bin", &mut fi, 0, &payload).await.map_err(errno)?;
        println!("wrote {written} bytes");

        let back = fs
            .read("/docs/big.bin", &mut fi, 0, payload.len() as u32)
            .await
            .map_err(errno)?;
        println!(
            "read {} bytes back ({})",
            back.len(),
            if back[..] == payload[..] { "verified" } else { "MISMATCH" }
        );
        fs.release("/docs/big.bin", &mut fi).await.map_err(errno)?;
        fs.unlink("/docs/big.bin").await.map_err(errno)?;
    }

    fs.unmount().await;
    println!("unmounted");
    Ok(())
}

fn errno(e: nix::errno::Errno) -> anyhow::Error {
    anyhow::anyhow!("operation failed: {e}")
}
