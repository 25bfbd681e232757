//! Run code on a Jupyter server and print its output.
//!
//! Run with: cargo run -p run-code -- "print('hello')"
//!
//! Without arguments the code is read from stdin. Ctrl-C interrupts the
//! kernel.

use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, bail};
use clap::Parser;
use kernel_client_core::{OutputItem, ServerConfig, SessionOptions, StreamName};
use kernel_client_executor::{
    CancelHandle, CellOutcome, ExecutionCounter, SessionHandle, execute_cell,
};
use kernel_client_session::SessionClient;
use kernel_client_transport::{RestClient, probe};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Run code on a Jupyter server")]
struct Args {
    /// Server base URL.
    #[arg(long, env = "JUPYTER_SERVER_URL", default_value = "http://localhost:8888")]
    url: String,

    /// Server token.
    #[arg(long, env = "JUPYTER_SERVER_TOKEN")]
    token: Option<String>,

    /// Also write images into this directory.
    #[arg(long)]
    images: Option<PathBuf>,

    /// Code to run, one cell per argument.
    code: Vec<String>,
}

fn print_item(item: &OutputItem) {
    match item {
        OutputItem::Stream {
            name: StreamName::Stderr,
            text,
        } => eprint!("{text}"),
        OutputItem::Stream { text, .. } => print!("{text}"),
        other => println!("{}", other.render_text()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::new(args.url, args.token);
    let options = SessionOptions::default();

    let cells = if args.code.is_empty() {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        vec![code]
    } else {
        args.code
    };

    let rest = RestClient::new(config.clone(), options.timeouts)?;
    let connectivity = probe(&rest, options.timeouts.probe).await;
    if !connectivity.available {
        bail!("Jupyter server at {} is not reachable", config.base_url);
    }
    tracing::info!(
        active_kernels = connectivity.active_kernels,
        "Connected to {}",
        config.base_url
    );

    let session = SessionHandle::new(config, options);
    let Some(client) = session.restart(connectivity).await? else {
        bail!("No kernel session was started");
    };

    let cancel = CancelHandle::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.interrupt();
        }
    });

    let mut counter = ExecutionCounter::new();
    let result = run_cells(&client, &cells, &cancel, &mut counter, args.images.as_deref()).await;
    session.shutdown().await;
    result
}

async fn run_cells(
    client: &SessionClient,
    cells: &[String],
    cancel: &CancelHandle,
    counter: &mut ExecutionCounter,
    images: Option<&Path>,
) -> anyhow::Result<()> {
    for (index, code) in cells.iter().enumerate() {
        let cell_id = format!("cell-{index}");
        counter.start(cell_id.clone());

        let printed = Arc::new(AtomicUsize::new(0));
        let outcome = execute_cell(client, code, cancel, move |outputs| {
            // Print each item once, as it arrives.
            let from = printed.swap(outputs.len(), Ordering::SeqCst);
            outputs[from..].iter().for_each(print_item);
        })
        .await?;

        if let Some(dir) = images {
            save_images(client, outcome.outputs(), dir)?;
        }

        match outcome {
            CellOutcome::Completed { execution, .. } => {
                let count = counter.finish(&cell_id);
                tracing::info!(
                    errored = execution.errored,
                    elapsed = ?execution.elapsed,
                    "In [{count}] done"
                );
            }
            CellOutcome::Cancelled { interrupted, .. } => {
                tracing::warn!(interrupted, "Cancelled");
                break;
            }
        }
    }
    Ok(())
}

fn save_images(client: &SessionClient, outputs: &[OutputItem], dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    for output in outputs {
        let OutputItem::DisplayImage { key, format, .. } = output else {
            continue;
        };
        let Some(bytes) = client.images(|arena| arena.decode(key)) else {
            tracing::warn!(%key, "Image payload is not valid base64");
            continue;
        };
        let path = dir.join(format!("{key}.{}", format.extension()));
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Saved {}", path.display());
    }
    Ok(())
}
