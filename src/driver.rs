//! Thin command-line glue around the engine: argument parsing, queue
//! seeding, signal handling and queue persistence.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use crate::{controller::Controller, error::BoxError, handler::Handler, queue::UrlQueue};

/// Command-line arguments of the reference crawl driver.
#[derive(Debug, Parser)]
#[command(name = "crawle", version, about = "Multi-threaded web crawling framework")]
pub struct CrawlArgs {
    /// Number of workers to use.
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: usize,

    /// File to seed the queue with, one URL per line.
    #[arg(short = 's', long = "seed")]
    pub seed: Option<PathBuf>,

    /// URL to seed the queue with; may be repeated.
    #[arg(short = 'u', long = "url", value_name = "URL")]
    pub urls: Vec<String>,

    /// File to save the remaining URLs to on exit.
    #[arg(short = 'S', long = "save")]
    pub save: Option<PathBuf>,
}

/// The typical way to start a crawl: seed a [`UrlQueue`] from `args`, run a
/// [`Controller`] with `handler` until the queue drains, and stop gracefully
/// on Ctrl-C. The remaining queue is saved if `args.save` is set.
pub async fn run_crawl<H>(args: CrawlArgs, handler: H) -> Result<(), BoxError>
where
    H: Handler<UrlQueue>,
{
    let queue = Arc::new(UrlQueue::with_seed(args.seed.as_deref(), &args.urls)?);
    let mut controller = Controller::new(handler, Arc::clone(&queue), args.threads);
    controller.start();
    tokio::select! {
        _ = controller.join() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!("could not listen for ctrl-c: {err}");
            }
        }
    }
    // Idempotent: latches the flag and drains any workers still running
    // after a Ctrl-C.
    controller.stop().await;
    if let Some(path) = &args.save {
        queue.save(path);
    }
    Ok(())
}
