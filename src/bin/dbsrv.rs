//! Line-oriented front-end for the concurrent lock-coupling BST store.
//!
//! Reads one command per line from stdin, in the `q`/`a`/`d`/`f` grammar of
//! [`fairtree_db::command`], and writes the textual response to stdout.
//! Commands are dispatched to a fixed pool of worker threads sharing one
//! `Tree`, matching the engine's "N worker threads concurrently touching
//! the same tree" scheduling model. This binary, its argument parsing, and
//! its wire format are all external collaborators of the tree engine, not
//! part of the core.

use std::io::{self, BufRead, Write};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use clap::Parser;
use fairtree_db::{command, Tree};

#[derive(Parser, Debug)]
#[command(about = "Concurrent lock-coupling BST key-value store")]
struct Args {
    /// Number of worker threads processing commands concurrently. Defaults
    /// to the available parallelism.
    #[arg(long)]
    workers: Option<usize>,

    /// Optional startup script, run once via the `f` verb before the
    /// interactive loop begins.
    #[arg(value_name = "STARTUP_FILE")]
    startup_file: Option<String>,
}

struct Job {
    line: String,
    reply: mpsc::Sender<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let workers = args
        .workers
        .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
        .max(1);

    let tree = Arc::new(Tree::new());

    if let Some(path) = &args.startup_file {
        let response = command::execute(&tree, &format!("f{path}"));
        tracing::info!(%path, %response, "ran startup file");
    }

    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let job_rx = Arc::new(Mutex::new(job_rx));

    let handles: Vec<_> = (0..workers)
        .map(|worker_id| {
            let tree = tree.clone();
            let job_rx = job_rx.clone();
            thread::spawn(move || {
                tracing::debug!(worker_id, "worker started");
                loop {
                    let job = {
                        let rx = job_rx.lock().expect("job queue mutex poisoned");
                        rx.recv()
                    };
                    let Ok(job) = job else {
                        break;
                    };
                    let response = command::execute(&tree, &job.line);
                    let _ = job.reply.send(response);
                }
                tracing::debug!(worker_id, "worker stopped");
            })
        })
        .collect();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        if job_tx.send(Job { line, reply: reply_tx }).is_err() {
            break;
        }

        if let Ok(response) = reply_rx.recv() {
            let _ = writeln!(stdout, "{response}");
        }
    }

    drop(job_tx);
    for handle in handles {
        let _ = handle.join();
    }
}
