//! Worker subprocess main entry point.
//!
//! This module runs when `stryx worker` is invoked by a [`WorkerProxy`].
//! It announces itself, builds the requested subject on `Init`, and serves
//! calls until the parent sends `Dispose` or closes stdin.
//!
//! [`WorkerProxy`]: super::proxy::WorkerProxy

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;
use tracing::{Level, debug, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt};

use super::ipc::{LineReader, LineWriter};
use super::protocol::{ParentMessage, WorkerMessage};
use super::subject::{Subject, create_subject};
use super::value::{ErrorValue, Value};
use crate::logging::{WorkerLogLayer, parse_level};

/// How long the final `DisposeCompleted` may take to reach the parent.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Drain outgoing messages to stdout; stops after `DisposeCompleted`.
async fn write_messages<W: AsyncWrite + Unpin>(
    mut writer: LineWriter<W>,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = messages.recv().await {
        let last = matches!(message, WorkerMessage::DisposeCompleted);
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                eprintln!("Failed to encode message: {}", e);
                continue;
            }
        };
        if writer.write_line(&line).await.is_err() || last {
            break;
        }
    }
}

fn initialize(
    plugin: &str,
    options: Value,
    working_dir: Option<&str>,
) -> Result<Arc<dyn Subject>, ErrorValue> {
    if let Some(dir) = working_dir {
        std::env::set_current_dir(dir).map_err(|e| {
            ErrorValue::new(
                "Error",
                format!("Cannot change working directory to {}: {}", dir, e),
            )
        })?;
    }
    let subject = create_subject(plugin, options)?;
    debug!(plugin, "Subject created");
    Ok(Arc::from(subject))
}

/// Worker main loop.
///
/// Calls run on their own tasks so stdin keeps being read while a call is
/// busy; an EOF therefore ends the worker even when its subject hangs.
async fn worker_loop() -> io::Result<()> {
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

    let (filter, filter_handle) = reload::Layer::new(LevelFilter::INFO);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(WorkerLogLayer::new(outgoing.clone(), Level::TRACE))
        .try_init();

    let writer = tokio::spawn(write_messages(
        LineWriter::new(tokio::io::stdout()),
        outgoing_rx,
    ));
    let mut reader = LineReader::new(tokio::io::stdin());
    let send = |message: WorkerMessage| {
        let _ = outgoing.send(message);
    };

    send(WorkerMessage::Ready);

    let mut subject: Option<Arc<dyn Subject>> = None;
    let mut calls = JoinSet::new();

    loop {
        let Some(line) = reader.read_line().await? else {
            // EOF - parent closed the pipe
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match ParentMessage::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed message from parent");
                continue;
            }
        };

        match message {
            ParentMessage::Init {
                plugin,
                options,
                working_dir,
                log_level,
            } => {
                if let Some(level) = parse_level(&log_level) {
                    let _ = filter_handle.modify(|filter| *filter = LevelFilter::from_level(level));
                }
                match initialize(&plugin, options, working_dir.as_deref()) {
                    Ok(created) => {
                        subject = Some(created);
                        send(WorkerMessage::Initialized);
                    }
                    Err(error) => send(WorkerMessage::InitError { error }),
                }
            }

            ParentMessage::Call {
                correlation_id,
                method,
                args,
            } => {
                let Some(subject) = subject.as_ref().map(Arc::clone) else {
                    send(WorkerMessage::rejection(
                        correlation_id,
                        ErrorValue::new("Error", "Worker is not initialized"),
                    ));
                    continue;
                };
                let outgoing = outgoing.clone();
                calls.spawn(async move {
                    let reply = match subject.invoke(&method, args).await {
                        Ok(result) => WorkerMessage::Result {
                            correlation_id,
                            result,
                        },
                        Err(error) => WorkerMessage::rejection(correlation_id, error),
                    };
                    let _ = outgoing.send(reply);
                });
            }

            ParentMessage::Dispose => {
                calls.abort_all();
                drop(subject.take());
                debug!("Worker disposed");
                send(WorkerMessage::DisposeCompleted);
                let _ = tokio::time::timeout(FLUSH_TIMEOUT, writer).await;
                return Ok(());
            }
        }

        // Reap finished calls
        while calls.try_join_next().is_some() {}
    }

    calls.abort_all();
    Ok(())
}

/// Run the worker subprocess main function.
///
/// This function never returns; it exits the process when the worker is done.
pub fn run_worker_main() -> ! {
    // Ignore SIGPIPE - a vanished parent surfaces as a write error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Worker error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(worker_loop()) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FIXTURE_TEST_RUNNER;

    #[tokio::test]
    async fn test_writer_stops_after_dispose_completed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut buffer = Vec::new();
        tx.send(WorkerMessage::Ready).unwrap();
        tx.send(WorkerMessage::DisposeCompleted).unwrap();
        tx.send(WorkerMessage::Initialized).unwrap();

        write_messages(LineWriter::new(&mut buffer), rx).await;

        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            WorkerMessage::from_line(lines[1]).unwrap(),
            WorkerMessage::DisposeCompleted
        );
    }

    #[test]
    fn test_initialize_rejects_missing_directory() {
        let err = match initialize(FIXTURE_TEST_RUNNER, Value::Null, Some("/nonexistent/stryx")) {
            Err(err) => err,
            Ok(_) => panic!("Expected initialization to fail"),
        };
        assert!(err.message.contains("/nonexistent/stryx"));
    }

    #[test]
    fn test_initialize_unknown_plugin() {
        let err = match initialize("karma-runner", Value::Null, None) {
            Err(err) => err,
            Ok(_) => panic!("Expected initialization to fail"),
        };
        assert_eq!(err.name, "PluginError");
    }
}
