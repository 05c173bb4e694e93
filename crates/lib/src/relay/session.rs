//! One relay run: send every input chunk, then watch for responses until done.
//!
//! Input is read on its own thread and handed over through a channel, so a producer that keeps
//! stdin open never blocks the runtime and the termination signal is observed between sends.
//! The send phase is sequential. Any send or marker failure aborts the run, but markers already
//! attached are still removed before the error is returned.

use std::future::Future;
use std::io::{self, Read, Write};

use tokio::sync::mpsc;

use crate::providers::{Inbound, Outbound, Provider};
use crate::relay::cleanup::{self, CleanupReport};
use crate::relay::dispatcher::{Dispatcher, ExitReason};
use crate::relay::error::RelayError;
use crate::relay::options::RelayOptions;
use crate::relay::table::CorrelationTable;
use crate::split::Chunks;

/// Chunks read ahead of the send loop.
const INPUT_BACKLOG: usize = 16;

/// What a run did.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Lines sent to the provider.
    pub sent: usize,
    /// Response lines written to the output.
    pub emitted: usize,
    /// None when the watch phase was skipped.
    pub exit: Option<ExitReason>,
    pub cleanup: CleanupReport,
}

/// How the send phase ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub sent: usize,
    /// The termination signal arrived before the input was exhausted.
    pub interrupted: bool,
}

/// Spawn the input thread. It stops at end of input, on a read error (which is forwarded), or
/// once the receiver is dropped. A plain thread rather than a blocking-pool task: a read parked
/// on an open terminal must not hold up runtime shutdown.
pub fn spawn_reader<R>(chunks: Chunks<R>) -> Result<mpsc::Receiver<io::Result<Vec<u8>>>, RelayError>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_BACKLOG);
    std::thread::Builder::new()
        .name("chatreply-input".to_string())
        .spawn(move || {
            for chunk in chunks {
                let failed = chunk.is_err();
                if tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
        })
        .map_err(RelayError::Input)?;
    Ok(rx)
}

/// Send each non-blank chunk; unless replies are skipped, attach the watch marker and register
/// the message in `table`. Stops early, between two sends, when `shutdown` completes.
pub async fn send_all<F>(
    provider: &dyn Provider,
    chunks: &mut mpsc::Receiver<io::Result<Vec<u8>>>,
    options: &RelayOptions,
    table: &mut CorrelationTable,
    shutdown: &mut F,
) -> Result<SendReport, RelayError>
where
    F: Future<Output = ()> + Unpin,
{
    let mut report = SendReport::default();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = &mut *shutdown => {
                log::info!("termination requested after {} message(s) sent", report.sent);
                report.interrupted = true;
                return Ok(report);
            }
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk.map_err(RelayError::Input)?,
                None => return Ok(report),
            },
        };
        let line = String::from_utf8_lossy(&chunk);
        if line.trim().is_empty() {
            continue;
        }
        let outbound = Outbound::from_chunk(&line, options.as_text);
        let id = provider.send(&outbound).await.map_err(RelayError::Send)?;
        report.sent += 1;
        log::debug!("sent message {}", id);
        if options.skip_replies {
            continue;
        }
        provider
            .add_marker(&id, &options.watch_marker)
            .await
            .map_err(|source| RelayError::Marker {
                id: id.clone(),
                source,
            })?;
        table.register(id, line.into_owned())?;
    }
}

/// Initialize the provider, relay `input`, write matched pairs to `out`, and shut the provider
/// down. `shutdown` is the termination signal; it ends either phase early.
pub async fn run<R, W, S>(
    provider: &dyn Provider,
    input: R,
    out: W,
    options: &RelayOptions,
    shutdown: S,
) -> Result<RunSummary, RelayError>
where
    R: Read + Send + 'static,
    W: Write,
    S: Future<Output = ()>,
{
    options.validate()?;
    let chunks = Chunks::new(input, options.message_separator.as_bytes(), options.trailing)
        .map_err(|e| RelayError::Config(e.to_string()))?;

    let inbound = provider.initialize().await?;
    log::debug!("provider {} initialized", provider.id());

    let result = relay(provider, inbound, chunks, out, options, shutdown).await;
    provider.shutdown().await;
    result
}

async fn relay<R, W, S>(
    provider: &dyn Provider,
    inbound: Inbound,
    chunks: Chunks<R>,
    out: W,
    options: &RelayOptions,
    shutdown: S,
) -> Result<RunSummary, RelayError>
where
    R: Read + Send + 'static,
    W: Write,
    S: Future<Output = ()>,
{
    let mut input = spawn_reader(chunks)?;
    tokio::pin!(shutdown);

    let mut table = CorrelationTable::new();
    let sent = send_all(provider, &mut input, options, &mut table, &mut shutdown).await;
    drop(input);
    let report = match sent {
        Ok(report) => report,
        Err(e) => {
            clear(provider, &mut table, options).await;
            return Err(e);
        }
    };
    log::info!("sent {} message(s)", report.sent);

    if report.interrupted {
        return Ok(RunSummary {
            sent: report.sent,
            exit: Some(ExitReason::Terminated),
            cleanup: clear(provider, &mut table, options).await,
            ..RunSummary::default()
        });
    }
    if options.skip_replies {
        log::info!("not waiting for replies");
        return Ok(RunSummary {
            sent: report.sent,
            ..RunSummary::default()
        });
    }

    let dispatched = Dispatcher::new(provider, options, table, out)
        .run(inbound, shutdown)
        .await?;
    Ok(RunSummary {
        sent: report.sent,
        emitted: dispatched.emitted,
        exit: Some(dispatched.exit),
        cleanup: dispatched.cleanup,
    })
}

async fn clear(
    provider: &dyn Provider,
    table: &mut CorrelationTable,
    options: &RelayOptions,
) -> CleanupReport {
    let ids: Vec<String> = table.drain().into_iter().map(|r| r.id).collect();
    cleanup::remove_markers(provider, ids, &options.watch_marker).await
}
