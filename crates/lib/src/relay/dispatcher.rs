//! Event dispatcher: the resolution loop.
//!
//! Waits on inbound messages, inbound reactions and the termination signal, first-ready-wins.
//! Every matched response is emitted immediately; a record is resolved (and its watch marker
//! removed) once the reply target is reached. Whatever remains when the loop exits is cleaned
//! up on the same path, whether the exit came from draining the table or from a signal.

use std::future::Future;
use std::io::Write;

use crate::providers::{Inbound, InboundEvent, Provider};
use crate::relay::cleanup::{self, CleanupReport};
use crate::relay::error::RelayError;
use crate::relay::options::RelayOptions;
use crate::relay::table::CorrelationTable;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every tracked message was resolved.
    Drained,
    /// The termination signal fired.
    Terminated,
    /// The provider closed both inbound sources; nothing more can arrive.
    SourcesClosed,
}

/// Outcome of handling one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// A message that is not a reply to anything.
    NotAReply,
    /// References a message that is not (or no longer) tracked.
    Unknown,
    /// Emitted; the record stays outstanding.
    Accumulated { id: String, collected: u32 },
    /// Emitted and resolved; the record is gone.
    Resolved { id: String, collected: u32 },
}

/// Result of a full dispatch run, including cleanup of what was left.
#[derive(Debug)]
pub struct Dispatched<W> {
    pub exit: ExitReason,
    pub emitted: usize,
    pub cleanup: CleanupReport,
    /// The output sink, handed back.
    pub out: W,
}

/// Owns the correlation table for the duration of the loop.
pub struct Dispatcher<'a, W> {
    provider: &'a dyn Provider,
    options: &'a RelayOptions,
    table: CorrelationTable,
    out: W,
    emitted: usize,
}

impl<'a, W: Write> Dispatcher<'a, W> {
    pub fn new(
        provider: &'a dyn Provider,
        options: &'a RelayOptions,
        table: CorrelationTable,
        out: W,
    ) -> Self {
        Self {
            provider,
            options,
            table,
            out,
            emitted: 0,
        }
    }

    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Match one inbound event against the table and apply the reply policy.
    pub async fn handle(&mut self, event: &InboundEvent) -> Result<Handled, RelayError> {
        let id = event.referenced_id();
        if id.is_empty() {
            log::info!("message does not reference another message, skipping: {:?}", event);
            return Ok(Handled::NotAReply);
        }
        let Some(collected) = self.table.record_response(id) else {
            log::info!("message {} not found in unresolved messages, skipping", id);
            return Ok(Handled::Unknown);
        };
        if let Some(record) = self.table.lookup(id) {
            let line = self.options.format_pair(&record.content, event.payload());
            self.emit(&line)?;
        }

        if !self.options.reply_target.is_satisfied(collected) {
            log::debug!("message {} has {} response(s), still watching", id, collected);
            return Ok(Handled::Accumulated {
                id: id.to_string(),
                collected,
            });
        }

        self.table.resolve(id);
        if let Err(e) = self
            .provider
            .remove_marker(id, &self.options.watch_marker)
            .await
        {
            log::error!(
                "error removing watch marker {} from message {}: {}",
                self.options.watch_marker,
                id,
                e
            );
        }
        log::debug!("message {} resolved after {} response(s)", id, collected);
        Ok(Handled::Resolved {
            id: id.to_string(),
            collected,
        })
    }

    /// Run until the table drains, the inbound sources close, or `shutdown` completes; then
    /// remove the markers of every record still outstanding.
    pub async fn run<S>(mut self, inbound: Inbound, shutdown: S) -> Result<Dispatched<W>, RelayError>
    where
        S: Future<Output = ()>,
    {
        let exit = self.wait(inbound, shutdown).await;

        let remaining: Vec<String> = self.table.drain().into_iter().map(|r| r.id).collect();
        let cleanup =
            cleanup::remove_markers(self.provider, remaining, &self.options.watch_marker).await;

        Ok(Dispatched {
            exit: exit?,
            emitted: self.emitted,
            cleanup,
            out: self.out,
        })
    }

    async fn wait<S>(&mut self, inbound: Inbound, shutdown: S) -> Result<ExitReason, RelayError>
    where
        S: Future<Output = ()>,
    {
        let Inbound {
            mut messages,
            mut reactions,
        } = inbound;
        tokio::pin!(shutdown);
        let mut messages_open = true;
        let mut reactions_open = true;

        log::info!(
            "watching {} message(s) for responses, press Ctrl+C to exit",
            self.table.len()
        );
        loop {
            if self.table.is_empty() {
                log::info!("all messages resolved");
                return Ok(ExitReason::Drained);
            }
            if !messages_open && !reactions_open {
                log::warn!("provider closed its inbound event sources, stopping");
                return Ok(ExitReason::SourcesClosed);
            }

            let event = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("shutting down with {} message(s) outstanding", self.table.len());
                    return Ok(ExitReason::Terminated);
                }
                msg = messages.recv(), if messages_open => match msg {
                    Some(m) => InboundEvent::Message(m),
                    None => {
                        log::debug!("inbound message source closed");
                        messages_open = false;
                        continue;
                    }
                },
                reaction = reactions.recv(), if reactions_open => match reaction {
                    Some(r) => InboundEvent::Reaction(r),
                    None => {
                        log::debug!("inbound reaction source closed");
                        reactions_open = false;
                        continue;
                    }
                },
            };

            log::debug!("handling reply {:?}", event);
            self.handle(&event).await?;
        }
    }

    fn emit(&mut self, line: &str) -> Result<(), RelayError> {
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(RelayError::Output)?;
        self.emitted += 1;
        Ok(())
    }
}
