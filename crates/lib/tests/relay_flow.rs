//! Integration tests: drive the relay against an in-memory provider.
//! Inbound events are injected through the provider's senders; a oneshot stands in for Ctrl+C.

use async_trait::async_trait;
use lib::providers::{
    Inbound, InboundEvent, InboundMessage, InboundReaction, InboundSender, Outbound, Provider,
    ProviderError,
};
use lib::relay::{
    self, CorrelationTable, Dispatcher, ExitReason, Handled, RelayError, RelayOptions, ReplyTarget,
};
use lib::split::TrailingFragment;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Provider that assigns ids m1, m2, ... and records every marker call.
#[derive(Default)]
struct ScriptedProvider {
    inbound: Mutex<Option<Inbound>>,
    next_id: AtomicUsize,
    sent: Mutex<Vec<Outbound>>,
    added: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<String>>,
    /// 1-based send number that fails.
    fail_send_on: Option<usize>,
    /// 1-based marker attach number that fails.
    fail_marker_on: Option<usize>,
    /// Ids whose marker removal reports "unsupported".
    unsupported_remove: Vec<String>,
    shut_down: AtomicBool,
}

impl ScriptedProvider {
    fn new() -> (Self, InboundSender) {
        let (tx, inbound) = Inbound::channel();
        let provider = Self {
            inbound: Mutex::new(Some(inbound)),
            ..Self::default()
        };
        (provider, tx)
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn added(&self) -> Vec<(String, String)> {
        self.added.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn initialize(&self) -> Result<Inbound, ProviderError> {
        self.inbound
            .lock()
            .unwrap()
            .take()
            .ok_or(ProviderError::NotInitialized)
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    async fn send(&self, content: &Outbound) -> Result<String, ProviderError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_send_on == Some(n) {
            return Err(ProviderError::Api("send rejected".to_string()));
        }
        self.sent.lock().unwrap().push(content.clone());
        Ok(format!("m{}", n))
    }

    async fn add_marker(&self, message_id: &str, symbol: &str) -> Result<(), ProviderError> {
        let mut added = self.added.lock().unwrap();
        if self.fail_marker_on == Some(added.len() + 1) {
            return Err(ProviderError::Api("reaction rejected".to_string()));
        }
        added.push((message_id.to_string(), symbol.to_string()));
        Ok(())
    }

    async fn remove_marker(&self, message_id: &str, _symbol: &str) -> Result<(), ProviderError> {
        if self.unsupported_remove.iter().any(|id| id == message_id) {
            return Err(ProviderError::Unsupported("marker removal"));
        }
        self.removed.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

fn reaction(id: &str, content: &str) -> InboundEvent {
    InboundEvent::Reaction(InboundReaction {
        message_id: id.to_string(),
        content: content.to_string(),
    })
}

fn reply(id: &str, referenced: &str, content: &str) -> InboundEvent {
    InboundEvent::Message(InboundMessage {
        id: id.to_string(),
        referenced_id: referenced.to_string(),
        content: content.to_string(),
    })
}

fn input(s: &str) -> Cursor<Vec<u8>> {
    Cursor::new(s.as_bytes().to_vec())
}

/// Yields `head`, then blocks like a terminal nobody is typing into until `release` fires or
/// its sender is dropped.
struct StalledInput {
    head: Cursor<Vec<u8>>,
    release: std::sync::mpsc::Receiver<()>,
}

impl Read for StalledInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.head.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        let _ = self.release.recv();
        Ok(0)
    }
}

fn with_target(n: i64) -> RelayOptions {
    RelayOptions {
        reply_target: ReplyTarget::from_flag(n).unwrap(),
        ..RelayOptions::default()
    }
}

fn table_of(ids: &[(&str, &str)]) -> CorrelationTable {
    let mut table = CorrelationTable::new();
    for (id, content) in ids {
        table.register(*id, *content).unwrap();
    }
    table
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} did not happen within 2s", what);
}

#[tokio::test]
async fn reaction_then_signal_emits_once_and_cleans_up() {
    let (provider, tx) = ScriptedProvider::new();
    let options = RelayOptions::default();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut out = Vec::new();

    let run = relay::run(&provider, input("hello\nworld\n"), &mut out, &options, async {
        let _ = stop_rx.await;
    });
    let driver = async {
        eventually("both sends", || provider.added().len() == 2).await;
        assert!(tx.forward(reaction("m1", "👍")));
        eventually("m1 resolved", || provider.removed() == ["m1"]).await;
        stop_tx.send(()).unwrap();
    };
    let (summary, ()) = tokio::join!(run, driver);
    let summary = summary.unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), "hello:👍\n");
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.emitted, 1);
    assert_eq!(summary.exit, Some(ExitReason::Terminated));
    assert_eq!(summary.cleanup.removed, vec!["m2".to_string()]);
    assert_eq!(provider.removed(), vec!["m1", "m2"]);
    assert_eq!(
        provider.added(),
        vec![("m1".to_string(), "👀".to_string()), ("m2".to_string(), "👀".to_string())]
    );
    assert!(provider.shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn loop_exits_on_its_own_once_every_message_resolves() {
    let (provider, tx) = ScriptedProvider::new();
    // Buffered before the run starts; consumed once the send phase is done.
    assert!(tx.forward(reply("r1", "m2", "later")));
    assert!(tx.forward(reaction("m1", "✅")));
    let options = RelayOptions {
        field_separator: " | ".into(),
        ..RelayOptions::default()
    };
    let mut out = Vec::new();

    let summary = relay::run(
        &provider,
        input("first\nsecond\n"),
        &mut out,
        &options,
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(summary.exit, Some(ExitReason::Drained));
    assert_eq!(summary.emitted, 2);
    assert_eq!(summary.cleanup.attempted(), 0);
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("second | later\n"));
    assert!(out.contains("first | ✅\n"));
    let mut removed = provider.removed();
    removed.sort();
    assert_eq!(removed, vec!["m1", "m2"]);
}

#[tokio::test]
async fn single_reply_target_resolves_on_first_response() {
    let (provider, _tx) = ScriptedProvider::new();
    let options = with_target(1);
    let mut out = Vec::new();
    let mut dispatcher = Dispatcher::new(&provider, &options, table_of(&[("m1", "hello")]), &mut out);

    let first = dispatcher.handle(&reaction("m1", "👍")).await.unwrap();
    assert_eq!(first, Handled::Resolved { id: "m1".into(), collected: 1 });
    assert!(dispatcher.table().lookup("m1").is_none());

    let second = dispatcher.handle(&reaction("m1", "👎")).await.unwrap();
    assert_eq!(second, Handled::Unknown);
    assert_eq!(dispatcher.emitted(), 1);
    drop(dispatcher);

    assert_eq!(String::from_utf8(out).unwrap(), "hello:👍\n");
    assert_eq!(provider.removed(), vec!["m1"]);
}

#[tokio::test]
async fn three_reply_target_resolves_exactly_on_third() {
    let (provider, _tx) = ScriptedProvider::new();
    let options = with_target(3);
    let mut out = Vec::new();
    let mut dispatcher = Dispatcher::new(&provider, &options, table_of(&[("m1", "q")]), &mut out);

    for (n, answer) in [(1, "a"), (2, "b")] {
        let handled = dispatcher.handle(&reply(&format!("r{}", n), "m1", answer)).await.unwrap();
        assert_eq!(handled, Handled::Accumulated { id: "m1".into(), collected: n });
        assert_eq!(dispatcher.table().lookup("m1").unwrap().replies_collected, n);
        assert!(provider.removed().is_empty());
    }
    let third = dispatcher.handle(&reaction("m1", "🎉")).await.unwrap();
    assert_eq!(third, Handled::Resolved { id: "m1".into(), collected: 3 });
    assert!(dispatcher.table().is_empty());
    drop(dispatcher);

    assert_eq!(String::from_utf8(out).unwrap(), "q:a\nq:b\nq:🎉\n");
    assert_eq!(provider.removed(), vec!["m1"]);
}

#[tokio::test]
async fn unbounded_target_never_resolves_until_cleanup() {
    let (provider, tx) = ScriptedProvider::new();
    let options = with_target(-1);
    let mut out = Vec::new();
    let mut dispatcher = Dispatcher::new(&provider, &options, table_of(&[("m1", "poll")]), &mut out);

    for n in 1..=5u32 {
        let handled = dispatcher.handle(&reaction("m1", "+1")).await.unwrap();
        assert_eq!(handled, Handled::Accumulated { id: "m1".into(), collected: n });
    }
    assert!(provider.removed().is_empty());

    let inbound = provider.initialize().await.unwrap();
    let dispatched = dispatcher.run(inbound, std::future::ready(())).await.unwrap();
    assert_eq!(dispatched.exit, ExitReason::Terminated);
    assert_eq!(dispatched.emitted, 5);
    assert_eq!(dispatched.cleanup.removed, vec!["m1".to_string()]);
    drop(tx);

    assert_eq!(String::from_utf8(out).unwrap(), "poll:+1\n".repeat(5));
    assert_eq!(provider.removed(), vec!["m1"]);
}

#[tokio::test]
async fn unmatched_responses_leave_table_and_output_untouched() {
    let (provider, _tx) = ScriptedProvider::new();
    let options = RelayOptions::default();
    let mut out = Vec::new();
    let mut dispatcher = Dispatcher::new(&provider, &options, table_of(&[("m1", "hello")]), &mut out);

    assert_eq!(dispatcher.handle(&reaction("nope", "👍")).await.unwrap(), Handled::Unknown);
    assert_eq!(dispatcher.handle(&reply("r1", "", "hi")).await.unwrap(), Handled::NotAReply);
    assert_eq!(dispatcher.handle(&reply("r2", "gone", "hi")).await.unwrap(), Handled::Unknown);

    assert_eq!(dispatcher.table().len(), 1);
    assert_eq!(dispatcher.table().lookup("m1").unwrap().replies_collected, 0);
    assert_eq!(dispatcher.emitted(), 0);
    drop(dispatcher);
    assert!(out.is_empty());
    assert!(provider.removed().is_empty());
}

#[tokio::test]
async fn skip_replies_sends_and_exits_without_markers() {
    let (provider, _tx) = ScriptedProvider::new();
    let options = RelayOptions {
        skip_replies: true,
        ..RelayOptions::default()
    };
    let mut out = Vec::new();

    let summary = relay::run(
        &provider,
        input("hello\nworld\n"),
        &mut out,
        &options,
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(summary.sent, 2);
    assert_eq!(summary.exit, None);
    assert!(out.is_empty());
    assert!(provider.added().is_empty());
    assert!(provider.removed().is_empty());
}

#[tokio::test]
async fn removal_failure_during_resolution_does_not_stop_the_loop() {
    let (provider, tx) = ScriptedProvider::new();
    let provider = ScriptedProvider {
        unsupported_remove: vec!["m1".to_string()],
        ..provider
    };
    assert!(tx.forward(reaction("m1", "a")));
    assert!(tx.forward(reaction("m2", "b")));
    let mut out = Vec::new();

    let summary = relay::run(
        &provider,
        input("one\ntwo\n"),
        &mut out,
        &RelayOptions::default(),
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(summary.exit, Some(ExitReason::Drained));
    assert_eq!(summary.emitted, 2);
    assert_eq!(provider.removed(), vec!["m2"]);
}

#[tokio::test]
async fn cleanup_is_exhaustive_despite_failures() {
    let (provider, _tx) = ScriptedProvider::new();
    let provider = ScriptedProvider {
        unsupported_remove: vec!["m2".to_string()],
        ..provider
    };
    let options = RelayOptions::default();
    let table = table_of(&[("m1", "a"), ("m2", "b"), ("m3", "c")]);
    let inbound = provider.initialize().await.unwrap();

    let dispatched = Dispatcher::new(&provider, &options, table, Vec::new())
        .run(inbound, std::future::ready(()))
        .await
        .unwrap();

    let mut removed = dispatched.cleanup.removed.clone();
    removed.sort();
    assert_eq!(removed, vec!["m1", "m3"]);
    assert_eq!(dispatched.cleanup.failed.len(), 1);
    assert_eq!(dispatched.cleanup.failed[0].0, "m2");
    assert!(matches!(dispatched.cleanup.failed[0].1, ProviderError::Unsupported(_)));
}

#[tokio::test]
async fn closed_sources_end_the_loop_and_clean_up() {
    let (provider, tx) = ScriptedProvider::new();
    drop(tx);
    let mut out = Vec::new();

    let summary = relay::run(
        &provider,
        input("hello\n"),
        &mut out,
        &RelayOptions::default(),
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(summary.exit, Some(ExitReason::SourcesClosed));
    assert_eq!(provider.removed(), vec!["m1"]);
}

#[tokio::test]
async fn send_failure_is_fatal_and_clears_attached_markers() {
    let (provider, _tx) = ScriptedProvider::new();
    let provider = ScriptedProvider {
        fail_send_on: Some(2),
        ..provider
    };
    let mut out = Vec::new();

    let err = relay::run(
        &provider,
        input("one\ntwo\nthree\n"),
        &mut out,
        &RelayOptions::default(),
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RelayError::Send(_)));
    assert_eq!(provider.sent_count(), 1);
    assert_eq!(provider.removed(), vec!["m1"]);
    assert!(provider.shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn marker_failure_is_fatal() {
    let (provider, _tx) = ScriptedProvider::new();
    let provider = ScriptedProvider {
        fail_marker_on: Some(1),
        ..provider
    };
    let mut out = Vec::new();

    let err = relay::run(
        &provider,
        input("one\ntwo\n"),
        &mut out,
        &RelayOptions::default(),
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RelayError::Marker { ref id, .. } if id == "m1"));
    assert_eq!(provider.sent_count(), 1);
}

#[tokio::test]
async fn blank_chunks_are_skipped_and_trailing_policy_applies() {
    let (provider, _tx) = ScriptedProvider::new();
    let options = RelayOptions {
        skip_replies: true,
        trailing: TrailingFragment::Drop,
        as_text: true,
        ..RelayOptions::default()
    };
    let summary = relay::run(
        &provider,
        input("a\n\n   \nb\npartial"),
        Vec::new(),
        &options,
        std::future::pending::<()>(),
    )
    .await
    .unwrap();
    assert_eq!(summary.sent, 2);
    assert_eq!(
        *provider.sent.lock().unwrap(),
        vec![Outbound::Text("a".into()), Outbound::Text("b".into())]
    );

    let (provider, _tx) = ScriptedProvider::new();
    let options = RelayOptions {
        trailing: TrailingFragment::Emit,
        ..options
    };
    let summary = relay::run(
        &provider,
        input("a\n\n   \nb\npartial"),
        Vec::new(),
        &options,
        std::future::pending::<()>(),
    )
    .await
    .unwrap();
    assert_eq!(summary.sent, 3);
}

#[tokio::test]
async fn multi_byte_separator_input() {
    let (provider, tx) = ScriptedProvider::new();
    assert!(tx.forward(reaction("m2", "ok")));
    let options = RelayOptions {
        message_separator: "--".into(),
        output_separator: ";".into(),
        ..RelayOptions::default()
    };
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut out = Vec::new();
    let run = relay::run(&provider, input("x--y--"), &mut out, &options, async {
        let _ = stop_rx.await;
    });
    let driver = async {
        eventually("m2 resolved", || provider.removed() == ["m2"]).await;
        stop_tx.send(()).unwrap();
    };
    let (summary, ()) = tokio::join!(run, driver);
    assert_eq!(summary.unwrap().cleanup.removed, vec!["m1".to_string()]);
    assert_eq!(String::from_utf8(out).unwrap(), "y:ok;");
}

#[tokio::test]
async fn signal_while_input_is_still_open_stops_sending_and_cleans_up() {
    let (provider, _tx) = ScriptedProvider::new();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let stalled = StalledInput {
        head: input("first\n"),
        release: release_rx,
    };
    let options = RelayOptions::default();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut out = Vec::new();

    let run = relay::run(&provider, stalled, &mut out, &options, async {
        let _ = stop_rx.await;
    });
    let driver = async {
        eventually("first send", || provider.added().len() == 1).await;
        stop_tx.send(()).unwrap();
    };
    let (summary, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(run, driver)
    })
    .await
    .expect("run stopped while input was still open");
    let summary = summary.unwrap();

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.exit, Some(ExitReason::Terminated));
    assert_eq!(summary.cleanup.removed, vec!["m1".to_string()]);
    assert_eq!(provider.removed(), vec!["m1"]);
    assert!(provider.shut_down.load(Ordering::SeqCst));
    assert!(out.is_empty());
    drop(release_tx);
}

#[tokio::test]
async fn empty_input_separator_is_rejected_before_the_provider_starts() {
    let (provider, _tx) = ScriptedProvider::new();
    let options = RelayOptions {
        message_separator: String::new(),
        ..RelayOptions::default()
    };

    let err = relay::run(
        &provider,
        input("hello\n"),
        Vec::new(),
        &options,
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RelayError::Config(_)));
    assert!(provider.inbound.lock().unwrap().is_some());
    assert_eq!(provider.sent_count(), 0);
}
