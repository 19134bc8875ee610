//! Protocol engine (C2): demultiplexes the line stream from C1 into command
//! replies and URCs, and serializes command transactions so at most one is
//! in flight at a time.
//!
//! A single background task owns the "active transaction" slot and consumes
//! lines from the transport's channel. Lines beginning with a known URC
//! prefix are handed to the [`UrcDispatcher`](crate::urc::UrcDispatcher) and
//! never enter a reply buffer. All other lines, while a transaction is
//! active, are appended to that transaction's buffer; a line containing any
//! member of the transaction's final-set completes it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::trace;

use crate::error::EngineError;
use crate::transport::Transport;
use crate::urc::{is_urc, UrcDispatcher};

/// The two finals every command transaction recognizes unless overridden.
pub const DEFAULT_FINAL: &[&str] = &["OK", "ERROR"];

/// Abstracts the outbound half of the link so the engine's classification
/// and serialization logic can be tested without a real serial device.
pub trait LineSink: Send + Sync + 'static {
    fn write_line(&self, text: &str) -> Result<(), EngineError>;
}

impl LineSink for Transport {
    fn write_line(&self, text: &str) -> Result<(), EngineError> {
        Transport::write_line(self, text)
    }
}

struct ActiveTransaction {
    final_set: Vec<String>,
    buffer: Vec<String>,
    complete: Option<oneshot::Sender<(bool, Vec<String>)>>,
}

/// Any `ERROR` line overrides any success marker; otherwise success iff some
/// line contains one of the transaction's non-`ERROR` finals (`OK` by
/// default).
fn compute_ok(buffer: &[String], final_set: &[String]) -> bool {
    if buffer.iter().any(|l| l.contains("ERROR")) {
        return false;
    }
    let markers: Vec<&str> = final_set
        .iter()
        .map(String::as_str)
        .filter(|s| !s.contains("ERROR"))
        .collect();
    if markers.is_empty() {
        return buffer.iter().any(|l| l.contains("OK"));
    }
    buffer.iter().any(|l| markers.iter().any(|m| l.contains(m)))
}

async fn dispatch_loop(
    mut lines_rx: mpsc::UnboundedReceiver<String>,
    urc: Arc<UrcDispatcher>,
    active: Arc<Mutex<Option<ActiveTransaction>>>,
) {
    while let Some(line) = lines_rx.recv().await {
        if is_urc(&line) {
            urc.deliver(&line);
            continue;
        }

        let mut guard = active.lock().await;
        let Some(txn) = guard.as_mut() else {
            trace!("engine: dropping unsolicited non-URC line: {line}");
            continue;
        };
        txn.buffer.push(line.clone());
        let is_final = txn.final_set.iter().any(|f| line.contains(f.as_str()));
        if is_final {
            let ok = compute_ok(&txn.buffer, &txn.final_set);
            let buffer = txn.buffer.clone();
            if let Some(tx) = txn.complete.take() {
                let _ = tx.send((ok, buffer));
            }
            *guard = None;
        }
    }
}

struct Inner {
    sink: Box<dyn LineSink>,
    urc: Arc<UrcDispatcher>,
    send_lock: Mutex<()>,
    active: Arc<Mutex<Option<ActiveTransaction>>>,
    dispatch: tokio::task::JoinHandle<()>,
}

/// The AT-command protocol engine. A cheap, cloneable handle — URC handlers
/// and follow-up workers hold their own clone to re-enter the engine without
/// borrowing across a spawned task.
#[derive(Clone)]
pub struct Engine(Arc<Inner>);

impl Engine {
    pub fn new(sink: impl LineSink, lines_rx: mpsc::UnboundedReceiver<String>) -> Self {
        let urc = Arc::new(UrcDispatcher::new());
        let active = Arc::new(Mutex::new(None));
        let dispatch = tokio::spawn(dispatch_loop(lines_rx, urc.clone(), active.clone()));
        Self(Arc::new(Inner {
            sink: Box::new(sink),
            urc,
            send_lock: Mutex::new(()),
            active,
            dispatch,
        }))
    }

    #[must_use]
    pub fn urc(&self) -> &Arc<UrcDispatcher> {
        &self.0.urc
    }

    /// Send a command and wait for completion, serialized against any other
    /// in-flight transaction. `final_set` should normally be
    /// [`DEFAULT_FINAL`], extended with e.g. `"+CME ERROR:"` where the
    /// profile expects it.
    ///
    /// Fails with [`EngineError::Busy`] if another transaction still holds
    /// the lock when `deadline` elapses waiting for it; otherwise returns
    /// `Ok((ok, buffer))`, with `ok=false` and a partial buffer on deadline
    /// expiry after the command was sent.
    pub async fn send_command(
        &self,
        text: &str,
        final_set: &[&str],
        deadline: Duration,
    ) -> Result<(bool, Vec<String>), EngineError> {
        let start = Instant::now();
        let _guard = match tokio::time::timeout(deadline, self.0.send_lock.lock()).await {
            Ok(g) => g,
            Err(_) => return Err(EngineError::Busy),
        };
        let remaining = deadline.saturating_sub(start.elapsed());
        self.run_transaction(text, final_set, remaining).await
    }

    async fn run_transaction(
        &self,
        text: &str,
        final_set: &[&str],
        remaining: Duration,
    ) -> Result<(bool, Vec<String>), EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.0.active.lock().await;
            *guard = Some(ActiveTransaction {
                final_set: final_set.iter().map(|s| s.to_string()).collect(),
                buffer: Vec::new(),
                complete: Some(tx),
            });
        }

        if let Err(e) = self.0.sink.write_line(text) {
            self.0.active.lock().await.take();
            return Err(e);
        }

        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok((ok, buffer))) => Ok((ok, buffer)),
            Ok(Err(_)) => Err(EngineError::TransportClosed),
            Err(_) => {
                let mut guard = self.0.active.lock().await;
                let buffer = guard.take().map(|t| t.buffer).unwrap_or_default();
                Ok((false, buffer))
            }
        }
    }

    /// Wait for a single URC whose prefix is a substring of the line,
    /// independent of any command transaction.
    pub async fn wait_for_urc(&self, prefix: &str, deadline: Duration) -> (bool, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let tx = StdMutex::new(Some(tx));
        let token = self.0.urc.subscribe(prefix, move |line| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(line.to_string());
            }
        });

        let result = tokio::time::timeout(deadline, rx).await;
        self.0.urc.unsubscribe(token);
        match result {
            Ok(Ok(line)) => (true, Some(line)),
            _ => (false, None),
        }
    }

    /// Register a one-shot URC subscription, send a command with a short
    /// sub-deadline, then wait on the URC until the overall deadline. The
    /// command's own completion (`OK`/`ERROR`/timeout) is not load-bearing —
    /// success is reported purely on URC receipt, since firmware sometimes
    /// emits the URC without ever closing the command's final code. The
    /// subscription is removed on every exit path.
    pub async fn send_command_then_wait_urc(
        &self,
        text: &str,
        final_set: &[&str],
        urc_prefix: &str,
        sub_deadline: Duration,
        deadline: Duration,
    ) -> Result<(bool, Vec<String>, Option<String>), EngineError> {
        let start = Instant::now();
        let (utx, urx) = oneshot::channel();
        let utx = StdMutex::new(Some(utx));
        let token = self.0.urc.subscribe(urc_prefix, move |line| {
            if let Some(tx) = utx.lock().unwrap().take() {
                let _ = tx.send(line.to_string());
            }
        });

        let cmd_result = self.send_command(text, final_set, sub_deadline).await;
        let buffer = match cmd_result {
            Ok((_, buffer)) => buffer,
            Err(e) => {
                self.0.urc.unsubscribe(token);
                return Err(e);
            }
        };

        let remaining = deadline.saturating_sub(start.elapsed());
        let urc_result = tokio::time::timeout(remaining, urx).await;
        self.0.urc.unsubscribe(token);
        match urc_result {
            Ok(Ok(line)) => Ok((true, buffer, Some(line))),
            _ => Ok((false, buffer, None)),
        }
    }

    /// Stop the background classification task. Does not close the
    /// transport; callers holding one separately must close it too.
    pub fn shutdown(&self) {
        self.0.dispatch.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdSyncMutex;

    struct RecordingSink {
        sent: Arc<StdSyncMutex<Vec<String>>>,
    }

    impl LineSink for RecordingSink {
        fn write_line(&self, text: &str) -> Result<(), EngineError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn fake_engine() -> (Engine, mpsc::UnboundedSender<String>, Arc<StdSyncMutex<Vec<String>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdSyncMutex::new(Vec::new()));
        let sink = RecordingSink { sent: sent.clone() };
        (Engine::new(sink, rx), tx, sent)
    }

    #[tokio::test]
    async fn test_simple_ok_reply() {
        let (engine, lines_tx, _sent) = fake_engine();
        let lines_tx2 = lines_tx.clone();
        let handle = tokio::spawn(async move {
            engine
                .send_command("AT", DEFAULT_FINAL, Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        lines_tx2.send("OK".to_string()).unwrap();
        let (ok, buffer) = handle.await.unwrap().unwrap();
        assert!(ok);
        assert_eq!(buffer, vec!["OK".to_string()]);
    }

    #[tokio::test]
    async fn test_error_wins_over_ok() {
        let (engine, lines_tx, _sent) = fake_engine();
        let handle = tokio::spawn(async move {
            engine
                .send_command("AT+X", DEFAULT_FINAL, Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        lines_tx.send("OK".to_string()).unwrap();
        lines_tx.send("ERROR".to_string()).unwrap();
        let (ok, buffer) = handle.await.unwrap().unwrap();
        assert!(!ok);
        assert_eq!(buffer, vec!["OK".to_string(), "ERROR".to_string()]);
    }

    #[tokio::test]
    async fn test_urc_does_not_enter_reply_buffer() {
        let (engine, lines_tx, _sent) = fake_engine();
        let urc_hits = Arc::new(StdSyncMutex::new(0));
        let hits2 = urc_hits.clone();
        engine.urc().subscribe("%CESQ:", move |_| {
            *hits2.lock().unwrap() += 1;
        });

        let handle = tokio::spawn(async move {
            engine
                .send_command("AT+CEREG=5", DEFAULT_FINAL, Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        lines_tx.send("%CESQ: 50,10,10,20".to_string()).unwrap();
        lines_tx.send("OK".to_string()).unwrap();
        let (ok, buffer) = handle.await.unwrap().unwrap();
        assert!(ok);
        assert_eq!(buffer, vec!["OK".to_string()]);
        assert_eq!(*urc_hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deadline_expiry_returns_ok_false_with_partial_buffer() {
        let (engine, lines_tx, _sent) = fake_engine();
        let handle = tokio::spawn(async move {
            engine
                .send_command("AT+SLOW", DEFAULT_FINAL, Duration::from_millis(50))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        lines_tx.send("+SOME: partial".to_string()).unwrap();
        let (ok, buffer) = handle.await.unwrap().unwrap();
        assert!(!ok);
        assert_eq!(buffer, vec!["+SOME: partial".to_string()]);
    }

    #[tokio::test]
    async fn test_busy_when_lock_unavailable_before_deadline() {
        let (engine, lines_tx, _sent) = fake_engine();
        let engine = Arc::new(engine);
        let e1 = engine.clone();
        let first = tokio::spawn(async move {
            e1.send_command("AT", DEFAULT_FINAL, Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let e2 = engine.clone();
        let second = e2
            .send_command("AT", DEFAULT_FINAL, Duration::from_millis(50))
            .await;
        assert!(matches!(second, Err(EngineError::Busy)));

        lines_tx.send("OK".to_string()).unwrap();
        let (ok, _) = first.await.unwrap().unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_urc_succeeds_even_when_command_never_gets_final_code() {
        let (engine, lines_tx, _sent) = fake_engine();
        let handle = tokio::spawn(async move {
            engine
                .send_command_then_wait_urc(
                    "ATZ",
                    DEFAULT_FINAL,
                    "%BOOTEV:0",
                    Duration::from_millis(50),
                    Duration::from_secs(1),
                )
                .await
        });
        // No OK/ERROR ever arrives for the command itself, only the URC —
        // after the sub-deadline elapses.
        tokio::time::sleep(Duration::from_millis(100)).await;
        lines_tx.send("%BOOTEV:0".to_string()).unwrap();
        let (ok, _buffer, urc_line) = handle.await.unwrap().unwrap();
        assert!(ok);
        assert_eq!(urc_line.as_deref(), Some("%BOOTEV:0"));
    }
}
