use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::store::AuditStore;
use super::AuditEntry;

const QUEUE_DEPTH: usize = 1024;
const MAX_BATCH: usize = 50;
const FLUSH_EVERY: Duration = Duration::from_millis(500);
const PRUNE_EVERY: Duration = Duration::from_secs(3600);

/// Sending half of the audit queue. Clones share one drain task.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditWriter {
    /// Queue `entry` without waiting. A full queue drops it with a warning;
    /// the engine never blocks on the audit trail.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.tx.try_send(entry) {
            log::warn!("Dropped audit entry {}: queue full or closed", e.into_inner().action);
        }
    }
}

/// Build a writer and the drain future that persists what it queues.
///
/// The drain ends once every writer clone is gone, after writing what is
/// still pending, so awaiting its task is how shutdown flushes the trail.
pub fn create(
    store: Arc<AuditStore>,
    retention: Duration,
) -> (AuditWriter, impl Future<Output = ()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    (AuditWriter { tx }, drain(rx, Pending::new(store), retention))
}

/// Entries received but not yet inserted.
struct Pending {
    store: Arc<AuditStore>,
    entries: Vec<AuditEntry>,
}

impl Pending {
    fn new(store: Arc<AuditStore>) -> Self {
        Self {
            store,
            entries: Vec::with_capacity(MAX_BATCH),
        }
    }

    fn push(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
        if self.entries.len() >= MAX_BATCH {
            self.write();
        }
    }

    fn write(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_batch(&self.entries) {
            log::error!("Lost {} audit entries: {}", self.entries.len(), e);
        }
        self.entries.clear();
    }

    fn prune(&self, retention: Duration) {
        match self.store.cleanup_old(retention) {
            Ok(0) => {}
            Ok(n) => log::info!("Pruned {} audit entries older than {:?}", n, retention),
            Err(e) => log::error!("Audit pruning failed: {}", e),
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<AuditEntry>, mut pending: Pending, retention: Duration) {
    let mut flush = interval_at(Instant::now() + FLUSH_EVERY, FLUSH_EVERY);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Fires at once so a database left idle for weeks is pruned on startup
    let mut prune = interval(PRUNE_EVERY);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(entry) => pending.push(entry),
                None => break,
            },
            _ = flush.tick() => pending.write(),
            _ = prune.tick() => pending.prune(retention),
        }
    }
    pending.write();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditActor, AuditQuery, AuditResult, AuditSeverity};

    fn entry(action: String) -> AuditEntry {
        AuditEntry::new(AuditActor::System, AuditSeverity::Info, action, None, AuditResult::Success)
    }

    #[tokio::test]
    async fn dropping_writers_flushes_pending_entries() {
        let store = Arc::new(AuditStore::in_memory().unwrap());
        let (writer, drain) = create(store.clone(), Duration::from_secs(86400));
        let task = tokio::spawn(drain);

        let second = writer.clone();
        for i in 0..3 {
            writer.record(entry(format!("test.{}", i)));
        }
        second.record(entry("test.clone".into()));
        drop(writer);
        drop(second);
        task.await.unwrap();

        assert_eq!(store.query(&AuditQuery::default()).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn full_batches_are_written_before_shutdown() {
        let store = Arc::new(AuditStore::in_memory().unwrap());
        let (writer, drain) = create(store.clone(), Duration::from_secs(86400));
        let task = tokio::spawn(drain);

        for i in 0..MAX_BATCH {
            writer.record(entry(format!("bulk.{}", i)));
        }
        let mut written = 0;
        for _ in 0..50 {
            written = store.query(&AuditQuery::default()).unwrap().len();
            if written == MAX_BATCH {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(written, MAX_BATCH);

        drop(writer);
        task.await.unwrap();
    }
}
