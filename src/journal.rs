use std::io;
use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::wal::Wal;

/// Durable, ordered record sink. The engine and the uplink ingestor each own one.
#[async_trait]
pub trait Journal<E: Send + Sync + 'static>: Send + Sync {
    /// Returns once the record is durable.
    async fn append(&self, record: &E) -> io::Result<()>;

    /// Replace the whole log with `records`.
    async fn compact(&self, records: Vec<E>) -> io::Result<()>;

    async fn appends_since_compact(&self) -> u64;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand<E> {
    Append {
        record: E,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<E>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Batch<E> = Vec<(E, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop<E: Serialize>(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand<E>>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch<E: Serialize>(wal: &mut Wal, batch: &mut Batch<E>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {}: {e}", wal.path().display());
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed for {}: {e}", wal.path().display());
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Any error leaves the whole batch for `commit_batch` to roll back.
fn flush_batch<E: Serialize>(wal: &mut Wal, batch: &Batch<E>) -> io::Result<()> {
    for (record, _) in batch.iter() {
        wal.append_buffered(record)?;
    }
    wal.flush_sync()
}

fn handle_non_append<E: Serialize>(wal: &mut Wal, cmd: WalCommand<E>) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let mut batch = vec![(record, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// `Journal` backed by a WAL file and a group-commit writer task.
pub struct WalJournal<E> {
    tx: mpsc::Sender<WalCommand<E>>,
    _records: PhantomData<fn() -> E>,
}

impl<E> WalJournal<E>
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    /// Replay the log at `path`, then spawn its writer task.
    /// Must be called from within a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<E>)> {
        let (wal, records) = Wal::recover(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Ok((
            Self {
                tx,
                _records: PhantomData,
            },
            records,
        ))
    }

    async fn request<T>(
        &self,
        cmd: WalCommand<E>,
        rx: oneshot::Receiver<T>,
    ) -> io::Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))
    }
}

#[async_trait]
impl<E> Journal<E> for WalJournal<E>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn append(&self, record: &E) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            record: record.clone(),
            response: tx,
        };
        self.request(cmd, rx).await?
    }

    async fn compact(&self, records: Vec<E>) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(WalCommand::Compact { records, response: tx }, rx)
            .await?
    }

    async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        self.request(WalCommand::AppendsSinceCompact { response: tx }, rx)
            .await
            .unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Wraps a journal and fails appends while `set_failing(true)`.
    pub struct FlakyJournal<J> {
        inner: J,
        failing: AtomicBool,
        rejected: AtomicUsize,
    }

    impl<J> FlakyJournal<J> {
        pub fn new(inner: J) -> Self {
            Self {
                inner,
                failing: AtomicBool::new(false),
                rejected: AtomicUsize::new(0),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn rejected(&self) -> usize {
            self.rejected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<E, J> Journal<E> for FlakyJournal<J>
    where
        E: Send + Sync + 'static,
        J: Journal<E>,
    {
        async fn append(&self, record: &E) -> io::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                return Err(io::Error::other("injected storage failure"));
            }
            self.inner.append(record).await
        }

        async fn compact(&self, records: Vec<E>) -> io::Result<()> {
            self.inner.compact(records).await
        }

        async fn appends_since_compact(&self) -> u64 {
            self.inner.appends_since_compact().await
        }
    }
}
