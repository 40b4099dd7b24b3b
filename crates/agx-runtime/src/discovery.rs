//! Session-id discovery.
//!
//! The executor announces its identifier with a `session.created` event
//! somewhere in its output. Two strategies look for it:
//!
//! - [`StreamDiscovery`] watches the live stdout of a child the runner owns.
//! - [`LogPoller`] re-reads the transcript file on a fixed cadence, for the
//!   launcher side where no stream is available.
//!
//! Both funnel into [`SessionDiscovery::record`], which applies the id to the
//! store at most once: the first id wins and later announcements (or a
//! second strategy racing the first) are ignored.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agx_core::SessionId;
use agx_protocol::{find_session_created, parse_session_created, LineBuffer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::store::{Assignment, StoreResult};
use crate::ticker::PollTicker;

// ============================================================================
// Shared State
// ============================================================================

/// Remembers the id once one has been applied, shared between strategies.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryLatch(Arc<Mutex<Option<SessionId>>>);

impl DiscoveryLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A latch that is already closed, e.g. when continuing a known session.
    pub fn with_known(id: Option<SessionId>) -> Self {
        Self(Arc::new(Mutex::new(id)))
    }

    pub fn get(&self) -> Option<SessionId> {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, id: SessionId) {
        match self.0.lock() {
            Ok(mut guard) => *guard = Some(id),
            Err(poisoned) => *poisoned.into_inner() = Some(id),
        }
    }
}

/// Applies a discovered id to the entry created under `key`.
#[derive(Debug, Clone)]
pub struct SessionDiscovery {
    ctx: Context,
    key: String,
    latch: DiscoveryLatch,
}

impl SessionDiscovery {
    pub fn new(ctx: Context, key: impl Into<String>) -> Self {
        Self {
            ctx,
            key: key.into(),
            latch: DiscoveryLatch::new(),
        }
    }

    #[must_use]
    pub fn with_latch(mut self, latch: DiscoveryLatch) -> Self {
        self.latch = latch;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn latch(&self) -> &DiscoveryLatch {
        &self.latch
    }

    /// Id already attached to the entry, from any source.
    ///
    /// Consults the latch first and falls back to the store, so an id
    /// written by another process also counts.
    pub fn known_session_id(&self) -> Option<SessionId> {
        if let Some(id) = self.latch.get() {
            return Some(id);
        }
        let store = match self.ctx.load_store() {
            Ok(store) => store,
            Err(e) => {
                debug!(error = %e, "Store unreadable while checking for session id");
                return None;
            }
        };
        let id = store
            .resolve(&self.key)
            .and_then(|(_, entry)| entry.session_id.clone())?;
        self.latch.set(id.clone());
        Some(id)
    }

    /// Records `id` against the entry and re-keys it.
    ///
    /// Returns true only for the call that actually changed the store.
    pub fn record(&self, id: SessionId) -> StoreResult<bool> {
        if self.latch.get().is_some() {
            return Ok(false);
        }

        let mut store = self.ctx.load_store()?;
        match store.assign_session_id(&self.key, &id) {
            Assignment::Applied => {
                self.ctx.save_store(&store)?;
                info!(key = %self.key, session_id = %id, "Session id discovered");
                self.latch.set(id);
                Ok(true)
            }
            Assignment::AlreadyKnown(existing) => {
                debug!(
                    key = %self.key,
                    existing = %existing,
                    ignored = %id,
                    "Entry already has a session id"
                );
                self.latch.set(existing);
                Ok(false)
            }
            Assignment::Missing => {
                warn!(key = %self.key, session_id = %id, "No session entry to attach id to");
                Ok(false)
            }
        }
    }
}

// ============================================================================
// Stream Strategy
// ============================================================================

/// Scans streamed output chunks for the announcement.
#[derive(Debug)]
pub struct StreamDiscovery {
    discovery: SessionDiscovery,
    lines: LineBuffer,
}

impl StreamDiscovery {
    pub fn new(discovery: SessionDiscovery) -> Self {
        Self {
            discovery,
            lines: LineBuffer::new(),
        }
    }

    /// Feeds one chunk of output. Returns the id if this chunk applied it.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<SessionId> {
        let lines = self.lines.push(chunk);
        self.scan(lines)
    }

    /// Flushes a final unterminated line.
    pub fn finish(&mut self) -> Option<SessionId> {
        let rest = self.lines.finish();
        self.scan(rest)
    }

    fn scan(&self, lines: impl IntoIterator<Item = String>) -> Option<SessionId> {
        if self.discovery.latch().get().is_some() {
            return None;
        }
        let id = lines
            .into_iter()
            .find_map(|line| parse_session_created(&line))?;
        match self.discovery.record(id.clone()) {
            Ok(true) => Some(id),
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, "Failed to persist discovered session id");
                None
            }
        }
    }

    /// Reads `reader` to the end, feeding every chunk.
    pub async fn watch<R>(mut self, mut reader: R) -> io::Result<Option<SessionId>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = buf.get(..n).unwrap_or_default();
            self.feed(chunk);
        }
        self.finish();
        Ok(self.discovery.latch().get())
    }
}

// ============================================================================
// Log-Poll Strategy
// ============================================================================

/// Re-reads a transcript until the announcement shows up.
#[derive(Debug)]
pub struct LogPoller {
    discovery: SessionDiscovery,
    log_file: PathBuf,
    interval: Duration,
    timeout: Duration,
}

impl LogPoller {
    pub fn new(
        discovery: SessionDiscovery,
        log_file: PathBuf,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            discovery,
            log_file,
            interval,
            timeout,
        }
    }

    /// Polls until an id is known or the timeout passes.
    ///
    /// Each cycle first checks whether the entry already has an id (from
    /// this poller, the stream, or another process) and stops if so. A
    /// missing or unreadable log is retried on the next cycle.
    pub async fn run(self) -> Option<SessionId> {
        let mut ticker = PollTicker::new(self.interval, self.timeout);
        loop {
            if let Some(id) = self.discovery.known_session_id() {
                return Some(id);
            }

            match tokio::fs::read(&self.log_file).await {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    if let Some(id) = find_session_created(&text) {
                        if let Err(e) = self.discovery.record(id) {
                            warn!(error = %e, "Failed to persist discovered session id");
                        }
                        // Re-read through the latch so a lost race reports the winner.
                        if let Some(id) = self.discovery.known_session_id() {
                            return Some(id);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(log = %self.log_file.display(), "Log not created yet");
                }
                Err(e) => {
                    debug!(log = %self.log_file.display(), error = %e, "Log unreadable");
                }
            }

            if !ticker.tick().await {
                debug!(key = %self.discovery.key(), "Log polling timed out");
                return None;
            }
        }
    }
}
