use std::{
    collections::{HashMap, hash_map::Entry},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, RwLock},
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::error::RegisterError;

pub const JOINED_TEXT: &str = "joined the chat";
pub const LEFT_TEXT: &str = "left the chat";
pub const USERS_HEADER: &str = "Connected users:\n";

type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A registered participant: its display name and the write side of its stream.
pub struct Session {
    name: String,
    writer: Mutex<SessionWriter>,
    write_timeout: Duration,
    broken: AtomicBool,
}

impl Session {
    pub fn new<W>(name: impl Into<String>, writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            writer: Mutex::new(Box::new(writer)),
            write_timeout,
            broken: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an earlier write failed. A broken session receives nothing more.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Writes `text` to the peer and flushes it, bounded by the write timeout.
    ///
    /// Writers are serialised per session so concurrent broadcasts never
    /// interleave bytes inside a line. A failed or timed-out write may leave a
    /// partial line on the stream, so the session is marked broken and every
    /// later send is refused.
    pub async fn send(&self, text: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.is_broken() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("stream to '{}' is broken", self.name),
            ));
        }

        let write = async {
            writer.write_all(text.as_bytes()).await?;
            writer.flush().await
        };
        let result = match timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write to '{}' timed out", self.name),
            )),
        };

        if result.is_err() {
            self.broken.store(true, Ordering::Release);
        }
        result
    }

    /// Shuts down the write side of the stream.
    pub async fn close(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

/// Shared map of display name to live session.
///
/// Broadcasting and listing take the shared side of the lock; registration and
/// removal take the exclusive side. Announcements are sent after the exclusive
/// hold is released.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` under its name and announces the join to everyone else.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), RegisterError> {
        {
            let mut sessions = self.sessions.write().await;
            match sessions.entry(session.name().to_string()) {
                Entry::Occupied(_) => {
                    return Err(RegisterError::NameTaken {
                        name: session.name().to_string(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&session));
                }
            }
        }

        self.broadcast(JOINED_TEXT, &session).await;
        Ok(())
    }

    /// Removes `name` and announces the departure. Absent names are ignored.
    pub async fn unregister(&self, name: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(name);

        if let Some(session) = &removed {
            self.broadcast(LEFT_TEXT, session).await;
        }
        removed
    }

    /// Sends `"> {sender}: {text}"` to every registered session except `sender`.
    ///
    /// Returns how many recipients the line was delivered to. A failed write is
    /// logged and skipped.
    pub async fn broadcast(&self, text: &str, sender: &Session) -> usize {
        let line = format!("> {}: {}\n", sender.name(), text);
        let sessions = self.sessions.read().await;

        let mut delivered = 0;
        for recipient in sessions.values() {
            if std::ptr::eq(Arc::as_ptr(recipient), sender) {
                continue;
            }
            if recipient.is_broken() {
                trace!(recipient = recipient.name(), "skipping broken session");
                continue;
            }
            match recipient.send(&line).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    sender = sender.name(),
                    recipient = recipient.name(),
                    error = %err,
                    "failed to deliver message"
                ),
            }
        }

        debug!(sender = sender.name(), delivered, "broadcast complete");
        delivered
    }

    /// Writes the connected-users listing to `requestor`.
    pub async fn list_users(&self, requestor: &Session) {
        let listing = {
            let sessions = self.sessions.read().await;
            let mut listing = String::from(USERS_HEADER);
            for name in sessions.keys() {
                listing.push_str("- ");
                listing.push_str(name);
                listing.push('\n');
            }
            listing
        };

        if requestor.is_broken() {
            return;
        }
        if let Err(err) = requestor.send(&listing).await {
            warn!(requestor = requestor.name(), error = %err, "failed to send user list");
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of the registered names, in no particular order.
    pub async fn names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
