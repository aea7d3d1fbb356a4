use std::sync::{Arc, LazyLock, Mutex, Weak};

use tracing::debug;

use crate::util::lock_unpoisoned;

/// Something holding pooled connections that a batch boundary should drop.
pub(crate) trait Closeable: Send + Sync {
    fn close(&self);
}

static OPEN_SESSIONS: LazyLock<Mutex<Vec<Weak<dyn Closeable>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

pub(crate) fn register(session: &Arc<dyn Closeable>) {
    let mut sessions = lock_unpoisoned(&OPEN_SESSIONS);
    sessions.retain(|session| session.strong_count() > 0);
    sessions.push(Arc::downgrade(session));
}

/// Closes every live session built with `auto_close`.
///
/// Meant to run once a unit of work (a dispatch) is finished. Closed sessions
/// stay registered and usable; they reconnect on their next request. Returns
/// how many sessions were closed.
pub fn close_sessions() -> usize {
    let live = {
        let mut sessions = lock_unpoisoned(&OPEN_SESSIONS);
        sessions.retain(|session| session.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
    };
    let closed = live.len();
    for session in live {
        session.close();
    }
    debug!(closed, "closed open sessions");
    closed
}

/// Number of registered sessions that are still alive.
pub fn open_session_count() -> usize {
    let mut sessions = lock_unpoisoned(&OPEN_SESSIONS);
    sessions.retain(|session| session.strong_count() > 0);
    sessions.len()
}
