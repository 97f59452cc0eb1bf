//! Thread operations on a session.
//!
//! Threads archive whole branches: starting a new thread snapshots the live
//! array and resets it to a lone system message, switching swaps the live
//! array with an archived one. As with forks, these are pure mutations; the
//! store persists and notifies.

use crate::models::session::{Session, Thread, default_system_message};

/// The system message a fresh branch starts from: the current leading system
/// message if present, otherwise the default.
fn carried_system_message(session: &Session) -> crate::models::message::Message {
    session
        .leading_system_message()
        .cloned()
        .unwrap_or_else(default_system_message)
}

/// Name for the branch being archived: the working thread name if one is
/// set, otherwise the session name.
fn archive_name(session: &Session) -> String {
    session
        .thread_name
        .clone()
        .unwrap_or_else(|| session.name.clone())
}

/// Archive the live branch as a new thread and start an empty one.
/// Fork buckets are cleared: their anchors moved into the archive wholesale,
/// so the side-table would only hold stale cursors.
pub fn start_new_thread(session: &mut Session) {
    let system = carried_system_message(session);
    let name = archive_name(session);

    let archived = std::mem::replace(&mut session.messages, vec![system]);
    session.threads.push(Thread::new(name, archived));
    session.thread_name = None;
    session.message_forks.clear();
}

/// Swap the live branch with the archived thread `thread_id`: the current
/// live array is archived in its place and the thread's messages become
/// live. Returns `false` when the thread does not exist.
pub fn switch_thread(session: &mut Session, thread_id: &str) -> bool {
    let Some(index) = session.threads.iter().position(|t| t.id == thread_id) else {
        return false;
    };
    let restored = session.threads.remove(index);

    let name = archive_name(session);
    let archived = std::mem::replace(&mut session.messages, restored.messages);
    session.threads.push(Thread::new(name, archived));
    session.thread_name = Some(restored.name);
    true
}

/// Drop an archived thread and its messages. Returns `false` when absent.
pub fn remove_thread(session: &mut Session, thread_id: &str) -> bool {
    let before = session.threads.len();
    session.threads.retain(|t| t.id != thread_id);
    session.threads.len() != before
}

/// Discard the live branch. The most recently archived thread (if any) is
/// restored in its place; otherwise the live array resets to a lone system
/// message.
pub fn remove_current_thread(session: &mut Session) {
    let system = carried_system_message(session);
    match session.threads.pop() {
        Some(thread) => {
            session.messages = thread.messages;
            session.thread_name = Some(thread.name);
        }
        None => {
            session.messages = vec![system];
            session.thread_name = None;
        }
    }
}

/// Detach a branch into a brand-new session. `thread_id` of `None` detaches
/// the live branch, leaving a lone system message behind. Returns the new
/// session, or `None` when the thread id is unknown.
pub fn move_thread_to_session(session: &mut Session, thread_id: Option<&str>) -> Option<Session> {
    let (name, messages) = match thread_id {
        Some(id) => {
            let index = session.threads.iter().position(|t| t.id == id)?;
            let thread = session.threads.remove(index);
            (thread.name, thread.messages)
        }
        None => {
            let system = carried_system_message(session);
            let name = archive_name(session);
            let messages = std::mem::replace(&mut session.messages, vec![system]);
            session.thread_name = None;
            session.message_forks.clear();
            (name, messages)
        }
    };

    let mut detached = Session::new(name);
    detached.messages = messages;
    detached.settings = session.settings.clone();
    Some(detached)
}
