//! Fork operations on a session.
//!
//! A fork parks the continuation after an anchor message and opens a fresh
//! branch in its place. All functions here are pure mutations on a
//! `Session`; persistence and change notification happen in the store.
//! Each returns `true` if the session was modified.

use std::collections::HashMap;

use crate::models::message::{Message, now_millis};
use crate::models::session::{ForkBucket, ForkList, MessageLocation, Session};

/// Cap on fork buckets per session. Exceeding buckets are evicted, lightest
/// and oldest first.
pub const MAX_FORK_BUCKETS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDirection {
    Next,
    Prev,
}

/// The message array holding `location`, together with the fork side-table.
/// Split out as a pair so both can be borrowed mutably at once.
fn branch_mut(
    session: &mut Session,
    location: MessageLocation,
) -> (&mut Vec<Message>, &mut HashMap<String, ForkBucket>) {
    match location {
        MessageLocation::Live => (&mut session.messages, &mut session.message_forks),
        MessageLocation::Thread(index) => (
            &mut session.threads[index].messages,
            &mut session.message_forks,
        ),
    }
}

/// Park everything after `message_id` into its fork bucket and start a new
/// empty branch there. No-op when the anchor is the last message of its
/// array, or is not found.
pub fn create_new_fork(session: &mut Session, message_id: &str) -> bool {
    let Some(location) = session.locate_message(message_id) else {
        return false;
    };
    let (array, forks) = branch_mut(session, location);
    let Some(position) = array.iter().position(|m| m.id == message_id) else {
        return false;
    };
    if position + 1 >= array.len() {
        return false;
    }

    let tail = array.split_off(position + 1);
    let bucket = forks.entry(message_id.to_string()).or_default();
    bucket.lists[bucket.position].messages = tail;
    bucket.lists.push(ForkList::new());
    bucket.position = bucket.lists.len() - 1;

    evict_excess_buckets(forks);
    true
}

/// Cycle to the adjacent fork at `message_id`, wrapping around. The current
/// continuation is parked in its list; the incoming list is spliced into the
/// array (and cleared, since its content now lives there).
pub fn switch_fork(session: &mut Session, message_id: &str, direction: SwitchDirection) -> bool {
    let Some(location) = session.locate_message(message_id) else {
        return false;
    };
    let (array, forks) = branch_mut(session, location);
    let Some(bucket) = forks.get_mut(message_id) else {
        return false;
    };
    if bucket.lists.len() < 2 {
        return false;
    }
    let Some(position) = array.iter().position(|m| m.id == message_id) else {
        return false;
    };

    bucket.lists[bucket.position].messages = array.split_off(position + 1);

    let count = bucket.lists.len();
    let next = match direction {
        SwitchDirection::Next => (bucket.position + 1) % count,
        SwitchDirection::Prev => (bucket.position + count - 1) % count,
    };
    let incoming = std::mem::take(&mut bucket.lists[next].messages);
    array.extend(incoming);
    bucket.position = next;
    true
}

/// Delete the currently active fork at `message_id`, dropping its messages.
/// The previous list (clamped) becomes active; the bucket is removed with
/// its last list.
pub fn delete_fork(session: &mut Session, message_id: &str) -> bool {
    let Some(location) = session.locate_message(message_id) else {
        return false;
    };
    let (array, forks) = branch_mut(session, location);
    let Some(position) = array.iter().position(|m| m.id == message_id) else {
        return false;
    };
    let Some(bucket) = forks.get_mut(message_id) else {
        return false;
    };

    array.truncate(position + 1);
    bucket.lists.remove(bucket.position);

    if bucket.lists.is_empty() {
        forks.remove(message_id);
    } else {
        if bucket.position >= bucket.lists.len() {
            bucket.position = bucket.lists.len() - 1;
        }
        let incoming = std::mem::take(&mut bucket.lists[bucket.position].messages);
        array.extend(incoming);
    }
    true
}

/// Flatten all forks at `message_id` back into the array, in list order, and
/// remove the bucket. No message is lost: the live continuation is parked
/// into its list first, so the result is the union of every branch.
pub fn expand_fork(session: &mut Session, message_id: &str) -> bool {
    let Some(location) = session.locate_message(message_id) else {
        return false;
    };
    let (array, forks) = branch_mut(session, location);
    let Some(mut bucket) = forks.remove(message_id) else {
        return false;
    };
    let Some(position) = array.iter().position(|m| m.id == message_id) else {
        // Bucket anchored at a message that lives in another array; put it back.
        forks.insert(message_id.to_string(), bucket);
        return false;
    };

    bucket.lists[bucket.position].messages = array.split_off(position + 1);
    for list in bucket.lists {
        array.extend(list.messages);
    }
    true
}

/// Drop the lowest-value buckets until the count is within
/// [`MAX_FORK_BUCKETS`]. Value favors message count over recency; empty
/// buckets go first, ties break oldest-created first.
fn evict_excess_buckets(forks: &mut HashMap<String, ForkBucket>) {
    if forks.len() <= MAX_FORK_BUCKETS {
        return;
    }

    let now = now_millis();
    let mut scored: Vec<(i64, i64, String)> = forks
        .iter()
        .map(|(id, bucket)| {
            let age_days = (now - bucket.created_at) / 86_400_000;
            let count = bucket.message_count() as i64;
            let mut weight = 10 * count - age_days;
            if count == 0 {
                weight -= 1_000_000;
            }
            (weight, bucket.created_at, id.clone())
        })
        .collect();
    scored.sort();

    for (_, _, id) in scored {
        if forks.len() <= MAX_FORK_BUCKETS {
            break;
        }
        forks.remove(&id);
    }
}
