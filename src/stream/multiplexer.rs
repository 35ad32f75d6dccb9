//! Maps channel subscriptions onto the fewest physical connections the
//! backend profile allows.
//!
//! The registry is keyed by connection key; every mutation for a key happens
//! under that key's map shard lock, so unrelated connections never contend.
//! A worker removes its own entry under the same lock before queueing
//! terminal events, so a subscription either joins a worker in time to get
//! its terminal event or lands on a fresh connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::stream::channel::Channel;
use crate::stream::connection::{
    spawn_connection, ConnectionCommand, ConnectionHandle, ExitHook, WorkerContext,
};
use crate::stream::dispatcher::ConnectionBinding;
use crate::stream::polling::spawn_poller;
use crate::stream::profile::{BackendProfile, TransportKind};

/// Physical-connection key for a channel.
///
/// Multiplexing profiles share one connection per backend; all others get
/// one connection per channel.
pub fn connection_key(profile: &BackendProfile, channel: &Channel) -> String {
    if profile.multiplexes() {
        format!("{}#shared", channel.backend_id)
    } else {
        channel.key()
    }
}

#[derive(Debug, Default)]
struct ChannelSlot {
    subscriptions: usize,
    idle_since: Option<Instant>,
}

#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    channels: HashMap<Channel, ChannelSlot>,
}

pub(crate) struct Multiplexer {
    context: WorkerContext,
    entries: Arc<DashMap<String, ConnectionEntry>>,
    next_connection: AtomicU64,
}

impl Multiplexer {
    pub(crate) fn new(context: WorkerContext) -> Self {
        Self {
            context,
            entries: Arc::new(DashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Counts one more subscription on `channel`, opening or joining a
    /// connection as needed, and binds the subscription to that connection.
    pub(crate) fn acquire(&self, channel: &Channel, binding: &ConnectionBinding) {
        let key = connection_key(&self.context.profile, channel);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let joined = !entry.handle.is_closed()
                    && (entry.channels.contains_key(channel)
                        || entry.handle.send(ConnectionCommand::Attach(channel.clone())));
                if joined {
                    binding.bind(entry.handle.id);
                    let slot = entry.channels.entry(channel.clone()).or_default();
                    slot.subscriptions += 1;
                    slot.idle_since = None;
                    let subscriptions = slot.subscriptions;
                    debug!(
                        event = "connection_joined",
                        connection_id = entry.handle.id,
                        channel = %channel,
                        subscriptions
                    );
                } else {
                    let stale = occupied.insert(self.open(key, channel, binding));
                    debug!(
                        event = "connection_replaced",
                        stale_connection_id = stale.handle.id,
                        channel = %channel
                    );
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.open(key, channel, binding));
            }
        }
    }

    fn open(&self, key: String, channel: &Channel, binding: &ConnectionBinding) -> ConnectionEntry {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        binding.bind(id);
        let context = self.context.clone();
        let on_exit = remove_on_exit(Arc::clone(&self.entries), key);
        let handle = match self.context.profile.transport_for(channel) {
            TransportKind::Polling => spawn_poller(id, context, channel.clone(), on_exit),
            TransportKind::WebSocket | TransportKind::EventStream => {
                spawn_connection(id, context, vec![channel.clone()], on_exit)
            }
        };
        info!(event = "connection_created", connection_id = id, channel = %channel);

        let mut channels = HashMap::new();
        channels.insert(
            channel.clone(),
            ChannelSlot {
                subscriptions: 1,
                idle_since: None,
            },
        );
        ConnectionEntry { handle, channels }
    }

    /// Drops one subscription on `channel` held on connection `connection_id`.
    /// Idle channels are detached and idle connections closed after the grace
    /// period.
    pub(crate) fn release(&self, channel: &Channel, connection_id: u64) {
        let key = connection_key(&self.context.profile, channel);
        {
            let Some(mut entry) = self.entries.get_mut(&key) else {
                return;
            };
            if entry.handle.id != connection_id {
                return;
            }
            let Some(slot) = entry.channels.get_mut(channel) else {
                return;
            };
            slot.subscriptions = slot.subscriptions.saturating_sub(1);
            if slot.subscriptions > 0 {
                return;
            }
            slot.idle_since = Some(Instant::now());
        }

        let entries = Arc::clone(&self.entries);
        let grace = self.context.config.unsubscribe_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            reconcile(&entries, &key, connection_id, grace);
        });
    }

    /// Number of registered connections that are not closed.
    pub(crate) fn live_connections(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.handle.is_closed())
            .count()
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Closes every connection and waits for the workers to exit.
    pub(crate) async fn close_all(&self) {
        let keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let mut handles = Vec::new();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.handle.close();
                handles.push(entry.handle);
            }
        }
        for handle in handles {
            handle.join().await;
        }
    }
}

/// Exit hook dropping a worker's registry entry, unless the key already
/// belongs to a newer connection.
fn remove_on_exit(entries: Arc<DashMap<String, ConnectionEntry>>, key: String) -> ExitHook {
    Box::new(move |connection_id| {
        if entries
            .remove_if(&key, |_, entry| entry.handle.id == connection_id)
            .is_some()
        {
            debug!(event = "connection_entry_removed", connection_id);
        }
    })
}

/// Detaches channels idle for the grace period and closes the connection once
/// no channel has subscribers.
fn reconcile(
    entries: &DashMap<String, ConnectionEntry>,
    key: &str,
    connection_id: u64,
    grace: std::time::Duration,
) {
    let now = Instant::now();
    let empty = {
        let Some(mut entry) = entries.get_mut(key) else {
            return;
        };
        if entry.handle.id != connection_id {
            return;
        }
        let expired: Vec<Channel> = entry
            .channels
            .iter()
            .filter(|(_, slot)| {
                slot.subscriptions == 0
                    && slot
                        .idle_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            })
            .map(|(channel, _)| channel.clone())
            .collect();

        for channel in expired {
            entry.channels.remove(&channel);
            if !entry.channels.is_empty() {
                entry.handle.send(ConnectionCommand::Detach(channel));
            }
        }
        entry.channels.is_empty()
    };
    if !empty {
        return;
    }

    let removed = entries.remove_if(key, |_, entry| {
        entry.handle.id == connection_id && entry.channels.is_empty()
    });
    if let Some((_, entry)) = removed {
        info!(event = "connection_released", connection_id);
        entry.handle.close();
    }
}
