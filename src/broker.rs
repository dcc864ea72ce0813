use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::message::Message;

/// Per-host broadcast broker with replay-on-join.
///
/// All group/subscriber state is owned by a single actor task; `subscribe`,
/// `publish` and unsubscription are commands sent over a channel, so
/// concurrent callers never touch shared maps. Publish and unsubscribe are
/// fire-and-forget and never fail; a slow or dead subscriber loses its own
/// delivery only, never the group's.
#[derive(Clone)]
pub struct Broker {
    tx: mpsc::UnboundedSender<Command>,
}

/// A per-connection handle to one broadcast group.
///
/// Dropping the handle requests removal from the group; the actor closes the
/// delivery channel exactly once.
pub struct Subscriber {
    key: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    broker: mpsc::UnboundedSender<Command>,
}

enum Command {
    Subscribe {
        key: String,
        reply: oneshot::Sender<Subscriber>,
    },
    Unsubscribe {
        key: String,
        id: u64,
    },
    Publish {
        msg: Message,
    },
}

#[derive(Default)]
struct Group {
    last: Option<Message>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Message>>,
}

impl Broker {
    /// Creates the broker and spawns its actor task.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        // The actor keeps only a weak handle to its own mailbox so it shuts
        // down once every Broker clone and Subscriber is gone.
        tokio::spawn(run_actor(rx, tx.downgrade()));
        Broker { tx }
    }

    /// Registers a new subscriber for `key`. If the group already has a last
    /// message it is delivered first, before any live messages.
    ///
    /// If the last message is terminal the subscriber receives it and its
    /// channel is closed immediately without joining the group.
    pub async fn subscribe(&self, key: &str) -> Subscriber {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                key: key.to_string(),
                reply,
            })
            .ok();
        // The actor task lives as long as any Broker clone does, so the
        // reply channel cannot be dropped before answering.
        rx.await.expect("broker actor stopped")
    }

    /// Records `msg` as its group's last message (creating the group if
    /// absent) and forwards it to every attached subscriber. A terminal
    /// message additionally closes all subscribers and retires the group.
    pub fn publish(&self, msg: Message) {
        self.tx.send(Command::Publish { msg }).ok();
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber {
    /// Receives the next message, or `None` once the group is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// The hostname this subscriber is attached to.
    pub fn group(&self) -> &str {
        &self.key
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // Idempotent at the actor; harmless if the actor already removed us.
        self.broker
            .send(Command::Unsubscribe {
                key: self.key.clone(),
                id: self.id,
            })
            .ok();
    }
}

async fn run_actor(
    mut rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::WeakUnboundedSender<Command>,
) {
    let mut groups: HashMap<String, Group> = HashMap::new();
    let mut next_id: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Subscribe { key, reply } => {
                let Some(broker) = tx.upgrade() else {
                    // Caller vanished between sending and processing.
                    continue;
                };
                let (msg_tx, msg_rx) = mpsc::unbounded_channel();
                next_id += 1;
                let id = next_id;

                let group = groups.entry(key.clone()).or_default();
                let mut terminal_replay = false;
                if let Some(last) = &group.last {
                    msg_tx.send(last.clone()).ok();
                    terminal_replay = last.is_terminal();
                }
                if !terminal_replay {
                    group.subscribers.insert(id, msg_tx);
                }
                debug!(host = %key, id, "subscriber joined");

                let sub = Subscriber {
                    key,
                    id,
                    rx: msg_rx,
                    broker,
                };
                reply.send(sub).ok();
            }
            Command::Unsubscribe { key, id } => {
                if let Some(group) = groups.get_mut(&key) {
                    if group.subscribers.remove(&id).is_some() {
                        debug!(host = %key, id, "subscriber left");
                    }
                    let terminal = group.last.as_ref().is_some_and(Message::is_terminal);
                    if group.subscribers.is_empty() && terminal {
                        groups.remove(&key);
                    }
                }
            }
            Command::Publish { msg } => {
                let group = groups.entry(msg.group.clone()).or_default();
                group.last = Some(msg.clone());
                group
                    .subscribers
                    .retain(|_, sub| sub.send(msg.clone()).is_ok());

                if msg.is_terminal() {
                    // Closing every delivery channel ends each subscriber's
                    // stream right after the terminal message.
                    let key = msg.group.clone();
                    groups.remove(&key);
                    debug!(host = %key, "group retired");
                }
            }
        }
    }
}
