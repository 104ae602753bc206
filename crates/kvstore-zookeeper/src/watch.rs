//! ZooKeeper watch translation
//!
//! ZooKeeper notifications carry no data, so creation and modification are
//! followed by a read of the node. Nodes already gone by then are skipped;
//! their deletion arrives as its own notification, unless the node lived
//! only inside a single `multi`. Such a create/delete pair shares one zxid
//! and is dropped entirely.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use kvstore_common::{KVPair, WatchEvent, WatchSource};

use crate::client::{EventType, WatchStream, WatchedEvent, ZkClient};
use crate::error::ZkError;
use crate::store::to_pair;

pub(crate) struct ZkWatchSource {
    client: Arc<dyn ZkClient>,
    stream: WatchStream,
    /// Creations skipped because the node was gone when read, with their zxid
    vanished: Vec<(String, i64)>,
}

impl ZkWatchSource {
    pub(crate) fn new(client: Arc<dyn ZkClient>, stream: WatchStream) -> Self {
        Self {
            client,
            stream,
            vanished: Vec::new(),
        }
    }

    /// Deletion closing a creation of the same zxid.
    fn closes_vanished(&mut self, event: &WatchedEvent) -> bool {
        let before = self.vanished.len();
        self.vanished
            .retain(|(path, zxid)| !(*path == event.path && *zxid == event.zxid));
        self.vanished.len() != before
    }
}

enum Translated {
    Event(WatchEvent),
    /// The created incarnation no longer exists
    Vanished,
    Ignored,
}

async fn translate(client: &dyn ZkClient, event: &WatchedEvent) -> Result<Translated, ZkError> {
    match event.event_type {
        EventType::NodeChildrenChanged => Ok(Translated::Ignored),
        EventType::NodeDeleted => Ok(Translated::Event(WatchEvent::delete(
            Some(KVPair::tombstone(event.path.clone(), event.zxid as u64)),
            None,
        ))),
        EventType::NodeCreated | EventType::NodeDataChanged => {
            let current = match client.get_data(&event.path).await {
                // A node created after the event is a later incarnation.
                Ok((data, stat)) if stat.czxid <= event.zxid => Some((data, stat)),
                Ok(_) | Err(ZkError::NoNode) => None,
                Err(e) => return Err(e),
            };
            Ok(match current {
                Some((data, stat)) => {
                    Translated::Event(WatchEvent::put(to_pair(&event.path, data, &stat), None))
                }
                None if event.event_type == EventType::NodeCreated => Translated::Vanished,
                None => Translated::Ignored,
            })
        }
    }
}

#[async_trait]
impl WatchSource for ZkWatchSource {
    async fn next_batch(&mut self) -> Option<Vec<WatchEvent>> {
        loop {
            let event = self.stream.next().await?;
            // Zxids only grow, so older skipped creations can no longer pair.
            self.vanished.retain(|(_, zxid)| *zxid >= event.zxid);

            if event.event_type == EventType::NodeDeleted && self.closes_vanished(&event) {
                trace!("Dropped transient node {} at zxid {:x}", event.path, event.zxid);
                continue;
            }

            match translate(self.client.as_ref(), &event).await {
                Ok(Translated::Event(event)) => return Some(vec![event]),
                Ok(Translated::Vanished) => self.vanished.push((event.path, event.zxid)),
                Ok(Translated::Ignored) => {}
                Err(e) => {
                    warn!("zookeeper watch read failed: {}", e);
                    return None;
                }
            }
        }
    }
}
