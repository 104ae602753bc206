//! etcd watch translation

use async_trait::async_trait;
use tracing::warn;

use kvstore_common::key::is_within;
use kvstore_common::{KVPair, WatchEvent, WatchSource};

use crate::client::{Event, EventType, WatchStream};
use crate::store::to_pair;

/// Native watch stream feeding the delivery loop
///
/// A tree watch is a byte-prefix watch natively; `scope` drops keys that
/// only share the prefix, such as `/ab` under `/a`.
pub(crate) struct EtcdWatchSource {
    stream: WatchStream,
    scope: Option<String>,
}

impl EtcdWatchSource {
    pub(crate) fn new(stream: WatchStream, scope: Option<String>) -> Self {
        Self { stream, scope }
    }

    fn in_scope(&self, event: &Event) -> bool {
        self.scope
            .as_deref()
            .is_none_or(|dir| is_within(&event.kv.key, dir))
    }
}

#[async_trait]
impl WatchSource for EtcdWatchSource {
    async fn next_batch(&mut self) -> Option<Vec<WatchEvent>> {
        loop {
            match self.stream.message().await? {
                Ok(events) => {
                    let batch: Vec<WatchEvent> = events
                        .iter()
                        .filter(|e| self.in_scope(e))
                        .map(translate)
                        .collect();
                    if !batch.is_empty() {
                        return Some(batch);
                    }
                }
                Err(e) => {
                    warn!("etcd watch stream failed: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Node fields always come from the current key-value.
pub(crate) fn translate(event: &Event) -> WatchEvent {
    let pre_node = event.prev_kv.as_ref().map(to_pair);
    match event.event_type {
        EventType::Put => WatchEvent::put(to_pair(&event.kv), pre_node),
        EventType::Delete => WatchEvent::delete(
            Some(KVPair::tombstone(
                event.kv.key.clone(),
                event.kv.mod_revision as u64,
            )),
            pre_node,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KeyValue;
    use bytes::Bytes;
    use kvstore_common::WatchAction;

    fn kv(value: &'static str, revision: i64, version: i64, lease: i64) -> KeyValue {
        KeyValue {
            key: "/k".to_string(),
            value: Bytes::from_static(value.as_bytes()),
            create_revision: 1,
            mod_revision: revision,
            version,
            lease,
        }
    }

    #[test]
    fn test_put_node_uses_current_kv() {
        let event = Event {
            event_type: EventType::Put,
            kv: kv("new", 5, 3, 7),
            prev_kv: Some(kv("old", 4, 2, 0)),
        };
        let translated = translate(&event);
        assert_eq!(translated.action, WatchAction::Put);

        let node = translated.node.unwrap();
        assert_eq!(node.value, Bytes::from_static(b"new"));
        assert_eq!(node.index, 5);
        assert_eq!(node.version, 3);
        assert_eq!(node.lease, 7);

        let pre = translated.pre_node.unwrap();
        assert_eq!(pre.version, 2);
    }

    #[test]
    fn test_delete_node_is_tombstone() {
        let event = Event {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: "/k".to_string(),
                mod_revision: 9,
                ..Default::default()
            },
            prev_kv: None,
        };
        let translated = translate(&event);
        assert_eq!(translated.action, WatchAction::Delete);
        let node = translated.node.unwrap();
        assert_eq!(node.key, "/k");
        assert_eq!(node.index, 9);
        assert!(node.value.is_empty());
        assert!(translated.pre_node.is_none());
    }

    #[tokio::test]
    async fn test_tree_scope_skips_prefix_siblings() {
        use crate::MemoryEtcd;
        use crate::client::{EtcdClient, WatchRequest};

        let client = MemoryEtcd::new().client();
        let stream = client
            .watch(WatchRequest {
                key: "/a".to_string(),
                prefix: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut source = EtcdWatchSource::new(stream, Some("/a".to_string()));

        client.put("/ab", Bytes::from_static(b"sibling"), 0).await.unwrap();
        client.put("/a/x", Bytes::from_static(b"child"), 0).await.unwrap();

        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].node.as_ref().unwrap().key, "/a/x");
    }
}
