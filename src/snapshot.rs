//! Session snapshot persistence: Redis when `REDIS_URL` is configured, an
//! in-process map otherwise. Store failures are swallowed; losing a
//! snapshot degrades to a fresh session, it never crashes a request.

use crate::session::SessionSnapshot;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Clone)]
pub enum SnapshotStore {
    Redis(redis::Client),
    Memory(Arc<Mutex<HashMap<String, String>>>),
}

impl SnapshotStore {
    pub fn from_env() -> Self {
        match std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok())
        {
            Some(client) => Self::Redis(client),
            None => Self::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(Mutex::new(HashMap::new())))
    }

    pub async fn load(&self, session_id: &str) -> Option<SessionSnapshot> {
        let raw = match self {
            Self::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await.ok()?;
                let value: Option<String> = conn.get(storage_key(session_id)).await.ok()?;
                value
            }
            Self::Memory(map) => map.lock().await.get(session_id).cloned(),
        }?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn save(&self, session_id: &str, snapshot: &SessionSnapshot) {
        let Ok(json) = serde_json::to_string(snapshot) else {
            return;
        };
        match self {
            Self::Redis(client) => {
                let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
                    warn!(target = "podforge.snapshot", session_id, "redis unavailable");
                    return;
                };
                let result: Result<(), _> = conn
                    .set_ex(storage_key(session_id), json, snapshot_ttl_secs())
                    .await;
                if let Err(err) = result {
                    warn!(target = "podforge.snapshot", session_id, error = %err, "snapshot write failed");
                }
            }
            Self::Memory(map) => {
                map.lock().await.insert(session_id.to_string(), json);
            }
        }
    }
}

fn storage_key(session_id: &str) -> String {
    format!("podforge:session:{session_id}")
}

fn snapshot_ttl_secs() -> u64 {
    std::env::var("SNAPSHOT_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = SnapshotStore::in_memory();
        let mut state = SessionState::default();
        state.selected_products.insert("tee-1".into());
        store.save("s-1", &state.to_snapshot()).await;

        let loaded = store.load("s-1").await.expect("snapshot");
        let restored = SessionState::from_snapshot(loaded);
        assert!(restored.selected_products.contains("tee-1"));
        assert!(store.load("s-2").await.is_none());
    }
}
