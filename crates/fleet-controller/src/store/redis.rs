//! Redis-backed instance store
//!
//! Instance records are hashes keyed `instance:{uid}:{fleet}`, fleet flags
//! are hashes keyed `fleet:{name}`, and notifications ride Redis pub/sub.
//! The terminal-state guard runs as a Lua script so the check-and-write is
//! atomic on the server.

use std::collections::BTreeSet;
use std::collections::HashMap;

use api_types::Instance;
use api_types::InstanceKind;
use api_types::InstanceState;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis::RedisError;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use super::instance_key;
use super::InstanceStore;
use super::StoreError;

/// Full-record write with the terminal-state guard. ARGV[1] is the new
/// state, ARGV[2..] are field/value pairs. Returns 0 when rejected.
const GUARDED_WRITE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'state')
if current == 'STOPPED' and ARGV[1] ~= 'STOPPED' then
  return 0
end
if current == 'STOPPING' and ARGV[1] ~= 'STOPPING' and ARGV[1] ~= 'STOPPED' then
  return 0
end
redis.call('DEL', KEYS[1])
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

pub struct RedisInstanceStore {
    client: redis::Client,
    conn: ConnectionManager,
    guarded_write: redis::Script,
}

impl RedisInstanceStore {
    /// Connect to the store at `url` (e.g. `redis://redis.default:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(backend)?;
        Ok(Self {
            client,
            conn,
            guarded_write: redis::Script::new(GUARDED_WRITE_SCRIPT),
        })
    }
}

fn backend(err: RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn record_fields(instance: &Instance) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("uid", instance.uid.clone()),
        ("name", instance.name.clone()),
        ("podName", instance.pod_name.clone()),
        ("ip", instance.ip.clone()),
        ("fleet", instance.fleet.clone()),
        ("kind", instance.kind.to_string()),
        ("state", instance.state.to_string()),
        ("createdAt", instance.created_at_ms.to_string()),
    ];
    if let Some(players) = &instance.players {
        let encoded = serde_json::to_string(players).unwrap_or_else(|_| "[]".to_string());
        fields.push(("players", encoded));
    }
    if let Some(block_until) = instance.block_until_ms {
        fields.push(("block_until", block_until.to_string()));
    }
    if let Some(reason) = &instance.shutdown_reason {
        fields.push(("shutdown_reason", reason.clone()));
    }
    if let Some(token) = &instance.shutdown_token {
        fields.push(("shutdown_token", token.clone()));
    }
    fields
}

fn instance_from_hash(key: &str, map: &HashMap<String, String>) -> Result<Instance, StoreError> {
    let field = |name: &str| {
        map.get(name).cloned().ok_or_else(|| StoreError::MalformedRecord {
            key: key.to_string(),
            message: format!("missing field `{name}`"),
        })
    };
    let malformed = |message: String| StoreError::MalformedRecord {
        key: key.to_string(),
        message,
    };

    let state: InstanceState = field("state")?
        .parse()
        .map_err(|e| malformed(format!("{e}")))?;
    let kind = match map.get("kind").map(String::as_str) {
        Some("GAME") => InstanceKind::Game,
        Some("GENERIC") | None => InstanceKind::Generic,
        Some(other) => return Err(malformed(format!("unknown kind `{other}`"))),
    };
    let players = match map.get("players") {
        Some(raw) => Some(
            serde_json::from_str::<BTreeSet<Uuid>>(raw)
                .map_err(|e| malformed(format!("bad players list: {e}")))?,
        ),
        None => None,
    };
    let parse_u64 = |name: &str| -> Result<Option<u64>, StoreError> {
        map.get(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| malformed(format!("bad numeric field `{name}`: `{raw}`")))
            })
            .transpose()
    };

    Ok(Instance {
        uid: field("uid")?,
        name: field("name")?,
        pod_name: field("podName")?,
        ip: field("ip")?,
        fleet: field("fleet")?,
        state,
        kind,
        players,
        created_at_ms: parse_u64("createdAt")?.unwrap_or(0),
        block_until_ms: parse_u64("block_until")?,
        shutdown_reason: map.get("shutdown_reason").cloned(),
        shutdown_token: map.get("shutdown_token").cloned(),
    })
}

#[async_trait]
impl InstanceStore for RedisInstanceStore {
    async fn get_instances(&self, fleet: &str) -> Result<Vec<Instance>, StoreError> {
        let pattern = format!("instance:*:{fleet}");
        let mut conn = self.conn.clone();

        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(backend)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(backend)?;
            if map.is_empty() {
                // Record deleted between SCAN and HGETALL.
                continue;
            }
            match instance_from_hash(&key, &map) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(key, error = %e, "skipping malformed instance record"),
            }
        }
        Ok(instances)
    }

    async fn get_instance(&self, uid: &str, fleet: &str) -> Result<Option<Instance>, StoreError> {
        let key = instance_key(uid, fleet);
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(backend)?;
        if map.is_empty() {
            return Ok(None);
        }
        instance_from_hash(&key, &map).map(Some)
    }

    async fn write_instance(&self, instance: &Instance) -> Result<bool, StoreError> {
        let key = instance_key(&instance.uid, &instance.fleet);
        let mut conn = self.conn.clone();
        let mut invocation = self.guarded_write.prepare_invoke();
        invocation.key(&key);
        invocation.arg(instance.state.to_string());
        for (field, value) in record_fields(instance) {
            invocation.arg(field).arg(value);
        }
        let written: i32 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(written == 1)
    }

    async fn remove_instance(&self, uid: &str, fleet: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(instance_key(uid, fleet))
            .await
            .map_err(backend)
    }

    async fn get_flag(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(backend)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(backend)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(backend)?;
        pubsub.subscribe(channel).await.map_err(backend)?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel, error = %e, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
