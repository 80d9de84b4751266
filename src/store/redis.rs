use crate::config::RedisSettings;
use crate::error::LimiterError;
use crate::store::{encode_member, Reservation, SeriesView};
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;

/// Shared-store key namespace. Part of the compatibility surface: external
/// tooling inspects keys under this prefix.
pub const KEY_PREFIX: &str = "rate_limiter:";

/// Prune + weigh + conditional add as one server-side unit, so no other
/// client interleaves between the load check and the append.
///
/// KEYS[1] series key
/// ARGV[1] cutoff (score), ARGV[2] now (score), ARGV[3] weight,
/// ARGV[4] limit, ARGV[5] member, ARGV[6] ttl millis, ARGV[7] unit flag
///
/// Returns {admitted, load, oldest-score-or-empty} with numbers stringified,
/// since Lua replies truncate floats to integers otherwise.
const RESERVE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local load = 0.0
if ARGV[7] == '1' then
    load = redis.call('ZCARD', KEYS[1])
else
    local members = redis.call('ZRANGE', KEYS[1], 0, -1)
    for _, m in ipairs(members) do
        load = load + (tonumber(string.match(m, '^[^:]+:([^:]+):')) or 1)
    end
end
local admitted = 0
if load + tonumber(ARGV[3]) <= tonumber(ARGV[4]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[5])
    redis.call('PEXPIRE', KEYS[1], ARGV[6])
    load = load + tonumber(ARGV[3])
    admitted = 1
end
local oldest = ''
local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if head[2] then
    oldest = head[2]
end
return {admitted, tostring(load), oldest}
"#;

/// Prune + read without admitting anything.
///
/// KEYS[1] series key; ARGV[1] cutoff, ARGV[2] unit flag.
const PEEK_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local load = 0.0
if ARGV[2] == '1' then
    load = redis.call('ZCARD', KEYS[1])
else
    local members = redis.call('ZRANGE', KEYS[1], 0, -1)
    for _, m in ipairs(members) do
        load = load + (tonumber(string.match(m, '^[^:]+:([^:]+):')) or 1)
    end
end
local oldest = ''
local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if head[2] then
    oldest = head[2]
end
return {tostring(load), oldest}
"#;

/// Shared timestamp store backed by Redis sorted sets.
///
/// Scores are wall-clock timestamps; weights ride in the member payload (see
/// `encode_member`). The connection manager owns pooling and reconnects; no
/// in-process lock is ever held across a round-trip.
pub struct RedisStore {
    conn: ConnectionManager,
    reserve_script: Script,
    peek_script: Script,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect and verify reachability with a ping.
    pub async fn connect(settings: &RedisSettings, op_timeout: Duration) -> Result<Self, LimiterError> {
        let url = format!("redis://{}:{}/{}", settings.host, settings.port, settings.db);
        let client = redis::Client::open(url)?;

        let conn = match tokio::time::timeout(op_timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(LimiterError::BackendUnreachable(format!(
                    "connect to {}:{} timed out after {}",
                    settings.host,
                    settings.port,
                    humantime::format_duration(op_timeout),
                )))
            }
        };

        let store = Self {
            conn,
            reserve_script: Script::new(RESERVE_SCRIPT),
            peek_script: Script::new(PEEK_SCRIPT),
            op_timeout,
        };
        store.ping().await?;
        Ok(store)
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    async fn with_timeout<T, F>(&self, op: &'static str, fut: F) -> Result<T, LimiterError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LimiterError::BackendUnreachable(format!(
                "{} timed out after {}",
                op,
                humantime::format_duration(self.op_timeout),
            ))),
        }
    }

    pub(super) async fn reserve(
        &self,
        key: &str,
        cutoff: f64,
        now: f64,
        weight: f64,
        limit: f64,
        unit_weights: bool,
    ) -> Result<Reservation, LimiterError> {
        let full_key = Self::full_key(key);
        let member = encode_member(now, weight);
        // Entries stay relevant for at most one window past the newest write.
        let ttl_millis = ((now - cutoff) * 1000.0).ceil() as i64;

        let mut conn = self.conn.clone();
        let reply: (i64, String, String) = self
            .with_timeout("reserve", async {
                self.reserve_script
                    .key(&full_key)
                    .arg(cutoff)
                    .arg(now)
                    .arg(weight)
                    .arg(limit)
                    .arg(&member)
                    .arg(ttl_millis)
                    .arg(if unit_weights { 1 } else { 0 })
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let (admitted, load, oldest) = reply;
        Ok(Reservation {
            admitted: admitted == 1,
            load: parse_score("load", &load)?,
            oldest: parse_optional_score(&oldest)?,
            member: (admitted == 1).then_some(member),
        })
    }

    pub(super) async fn peek(
        &self,
        key: &str,
        cutoff: f64,
        unit_weights: bool,
    ) -> Result<SeriesView, LimiterError> {
        let full_key = Self::full_key(key);
        let mut conn = self.conn.clone();
        let reply: (String, String) = self
            .with_timeout("peek", async {
                self.peek_script
                    .key(&full_key)
                    .arg(cutoff)
                    .arg(if unit_weights { 1 } else { 0 })
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let (load, oldest) = reply;
        Ok(SeriesView {
            load: parse_score("load", &load)?,
            oldest: parse_optional_score(&oldest)?,
        })
    }

    pub(super) async fn remove(&self, key: &str, member: &str) -> Result<bool, LimiterError> {
        let full_key = Self::full_key(key);
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .with_timeout("remove", async {
                redis::cmd("ZREM")
                    .arg(&full_key)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(removed > 0)
    }

    pub(super) async fn clear(&self, key: &str) -> Result<(), LimiterError> {
        let full_key = Self::full_key(key);
        let mut conn = self.conn.clone();
        let _: i64 = self
            .with_timeout("clear", async {
                redis::cmd("DEL").arg(&full_key).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    pub(super) async fn all_keys(&self) -> Result<Vec<String>, LimiterError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        let pattern = format!("{}*", KEY_PREFIX);
        loop {
            let mut conn = self.conn.clone();
            let (next, batch): (u64, Vec<String>) = self
                .with_timeout("scan", async {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            keys.extend(
                batch
                    .into_iter()
                    .map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string).unwrap_or(k)),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    pub(super) async fn report_memory(&self) -> Result<u64, LimiterError> {
        let keys = self.all_keys().await?;
        let mut bytes = 0u64;
        for key in keys {
            let full_key = Self::full_key(&key);
            let mut conn = self.conn.clone();
            let usage: Option<i64> = self
                .with_timeout("memory_usage", async {
                    redis::cmd("MEMORY")
                        .arg("USAGE")
                        .arg(&full_key)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            bytes += usage.unwrap_or(0).max(0) as u64;
        }
        Ok(bytes)
    }

    pub(super) async fn ping(&self) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .with_timeout("ping", async {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(LimiterError::BackendInconsistent(format!(
                "unexpected ping reply: {}",
                reply
            )))
        }
    }
}

fn parse_score(field: &str, raw: &str) -> Result<f64, LimiterError> {
    raw.parse::<f64>().map_err(|_| {
        LimiterError::BackendInconsistent(format!("script returned malformed {}: {:?}", field, raw))
    })
}

fn parse_optional_score(raw: &str) -> Result<Option<f64>, LimiterError> {
    if raw.is_empty() {
        return Ok(None);
    }
    parse_score("oldest", raw).map(Some)
}
