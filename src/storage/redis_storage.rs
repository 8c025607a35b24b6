use super::{CounterStore, Swap};
use crate::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

// KEYS[1]: counter. ARGV[1]: ttl applied when INCR creates the key (0 = none).
const INCREMENT_SCRIPT: &str = r#"
local value = redis.call('INCR', KEYS[1])
local ttl = tonumber(ARGV[1])
if value == 1 and ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return value
"#;

// KEYS[i]: keys to swap. ARGV[1]: ttl for the written keys (0 = none).
// Per key, three args starting at ARGV[2 + (i-1)*3]: present flag, expected, new.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[1])
for i = 1, #KEYS do
  local base = 2 + (i - 1) * 3
  local current = redis.call('GET', KEYS[i])
  if ARGV[base] == '1' then
    if current ~= ARGV[base + 1] then
      return 0
    end
  elseif current then
    return 0
  end
end
for i = 1, #KEYS do
  local new = ARGV[2 + (i - 1) * 3 + 2]
  if ttl > 0 then
    redis.call('SET', KEYS[i], new, 'EX', ttl)
  else
    redis.call('SET', KEYS[i], new)
  end
end
return 1
"#;

/// Redis-backed counter store shared by every gateway instance.
///
/// The atomic primitives run as Lua scripts, so Redis serializes them against
/// every other command touching the same keys. A token bucket's two keys are
/// swapped in one script, which assumes a single Redis node (no cluster slot
/// splitting).
pub struct RedisStore {
    connection: ConnectionManager,
    increment_script: Script,
    cas_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers.
    /// url: "redis://127.0.0.1:6379"
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        debug!(url, "connected to redis counter store");

        Ok(Self {
            connection,
            increment_script: Script::new(INCREMENT_SCRIPT),
            cas_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.connection.clone();
        match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn increment(&self, key: &str, ttl_on_create: Option<u64>) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = self
            .increment_script
            .key(key)
            .arg(ttl_on_create.unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn compare_and_swap(&self, swaps: &[Swap], ttl_secs: Option<u64>) -> Result<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = self.cas_script.prepare_invoke();
        invocation.arg(ttl_secs.unwrap_or(0));
        for swap in swaps {
            invocation.key(swap.key.as_str());
            match &swap.expected {
                Some(expected) => invocation.arg("1").arg(expected.as_str()),
                None => invocation.arg("0").arg(""),
            };
            invocation.arg(swap.new.as_str());
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }
}
