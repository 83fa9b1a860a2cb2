use crate::control::{Command, CommandSource, KlineSink};
use crate::error::BotError;
use crate::models::{KlineEvent, MarketMode, Pair};
use crate::report::{Report, ReportSink};
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::time::{timeout, Duration};

pub const DEFAULT_KEY_PREFIX: &str = "binance-trade";

/// Key names for every Redis structure the bot touches
#[derive(Debug, Clone)]
pub struct KeySchema {
    prefix: String,
}

impl Default for KeySchema {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySchema {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn kline_hash(&self, symbol: &str, event_time: i64) -> String {
        format!("{}:kline:{}:hash:{}", self.prefix, symbol, event_time)
    }

    pub fn kline_list(&self, symbol: &str) -> String {
        format!("{}:kline:{}:list", self.prefix, symbol)
    }

    pub fn kline_zset(&self, symbol: &str) -> String {
        format!("{}:kline:{}:zset", self.prefix, symbol)
    }

    pub fn report_hash(&self, symbol: &str, event_time: i64) -> String {
        format!("{}:report:{}:hash:{}", self.prefix, symbol, event_time)
    }

    pub fn report_list(&self, symbol: &str) -> String {
        format!("{}:report:{}:list", self.prefix, symbol)
    }

    pub fn report_zset(&self, symbol: &str) -> String {
        format!("{}:report:{}:zset", self.prefix, symbol)
    }

    pub fn tasks_list(&self) -> String {
        format!("{}:tasks:key:list", self.prefix)
    }

    pub fn task_hash(&self, task_id: i64) -> String {
        format!("{}:tasks:hash:{}", self.prefix, task_id)
    }

    pub fn task_counter(&self) -> String {
        format!("{}:tasks:id", self.prefix)
    }

    pub fn all(&self) -> String {
        format!("{}:*", self.prefix)
    }
}

/// Redis storage for klines, reports and the operator task queue
///
/// Cheap to clone: clones share the same multiplexed connection.
#[derive(Clone)]
pub struct RedisPersistence {
    conn: ConnectionManager,
    keys: KeySchema,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| BotError::Backend("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            keys: KeySchema::default(),
        })
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    /// Record the active market and the symbol traded on each
    pub async fn register_market(&mut self, market: &str, pairs: &[(MarketMode, Pair)]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.set("strategy", market);
        for (mode, pair) in pairs {
            pipe.set(mode.to_string(), pair.symbol());
        }
        let _: () = pipe.query_async(&mut self.conn).await?;

        tracing::info!("Registered {} market in Redis", market);
        Ok(())
    }

    /// Queue a command for the live loop
    ///
    /// Returns the task id.
    pub async fn push_command(&mut self, command: Command) -> Result<i64> {
        let id: i64 = self.conn.incr(self.keys.task_counter(), 1).await?;

        let _: () = redis::pipe()
            .atomic()
            .hset(self.keys.task_hash(id), "task", command.token())
            .lpush(self.keys.tasks_list(), id)
            .query_async(&mut self.conn)
            .await?;

        tracing::info!("Queued task {} ({})", id, command);
        Ok(id)
    }

    /// Stored report times for a symbol, oldest first
    pub async fn report_times(&mut self, symbol: &str) -> Result<Vec<i64>> {
        Ok(self.conn.zrange(self.keys.report_zset(symbol), 0, -1).await?)
    }

    pub async fn load_report(&mut self, symbol: &str, event_time: i64) -> Result<HashMap<String, String>> {
        Ok(self
            .conn
            .hgetall(self.keys.report_hash(symbol, event_time))
            .await?)
    }

    /// Delete every key under the bot's prefix
    pub async fn clear(&mut self) -> Result<usize> {
        let keys: Vec<String> = self.conn.keys(self.keys.all()).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = self.conn.del(&keys).await?;
        tracing::info!("Cleared {} Redis keys", removed);
        Ok(removed)
    }

    async fn save_entry(
        &mut self,
        hash: String,
        list: String,
        zset: String,
        time: i64,
        fields: &[(String, String)],
    ) -> Result<()> {
        let _: () = redis::pipe()
            .hset_multiple(hash, fields)
            .lpush(list, time)
            .zadd(zset, time, time)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }
}

/// Flatten a report into hash fields; missing values become empty strings
pub fn report_fields(report: &Report) -> Result<Vec<(String, String)>> {
    let serde_json::Value::Object(map) = serde_json::to_value(report)? else {
        return Ok(Vec::new());
    };
    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

pub fn kline_fields(event: &KlineEvent) -> Vec<(String, String)> {
    let c = &event.candle;
    vec![
        ("event_time".into(), event.event_time.to_string()),
        ("symbol".into(), event.symbol.clone()),
        ("kline_start_time".into(), c.open_time.to_string()),
        ("open_price".into(), c.open.to_string()),
        ("high_price".into(), c.high.to_string()),
        ("low_price".into(), c.low.to_string()),
        ("close_price".into(), c.close.to_string()),
        ("base_volume".into(), c.volume.to_string()),
        ("is_closed".into(), u8::from(event.is_closed).to_string()),
    ]
}

#[async_trait]
impl ReportSink for RedisPersistence {
    async fn emit(&mut self, report: &Report) -> Result<()> {
        let symbol = report.symbol();
        let fields = report_fields(report)?;
        let keys = self.keys.clone();
        self.save_entry(
            keys.report_hash(&symbol, report.event_time),
            keys.report_list(&symbol),
            keys.report_zset(&symbol),
            report.event_time,
            &fields,
        )
        .await
    }
}

#[async_trait]
impl KlineSink for RedisPersistence {
    async fn store_kline(&mut self, event: &KlineEvent) -> Result<()> {
        let fields = kline_fields(event);
        let keys = self.keys.clone();
        self.save_entry(
            keys.kline_hash(&event.symbol, event.event_time),
            keys.kline_list(&event.symbol),
            keys.kline_zset(&event.symbol),
            event.event_time,
            &fields,
        )
        .await
    }
}

#[async_trait]
impl CommandSource for RedisPersistence {
    /// Pop the oldest task id, then read and delete its hash
    async fn pop_command(&mut self) -> Result<Option<Command>> {
        let id: Option<i64> = self.conn.rpop(self.keys.tasks_list(), None).await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let hash_key = self.keys.task_hash(id);
        let task: HashMap<String, String> = self.conn.hgetall(&hash_key).await?;
        let _: () = self.conn.del(&hash_key).await?;

        tracing::info!("We have task {}", id);
        let token = task.get("task").map(String::as_str).unwrap_or_default();
        token.parse().map(Some)
    }
}
