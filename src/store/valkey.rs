//! Valkey (Redis-compatible) window store.
//!
//! Data model:
//!   window:{user_id}   → JSON MonitoringWindow            (TTL: expiry + 24h retention)
//!   active:{user_id}   → window tag (started_at, RFC 3339) (TTL: window ttl)
//!   stopped:{user_id}  → "{tag}|{stopped_at}"             (TTL: 24h retention)
//!   balance:{user_id}  → "{tag}|{last seen balance}"      (TTL: 24h retention)
//!   windows            → SET of user_ids with a window record
//!   pending:{user_id}  → JSON PendingTransaction          (TTL: until expires_at)
//!
//! Only `start` writes the window record. Everything that changes later lives
//! in a side key tagged with the window it belongs to, so a write that races a
//! restart lands on the old tag and is ignored when the new window is read.
//!
//! `stop` claims a window with GETDEL on its `active:` marker. GETDEL is
//! atomic, so across any number of monitor processes exactly one caller gets
//! the tag back.

use super::{MonitorContext, MonitoringWindow, PendingTransaction, StoreError, WindowStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// How long a finished window record is kept around for inspection.
const RETENTION_SECS: u64 = 86_400;

/// Valkey-backed window store.
///
/// All keys are namespaced under a configurable prefix so several deployments
/// can share one Valkey. Default prefix "depmon" → "depmon:window:{id}", ...
#[derive(Clone)]
pub struct ValkeyWindowStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyWindowStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{kind}:{user_id}"
    fn key(&self, kind: &str, user_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, user_id)
    }

    fn index_key(&self) -> String {
        format!("{}:windows", self.prefix)
    }

    /// Test connectivity.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    /// Tag of the user's active window, if one is live.
    async fn active_tag(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.key("active", user_id)).await?)
    }

    /// Window record with its side keys applied.
    async fn read_current(&self, user_id: &str) -> Result<Option<MonitoringWindow>, StoreError> {
        let mut conn = self.conn.clone();
        let (record, marker, stopped, balance): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = redis::pipe()
            .get(self.key("window", user_id))
            .get(self.key("active", user_id))
            .get(self.key("stopped", user_id))
            .get(self.key("balance", user_id))
            .query_async(&mut conn)
            .await?;

        let Some(record) = record else {
            return Ok(None);
        };
        let window: MonitoringWindow = serde_json::from_str(&record)?;
        Ok(Some(reconcile(
            window,
            marker.as_deref(),
            stopped.as_deref(),
            balance.as_deref(),
            Utc::now(),
        )))
    }
}

/// Identity of a window in side keys.
fn window_tag(window: &MonitoringWindow) -> String {
    window.started_at.to_rfc3339()
}

/// Value part of a "{tag}|{value}" side key, if it belongs to `tag`.
fn tagged<'a>(raw: &'a str, tag: &str) -> Option<&'a str> {
    let (owner, value) = raw.split_once('|')?;
    (owner == tag).then_some(value)
}

/// Apply side keys to a freshly decoded record.
///
/// The `active:` marker is authoritative: without a marker carrying this
/// window's tag the window reads as stopped, at the recorded stop time when
/// there is one, otherwise at its expiry (or now, if that is earlier).
fn reconcile(
    mut window: MonitoringWindow,
    marker: Option<&str>,
    stopped: Option<&str>,
    balance: Option<&str>,
    now: DateTime<Utc>,
) -> MonitoringWindow {
    let tag = window_tag(&window);

    window.last_seen_balance = balance
        .and_then(|raw| tagged(raw, &tag))
        .and_then(|value| value.parse::<Decimal>().ok());

    if marker != Some(tag.as_str()) {
        let recorded = stopped
            .and_then(|raw| tagged(raw, &tag))
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|at| at.with_timezone(&Utc));
        window.stopped_at = Some(recorded.unwrap_or_else(|| window.expires_at.min(now)));
    } else {
        window.stopped_at = None;
    }
    window
}

/// Seconds until the record can be dropped: remaining window life plus retention.
fn record_ttl(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining = (expires_at - now).num_seconds().max(0) as u64;
    remaining + RETENTION_SECS
}

#[async_trait]
impl WindowStore for ValkeyWindowStore {
    async fn start(
        &self,
        user_id: &str,
        context: MonitorContext,
        ttl_minutes: u32,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let window = MonitoringWindow::new(user_id, context, ttl_minutes, metadata, now);
        let json = serde_json::to_string(&window)?;
        let ttl_secs = u64::from(ttl_minutes.max(1)) * 60;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set_ex(self.key("window", user_id), json, record_ttl(window.expires_at, now))
            .ignore()
            .set_ex(self.key("active", user_id), window_tag(&window), ttl_secs)
            .ignore()
            .del(self.key("stopped", user_id))
            .ignore()
            .del(self.key("balance", user_id))
            .ignore()
            .sadd(self.index_key(), user_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(
            user_id = user_id,
            context = %context,
            expires_at = %window.expires_at,
            "monitoring window started"
        );
        Ok(())
    }

    async fn stop(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("GETDEL")
            .arg(self.key("active", user_id))
            .query_async(&mut conn)
            .await?;
        let Some(tag) = claimed else {
            debug!(user_id = user_id, "stop: no active window");
            return Ok(false);
        };

        conn.set_ex::<_, _, ()>(
            self.key("stopped", user_id),
            format!("{}|{}", tag, Utc::now().to_rfc3339()),
            RETENTION_SECS,
        )
        .await?;
        info!(user_id = user_id, "monitoring window stopped");
        Ok(true)
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<MonitoringWindow>, StoreError> {
        let mut conn = self.conn.clone();
        let users: Vec<String> = conn.smembers(self.index_key()).await?;

        let mut active = Vec::new();
        for user_id in users {
            match self.read_current(&user_id).await {
                Ok(Some(w)) => {
                    if w.is_active(now) {
                        active.push(w);
                    }
                }
                Ok(None) => {
                    // Record aged out of retention; drop it from the index.
                    conn.srem::<_, _, ()>(self.index_key(), &user_id).await?;
                }
                Err(StoreError::Codec(e)) => {
                    warn!(user_id = %user_id, error = %e, "skipping undecodable window record");
                }
                Err(e) => return Err(e),
            }
        }
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(active)
    }

    async fn get(&self, user_id: &str) -> Result<Option<MonitoringWindow>, StoreError> {
        self.read_current(user_id).await
    }

    async fn record_balance(&self, user_id: &str, balance: Decimal) -> Result<(), StoreError> {
        let Some(tag) = self.active_tag(user_id).await? else {
            debug!(user_id = user_id, "no active window, balance not recorded");
            return Ok(());
        };
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            self.key("balance", user_id),
            format!("{tag}|{balance}"),
            RETENTION_SECS,
        )
        .await?;
        Ok(())
    }

    async fn put_pending(&self, pending: &PendingTransaction) -> Result<(), StoreError> {
        let ttl = (pending.expires_at - Utc::now()).num_seconds();
        if ttl <= 0 {
            warn!(user_id = %pending.user_id, "refusing to store an already expired pending transaction");
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(pending)?;
        conn.set_ex::<_, _, ()>(self.key("pending", &pending.user_id), json, ttl as u64)
            .await?;
        debug!(user_id = %pending.user_id, amount = %pending.amount, shortage = %pending.shortage, "pending transaction stored");
        Ok(())
    }

    async fn get_pending(&self, user_id: &str) -> Result<Option<PendingTransaction>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.key("pending", user_id)).await?;
        let pending = match json {
            Some(j) => Some(serde_json::from_str::<PendingTransaction>(&j)?),
            None => None,
        };
        Ok(pending.filter(|p| p.is_live(Utc::now())))
    }

    async fn clear_pending(&self, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key("pending", user_id)).await?;
        Ok(())
    }
}
