use std::{
    sync::LazyLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use redis::{aio::MultiplexedConnection, Script};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::queue::{
    MessageQueue, QueueError, QueueFuture, QueueResult, ReceiveOptions, ReceivedItem,
};

/// Interval between claim attempts while long polling an empty queue.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Moves every expired receipt back to the pending list.
///
/// KEYS: in-flight set, pending list. ARGV: current time in milliseconds.
static REQUEUE_EXPIRED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local requeued = 0
for _, receipt in ipairs(expired) do
    redis.call('ZREM', KEYS[1], receipt)
    local id = string.match(receipt, '^([^:]+):')
    if id then
        redis.call('RPUSH', KEYS[2], id)
        requeued = requeued + 1
    end
end
return requeued
",
    )
});

/// Pops pending ids and registers them as in flight in a single step,
/// returning `receipt, body` pairs. Ids without a payload are dropped.
///
/// KEYS: pending list, in-flight set, item hash. ARGV: visibility deadline
/// in milliseconds followed by one receipt token per item to claim.
static CLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local claimed = {}
local token = 2
while token <= #ARGV do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        break
    end
    local body = redis.call('HGET', KEYS[3], id)
    if body then
        local receipt = id .. ':' .. ARGV[token]
        redis.call('ZADD', KEYS[2], ARGV[1], receipt)
        table.insert(claimed, receipt)
        table.insert(claimed, body)
        token = token + 1
    end
end
return claimed
",
    )
});

/// Removes an item whose receipt is still within its visibility window.
///
/// KEYS: in-flight set, item hash. ARGV: receipt, current time in
/// milliseconds, item id. Returns 1 when deleted, 0 for a stale receipt.
static DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not deadline or tonumber(deadline) <= tonumber(ARGV[2]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[3])
return 1
",
    )
});

/// Queue stored in Redis, shared between the receiving and the draining
/// processes.
///
/// Uses three keys per queue: `{name}:pending` is the list of visible item
/// ids, `{name}:inflight` is a sorted set of receipts scored by their
/// visibility deadline in milliseconds and `{name}:items` is a hash holding
/// the payloads. Every move between the pending list and the in-flight set
/// runs as a server-side script, so an item is always in one of the two.
pub struct RedisQueue {
    client: redis::Client,
    name: String,
    pending: String,
    in_flight: String,
    items: String,
}

impl RedisQueue {
    /// Creates a new [`RedisQueue`] with the given Redis URL and queue name.
    pub fn new(url: &str, name: String) -> QueueResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            error!(url = %url, error = %e, "Failed to create Redis client");
            QueueError::Connection(format!("Failed to create Redis client: {e}"))
        })?;
        info!(url = %url, queue = %name, "Redis queue initialized");
        Ok(Self {
            client,
            pending: format!("{name}:pending"),
            in_flight: format!("{name}:inflight"),
            items: format!("{name}:items"),
            name,
        })
    }

    async fn connection(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(queue = %self.name, error = %e, "Failed to connect to Redis");
                QueueError::Connection(format!("Failed to connect to Redis: {e}"))
            })
    }

    /// Moves every receipt whose visibility deadline passed back to the
    /// pending list.
    async fn requeue_expired(&self, conn: &mut MultiplexedConnection) -> QueueResult<usize> {
        let requeued: usize = REQUEUE_EXPIRED
            .key(&self.in_flight)
            .key(&self.pending)
            .arg(now_millis())
            .invoke_async(conn)
            .await
            .map_err(operation_error)?;
        if requeued > 0 {
            debug!(
                queue = %self.name,
                count = requeued,
                "Visibility timeout expired, items requeued"
            );
        }
        Ok(requeued)
    }

    /// Claims up to `max_items` pending items for the visibility timeout.
    async fn claim(
        &self,
        conn: &mut MultiplexedConnection,
        max_items: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<ReceivedItem>> {
        let deadline = now_millis().saturating_add(visibility_timeout.as_millis() as u64);
        let mut invocation = CLAIM.key(&self.pending);
        invocation
            .key(&self.in_flight)
            .key(&self.items)
            .arg(deadline);
        for _ in 0..max_items {
            invocation.arg(Uuid::new_v4().to_string());
        }

        let claimed: Vec<String> = invocation
            .invoke_async(conn)
            .await
            .map_err(operation_error)?;
        Ok(claimed_items(claimed))
    }
}

impl MessageQueue for RedisQueue {
    fn enqueue<'a>(&'a self, body: &'a str) -> QueueFuture<'a, String> {
        Box::pin(async move {
            let id = Uuid::new_v4().to_string();
            let mut conn = self.connection().await?;

            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&self.items)
                .arg(&id)
                .arg(body)
                .ignore()
                .cmd("LPUSH")
                .arg(&self.pending)
                .arg(&id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| {
                    error!(queue = %self.name, error = %e, "Failed to LPUSH to Redis");
                    QueueError::Operation(format!("Failed to push to Redis: {e}"))
                })?;

            debug!(queue = %self.name, id = %id, size = body.len(), "Pushed item to Redis");
            Ok(id)
        })
    }

    fn approximate_backlog(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            self.requeue_expired(&mut conn).await?;
            redis::cmd("LLEN")
                .arg(&self.pending)
                .query_async(&mut conn)
                .await
                .map_err(operation_error)
        })
    }

    fn receive(&self, options: ReceiveOptions) -> QueueFuture<'_, Vec<ReceivedItem>> {
        Box::pin(async move {
            if options.max_items == 0 {
                return Ok(Vec::new());
            }

            let mut conn = self.connection().await?;
            let wait_until = Instant::now() + options.wait;
            loop {
                self.requeue_expired(&mut conn).await?;
                let items = self
                    .claim(&mut conn, options.max_items, options.visibility_timeout)
                    .await?;

                let now = Instant::now();
                if !items.is_empty() || now >= wait_until {
                    debug!(queue = %self.name, count = items.len(), "Received items from Redis");
                    return Ok(items);
                }
                sleep(POLL_INTERVAL.min(wait_until - now)).await;
            }
        })
    }

    fn delete<'a>(&'a self, receipt: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let id = receipt_id(receipt)
                .ok_or_else(|| QueueError::StaleReceipt(receipt.to_string()))?;
            let mut conn = self.connection().await?;

            let deleted: i64 = DELETE
                .key(&self.in_flight)
                .key(&self.items)
                .arg(receipt)
                .arg(now_millis())
                .arg(id)
                .invoke_async(&mut conn)
                .await
                .map_err(operation_error)?;
            if deleted == 0 {
                return Err(QueueError::StaleReceipt(receipt.to_string()));
            }

            debug!(queue = %self.name, id = %id, "Deleted item from Redis");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// Pairs up the flat `receipt, body` reply of the claim script.
fn claimed_items(claimed: Vec<String>) -> Vec<ReceivedItem> {
    let mut claimed = claimed.into_iter();
    let mut items = Vec::new();
    while let (Some(receipt), Some(body)) = (claimed.next(), claimed.next()) {
        items.push(ReceivedItem { body, receipt });
    }
    items
}

/// Extracts the item id from a receipt handle (`{id}:{token}`).
fn receipt_id(receipt: &str) -> Option<&str> {
    receipt
        .split_once(':')
        .map(|(id, _)| id)
        .filter(|id| !id.is_empty())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn operation_error(e: redis::RedisError) -> QueueError {
    error!(error = %e, "Redis queue operation failed");
    QueueError::Operation(e.to_string())
}
