//! 连接池：每个工具服务端最多 N 条存活连接
//!
//! - acquire 优先复用空闲连接（空闲过久或已降级的先 ping 探测），否则在上限内新建，再否则等待归还，整体受获取超时约束
//! - PoolGuard 是作用域借用：release(outcome) 归还一次；未 release 就被 drop（取消 / panic）则直接退役
//! - 连续错误超过阈值、探测失败、超时的连接关闭而不归还；下次 acquire 透明补建
//! - 每个服务端一个独立 slot，不同服务端之间没有共享锁

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolSection;
use crate::core::AgentError;
use crate::tools::transport::{Connector, ToolConnection};

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_server: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    /// 空闲超过该时长的连接被回收
    pub idle_timeout: Duration,
    /// 空闲超过该时长的连接复用前先探测
    pub probe_after: Duration,
    /// 连续错误超过该值即退役
    pub max_consecutive_errors: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_server: 4,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            probe_after: Duration::from_secs(30),
            max_consecutive_errors: 3,
        }
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(s: &PoolSection) -> Self {
        Self {
            max_connections_per_server: s.max_connections_per_server.max(1),
            acquire_timeout: Duration::from_millis(s.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            idle_timeout: Duration::from_secs(s.idle_timeout_secs),
            probe_after: Duration::from_secs(s.probe_after_secs),
            max_consecutive_errors: s.max_consecutive_errors,
        }
    }
}

/// 连接健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    Healthy,
    /// 最近出过连接错误，复用前必须探测
    Degraded,
    Dead,
}

/// 一次借用结束时的结果，决定连接去留
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// 工具自己报错，连接本身没问题
    ToolError,
    ConnectionError,
    /// 调用超时，连接上可能还有未读完的响应
    Timeout,
}

/// 池中的一条连接；持有一个 slot 许可，连接存活期间计入上限
pub struct PooledConnection {
    pub server_id: String,
    handle: Box<dyn ToolConnection>,
    pub health: Health,
    pub idle_since: Instant,
    pub consecutive_errors: u32,
    _permit: SlotPermit,
}

/// 存活连接许可；释放时唤醒一个等待者，借出途中被取消也不会漏掉通知
struct SlotPermit {
    permit: Option<OwnedSemaphorePermit>,
    returned: Arc<Notify>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.returned.notify_one();
    }
}

struct ServerSlot {
    server_id: String,
    connector: Arc<dyn Connector>,
    /// 存活连接许可（空闲 + 借出）
    live: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
    /// 有连接归还或退役时唤醒等待者
    returned: Arc<Notify>,
    checked_out: AtomicUsize,
    peak_checked_out: AtomicUsize,
}

impl ServerSlot {
    fn pop_idle(&self) -> Option<PooledConnection> {
        self.idle.lock().ok()?.pop_back()
    }

    fn push_idle(&self, conn: PooledConnection) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push_back(conn),
            Err(_) => drop(conn),
        }
        self.returned.notify_one();
    }

    /// 关闭连接并释放许可；在异步上下文外只做 drop（子进程有 kill_on_drop 兜底）
    fn retire(&self, mut conn: PooledConnection, reason: &str) {
        tracing::debug!(server = %self.server_id, reason, "retiring connection");
        conn.health = Health::Dead;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    conn.handle.close().await;
                });
            }
            Err(_) => drop(conn),
        }
    }

    fn mark_checked_out(&self) {
        let now = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_checked_out.fetch_max(now, Ordering::SeqCst);
    }
}

/// 按工具服务端分组的连接池
pub struct ConnectionPool {
    slots: HashMap<String, Arc<ServerSlot>>,
    config: PoolConfig,
    closed: Arc<AtomicBool>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            slots: HashMap::new(),
            config,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 注册一个工具服务端（构建期调用，之后池以 Arc 共享）
    pub fn with_server(mut self, server_id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let server_id = server_id.into();
        let slot = ServerSlot {
            server_id: server_id.clone(),
            connector,
            live: Arc::new(Semaphore::new(self.config.max_connections_per_server.max(1))),
            idle: Mutex::new(VecDeque::new()),
            returned: Arc::new(Notify::new()),
            checked_out: AtomicUsize::new(0),
            peak_checked_out: AtomicUsize::new(0),
        };
        self.slots.insert(server_id, Arc::new(slot));
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn slot(&self, server_id: &str) -> Result<&Arc<ServerSlot>, AgentError> {
        self.slots
            .get(server_id)
            .ok_or_else(|| AgentError::UnknownServer(server_id.to_string()))
    }

    /// 借出一条连接；超时返回 PoolExhausted，建连失败返回 Connection
    pub async fn acquire(&self, server_id: &str) -> Result<PoolGuard, AgentError> {
        let slot = self.slot(server_id)?;
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AgentError::PoolExhausted(format!("{server_id} (pool is shut down)")));
            }
            // 先登记等待，再检查状态，避免错过检查与等待之间的归还通知
            let notified = slot.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while let Some(conn) = slot.pop_idle() {
                if let Some(conn) = self.revalidate(slot, conn).await {
                    return Ok(self.guard(slot, conn));
                }
            }

            if let Ok(permit) = Arc::clone(&slot.live).try_acquire_owned() {
                let permit = SlotPermit {
                    permit: Some(permit),
                    returned: Arc::clone(&slot.returned),
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                let budget = self.config.connect_timeout.min(remaining.max(Duration::from_millis(1)));
                let handle = match tokio::time::timeout(budget, slot.connector.connect()).await {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(AgentError::connection(
                            server_id,
                            format!("connect timed out after {budget:?}"),
                        ));
                    }
                };
                tracing::debug!(server = %server_id, "opened new connection");
                let conn = PooledConnection {
                    server_id: server_id.to_string(),
                    handle,
                    health: Health::Healthy,
                    idle_since: Instant::now(),
                    consecutive_errors: 0,
                    _permit: permit,
                };
                return Ok(self.guard(slot, conn));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(server = %server_id, "acquire timed out, all connections busy");
                return Err(AgentError::PoolExhausted(server_id.to_string()));
            }
        }
    }

    /// 空闲连接复用前的检查：过期回收；空闲过久或已降级则 ping
    async fn revalidate(&self, slot: &Arc<ServerSlot>, mut conn: PooledConnection) -> Option<PooledConnection> {
        let idle_for = conn.idle_since.elapsed();
        if idle_for >= self.config.idle_timeout {
            slot.retire(conn, "idle timeout");
            return None;
        }
        if conn.health == Health::Degraded || idle_for >= self.config.probe_after {
            let probe = tokio::time::timeout(self.config.connect_timeout, conn.handle.ping()).await;
            match probe {
                Ok(Ok(())) => {
                    conn.health = Health::Healthy;
                }
                Ok(Err(e)) => {
                    tracing::info!(server = %slot.server_id, error = %e, "health probe failed");
                    slot.retire(conn, "probe failed");
                    return None;
                }
                Err(_) => {
                    slot.retire(conn, "probe timed out");
                    return None;
                }
            }
        }
        Some(conn)
    }

    fn guard(&self, slot: &Arc<ServerSlot>, conn: PooledConnection) -> PoolGuard {
        slot.mark_checked_out();
        PoolGuard {
            slot: Arc::clone(slot),
            conn: Some(conn),
            max_consecutive_errors: self.config.max_consecutive_errors,
            pool_closed: Arc::clone(&self.closed),
        }
    }

    /// 回收空闲超时的连接，返回关闭数量
    pub fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for slot in self.slots.values() {
            let expired: Vec<PooledConnection> = match slot.idle.lock() {
                Ok(mut idle) => {
                    let (old, keep): (Vec<_>, Vec<_>) = idle
                        .drain(..)
                        .partition(|c| c.idle_since.elapsed() >= self.config.idle_timeout);
                    idle.extend(keep);
                    old
                }
                Err(_) => Vec::new(),
            };
            reaped += expired.len();
            for conn in expired {
                slot.retire(conn, "idle timeout");
            }
        }
        if reaped > 0 {
            tracing::debug!(reaped, "reaped idle connections");
        }
        reaped
    }

    /// 后台定期回收空闲连接，直到 cancel
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.reap_idle();
                    }
                }
            }
        })
    }

    /// 关闭所有空闲连接并拒绝后续借出；借出中的连接在归还时关闭
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for slot in self.slots.values() {
            let drained: Vec<PooledConnection> = match slot.idle.lock() {
                Ok(mut idle) => idle.drain(..).collect(),
                Err(_) => Vec::new(),
            };
            for mut conn in drained {
                conn.handle.close().await;
            }
            slot.returned.notify_waiters();
        }
        tracing::info!("connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 当前借出数
    pub fn checked_out(&self, server_id: &str) -> usize {
        self.slots
            .get(server_id)
            .map(|s| s.checked_out.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// 借出数的历史峰值
    pub fn peak_checked_out(&self, server_id: &str) -> usize {
        self.slots
            .get(server_id)
            .map(|s| s.peak_checked_out.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// 存活连接数（空闲 + 借出 + 正在关闭）
    pub fn live(&self, server_id: &str) -> usize {
        self.slots
            .get(server_id)
            .map(|s| self.config.max_connections_per_server.max(1) - s.live.available_permits())
            .unwrap_or(0)
    }

    pub fn idle(&self, server_id: &str) -> usize {
        self.slots
            .get(server_id)
            .and_then(|s| s.idle.lock().ok().map(|i| i.len()))
            .unwrap_or(0)
    }
}

/// 作用域借用：release 或 drop 时归还，且只归还一次
pub struct PoolGuard {
    slot: Arc<ServerSlot>,
    conn: Option<PooledConnection>,
    max_consecutive_errors: u32,
    pool_closed: Arc<AtomicBool>,
}

impl PoolGuard {
    pub fn server_id(&self) -> &str {
        &self.slot.server_id
    }

    pub fn connection(&mut self) -> &mut dyn ToolConnection {
        // conn 只在 release/drop 中取走，二者都消耗 guard
        match self.conn.as_mut() {
            Some(c) => c.handle.as_mut(),
            None => unreachable!("pool guard used after release"),
        }
    }

    pub fn health(&self) -> Option<Health> {
        self.conn.as_ref().map(|c| c.health)
    }

    /// 按本次调用结果归还连接
    pub fn release(mut self, outcome: CallOutcome) {
        if let Some(conn) = self.conn.take() {
            self.check_in(conn, outcome);
        }
    }

    fn check_in(&self, mut conn: PooledConnection, outcome: CallOutcome) {
        self.slot.checked_out.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            CallOutcome::Success | CallOutcome::ToolError => {
                conn.consecutive_errors = 0;
                conn.health = Health::Healthy;
            }
            CallOutcome::ConnectionError => {
                conn.consecutive_errors += 1;
                conn.health = Health::Degraded;
            }
            CallOutcome::Timeout => {
                conn.health = Health::Dead;
            }
        }

        if self.pool_closed.load(Ordering::SeqCst) {
            self.slot.retire(conn, "pool closed");
        } else if conn.health == Health::Dead {
            self.slot.retire(conn, "dead");
        } else if conn.consecutive_errors > self.max_consecutive_errors {
            self.slot.retire(conn, "too many consecutive errors");
        } else {
            conn.idle_since = Instant::now();
            self.slot.push_idle(conn);
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // 未 release 即被丢弃：调用可能中途被取消，连接上的协议状态不可信
            self.slot.checked_out.fetch_sub(1, Ordering::SeqCst);
            self.slot.retire(conn, "guard dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::mock::MockToolServer;

    fn pool_with(server: &Arc<MockToolServer>, max: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            max_connections_per_server: max,
            acquire_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        };
        Arc::new(ConnectionPool::new(config).with_server(server.id(), server.clone()))
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let server = Arc::new(MockToolServer::new("fs"));
        let pool = pool_with(&server, 2);

        let guard = pool.acquire("fs").await.unwrap();
        guard.release(CallOutcome::Success);
        let guard = pool.acquire("fs").await.unwrap();
        guard.release(CallOutcome::Success);

        assert_eq!(server.connects(), 1);
        assert_eq!(pool.idle("fs"), 1);
        assert_eq!(pool.checked_out("fs"), 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_cap() {
        let server = Arc::new(MockToolServer::new("fs"));
        let pool = pool_with(&server, 1);

        let _held = pool.acquire("fs").await.unwrap();
        let err = pool.acquire("fs").await.err().unwrap();
        assert!(matches!(err, AgentError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let server = Arc::new(MockToolServer::new("fs"));
        let pool = pool_with(&server, 1);

        let held = pool.acquire("fs").await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire("fs").await.map(|g| g.release(CallOutcome::Success)) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release(CallOutcome::Success);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_retires_connection() {
        let server = Arc::new(MockToolServer::new("fs"));
        let pool = pool_with(&server, 1);

        {
            let _guard = pool.acquire("fs").await.unwrap();
        }
        assert_eq!(pool.checked_out("fs"), 0);
        // 退役后许可释放，可以新建
        let guard = pool.acquire("fs").await.unwrap();
        guard.release(CallOutcome::Success);
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test]
    async fn test_consecutive_errors_retire() {
        let server = Arc::new(MockToolServer::new("fs"));
        let config = PoolConfig {
            max_connections_per_server: 1,
            max_consecutive_errors: 1,
            acquire_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(config).with_server("fs", server.clone());

        pool.acquire("fs").await.unwrap().release(CallOutcome::ConnectionError);
        assert_eq!(pool.idle("fs"), 1);
        pool.acquire("fs").await.unwrap().release(CallOutcome::ConnectionError);
        assert_eq!(pool.idle("fs"), 0);

        pool.acquire("fs").await.unwrap().release(CallOutcome::Success);
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test]
    async fn test_degraded_connection_probe_failure_replaced() {
        let server = Arc::new(MockToolServer::new("fs"));
        let pool = pool_with(&server, 1);

        pool.acquire("fs").await.unwrap().release(CallOutcome::ConnectionError);
        server.set_ping_failure(true);
        let guard = pool.acquire("fs").await.unwrap();
        assert_eq!(guard.health(), Some(Health::Healthy));
        guard.release(CallOutcome::Success);
        assert_eq!(server.connects(), 2);
        assert!(server.pings() >= 1);
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let server = Arc::new(MockToolServer::new("fs"));
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(config).with_server("fs", server.clone());
        pool.acquire("fs").await.unwrap().release(CallOutcome::Success);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.idle("fs"), 0);
    }

    #[tokio::test]
    async fn test_never_exceeds_cap_under_contention() {
        let server = Arc::new(MockToolServer::new("fs"));
        let config = PoolConfig {
            max_connections_per_server: 3,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(config).with_server("fs", server.clone()));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let p = pool.clone();
            tasks.push(tokio::spawn(async move {
                let g = p.acquire("fs").await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                g.release(CallOutcome::Success);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(pool.peak_checked_out("fs") <= 3);
        assert!(server.peak_open() <= 3);
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let pool = ConnectionPool::new(PoolConfig::default());
        assert!(matches!(pool.acquire("nope").await, Err(AgentError::UnknownServer(_))));
    }

    #[tokio::test]
    async fn test_cancelled_connect_wakes_waiter() {
        let server = Arc::new(MockToolServer::new("fs"));
        server.set_connect_delay(Duration::from_millis(100));
        let config = PoolConfig {
            max_connections_per_server: 1,
            acquire_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(config).with_server("fs", server.clone()));

        let p = pool.clone();
        let first = tokio::spawn(async move { p.acquire("fs").await.map(|g| g.release(CallOutcome::Success)) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let p = pool.clone();
        let second = tokio::spawn(async move {
            let started = Instant::now();
            let result = p.acquire("fs").await.map(|g| g.release(CallOutcome::Success));
            (result, started.elapsed())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let (result, took) = second.await.unwrap();
        assert!(result.is_ok());
        assert!(took < Duration::from_secs(1), "waiter slept through a free slot: {took:?}");
        assert_eq!(pool.checked_out("fs"), 0);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_shutdown_does_not_connect() {
        let server = Arc::new(MockToolServer::new("fs"));
        let config = PoolConfig {
            max_connections_per_server: 1,
            acquire_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(config).with_server("fs", server.clone()));

        let held = pool.acquire("fs").await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire("fs").await.map(|g| g.release(CallOutcome::Success)) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;
        drop(held);

        assert!(matches!(waiter.await.unwrap(), Err(AgentError::PoolExhausted(_))));
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_acquire() {
        let server = Arc::new(MockToolServer::new("fs"));
        let pool = pool_with(&server, 2);
        pool.acquire("fs").await.unwrap().release(CallOutcome::Success);
        pool.shutdown().await;
        assert_eq!(pool.idle("fs"), 0);
        assert!(pool.acquire("fs").await.is_err());
    }
}
