//! 内存中的 Mock 工具服务端（用于测试与本地演示，无需真实子进程）
//!
//! 支持注入故障：前 N 次建连失败、前 N 次调用连接错误、发现失败、ping 失败、人为延迟；
//! 并统计建连 / 发现 / 调用次数，便于断言单飞、上限与重试行为。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::protocol::{RemoteTool, ToolResponse};
use crate::tools::transport::{Connector, ToolConnection};

pub type MockHandler = Arc<dyn Fn(&Value) -> ToolResponse + Send + Sync>;

#[derive(Clone)]
struct MockTool {
    remote: RemoteTool,
    handler: MockHandler,
}

/// Mock 工具服务端；clone 共享同一份状态，可一份注册进连接池、一份留给测试断言
#[derive(Clone)]
pub struct MockToolServer {
    inner: Arc<MockState>,
}

struct MockState {
    id: String,
    tools: Mutex<Vec<MockTool>>,
    connects: AtomicUsize,
    list_calls: AtomicUsize,
    pings: AtomicUsize,
    calls: Mutex<HashMap<String, usize>>,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_calls: AtomicUsize,
    fail_list: AtomicBool,
    fail_ping: AtomicBool,
    connect_delay: Mutex<Duration>,
    list_delay: Mutex<Duration>,
    call_delay: Mutex<Duration>,
}

impl MockToolServer {
    pub fn new(id: impl Into<String>) -> Self {
        let inner = MockState {
            id: id.into(),
            tools: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            open: AtomicUsize::new(0),
            peak_open: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            fail_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            list_delay: Mutex::new(Duration::ZERO),
            call_delay: Mutex::new(Duration::ZERO),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// 注册一个工具（无参数 schema）
    pub fn tool<F>(self, name: &str, tags: &[&str], handler: F) -> Self
    where
        F: Fn(&Value) -> ToolResponse + Send + Sync + 'static,
    {
        self.tool_with_schema(name, tags, None, handler)
    }

    pub fn tool_with_schema<F>(self, name: &str, tags: &[&str], schema: Option<Value>, handler: F) -> Self
    where
        F: Fn(&Value) -> ToolResponse + Send + Sync + 'static,
    {
        self.add_tool(name, tags, schema, handler);
        self
    }

    /// 运行期追加工具（用于测试刷新后工具集变化）
    pub fn add_tool<F>(&self, name: &str, tags: &[&str], schema: Option<Value>, handler: F)
    where
        F: Fn(&Value) -> ToolResponse + Send + Sync + 'static,
    {
        let remote = RemoteTool {
            name: name.to_string(),
            description: format!("mock tool {name}"),
            argument_schema: schema,
            capability_tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        if let Ok(mut tools) = self.inner.tools.lock() {
            tools.retain(|t| t.remote.name != name);
            tools.push(MockTool {
                remote,
                handler: Arc::new(handler),
            });
        }
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// 接下来 n 次 call_tool 返回连接错误
    pub fn fail_next_calls(&self, n: usize) {
        self.inner.fail_calls.store(n, Ordering::SeqCst);
    }

    pub fn set_list_failure(&self, fail: bool) {
        self.inner.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.inner.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.inner.connect_delay.lock() {
            *d = delay;
        }
    }

    pub fn set_list_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.inner.list_delay.lock() {
            *d = delay;
        }
    }

    pub fn set_call_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.inner.call_delay.lock() {
            *d = delay;
        }
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.inner.pings.load(Ordering::SeqCst)
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.inner.calls
            .lock()
            .map(|c| c.get(tool).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn peak_open(&self) -> usize {
        self.inner.peak_open.load(Ordering::SeqCst)
    }
}

fn read_delay(cell: &Mutex<Duration>) -> Duration {
    cell.lock().map(|d| *d).unwrap_or(Duration::ZERO)
}

/// 原子地消耗一次注入的故障计数
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for MockToolServer {
    async fn connect(&self) -> Result<Box<dyn ToolConnection>, AgentError> {
        let state = &self.inner;
        state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = read_delay(&state.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_fault(&state.fail_connects) {
            return Err(AgentError::connection(&state.id, "injected connect failure"));
        }
        let now = state.open.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            server: Arc::clone(state),
        }))
    }
}

struct MockConnection {
    server: Arc<MockState>,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.server.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolConnection for MockConnection {
    async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<ToolResponse, AgentError> {
        let delay = read_delay(&self.server.call_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut calls) = self.server.calls.lock() {
            *calls.entry(tool.to_string()).or_insert(0) += 1;
        }
        if take_fault(&self.server.fail_calls) {
            return Err(AgentError::connection(&self.server.id, "injected connection reset"));
        }
        let handler = self
            .server
            .tools
            .lock()
            .ok()
            .and_then(|tools| tools.iter().find(|t| t.remote.name == tool).map(|t| t.handler.clone()));
        match handler {
            Some(h) => Ok(h(&arguments)),
            None => Ok(ToolResponse::failure(format!("unknown tool: {tool}"))),
        }
    }

    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, AgentError> {
        self.server.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = read_delay(&self.server.list_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.server.fail_list.load(Ordering::SeqCst) {
            return Err(AgentError::connection(&self.server.id, "injected discovery failure"));
        }
        Ok(self
            .server
            .tools
            .lock()
            .map(|tools| tools.iter().map(|t| t.remote.clone()).collect())
            .unwrap_or_default())
    }

    async fn ping(&mut self) -> Result<(), AgentError> {
        self.server.pings.fetch_add(1, Ordering::SeqCst);
        if self.server.fail_ping.load(Ordering::SeqCst) {
            return Err(AgentError::connection(&self.server.id, "injected ping failure"));
        }
        Ok(())
    }
}
