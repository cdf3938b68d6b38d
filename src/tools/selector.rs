//! 工具选择器：给定步骤描述与所需能力标签，从缓存的工具元数据里挑一个
//!
//! 打分 = w_tag × 标签覆盖率 + w_rel × 可靠度 + w_lat × 1/(1 + 平均延迟秒)；同分按名称排序保证确定性。
//! 步骤未给标签时，标签覆盖率改用描述与工具名 / 描述 / 标签的分词 Jaccard 相似度。
//!
//! 排序策略是 ToolRanker：RuleRanker 直接取最高分；LlmRanker 在最高分附近的候选中让模型挑。
//! 唯一的回退点在 select 内部：排序器出错 → warn → 取规则排序结果。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::SelectorSection;
use crate::core::AgentError;
use crate::llm::{extract_json, LlmClient};
use crate::memory::tokenizer::{jaccard_similarity, tokenize_to_set};
use crate::memory::{Message, ToolStats};
use crate::tools::cache::ToolCache;
use crate::tools::descriptor::ToolDescriptor;

/// 打分权重
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub tags: f64,
    pub reliability: f64,
    pub latency: f64,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub weights: ScoreWeights,
    pub min_tag_overlap: f64,
    pub min_text_similarity: f64,
    pub ambiguity_margin: f64,
    pub max_llm_candidates: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self::from(&SelectorSection::default())
    }
}

impl From<&SelectorSection> for SelectorConfig {
    fn from(s: &SelectorSection) -> Self {
        Self {
            weights: ScoreWeights {
                tags: s.weight_tags,
                reliability: s.weight_reliability,
                latency: s.weight_latency,
            },
            min_tag_overlap: s.min_tag_overlap,
            min_text_similarity: s.min_text_similarity,
            ambiguity_margin: s.ambiguity_margin,
            max_llm_candidates: s.max_llm_candidates.max(1),
        }
    }
}

/// 打过分的候选工具（descriptor 已叠加使用统计）
#[derive(Debug, Clone, Serialize)]
pub struct ScoredTool {
    pub descriptor: ToolDescriptor,
    pub score: f64,
    /// 标签覆盖率或描述相似度（0.0 ~ 1.0）
    pub match_ratio: f64,
}

#[derive(Debug, Clone)]
pub enum Selection {
    Tool(ScoredTool),
    /// 没有工具达到阈值；由编排器决定重新规划还是终止
    NoMatch { reason: String },
}

/// 候选排序策略
#[async_trait]
pub trait ToolRanker: Send + Sync {
    fn name(&self) -> &'static str;

    /// candidates 已按规则分数降序；返回选中的下标
    async fn rank(&self, step_description: &str, candidates: &[ScoredTool]) -> Result<usize, AgentError>;
}

/// 规则排序：总是取最高分
#[derive(Debug, Default)]
pub struct RuleRanker;

#[async_trait]
impl ToolRanker for RuleRanker {
    fn name(&self) -> &'static str {
        "rule"
    }

    async fn rank(&self, _step_description: &str, _candidates: &[ScoredTool]) -> Result<usize, AgentError> {
        Ok(0)
    }
}

/// LLM 排序：列出候选，要求模型回复 `{"choice": <下标>}`
pub struct LlmRanker {
    llm: Arc<dyn LlmClient>,
}

#[derive(Debug, Deserialize)]
struct RankReply {
    choice: usize,
}

impl LlmRanker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(step_description: &str, candidates: &[ScoredTool]) -> Vec<Message> {
        let mut listing = String::new();
        for (i, c) in candidates.iter().enumerate() {
            listing.push_str(&format!(
                "{}. {}: {} [tags: {}]\n",
                i,
                c.descriptor.key(),
                c.descriptor.description,
                c.descriptor.capabilities.join(", ")
            ));
        }
        vec![
            Message::system(
                "You pick the tool that best fits a task step. \
                 Reply with JSON only: {\"choice\": <index>}.",
            ),
            Message::user(format!("Step: {step_description}\n\nCandidates:\n{listing}")),
        ]
    }
}

#[async_trait]
impl ToolRanker for LlmRanker {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn rank(&self, step_description: &str, candidates: &[ScoredTool]) -> Result<usize, AgentError> {
        let reply = self
            .llm
            .complete(&Self::prompt(step_description, candidates))
            .await
            .map_err(AgentError::LlmError)?;

        let choice = match extract_json(&reply) {
            Some(json) => serde_json::from_str::<RankReply>(json)
                .map_err(|e| AgentError::JsonParseError(format!("{e}: {json}")))?
                .choice,
            None => reply
                .trim()
                .parse::<usize>()
                .map_err(|_| AgentError::JsonParseError(format!("no choice in reply: {reply}")))?,
        };
        if choice >= candidates.len() {
            return Err(AgentError::LlmError(format!(
                "choice {choice} out of range ({} candidates)",
                candidates.len()
            )));
        }
        Ok(choice)
    }
}

pub struct ToolSelector {
    cache: ToolCache,
    stats: Arc<ToolStats>,
    ranker: Box<dyn ToolRanker>,
    config: SelectorConfig,
}

impl ToolSelector {
    pub fn new(cache: ToolCache, stats: Arc<ToolStats>, ranker: Box<dyn ToolRanker>, config: SelectorConfig) -> Self {
        Self {
            cache,
            stats,
            ranker,
            config,
        }
    }

    pub fn ranker_name(&self) -> &'static str {
        self.ranker.name()
    }

    /// 所有服务端的工具（并行经缓存获取）；单个服务端失败记日志跳过，全部失败才返回错误
    pub async fn catalog(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
        self.gather().await.map(|(tools, _)| tools)
    }

    /// 部分成功时连同第一个服务端错误一起返回
    async fn gather(&self) -> Result<(Vec<ToolDescriptor>, Option<AgentError>), AgentError> {
        let servers = self.cache.servers();
        let lookups = join_all(servers.iter().map(|s| self.cache.get(s))).await;

        let mut tools = Vec::new();
        let mut first_error = None;
        let mut ok_count = 0;
        for (server, result) in servers.iter().zip(lookups) {
            match result {
                Ok(list) => {
                    ok_count += 1;
                    tools.extend(list);
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "skipping tool server during selection");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if ok_count == 0 => Err(e),
            failure => Ok((tools, failure)),
        }
    }

    /// 全部可用能力标签（去重排序），供规划器使用
    pub async fn available_capabilities(&self) -> Result<Vec<String>, AgentError> {
        let mut tags: Vec<String> = self
            .catalog()
            .await?
            .into_iter()
            .flat_map(|d| d.capabilities)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        tags.sort();
        Ok(tags)
    }

    pub async fn select(
        &self,
        step_description: &str,
        required_capabilities: &[String],
    ) -> Result<Selection, AgentError> {
        let (catalog, failure) = self.gather().await?;
        if catalog.is_empty() {
            if let Some(e) = failure {
                return Err(e);
            }
            return Ok(Selection::NoMatch {
                reason: "no tools discovered on any server".to_string(),
            });
        }

        let candidates = self.score(step_description, required_capabilities, &catalog);
        if candidates.is_empty() {
            // 没有候选时不能确定匹配的工具不在失联的服务端上
            if let Some(e) = failure {
                tracing::warn!(step = %step_description, error = %e, "no candidate while a tool server is unreachable");
                return Err(e);
            }
            let reason = if required_capabilities.is_empty() {
                format!("no tool resembles '{step_description}'")
            } else {
                format!("no tool covers capabilities [{}]", required_capabilities.join(", "))
            };
            tracing::debug!(step = %step_description, "{}", reason);
            return Ok(Selection::NoMatch { reason });
        }

        let best = candidates[0].score;
        let ambiguous: Vec<ScoredTool> = candidates
            .iter()
            .take_while(|c| best - c.score <= self.config.ambiguity_margin)
            .take(self.config.max_llm_candidates)
            .cloned()
            .collect();

        let pick = if ambiguous.len() > 1 {
            match self.ranker.rank(step_description, &ambiguous).await {
                Ok(i) => i,
                Err(e) => {
                    tracing::warn!(
                        ranker = self.ranker.name(),
                        error = %e,
                        "ranker failed, falling back to rule ranking"
                    );
                    0
                }
            }
        } else {
            0
        };

        let chosen = ambiguous
            .into_iter()
            .nth(pick)
            .unwrap_or_else(|| candidates[0].clone());
        tracing::debug!(
            step = %step_description,
            tool = %chosen.descriptor.key(),
            score = chosen.score,
            "tool selected"
        );
        Ok(Selection::Tool(chosen))
    }

    /// 打分并过滤，按分数降序、名称升序
    fn score(&self, step_description: &str, required: &[String], catalog: &[ToolDescriptor]) -> Vec<ScoredTool> {
        let required: Vec<String> = required.iter().map(|t| t.to_lowercase()).collect();
        let step_tokens = tokenize_to_set(step_description);
        let w = self.config.weights;

        let mut scored: Vec<ScoredTool> = catalog
            .iter()
            .filter_map(|d| {
                let (ratio, threshold) = if required.is_empty() {
                    let text = format!("{} {} {}", d.name, d.description, d.capabilities.join(" "));
                    let sim = jaccard_similarity(&step_tokens, &tokenize_to_set(&text)) as f64;
                    (sim, self.config.min_text_similarity)
                } else {
                    let hits = required.iter().filter(|t| d.has_capability(t)).count();
                    (hits as f64 / required.len() as f64, self.config.min_tag_overlap)
                };
                if ratio <= 0.0 || ratio < threshold {
                    return None;
                }
                let annotated = self.stats.annotate(d);
                let latency_score = 1.0 / (1.0 + annotated.avg_latency_ms / 1000.0);
                let score = w.tags * ratio + w.reliability * annotated.reliability + w.latency * latency_score;
                Some(ScoredTool {
                    descriptor: annotated,
                    score,
                    match_ratio: ratio,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.descriptor.name.cmp(&b.descriptor.name))
                .then_with(|| a.descriptor.server_id.cmp(&b.descriptor.server_id))
        });
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::cache::CacheConfig;
    use crate::tools::mock::MockToolServer;
    use crate::tools::pool::{ConnectionPool, PoolConfig};
    use crate::tools::protocol::ToolResponse;
    use serde_json::json;
    use std::time::Duration;

    fn ok(_: &serde_json::Value) -> ToolResponse {
        ToolResponse::success(json!("ok"))
    }

    fn fixture(servers: &[MockToolServer]) -> ToolCache {
        let mut pool = ConnectionPool::new(PoolConfig::default());
        for s in servers {
            pool = pool.with_server(s.id(), Arc::new(s.clone()));
        }
        let config = CacheConfig {
            refresh_retries: 0,
            ..CacheConfig::default()
        };
        ToolCache::new(Arc::new(pool), config)
    }

    fn selector(cache: ToolCache, stats: Arc<ToolStats>, ranker: Box<dyn ToolRanker>) -> ToolSelector {
        ToolSelector::new(cache, stats, ranker, SelectorConfig::default())
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn picked(selection: Selection) -> String {
        match selection {
            Selection::Tool(t) => t.descriptor.key(),
            Selection::NoMatch { reason } => panic!("unexpected NoMatch: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_tag_match_wins() {
        let fs = MockToolServer::new("fs")
            .tool("read_file", &["fs", "read"], ok)
            .tool("write_file", &["fs", "write"], ok);
        let web = MockToolServer::new("web").tool("fetch", &["http", "read"], ok);
        let sel = selector(fixture(&[fs, web]), Arc::new(ToolStats::default()), Box::new(RuleRanker));

        let choice = sel.select("read the config", &tags(&["fs", "read"])).await.unwrap();
        assert_eq!(picked(choice), "fs/read_file");
    }

    #[tokio::test]
    async fn test_no_match_below_threshold() {
        let fs = MockToolServer::new("fs").tool("read_file", &["fs", "read"], ok);
        let sel = selector(fixture(&[fs]), Arc::new(ToolStats::default()), Box::new(RuleRanker));

        let choice = sel.select("send an email", &tags(&["email"])).await.unwrap();
        assert!(matches!(choice, Selection::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_reliability_breaks_tag_tie() {
        let a = MockToolServer::new("a").tool("search", &["search"], ok);
        let b = MockToolServer::new("b").tool("search", &["search"], ok);
        let stats = Arc::new(ToolStats::default());
        stats.record("a/search", false, Duration::from_millis(10));
        stats.record("b/search", true, Duration::from_millis(10));
        let sel = selector(fixture(&[a, b]), stats, Box::new(RuleRanker));

        let choice = sel.select("look it up", &tags(&["search"])).await.unwrap();
        assert_eq!(picked(choice), "b/search");
    }

    #[tokio::test]
    async fn test_latency_and_name_order_are_deterministic() {
        let a = MockToolServer::new("a").tool("zeta", &["calc"], ok).tool("alpha", &["calc"], ok);
        let stats = Arc::new(ToolStats::default());
        let sel = selector(fixture(&[a]), stats.clone(), Box::new(RuleRanker));
        assert_eq!(picked(sel.select("add", &tags(&["calc"])).await.unwrap()), "a/alpha");

        stats.record("a/alpha", true, Duration::from_secs(3));
        stats.record("a/zeta", true, Duration::from_millis(1));
        assert_eq!(picked(sel.select("add", &tags(&["calc"])).await.unwrap()), "a/zeta");
    }

    #[tokio::test]
    async fn test_description_similarity_without_tags() {
        let fs = MockToolServer::new("fs")
            .tool("read_file", &["fs"], ok)
            .tool("delete_file", &["fs"], ok);
        let sel = selector(fixture(&[fs]), Arc::new(ToolStats::default()), Box::new(RuleRanker));
        let choice = sel.select("read file notes.txt", &[]).await.unwrap();
        assert_eq!(picked(choice), "fs/read_file");
    }

    #[tokio::test]
    async fn test_llm_ranker_picks_among_ambiguous() {
        let fs = MockToolServer::new("fs")
            .tool("grep", &["search"], ok)
            .tool("find", &["search"], ok);
        let llm = Arc::new(MockLlmClient::scripted([r#"{"choice": 1}"#]));
        let sel = selector(
            fixture(&[fs]),
            Arc::new(ToolStats::default()),
            Box::new(LlmRanker::new(llm.clone())),
        );
        // 规则排序：find < grep，下标 1 是 grep
        let choice = sel.select("search text", &tags(&["search"])).await.unwrap();
        assert_eq!(picked(choice), "fs/grep");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_llm_ranker_failure_falls_back() {
        let fs = MockToolServer::new("fs")
            .tool("grep", &["search"], ok)
            .tool("find", &["search"], ok);
        let llm = Arc::new(MockLlmClient::failing("backend down"));
        let sel = selector(fixture(&[fs]), Arc::new(ToolStats::default()), Box::new(LlmRanker::new(llm)));
        let choice = sel.select("search text", &tags(&["search"])).await.unwrap();
        assert_eq!(picked(choice), "fs/find");
    }

    #[tokio::test]
    async fn test_llm_ranker_out_of_range_falls_back() {
        let fs = MockToolServer::new("fs")
            .tool("grep", &["search"], ok)
            .tool("find", &["search"], ok);
        let llm = Arc::new(MockLlmClient::scripted(["7"]));
        let sel = selector(fixture(&[fs]), Arc::new(ToolStats::default()), Box::new(LlmRanker::new(llm)));
        assert_eq!(picked(sel.select("search", &tags(&["search"])).await.unwrap()), "fs/find");
    }

    #[tokio::test]
    async fn test_failed_server_skipped() {
        let fs = MockToolServer::new("fs").tool("read_file", &["read"], ok);
        let broken = MockToolServer::new("broken").tool("read_all", &["read"], ok);
        broken.set_list_failure(true);
        let sel = selector(fixture(&[fs, broken]), Arc::new(ToolStats::default()), Box::new(RuleRanker));
        assert_eq!(picked(sel.select("read", &tags(&["read"])).await.unwrap()), "fs/read_file");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_reported_as_no_match() {
        let fs = MockToolServer::new("fs").tool("read_file", &["fs"], ok);
        let mail = MockToolServer::new("mail").tool("send", &["email"], ok);
        mail.set_list_failure(true);
        let sel = selector(fixture(&[fs, mail]), Arc::new(ToolStats::default()), Box::new(RuleRanker));
        assert!(matches!(
            sel.select("send email", &tags(&["email"])).await,
            Err(AgentError::CacheRefresh { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_servers_failing_propagates() {
        let broken = MockToolServer::new("broken").tool("x", &["read"], ok);
        broken.set_list_failure(true);
        let sel = selector(fixture(&[broken]), Arc::new(ToolStats::default()), Box::new(RuleRanker));
        assert!(matches!(
            sel.select("read", &tags(&["read"])).await,
            Err(AgentError::CacheRefresh { .. })
        ));
    }

    #[tokio::test]
    async fn test_available_capabilities() {
        let fs = MockToolServer::new("fs").tool("read_file", &["fs", "read"], ok);
        let web = MockToolServer::new("web").tool("fetch", &["http", "read"], ok);
        let sel = selector(fixture(&[fs, web]), Arc::new(ToolStats::default()), Box::new(RuleRanker));
        assert_eq!(sel.available_capabilities().await.unwrap(), tags(&["fs", "http", "read"]));
    }
}
