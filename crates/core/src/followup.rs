//! Suggests next questions after an answer.
//!
//! The LLM is asked first; when it is missing, slow or unhelpful the
//! generator falls back to keyword templates. Every candidate, from either
//! source, passes the same token-set Jaccard filter against the other
//! candidates and the recent question history.

use crate::analysis::{extract_keywords, jaccard, token_set, truncate_chars, MAX_KEYWORDS};
use crate::config::FollowUpConfig;
use crate::models::FollowUpOptions;
use crate::retriever::Retriever;
use crate::traits::CompletionModel;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_QUESTION_CHARS: usize = 30;
const PROBE_HITS: usize = 3;
const TOPIC_SNIPPET_CHARS: usize = 60;

const SYSTEM_PROMPT: &str = "你是知识库助手，负责根据对话内容推荐用户接下来可能提出的问题。\
每行输出一个问题，不要编号，不要解释。";

const KEYWORD_TEMPLATES: &[&str] = &[
    "{}的具体步骤是什么？",
    "{}时常见问题有哪些？",
    "使用{}需要注意什么？",
    "有没有关于{}的示例？",
    "{}有哪些替代方案？",
];

const GENERIC_QUESTIONS: &[&str] = &[
    "能再举一个例子吗？",
    "这部分有哪些注意事项？",
    "相关的文档还有哪些？",
    "下一步应该做什么？",
];

pub struct FollowUpGenerator {
    config: FollowUpConfig,
    llm: Option<Arc<dyn CompletionModel>>,
    retriever: Option<Retriever>,
}

impl FollowUpGenerator {
    pub fn new(config: FollowUpConfig) -> Self {
        Self {
            config,
            llm: None,
            retriever: None,
        }
    }

    pub fn with_llm(mut self, llm: Option<Arc<dyn CompletionModel>>) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Returns at most `num_questions` suggestions; never fails.
    pub async fn generate(&self, context: &str, options: &FollowUpOptions) -> Vec<String> {
        let wanted = options.num_questions;
        if wanted == 0 {
            return Vec::new();
        }

        let keywords = extract_keywords(context, MAX_KEYWORDS);
        let window = options
            .existing_questions
            .len()
            .saturating_sub(self.config.history_window);
        let mut filter = NoveltyFilter::new(
            self.config.dedup_threshold,
            &options.existing_questions[window..],
        );

        let mut questions = Vec::with_capacity(wanted);
        if let Some(llm) = &self.llm {
            let topics = self.probe_topics(&keywords, options).await;
            let prompt = build_prompt(context, &keywords, &topics, &options.existing_questions, wanted);
            let call = llm.complete(SYSTEM_PROMPT, &prompt);
            match tokio::time::timeout(Duration::from_secs(options.timeout_s), call).await {
                Ok(Ok(raw)) => match parse_candidates(&raw) {
                    Ok(candidates) => {
                        for candidate in candidates {
                            if questions.len() == wanted {
                                break;
                            }
                            if let Some(accepted) = filter.admit(&candidate) {
                                questions.push(accepted);
                            }
                        }
                    }
                    Err(error) => warn!(%error, "follow-up parsing failed"),
                },
                Ok(Err(error)) => warn!(model = llm.name(), kind = error.kind(), %error, "follow-up llm failed"),
                Err(_) => warn!(model = llm.name(), timeout_s = options.timeout_s, "follow-up llm timed out"),
            }
        }

        if questions.len() < wanted {
            debug!(have = questions.len(), wanted, "filling follow-ups from templates");
            for candidate in template_candidates(&keywords) {
                if questions.len() == wanted {
                    break;
                }
                if let Some(accepted) = filter.admit(&candidate) {
                    questions.push(accepted);
                }
            }
        }
        questions
    }

    async fn probe_topics(&self, keywords: &[String], options: &FollowUpOptions) -> Vec<String> {
        let Some(retriever) = self.retriever.as_ref().filter(|_| options.probe_retriever) else {
            return Vec::new();
        };
        if keywords.is_empty() {
            return Vec::new();
        }
        match retriever.probe(&keywords.join(" "), PROBE_HITS).await {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| truncate_chars(hit.text.trim(), TOPIC_SNIPPET_CHARS))
                .collect(),
            Err(error) => {
                warn!(kind = error.kind(), %error, "follow-up retriever probe failed");
                Vec::new()
            }
        }
    }
}

/// Accepts questions that are not near-duplicates of anything seen so far.
struct NoveltyFilter {
    threshold: f64,
    seen: Vec<HashSet<String>>,
    exact: HashSet<String>,
}

impl NoveltyFilter {
    fn new(threshold: f64, existing: &[String]) -> Self {
        let mut filter = Self {
            threshold,
            seen: Vec::new(),
            exact: HashSet::new(),
        };
        for question in existing {
            filter.remember(question);
        }
        filter
    }

    fn remember(&mut self, question: &str) {
        self.exact.insert(question.trim().to_lowercase());
        let tokens = token_set(question);
        if !tokens.is_empty() {
            self.seen.push(tokens);
        }
    }

    fn admit(&mut self, candidate: &str) -> Option<String> {
        let question = truncate_chars(candidate.trim(), MAX_QUESTION_CHARS);
        if question.is_empty() || self.exact.contains(&question.to_lowercase()) {
            return None;
        }
        let tokens = token_set(&question);
        if self
            .seen
            .iter()
            .any(|known| jaccard(known, &tokens) > self.threshold)
        {
            return None;
        }
        self.remember(&question);
        Some(question)
    }
}

fn build_prompt(
    context: &str,
    keywords: &[String],
    topics: &[String],
    existing: &[String],
    wanted: usize,
) -> String {
    let mut prompt = format!(
        "对话内容：\n{}\n\n关键词：{}\n",
        truncate_chars(context, 1_500),
        keywords.join("、")
    );
    if !topics.is_empty() {
        prompt.push_str("\n知识库中的相关内容：\n");
        for topic in topics {
            prompt.push_str("- ");
            prompt.push_str(topic);
            prompt.push('\n');
        }
    }
    if !existing.is_empty() {
        prompt.push_str("\n用户已经问过：\n");
        for question in existing {
            prompt.push_str("- ");
            prompt.push_str(question);
            prompt.push('\n');
        }
    }
    prompt.push_str(&format!(
        "\n请给出{}个新问题，每个10到15个字，不要与已问过的问题重复，并且能够用知识库内容回答。",
        wanted * 2
    ));
    prompt
}

/// One candidate per non-empty line, list markers and quotes removed.
fn parse_candidates(raw: &str) -> Result<Vec<String>, regex::Error> {
    let marker = Regex::new(r"^\s*(?:[-*•·]|\d+\s*[.)、．]|[（(]\d+[）)])\s*")?;
    Ok(raw
        .lines()
        .map(|line| marker.replace(line, "").trim().to_string())
        .map(|line| {
            line.trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '「' | '」'))
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect())
}

/// Keyword-templated questions, rotating templates so neighbours differ.
fn template_candidates(keywords: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    if !keywords.is_empty() {
        for round in 0..KEYWORD_TEMPLATES.len() {
            for (position, template) in KEYWORD_TEMPLATES.iter().enumerate() {
                let keyword = &keywords[(position + round) % keywords.len()];
                candidates.push(template.replacen("{}", keyword, 1));
            }
        }
    }
    candidates.extend(GENERIC_QUESTIONS.iter().map(|question| question.to_string()));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SearchError;
    use async_trait::async_trait;

    struct CannedModel(String);

    #[async_trait]
    impl CompletionModel for CannedModel {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, SearchError> {
            Ok(self.0.clone())
        }
    }

    struct SlowModel;

    #[async_trait]
    impl CompletionModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, SearchError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("太慢了".to_string())
        }
    }

    fn options(existing: &[&str]) -> FollowUpOptions {
        FollowUpOptions {
            existing_questions: existing.iter().map(|question| question.to_string()).collect(),
            ..FollowUpOptions::default()
        }
    }

    #[test]
    fn list_markers_are_stripped() -> Result<(), regex::Error> {
        let parsed = parse_candidates("1. 第一个问题\n2) 第二个\n- 第三个\n（4）第四个\n\n• “第五个”")?;
        assert_eq!(parsed, vec!["第一个问题", "第二个", "第三个", "第四个", "第五个"]);
        Ok(())
    }

    #[test]
    fn filter_rejects_near_duplicates_of_history() {
        let mut filter = NoveltyFilter::new(0.7, &["如何安装Python".to_string()]);
        assert!(filter.admit("如何安装Python").is_none());
        assert!(filter.admit("安装的具体步骤是什么？").is_some());
        assert!(filter.admit("安装的具体步骤是什么？").is_none());
    }

    #[tokio::test]
    async fn fallback_without_llm_is_novel_and_short() {
        let generator = FollowUpGenerator::new(FollowUpConfig::default());
        let existing = ["如何安装Python"];
        let questions = generator
            .generate("本文介绍安装Python的方法。", &options(&existing))
            .await;

        assert_eq!(questions.len(), 3);
        let known = token_set(existing[0]);
        for question in &questions {
            assert!(!question.is_empty());
            assert!(question.chars().count() <= MAX_QUESTION_CHARS);
            assert!(jaccard(&known, &token_set(question)) <= 0.7);
        }
        let distinct: HashSet<&String> = questions.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn llm_candidates_are_deduplicated_and_capped() {
        let model = CannedModel(
            "1. Python版本怎么选择？\n2. Python版本怎么选择？\n3. 如何安装Python\n4. 虚拟环境如何创建？\n5. 这是一个特别特别特别特别特别特别特别特别特别特别特别特别长的问题吗？".to_string(),
        );
        let generator = FollowUpGenerator::new(FollowUpConfig::default()).with_llm(Some(Arc::new(model)));
        let questions = generator
            .generate("安装Python的方法", &options(&["如何安装Python"]))
            .await;

        assert_eq!(questions[0], "Python版本怎么选择？");
        assert_eq!(questions[1], "虚拟环境如何创建？");
        assert_eq!(questions.len(), 3);
        assert!(questions.iter().all(|question| question.chars().count() <= MAX_QUESTION_CHARS));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_llm_falls_back_to_templates() {
        let generator = FollowUpGenerator::new(FollowUpConfig::default()).with_llm(Some(Arc::new(SlowModel)));
        let mut opts = options(&[]);
        opts.timeout_s = 1;

        let questions = generator.generate("安装Python的方法", &opts).await;
        assert_eq!(questions.len(), 3);
        assert!(!questions.contains(&"太慢了".to_string()));
    }
}
