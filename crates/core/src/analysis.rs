//! Language-aware text helpers shared by ingestion and retrieval.
//!
//! Tokenization goes through jieba so Chinese text splits into words
//! instead of single characters; latin runs come out as whole words.

use jieba_rs::Jieba;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

pub const OTHER_CATEGORY: &str = "其他文档";
pub const SUMMARY_MAX_CHARS: usize = 100;
pub const MAX_KEYWORDS: usize = 5;

const CATEGORY_SAMPLE_CHARS: usize = 500;

/// Ordered category table; earlier entries win ties.
const CATEGORY_TABLE: &[(&str, &[&str])] = &[
    (
        "技术文档",
        &[
            "api", "sdk", "代码", "技术", "开发", "架构", "部署", "配置", "安装", "编程", "python",
            "rust", "java", "接口", "数据库", "服务器",
        ],
    ),
    (
        "产品文档",
        &["产品", "需求", "功能", "用户手册", "说明书", "版本", "prd", "原型"],
    ),
    (
        "财务报告",
        &[
            "财务", "预算", "报表", "收入", "成本", "利润", "invoice", "发票", "审计", "budget",
        ],
    ),
    (
        "法律合同",
        &[
            "合同", "协议", "条款", "法律", "甲方", "乙方", "contract", "agreement", "license",
        ],
    ),
    (
        "学术论文",
        &[
            "论文", "摘要", "研究", "实验", "参考文献", "abstract", "paper", "doi", "arxiv",
        ],
    ),
    (
        "会议纪要",
        &["会议", "纪要", "议程", "讨论", "meeting", "minutes", "agenda"],
    ),
    (
        "培训资料",
        &["培训", "教程", "课程", "学习", "指南", "tutorial", "guide", "course"],
    ),
    (
        "人事行政",
        &["人事", "招聘", "员工", "考勤", "薪酬", "请假", "hr", "onboarding"],
    ),
];

const STOP_WORDS: &[&str] = &[
    "的", "了", "和", "是", "在", "我", "有", "就", "不", "人", "都", "一", "一个", "上", "也",
    "很", "到", "说", "要", "去", "你", "会", "着", "没有", "看", "好", "自己", "这", "那", "与",
    "及", "或", "等", "为", "对", "把", "被", "从", "而", "并", "其", "之", "以", "于", "中",
    "如何", "什么", "怎么", "哪些", "可以", "进行", "通过", "使用", "这个", "那个", "我们",
    "他们", "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "is", "are", "was",
    "were", "be", "by", "with", "as", "at", "it", "this", "that", "from", "how", "what", "which",
    "who", "why", "can", "do", "does", "not", "no", "yes", "you", "we", "they", "i",
];

fn jieba() -> &'static Jieba {
    static INSTANCE: OnceLock<Jieba> = OnceLock::new();
    INSTANCE.get_or_init(Jieba::new)
}

pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}'
    )
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Lowercased word tokens with whitespace and punctuation removed.
pub fn tokenize(text: &str) -> Vec<String> {
    jieba()
        .cut(text, false)
        .into_iter()
        .map(|token| token.trim().to_lowercase())
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .collect()
}

pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

pub fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.union(right).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// `zh` above 70% Chinese characters, `zh-en` from 30%, `en` below, `unknown` without letters.
pub fn detect_language(text: &str) -> &'static str {
    let mut chinese = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            chinese += 1;
        } else if c.is_ascii_alphabetic() {
            latin += 1;
        }
    }

    let total = chinese + latin;
    if total == 0 {
        return "unknown";
    }

    let ratio = chinese as f64 / total as f64;
    if ratio > 0.7 {
        "zh"
    } else if ratio >= 0.3 {
        "zh-en"
    } else {
        "en"
    }
}

/// Scores each category by keyword hits in the file name and opening text.
///
/// Latin keywords must match a whole word; CJK keywords match anywhere.
pub fn categorize(file_name: &str, text: &str) -> &'static str {
    let sample: String = text.chars().take(CATEGORY_SAMPLE_CHARS).collect();
    let haystack = format!("{} {}", file_name, sample).to_lowercase();
    let words: HashSet<&str> = haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let mentions = |keyword: &str| {
        if keyword.is_ascii() {
            words.contains(keyword)
        } else {
            haystack.contains(keyword)
        }
    };

    let mut best: Option<(&'static str, usize)> = None;
    for (category, keywords) in CATEGORY_TABLE {
        let hits = keywords.iter().filter(|keyword| mentions(keyword)).count();
        if hits == 0 {
            continue;
        }
        match best {
            Some((_, best_hits)) if best_hits >= hits => {}
            _ => best = Some((category, hits)),
        }
    }

    best.map(|(category, _)| category).unwrap_or(OTHER_CATEGORY)
}

/// Top-`limit` keywords by frequency; ties keep first-occurrence order.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, token) in tokenize(text).into_iter().enumerate() {
        if token.chars().count() < 2
            || is_stop_word(&token)
            || token.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        let entry = counts.entry(token).or_insert((0, position));
        entry.0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(token, (count, first))| (token, count, first))
        .collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.2.cmp(&right.2)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(token, _, _)| token)
        .collect()
}

/// First sentence of the text, capped at [`SUMMARY_MAX_CHARS`].
pub fn extractive_summary(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut sentence = String::new();
    for c in normalized.chars() {
        sentence.push(c);
        if is_sentence_end(c) {
            break;
        }
    }
    truncate_chars(sentence.trim(), SUMMARY_MAX_CHARS)
}

pub fn is_sentence_end(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '.' | '!' | '?')
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_ratio_thresholds() {
        assert_eq!(detect_language("这是一个中文文档"), "zh");
        assert_eq!(detect_language("Rust 编程语言入门"), "zh-en");
        assert_eq!(detect_language("plain english words"), "en");
        assert_eq!(detect_language("12345 !!!"), "unknown");
    }

    #[test]
    fn category_prefers_table_order_on_ties() {
        assert_eq!(categorize("install_guide.md", "安装 python"), "技术文档");
        assert_eq!(categorize("合同.docx", "甲方 乙方 条款"), "法律合同");
        assert_eq!(categorize("notes.txt", "nothing relevant"), OTHER_CATEGORY);
    }

    #[test]
    fn latin_keywords_match_whole_words_only() {
        assert_eq!(
            categorize("three_rapid_steps.txt", "The chrome therapy shows capital growth."),
            OTHER_CATEGORY
        );
        assert_eq!(categorize("hr-onboarding.txt", "first week checklist"), "人事行政");
        assert_eq!(categorize("notes.txt", "see the API reference"), "技术文档");
    }

    #[test]
    fn keywords_skip_stop_words_and_rank_by_frequency() {
        let keywords = extract_keywords("安装Python的方法，安装步骤和Python版本", 5);
        assert_eq!(keywords[0], "安装");
        assert!(keywords.contains(&"python".to_string()));
        assert!(!keywords.contains(&"的".to_string()));
        assert!(keywords.len() <= 5);
    }

    #[test]
    fn tokenize_drops_punctuation_and_lowercases() {
        let tokens = tokenize("The quick, brown FOX!");
        assert_eq!(tokens, vec!["the", "quick", "brown", "fox"]);
    }

    #[test]
    fn jaccard_of_identical_sets_is_one() {
        let left = token_set("如何安装Python");
        let right = token_set("如何安装Python");
        assert!((jaccard(&left, &right) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_is_first_sentence_and_bounded() {
        assert_eq!(extractive_summary("Hello, world. Second line."), "Hello, world.");
        let long = "字".repeat(300);
        assert_eq!(extractive_summary(&long).chars().count(), SUMMARY_MAX_CHARS);
    }
}
