//! OpenAI-compatible chat-completions provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Analysis, AnalysisError, AnalysisService, ContentType, GeneratedTutorial, TokenUsage};
use crate::config::ai::AnalysisConfig;

const SYSTEM_PROMPT: &str = "You analyze feed items for a technical reader. \
Reply with ONE JSON object and nothing else, with keys: \
\"relevance_score\" (1-10), \"content_type\" (one of \"News\", \"Research Paper Abstract\", \
\"Tutorial/Guide\", \"Opinion\", \"Market/Competitor Info\", \"Company Update\", \"Other\"), \
\"keywords\" (3-5 strings), \"summary\" (2-3 sentences), \"justification\" (one sentence).";

const TUTORIAL_SYSTEM_PROMPT: &str = "You are an AI educator writing a practical, concise \
tutorial for a time-poor technical lead who knows Python and ML but wants hands-on steps, \
not theory. Reply in Markdown only.";

fn tutorial_prompt(topic: &str) -> String {
    format!(
        "Write a step-by-step tutorial on implementing **{topic}**.\n\n\
         Start with the heading `## Skill Up Tutorial: {topic}`, then these sections:\n\
         - **Objective**: what the reader will have built.\n\
         - **Core Concepts**: 1-3 ideas specific to this task, one or two sentences each.\n\
         - **Prerequisites**: libraries with pinned versions.\n\
         - **Step-by-Step Implementation**: numbered steps, each with a minimal Python code block \
         and a one-line explanation, ending with a runnable `if __name__ == \"__main__\":` example.\n\
         - **Key Considerations**: 1-2 practical pitfalls.\n\
         - **Next Steps**: 1-2 links to official documentation.\n\n\
         It should take 10-15 minutes to read and run."
    )
}

pub struct OpenAiAnalyzer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::ingest::client::DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building analysis http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn from_config(cfg: &AnalysisConfig) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            &cfg.api_key,
            &cfg.model,
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct WireAnalysis {
    relevance_score: f64,
    content_type: ContentType,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    justification: String,
}

impl OpenAiAnalyzer {
    /// One chat completion; returns the first choice's text and the usage.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<(String, TokenUsage), AnalysisError> {
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AnalysisError::Status(resp.status().as_u16()));
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| AnalysisError::Malformed(e.to_string()))?;
        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok((content, usage))
    }
}

/// Models like to wrap JSON in ```json fences.
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let s = raw.trim();
    let s = s.strip_prefix("```").unwrap_or(s);
    let s = s.strip_suffix("```").unwrap_or(s);
    let s = s.trim_start();
    s.strip_prefix("json").unwrap_or(s).trim()
}

/// Some models wrap the whole Markdown answer in a ```markdown fence.
fn strip_markdown_fence(raw: &str) -> &str {
    let s = raw.trim();
    match s
        .strip_prefix("```markdown")
        .or_else(|| s.strip_prefix("```md"))
        .and_then(|rest| rest.strip_suffix("```"))
    {
        Some(inner) => inner,
        None => s,
    }
}

pub(crate) fn parse_analysis(content: &str) -> Result<Analysis, AnalysisError> {
    let wire: WireAnalysis = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| AnalysisError::Malformed(e.to_string()))?;
    if !wire.relevance_score.is_finite() {
        return Err(AnalysisError::Malformed("relevance_score is not a number".into()));
    }
    Ok(Analysis {
        relevance: wire.relevance_score.round().clamp(1.0, 10.0) as u8,
        content_type: wire.content_type,
        keywords: wire
            .keywords
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        summary: wire.summary.trim().to_string(),
        justification: wire.justification.trim().to_string(),
        usage: TokenUsage::default(),
    })
}

#[async_trait]
impl AnalysisService for OpenAiAnalyzer {
    async fn analyze(&self, text: &str) -> Result<Analysis, AnalysisError> {
        let (content, usage) = self.complete(SYSTEM_PROMPT, text, 0.2).await?;
        let mut analysis = parse_analysis(&content)?;
        analysis.usage = usage;
        Ok(analysis)
    }

    async fn generate_tutorial(&self, topic: &str) -> Result<GeneratedTutorial, AnalysisError> {
        let (content, usage) = self
            .complete(TUTORIAL_SYSTEM_PROMPT, &tutorial_prompt(topic), 0.7)
            .await?;
        let markdown = strip_markdown_fence(&content).trim().to_string();
        if markdown.is_empty() {
            return Err(AnalysisError::Malformed("empty tutorial".into()));
        }
        Ok(GeneratedTutorial {
            topic: topic.to_string(),
            markdown,
            usage,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
