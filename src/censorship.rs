//! Content-policy failure detection and prompt rewrite recovery.
//!
//! A failed job's error text is matched against an ordered list of
//! locale-tagged phrase lists. When it reads as a censorship rejection and
//! the job may still be rewritten, the prompt is sent to a chain of rewrite
//! providers (primary first, then the fallback) and the job is re-queued with
//! the revised text.

use std::sync::Arc;

use async_trait::async_trait;

use crate::anthropic::{MessageSender, MessagesRequest};
use crate::error::RewriteError;
use crate::state_machine::Job;

/// Phrases one locale's content filters use in their rejection messages.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    pub locale: String,
    phrases: Vec<String>,
}

impl PhraseMatcher {
    pub fn new(locale: impl Into<String>, phrases: &[&str]) -> Self {
        Self {
            locale: locale.into(),
            phrases: phrases.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    fn find(&self, haystack: &str) -> Option<&str> {
        self.phrases
            .iter()
            .find(|p| haystack.contains(p.as_str()))
            .map(|p| p.as_str())
    }
}

/// Decides whether an agent error is a content-policy rejection.
pub trait CensorshipClassifier: Send + Sync {
    /// Returns the matched indicator, if any.
    fn classify(&self, message: &str, error_code: Option<&str>) -> Option<String>;
}

/// Ordered phrase matchers plus a list of agent error codes that always
/// mean censorship.
#[derive(Debug, Clone)]
pub struct PhraseClassifier {
    matchers: Vec<PhraseMatcher>,
    codes: Vec<String>,
}

impl PhraseClassifier {
    pub fn new(matchers: Vec<PhraseMatcher>, codes: Vec<String>) -> Self {
        Self {
            matchers,
            codes: codes.into_iter().map(|c| c.to_uppercase()).collect(),
        }
    }

    /// Classifier with one extra matcher holding user-configured phrases in
    /// front of the built-in lists.
    pub fn with_extra_phrases(phrases: &[String]) -> Self {
        let mut classifier = Self::default();
        if !phrases.is_empty() {
            let extra: Vec<&str> = phrases.iter().map(String::as_str).collect();
            classifier
                .matchers
                .insert(0, PhraseMatcher::new("custom", &extra));
        }
        classifier
    }

    pub fn locales(&self) -> Vec<&str> {
        self.matchers.iter().map(|m| m.locale.as_str()).collect()
    }
}

impl Default for PhraseClassifier {
    fn default() -> Self {
        Self::new(
            vec![
                PhraseMatcher::new(
                    "en",
                    &[
                        "content policy",
                        "violates our",
                        "policy violation",
                        "safety system",
                        "not allowed",
                        "inappropriate",
                        "unsafe content",
                        "moderation",
                        "flagged",
                        "prohibited",
                        "can't generate",
                        "cannot generate",
                        "unable to generate this",
                    ],
                ),
                PhraseMatcher::new(
                    "pt",
                    &[
                        "política de conteúdo",
                        "viola nossas",
                        "conteúdo impróprio",
                        "não é permitido",
                        "não podemos gerar",
                    ],
                ),
                PhraseMatcher::new(
                    "es",
                    &[
                        "política de contenido",
                        "contenido inapropiado",
                        "no está permitido",
                        "infringe",
                    ],
                ),
                PhraseMatcher::new(
                    "fr",
                    &["politique de contenu", "contenu inapproprié", "n'est pas autorisé"],
                ),
                PhraseMatcher::new("de", &["inhaltsrichtlinie", "nicht erlaubt", "unangemessen"]),
                PhraseMatcher::new("ja", &["コンテンツポリシー", "不適切"]),
                PhraseMatcher::new("zh", &["内容政策", "违反", "不当内容"]),
            ],
            vec![
                "CONTENT_POLICY".into(),
                "POLICY".into(),
                "CENSORED".into(),
                "MODERATION".into(),
            ],
        )
    }
}

impl CensorshipClassifier for PhraseClassifier {
    fn classify(&self, message: &str, error_code: Option<&str>) -> Option<String> {
        if let Some(code) = error_code {
            if self.codes.iter().any(|c| c == &code.to_uppercase()) {
                return Some(code.to_string());
            }
        }
        let lower = message.to_lowercase();
        self.matchers
            .iter()
            .find_map(|m| m.find(&lower))
            .map(str::to_string)
    }
}

/// External service that rephrases a prompt so it passes content filters.
#[async_trait]
pub trait RewriteService: Send + Sync {
    fn name(&self) -> &str;

    async fn rewrite(&self, prompt: &str) -> Result<String, RewriteError>;
}

const REWRITE_INSTRUCTIONS: &str = "You rewrite prompts for image and video generators. \
The user's prompt was rejected by the generator's content filter. Rewrite it so it keeps \
the same subject, composition and style but avoids anything a content filter could flag. \
Respond with ONLY the rewritten prompt, no quotes, no commentary.";

/// Rewrite provider backed by an LLM Messages endpoint.
pub struct LlmRewriter<C: MessageSender> {
    name: String,
    model: String,
    client: C,
}

impl<C: MessageSender> LlmRewriter<C> {
    pub fn new(client: C, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            name: model.clone(),
            model,
            client,
        }
    }
}

#[async_trait]
impl<C: MessageSender> RewriteService for LlmRewriter<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn rewrite(&self, prompt: &str) -> Result<String, RewriteError> {
        let req = MessagesRequest::single(
            &self.model,
            1024,
            Some(REWRITE_INSTRUCTIONS.to_string()),
            format!("Prompt: {prompt}"),
        );
        let response = self
            .client
            .send_message(&req)
            .await
            .map_err(|e| {
                tracing::debug!(provider = %self.name, transient = e.is_transient(), error = %e, "Rewrite request failed");
                RewriteError::Provider {
                    provider: self.name.clone(),
                    message: e.to_string(),
                }
            })?;

        let text = response
            .text()
            .trim_matches(|c: char| c == '"' || c == '\'')
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(RewriteError::EmptyRewrite(self.name.clone()));
        }
        Ok(text)
    }
}

/// Tries each provider in order; the first usable rewrite wins.
pub struct FallbackRewriter {
    providers: Vec<Arc<dyn RewriteService>>,
}

impl FallbackRewriter {
    pub fn new(providers: Vec<Arc<dyn RewriteService>>) -> Self {
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl RewriteService for FallbackRewriter {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn rewrite(&self, prompt: &str) -> Result<String, RewriteError> {
        if self.providers.is_empty() {
            return Err(RewriteError::NotConfigured);
        }
        for provider in &self.providers {
            match provider.rewrite(prompt).await {
                Ok(revised) => {
                    tracing::info!(provider = provider.name(), "Prompt rewritten");
                    return Ok(revised);
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Rewrite provider failed");
                }
            }
        }
        Err(RewriteError::AllProvidersFailed)
    }
}

/// What to do with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Ordinary failure; the plain retry path applies.
    NotCensorship,
    /// Censorship, but the job may not be rewritten (any more).
    Ineligible { indicator: String, reason: &'static str },
    /// Rewrite starting from `source`.
    Rewrite { indicator: String, source: String },
}

pub struct CensorshipRecoveryPolicy {
    classifier: Box<dyn CensorshipClassifier>,
    rewriter: Option<Arc<dyn RewriteService>>,
    max_rewrites: u32,
}

impl CensorshipRecoveryPolicy {
    pub fn new(
        classifier: Box<dyn CensorshipClassifier>,
        rewriter: Option<Arc<dyn RewriteService>>,
        max_rewrites: u32,
    ) -> Self {
        Self {
            classifier,
            rewriter,
            max_rewrites,
        }
    }

    /// Policy that classifies but never rewrites.
    pub fn disabled() -> Self {
        Self::new(Box::new(PhraseClassifier::default()), None, 0)
    }

    pub fn rewriter(&self) -> Option<Arc<dyn RewriteService>> {
        self.rewriter.clone()
    }

    pub fn assess(&self, job: &Job, message: &str, error_code: Option<&str>) -> Verdict {
        let Some(indicator) = self.classifier.classify(message, error_code) else {
            return Verdict::NotCensorship;
        };
        let reason = if job.is_special_category {
            Some("excluded category")
        } else if job.rewrite_count >= self.max_rewrites {
            Some("rewrite attempts exhausted")
        } else if self.rewriter.is_none() {
            Some("no rewrite service configured")
        } else {
            None
        };
        match reason {
            Some(reason) => Verdict::Ineligible { indicator, reason },
            None => Verdict::Rewrite {
                indicator,
                source: job.rewrite_source().to_string(),
            },
        }
    }
}
