//! Configuração do promptline carregada a partir de `promptline.toml`.
//!
//! A struct [`PromptlineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ANTHROPIC_API_KEY` e `PROMPTLINE_AGENT_URL`
//! têm precedência sobre o arquivo.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::orchestrator::OrchestratorOptions;
use crate::state_machine::{CooldownRange, MediaKind, Platform, RetryConfig, RunSettings};
use crate::watchdog::WatchdogConfig;

pub const CONFIG_FILE: &str = "promptline.toml";

/// Configuração de nível superior carregada de `promptline.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptlineConfig {
    /// Chave da API usada pelos provedores de reescrita.
    #[serde(default)]
    pub api_key: String,

    /// Endereço do agente HTTP que controla a aba do site alvo.
    #[serde(default = "default_agent_url")]
    pub agent_url: String,

    /// Configurações específicas do site, repassadas ao agente sem alteração.
    #[serde(default)]
    pub agent_settings: serde_json::Value,

    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub media: MediaKind,

    /// Número de slots de trabalho simultâneos (1 = modo sequencial).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Máximo de tentativas por item antes de registrar a falha.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_cooldown_min_ms")]
    pub cooldown_min_ms: u64,

    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,

    /// Atraso configurado entre prompts no preenchimento inicial.
    #[serde(default)]
    pub prompt_delay_ms: u64,

    /// Intervalo mínimo entre envios para não sobrecarregar o agente.
    #[serde(default = "default_min_submit_gap_ms")]
    pub min_submit_gap_ms: u64,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub watchdog: WatchdogSection,

    #[serde(default)]
    pub censorship: CensorshipSection,
}

fn default_agent_url() -> String {
    "http://127.0.0.1:8765".to_string()
}

fn default_platform() -> String {
    "flow".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_cooldown_min_ms() -> u64 {
    5000
}

fn default_cooldown_max_ms() -> u64 {
    10_000
}

fn default_min_submit_gap_ms() -> u64 {
    2000
}

/// Timeout por job no modo pipeline, por tipo de mídia e plataforma.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_image_secs")]
    pub image_secs: u64,
    #[serde(default = "default_video_secs")]
    pub video_secs: u64,
    /// Margem somada a todo timeout.
    #[serde(default = "default_safety_buffer_secs")]
    pub safety_buffer_secs: u64,
    /// Sobrescritas por chave `plataforma:mídia`, em segundos.
    #[serde(default)]
    pub overrides: HashMap<String, u64>,
}

fn default_image_secs() -> u64 {
    180
}

fn default_video_secs() -> u64 {
    600
}

fn default_safety_buffer_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            image_secs: default_image_secs(),
            video_secs: default_video_secs(),
            safety_buffer_secs: default_safety_buffer_secs(),
            overrides: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn job_timeout(&self, platform: &Platform, media: MediaKind) -> Duration {
        let base = self
            .overrides
            .get(&platform.target_key(media))
            .copied()
            .unwrap_or(match media {
                MediaKind::Image => self.image_secs,
                MediaKind::Video => self.video_secs,
            });
        Duration::from_secs(base + self.safety_buffer_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
    #[serde(default = "default_extended_deadline_secs")]
    pub extended_deadline_secs: u64,
    #[serde(default = "default_extended_targets")]
    pub extended_targets: Vec<String>,
}

fn default_tick_secs() -> u64 {
    24
}

fn default_deadline_secs() -> u64 {
    300
}

fn default_extended_deadline_secs() -> u64 {
    600
}

fn default_extended_targets() -> Vec<String> {
    vec!["grok:video".to_string()]
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            default_deadline_secs: default_deadline_secs(),
            extended_deadline_secs: default_extended_deadline_secs(),
            extended_targets: default_extended_targets(),
        }
    }
}

/// Provedor de reescrita; o primeiro da lista é o primário.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CensorshipSection {
    /// Frases extras, verificadas antes das listas embutidas.
    #[serde(default)]
    pub phrases: Vec<String>,
    #[serde(default = "default_max_rewrites")]
    pub max_rewrites: u32,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

fn default_max_rewrites() -> u32 {
    2
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            model: "claude-haiku-4-5".to_string(),
            base_url: None,
        },
        ProviderConfig {
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
        },
    ]
}

impl Default for CensorshipSection {
    fn default() -> Self {
        Self {
            phrases: Vec::new(),
            max_rewrites: default_max_rewrites(),
            providers: default_providers(),
        }
    }
}

impl Default for PromptlineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            agent_url: default_agent_url(),
            agent_settings: serde_json::Value::Null,
            platform: default_platform(),
            media: MediaKind::default(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            cooldown_min_ms: default_cooldown_min_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
            prompt_delay_ms: 0,
            min_submit_gap_ms: default_min_submit_gap_ms(),
            timeouts: TimeoutConfig::default(),
            watchdog: WatchdogSection::default(),
            censorship: CensorshipSection::default(),
        }
    }
}

impl PromptlineConfig {
    /// Carrega `promptline.toml` do diretório atual, ou os defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração do caminho dado. Usa valores padrão se o
    /// arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<PromptlineConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("PROMPTLINE_AGENT_URL") {
            if !url.is_empty() {
                config.agent_url = url;
            }
        }

        Ok(config)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            concurrency: self.concurrency,
            media_kind: self.media,
            platform: Platform::new(&self.platform),
            cooldown: CooldownRange::new(
                Duration::from_millis(self.cooldown_min_ms),
                Duration::from_millis(self.cooldown_max_ms),
            ),
            retry: RetryConfig {
                max_retries: self.max_retries,
                base_delay_ms: self.base_delay_ms,
            },
        }
    }

    /// Espaçamento entre envios no preenchimento inicial dos slots.
    pub fn submit_stagger(&self) -> Duration {
        Duration::from_millis(self.min_submit_gap_ms.max(self.prompt_delay_ms))
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            submit_stagger: self.submit_stagger(),
            timeouts: self.timeouts.clone(),
            watchdog: self.watchdog_config(),
            agent_settings: self.agent_settings.clone(),
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            tick: Duration::from_secs(self.watchdog.tick_secs),
            default_deadline: Duration::from_secs(self.watchdog.default_deadline_secs),
            extended_deadline: Duration::from_secs(self.watchdog.extended_deadline_secs),
            extended_targets: self.watchdog.extended_targets.clone(),
        }
    }
}
