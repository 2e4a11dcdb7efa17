//! Interface de linha de comando do promptline baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, check, classify)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::state_machine::MediaKind;

/// promptline — orquestrador de geração em massa de imagens e vídeos.
#[derive(Debug, Parser)]
#[command(name = "promptline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = crate::config::CONFIG_FILE)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Tipo de mídia aceito pela CLI, mapeado para [`MediaKind`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MediaArg {
    Image,
    Video,
}

impl From<MediaArg> for MediaKind {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Image => MediaKind::Image,
            MediaArg::Video => MediaKind::Video,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa uma fila de prompts até o fim.
    Run {
        /// Arquivo JSON ou TOML com a fila de prompts.
        #[arg(long)]
        queue: PathBuf,

        /// Número de slots simultâneos (sobrescreve a configuração).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Rodadas extras de retentativa para os itens que falharem.
        #[arg(long, default_value_t = 0)]
        retry_rounds: u32,

        /// Plataforma alvo (sobrescreve a configuração).
        #[arg(long)]
        platform: Option<String>,

        /// Tipo de mídia (sobrescreve a configuração).
        #[arg(long)]
        media: Option<MediaArg>,
    },

    /// Valida a configuração e verifica se o agente responde.
    Check,

    /// Classifica uma mensagem de erro como censura ou não.
    Classify {
        /// Mensagem de erro devolvida pelo gerador.
        message: String,

        /// Código de erro opcional do agente.
        #[arg(long)]
        code: Option<String>,
    },
}
