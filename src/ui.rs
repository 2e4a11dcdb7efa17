//! Interface de terminal do promptline: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha uma execução a partir
//! dos snapshots publicados pelo orquestrador.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::OrchestratorError;
use crate::orchestrator::{OrchestratorHandle, RunSnapshot};

/// Barra de progresso de uma execução (ou rodada de retentativa).
pub struct RunProgress {
    pb: ProgressBar,
    // Resultados já existentes quando a barra foi criada (itens mantidos
    // de uma rodada anterior).
    baseline: usize,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn start(snapshot: &RunSnapshot) -> Self {
        let pb = ProgressBar::new(snapshot.total_count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            baseline: snapshot.results.len(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza posição e mensagem a partir do snapshot.
    pub fn update(&self, snapshot: &RunSnapshot) {
        let done = snapshot.results.len().saturating_sub(self.baseline);
        self.pb.set_position(done as u64);
        let mut state = if snapshot.auth_expired {
            self.yellow.apply_to("AUTH EXPIRED").to_string()
        } else {
            snapshot.lifecycle_state.to_string()
        };
        if snapshot.is_retry {
            state.push_str(" (retry)");
        }
        match &snapshot.current_job_summary {
            Some(summary) => self.pb.set_message(format!("{state} {summary}")),
            None => self.pb.set_message(state),
        }
    }

    /// Finaliza a barra e imprime o resumo com os itens que falharam.
    pub fn finish(&self, snapshot: &RunSnapshot) {
        self.pb.finish_and_clear();
        println!(
            "  {} {} succeeded, {} {} failed",
            self.green.apply_to("✓"),
            snapshot.completed_count,
            self.red.apply_to("✗"),
            snapshot.failed_count,
        );
        let mut failed: Vec<_> = snapshot.results.iter().filter(|r| !r.success).collect();
        failed.sort_by_key(|r| r.index);
        for result in failed {
            println!(
                "    {} #{:03} {}",
                self.red.apply_to("✗"),
                result.index + 1,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Mensagem de nova rodada de retentativa.
    pub fn retry_round(round: u32, max: u32, count: usize) {
        let yellow = Style::new().yellow();
        println!("  {} Retry round {round}/{max}: {count} item(s)", yellow.apply_to("↻"));
    }
}

/// Acompanha a execução até `Completed` ou `Idle`, desenhando o progresso.
pub async fn follow(handle: &OrchestratorHandle) -> Result<RunSnapshot, OrchestratorError> {
    let mut rx = handle.subscribe();
    let first = rx.borrow_and_update().clone();
    let progress = RunProgress::start(&first);
    loop {
        let snapshot = rx.borrow_and_update().clone();
        progress.update(&snapshot);
        if snapshot.lifecycle_state.is_finished() {
            progress.finish(&snapshot);
            return Ok(snapshot);
        }
        if rx.changed().await.is_err() {
            return Err(OrchestratorError::ControllerGone);
        }
    }
}
