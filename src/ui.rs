//! Interface de terminal do lingua-relay: spinners e saída colorida.
//!
//! Usa `indicatif` para os spinners e `console` para as cores. Cada job
//! acompanhado ganha um [`JobProgress`] que reflete os eventos recebidos.

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::api::JobEvent;
use crate::metrics::EngineMetrics;
use crate::state_machine::{JobId, JobSnapshot, JobStatus};

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Estilos por status, compartilhados pelas saídas do terminal.
#[derive(Debug, Clone)]
struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn for_status(&self, status: JobStatus) -> &Style {
        match status {
            JobStatus::Completed => &self.green,
            JobStatus::Dead | JobStatus::Error => &self.red,
            JobStatus::QueuedForRetry => &self.yellow,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Cancelled => &self.dim,
        }
    }

    fn symbol(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Completed => "✓",
            JobStatus::Dead | JobStatus::Error => "✗",
            JobStatus::QueuedForRetry => "↻",
            JobStatus::Cancelled => "⊘",
            JobStatus::Pending | JobStatus::Processing => "…",
        }
    }
}

/// Linha curta descrevendo um evento, sem cores (usada também nos testes).
pub fn describe_event(event: &JobEvent) -> String {
    let mut line = format!("{} (attempt {})", event.status, event.attempt_count);
    if let Some(error) = &event.error_message {
        line.push_str(": ");
        line.push_str(error);
    }
    line
}

/// Conjunto de spinners, um por job, desenhados juntos.
pub struct ProgressBoard {
    multi: MultiProgress,
    palette: Palette,
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            palette: Palette::new(),
        }
    }

    /// Adiciona um spinner para o job com um rótulo curto (ex.: "en→es").
    pub fn track(&self, job_id: JobId, label: &str) -> JobProgress {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        pb.set_prefix(format!("{} {label}", short_id(job_id)));
        pb.set_message("pending");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        JobProgress {
            pb,
            palette: self.palette.clone(),
        }
    }

    /// Imprime acima dos spinners sem corromper o desenho.
    pub fn println(&self, line: impl AsRef<str>) {
        let _ = self.multi.println(line);
    }
}

/// Spinner de um único job.
pub struct JobProgress {
    pb: ProgressBar,
    palette: Palette,
}

impl JobProgress {
    /// Reflete um evento no spinner; retentativas também ficam registradas acima dele.
    pub fn update(&self, event: &JobEvent) {
        let style = self.palette.for_status(event.status);
        if event.status == JobStatus::QueuedForRetry {
            self.pb.println(format!(
                "  {} {} {}",
                self.palette.yellow.apply_to("↻"),
                self.pb.prefix(),
                describe_event(event)
            ));
        }
        self.pb
            .set_message(style.apply_to(describe_event(event)).to_string());
    }

    /// Encerra o spinner deixando a linha final com o status terminal.
    pub fn finish(&self, event: &JobEvent) {
        let style = self.palette.for_status(event.status);
        self.pb.finish_with_message(format!(
            "{} {}",
            style.apply_to(Palette::symbol(event.status)),
            style.apply_to(describe_event(event))
        ));
    }

    /// Encerra o spinner quando o stream acabou sem evento terminal.
    pub fn abandon(&self, reason: &str) {
        self.pb
            .abandon_with_message(self.palette.red.apply_to(reason).to_string());
    }
}

/// Spinner simples para o comando `watch`.
pub fn watch_spinner(job_id: JobId) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_prefix(short_id(job_id));
    pb.set_message("waiting for status");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Imprime o snapshot final formatado em JSON, colorido pelo status.
pub fn print_snapshot(snapshot: &JobSnapshot) {
    let palette = Palette::new();
    let style = palette.for_status(snapshot.status);
    println!(
        "{} job {} is {}",
        style.apply_to(Palette::symbol(snapshot.status)),
        snapshot.job_id,
        style.apply_to(snapshot.status)
    );
    println!(
        "{}",
        serde_json::to_string_pretty(snapshot).unwrap_or_default()
    );
}

/// Resumo da demonstração: contagem por status e métricas do motor.
pub fn print_summary(snapshots: &[JobSnapshot], metrics: &EngineMetrics) {
    let palette = Palette::new();
    println!();
    println!("{}", palette.dim.apply_to("─── Summary ───"));
    for status in [
        JobStatus::Completed,
        JobStatus::Dead,
        JobStatus::Cancelled,
    ] {
        let count = snapshots.iter().filter(|s| s.status == status).count();
        println!(
            "  {} {:<10} {count}",
            palette.for_status(status).apply_to(Palette::symbol(status)),
            status.as_str()
        );
    }
    let attempts: u32 = snapshots.iter().map(|s| s.attempt_count).sum();
    println!("  attempts   {attempts}");
    println!(
        "  cache hit  {:.0}%",
        metrics.cache_hit_ratio() * 100.0
    );
}

fn short_id(job_id: JobId) -> String {
    job_id.simple().to_string()[..8].to_string()
}
