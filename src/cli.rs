//! Interface de linha de comando do lingua-relay baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, watch)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// lingua-relay: ciclo de vida de jobs de tradução com notificações e retentativas.
#[derive(Debug, Parser)]
#[command(name = "lingua-relay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração TOML (padrão: ./lingua-relay.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa jobs simulados no motor embutido e acompanha os eventos de cada um.
    Demo {
        /// Quantidade de jobs a submeter.
        #[arg(long, default_value_t = 5)]
        jobs: usize,

        /// Sobrescreve `worker.error_rate` (0.0 a 1.0).
        #[arg(long)]
        error_rate: Option<f64>,

        /// Cancela um job logo após a submissão para exercitar o cancelamento.
        #[arg(long, default_value_t = false)]
        cancel_one: bool,

        /// Imprime as métricas no formato de exposição do Prometheus ao final.
        #[arg(long, default_value_t = false)]
        metrics: bool,
    },

    /// Consulta um serviço remoto até o job terminar, com intervalo progressivo.
    Watch {
        /// Identificador do job.
        job_id: Uuid,

        /// URL base do serviço (ex.: http://localhost:8000).
        #[arg(long)]
        url: String,
    },
}
