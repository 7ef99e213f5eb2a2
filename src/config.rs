//! Configuração do lingua-relay carregada a partir de `lingua-relay.toml`.
//!
//! A struct [`RelayConfig`] agrupa as seções `[dlq]`, `[cache]`, `[subscribers]`,
//! `[polling]`, `[worker]` e `[logging]`. Campos ausentes usam defaults sensíveis.
//! A variável de ambiente `LINGUA_RELAY_LOG` tem precedência sobre `logging.level`.

use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::dlq::RetryPolicy;
use crate::poller::PollConfig;

/// Nome do arquivo procurado no diretório atual quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "lingua-relay.toml";

/// Variável de ambiente que sobrescreve o filtro de log.
pub const LOG_ENV_VAR: &str = "LINGUA_RELAY_LOG";

/// Configuração de nível superior.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dlq: DlqConfig,
    pub cache: CacheConfig,
    pub subscribers: SubscriberConfig,
    pub polling: PollingConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

/// Política da fila de mensagens mortas (DLQ).
#[derive(Debug, Clone, Deserialize)]
pub struct DlqConfig {
    /// Máximo de tentativas de processamento antes de marcar o job como `dead`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso exponencial, em milissegundos.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Intervalo entre varreduras do agendador de reentrega.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

/// Cache de status.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Tempo de vida de uma entrada, em segundos.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

/// Registro de assinantes.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    /// Capacidade do buffer de cada canal; ao estourar, o evento mais antigo é descartado.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Cliente de polling.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Dobra o intervalo enquanto o status não muda.
    #[serde(default = "default_progressive_delay")]
    pub progressive_delay: bool,
}

/// Tradutor simulado usado pela demonstração.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_min_processing_ms")]
    pub min_processing_ms: u64,

    #[serde(default = "default_max_processing_ms")]
    pub max_processing_ms: u64,

    /// Probabilidade de falha de cada tentativa (0.0 a 1.0).
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
}

/// Saída de logs via `tracing`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filtro no formato do `EnvFilter` (ex.: "info", "lingua_relay=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emite logs em JSON em vez do formato legível.
    #[serde(default)]
    pub json: bool,
}

// Valor padrão de tentativas: 3.
fn default_max_attempts() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_scan_interval_ms() -> u64 {
    250
}

// Uma hora.
fn default_ttl_secs() -> u64 {
    3600
}

fn default_buffer_size() -> usize {
    16
}

fn default_base_timeout_ms() -> u64 {
    30_000
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    3000
}

fn default_progressive_delay() -> bool {
    true
}

fn default_min_processing_ms() -> u64 {
    1000
}

fn default_max_processing_ms() -> u64 {
    3000
}

fn default_error_rate() -> f64 {
    0.2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: default_base_timeout_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            progressive_delay: default_progressive_delay(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_processing_ms: default_min_processing_ms(),
            max_processing_ms: default_max_processing_ms(),
            error_rate: default_error_rate(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DlqConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl PollingConfig {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            base_timeout: Duration::from_millis(self.base_timeout_ms),
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            progressive_delay: self.progressive_delay,
        }
    }
}

impl RelayConfig {
    /// Carrega a configuração de `lingua-relay.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito; arquivo ausente usa defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<RelayConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o filtro de log.
        if let Ok(level) = std::env::var(LOG_ENV_VAR) {
            if !level.is_empty() {
                config.logging.level = level;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que tornariam o motor inconsistente.
    pub fn validate(&self) -> Result<()> {
        if self.dlq.max_attempts == 0 {
            bail!("dlq.max_attempts must be at least 1");
        }
        if self.dlq.base_delay_ms == 0 {
            bail!("dlq.base_delay_ms must be at least 1");
        }
        if self.dlq.scan_interval_ms == 0 {
            bail!("dlq.scan_interval_ms must be at least 1");
        }
        if self.polling.min_delay_ms == 0 {
            bail!("polling.min_delay_ms must be at least 1");
        }
        if self.polling.min_delay_ms > self.polling.max_delay_ms {
            bail!(
                "polling.min_delay_ms ({}) exceeds polling.max_delay_ms ({})",
                self.polling.min_delay_ms,
                self.polling.max_delay_ms
            );
        }
        if self.worker.min_processing_ms > self.worker.max_processing_ms {
            bail!("worker.min_processing_ms exceeds worker.max_processing_ms");
        }
        if !(0.0..=1.0).contains(&self.worker.error_rate) {
            bail!(
                "worker.error_rate must be within [0, 1], got {}",
                self.worker.error_rate
            );
        }
        Ok(())
    }
}
