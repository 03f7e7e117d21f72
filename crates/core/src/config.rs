use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::ApprovalStep;
use crate::domain::deal::RiskTier;
use crate::domain::invoice::AccountingSystem;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub guardrails: GuardrailConfig,
    pub invoicing: InvoicingConfig,
    pub idempotency: IdempotencyConfig,
    pub accounting: AccountingConfig,
    pub payments: PaymentsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Built-in guardrail limits and approval SLAs. These apply when no explicit
/// active policy covers a deal; an active policy fully replaces the
/// overlapping built-in check.
#[derive(Clone, Debug)]
pub struct GuardrailConfig {
    pub risk_ceiling_low: Decimal,
    pub risk_ceiling_medium: Decimal,
    pub risk_ceiling_high: Decimal,
    /// Relative excess over a limit (excess / limit) at which a violation
    /// additionally requires executive approval.
    pub secondary_escalation_threshold: Decimal,
    pub payment_terms_ceiling_days: u32,
    pub finance_review_sla_hours: u32,
    pub executive_approval_sla_hours: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            risk_ceiling_low: Decimal::from(30),
            risk_ceiling_medium: Decimal::from(20),
            risk_ceiling_high: Decimal::from(10),
            secondary_escalation_threshold: Decimal::new(5, 1),
            payment_terms_ceiling_days: 45,
            finance_review_sla_hours: 24,
            executive_approval_sla_hours: 48,
        }
    }
}

impl GuardrailConfig {
    pub fn risk_ceiling(&self, risk: RiskTier) -> Decimal {
        match risk {
            RiskTier::Low => self.risk_ceiling_low,
            RiskTier::Medium => self.risk_ceiling_medium,
            RiskTier::High => self.risk_ceiling_high,
        }
    }

    pub fn sla_hours_for(&self, step: ApprovalStep) -> u32 {
        match step {
            ApprovalStep::FinanceReview => self.finance_review_sla_hours,
            ApprovalStep::ExecutiveApproval => self.executive_approval_sla_hours,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InvoicingConfig {
    pub default_tax_rate: Decimal,
    pub tax_jurisdiction: String,
    pub numbering_prefix: String,
}

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    pub lease_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AccountingConfig {
    pub enabled: bool,
    pub system: AccountingSystem,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    pub provider_base_url: Option<String>,
    pub callback_secret: Option<SecretString>,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub accounting_enabled: Option<bool>,
    pub accounting_base_url: Option<String>,
    pub accounting_api_key: Option<String>,
    pub payments_provider_base_url: Option<String>,
    pub payments_callback_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://dealgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            guardrails: GuardrailConfig {
                risk_ceiling_low: Decimal::from(30),
                risk_ceiling_medium: Decimal::from(20),
                risk_ceiling_high: Decimal::from(10),
                secondary_escalation_threshold: Decimal::new(5, 1),
                payment_terms_ceiling_days: 45,
                finance_review_sla_hours: 24,
                executive_approval_sla_hours: 48,
            },
            invoicing: InvoicingConfig {
                default_tax_rate: Decimal::new(825, 2),
                tax_jurisdiction: "State".to_string(),
                numbering_prefix: "INV".to_string(),
            },
            idempotency: IdempotencyConfig { lease_ttl_secs: 3600 },
            accounting: AccountingConfig {
                enabled: false,
                system: AccountingSystem::QuickBooks,
                base_url: None,
                api_key: None,
            },
            payments: PaymentsConfig {
                provider_base_url: None,
                callback_secret: None,
                max_retries: 3,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                health_check_port: 8081,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

fn parse_accounting_system(value: &str) -> Result<AccountingSystem, ConfigError> {
    AccountingSystem::parse(value.trim().to_ascii_lowercase().as_str()).ok_or_else(|| {
        ConfigError::Validation(format!(
            "unsupported accounting system `{value}` (expected quickbooks|xero|netsuite)"
        ))
    })
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dealgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(value) = guardrails.risk_ceiling_low {
                self.guardrails.risk_ceiling_low = value;
            }
            if let Some(value) = guardrails.risk_ceiling_medium {
                self.guardrails.risk_ceiling_medium = value;
            }
            if let Some(value) = guardrails.risk_ceiling_high {
                self.guardrails.risk_ceiling_high = value;
            }
            if let Some(value) = guardrails.secondary_escalation_threshold {
                self.guardrails.secondary_escalation_threshold = value;
            }
            if let Some(value) = guardrails.payment_terms_ceiling_days {
                self.guardrails.payment_terms_ceiling_days = value;
            }
            if let Some(value) = guardrails.finance_review_sla_hours {
                self.guardrails.finance_review_sla_hours = value;
            }
            if let Some(value) = guardrails.executive_approval_sla_hours {
                self.guardrails.executive_approval_sla_hours = value;
            }
        }

        if let Some(invoicing) = patch.invoicing {
            if let Some(value) = invoicing.default_tax_rate {
                self.invoicing.default_tax_rate = value;
            }
            if let Some(value) = invoicing.tax_jurisdiction {
                self.invoicing.tax_jurisdiction = value;
            }
            if let Some(value) = invoicing.numbering_prefix {
                self.invoicing.numbering_prefix = value;
            }
        }

        if let Some(idempotency) = patch.idempotency {
            if let Some(value) = idempotency.lease_ttl_secs {
                self.idempotency.lease_ttl_secs = value;
            }
        }

        if let Some(accounting) = patch.accounting {
            if let Some(enabled) = accounting.enabled {
                self.accounting.enabled = enabled;
            }
            if let Some(system) = accounting.system {
                self.accounting.system = system;
            }
            if let Some(base_url) = accounting.base_url {
                self.accounting.base_url = Some(base_url);
            }
            if let Some(api_key_value) = accounting.api_key {
                self.accounting.api_key = Some(secret_value(api_key_value));
            }
        }

        if let Some(payments) = patch.payments {
            if let Some(provider_base_url) = payments.provider_base_url {
                self.payments.provider_base_url = Some(provider_base_url);
            }
            if let Some(callback_secret_value) = payments.callback_secret {
                self.payments.callback_secret = Some(secret_value(callback_secret_value));
            }
            if let Some(max_retries) = payments.max_retries {
                self.payments.max_retries = max_retries;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DEALGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DEALGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DEALGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DEALGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALGATE_GUARDRAILS_RISK_CEILING_LOW") {
            self.guardrails.risk_ceiling_low =
                parse_decimal("DEALGATE_GUARDRAILS_RISK_CEILING_LOW", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM") {
            self.guardrails.risk_ceiling_medium =
                parse_decimal("DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_GUARDRAILS_RISK_CEILING_HIGH") {
            self.guardrails.risk_ceiling_high =
                parse_decimal("DEALGATE_GUARDRAILS_RISK_CEILING_HIGH", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_GUARDRAILS_SECONDARY_ESCALATION_THRESHOLD") {
            self.guardrails.secondary_escalation_threshold =
                parse_decimal("DEALGATE_GUARDRAILS_SECONDARY_ESCALATION_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_GUARDRAILS_PAYMENT_TERMS_CEILING_DAYS") {
            self.guardrails.payment_terms_ceiling_days =
                parse_u32("DEALGATE_GUARDRAILS_PAYMENT_TERMS_CEILING_DAYS", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_GUARDRAILS_FINANCE_REVIEW_SLA_HOURS") {
            self.guardrails.finance_review_sla_hours =
                parse_u32("DEALGATE_GUARDRAILS_FINANCE_REVIEW_SLA_HOURS", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_GUARDRAILS_EXECUTIVE_APPROVAL_SLA_HOURS") {
            self.guardrails.executive_approval_sla_hours =
                parse_u32("DEALGATE_GUARDRAILS_EXECUTIVE_APPROVAL_SLA_HOURS", &value)?;
        }

        if let Some(value) = read_env("DEALGATE_INVOICING_DEFAULT_TAX_RATE") {
            self.invoicing.default_tax_rate =
                parse_decimal("DEALGATE_INVOICING_DEFAULT_TAX_RATE", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_INVOICING_TAX_JURISDICTION") {
            self.invoicing.tax_jurisdiction = value;
        }
        if let Some(value) = read_env("DEALGATE_INVOICING_NUMBERING_PREFIX") {
            self.invoicing.numbering_prefix = value;
        }

        if let Some(value) = read_env("DEALGATE_IDEMPOTENCY_LEASE_TTL_SECS") {
            self.idempotency.lease_ttl_secs =
                parse_u64("DEALGATE_IDEMPOTENCY_LEASE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALGATE_ACCOUNTING_ENABLED") {
            self.accounting.enabled = parse_bool("DEALGATE_ACCOUNTING_ENABLED", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_ACCOUNTING_SYSTEM") {
            self.accounting.system = parse_accounting_system(&value)?;
        }
        if let Some(value) = read_env("DEALGATE_ACCOUNTING_BASE_URL") {
            self.accounting.base_url = Some(value);
        }
        if let Some(value) = read_env("DEALGATE_ACCOUNTING_API_KEY") {
            self.accounting.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("DEALGATE_PAYMENTS_PROVIDER_BASE_URL") {
            self.payments.provider_base_url = Some(value);
        }
        if let Some(value) = read_env("DEALGATE_PAYMENTS_CALLBACK_SECRET") {
            self.payments.callback_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEALGATE_PAYMENTS_MAX_RETRIES") {
            self.payments.max_retries = parse_u32("DEALGATE_PAYMENTS_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("DEALGATE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DEALGATE_SERVER_PORT") {
            self.server.port = parse_u16("DEALGATE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("DEALGATE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("DEALGATE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DEALGATE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("DEALGATE_LOGGING_LEVEL").or_else(|| read_env("DEALGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DEALGATE_LOGGING_FORMAT").or_else(|| read_env("DEALGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(enabled) = overrides.accounting_enabled {
            self.accounting.enabled = enabled;
        }
        if let Some(base_url) = overrides.accounting_base_url {
            self.accounting.base_url = Some(base_url);
        }
        if let Some(api_key) = overrides.accounting_api_key {
            self.accounting.api_key = Some(secret_value(api_key));
        }
        if let Some(provider_base_url) = overrides.payments_provider_base_url {
            self.payments.provider_base_url = Some(provider_base_url);
        }
        if let Some(callback_secret) = overrides.payments_callback_secret {
            self.payments.callback_secret = Some(secret_value(callback_secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_guardrails(&self.guardrails)?;
        validate_invoicing(&self.invoicing)?;
        validate_idempotency(&self.idempotency)?;
        validate_accounting(&self.accounting)?;
        validate_payments(&self.payments)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dealgate.toml"), PathBuf::from("config/dealgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_guardrails(guardrails: &GuardrailConfig) -> Result<(), ConfigError> {
    let hundred = Decimal::from(100);
    for (name, value) in [
        ("guardrails.risk_ceiling_low", guardrails.risk_ceiling_low),
        ("guardrails.risk_ceiling_medium", guardrails.risk_ceiling_medium),
        ("guardrails.risk_ceiling_high", guardrails.risk_ceiling_high),
    ] {
        if value < Decimal::ZERO || value > hundred {
            return Err(ConfigError::Validation(format!(
                "{name} must be a percentage between 0 and 100"
            )));
        }
    }

    if guardrails.secondary_escalation_threshold <= Decimal::ZERO {
        return Err(ConfigError::Validation(
            "guardrails.secondary_escalation_threshold must be greater than zero".to_string(),
        ));
    }

    if guardrails.payment_terms_ceiling_days == 0 || guardrails.payment_terms_ceiling_days > 365 {
        return Err(ConfigError::Validation(
            "guardrails.payment_terms_ceiling_days must be in range 1..=365".to_string(),
        ));
    }

    if guardrails.finance_review_sla_hours == 0 || guardrails.executive_approval_sla_hours == 0 {
        return Err(ConfigError::Validation(
            "guardrails approval SLA hours must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_invoicing(invoicing: &InvoicingConfig) -> Result<(), ConfigError> {
    if invoicing.default_tax_rate < Decimal::ZERO || invoicing.default_tax_rate > Decimal::from(100)
    {
        return Err(ConfigError::Validation(
            "invoicing.default_tax_rate must be a percentage between 0 and 100".to_string(),
        ));
    }

    if invoicing.numbering_prefix.trim().is_empty() {
        return Err(ConfigError::Validation(
            "invoicing.numbering_prefix must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_idempotency(idempotency: &IdempotencyConfig) -> Result<(), ConfigError> {
    if idempotency.lease_ttl_secs == 0 || idempotency.lease_ttl_secs > 86_400 {
        return Err(ConfigError::Validation(
            "idempotency.lease_ttl_secs must be in range 1..=86400".to_string(),
        ));
    }

    Ok(())
}

fn validate_accounting(accounting: &AccountingConfig) -> Result<(), ConfigError> {
    if accounting.enabled {
        let base_url = accounting.base_url.as_deref().unwrap_or("").trim().to_string();
        if base_url.is_empty() {
            return Err(ConfigError::Validation(
                "accounting.base_url is required when accounting.enabled is true".to_string(),
            ));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "accounting.base_url must start with http:// or https://".to_string(),
            ));
        }

        let missing_key = accounting
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_key {
            return Err(ConfigError::Validation(
                "accounting.api_key is required when accounting.enabled is true".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_payments(payments: &PaymentsConfig) -> Result<(), ConfigError> {
    if let Some(base_url) = &payments.provider_base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "payments.provider_base_url must start with http:// or https://".to_string(),
            ));
        }

        let missing_secret = payments
            .callback_secret
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_secret {
            return Err(ConfigError::Validation(
                "payments.callback_secret is required when payments.provider_base_url is set"
                    .to_string(),
            ));
        }
    }

    if payments.max_retries > 10 {
        return Err(ConfigError::Validation(
            "payments.max_retries must be at most 10".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 || server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server ports must be greater than zero".to_string(),
        ));
    }

    if server.port == server.health_check_port {
        return Err(ConfigError::Validation(
            "server.port and server.health_check_port must differ".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    value.parse::<Decimal>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    guardrails: Option<GuardrailPatch>,
    invoicing: Option<InvoicingPatch>,
    idempotency: Option<IdempotencyPatch>,
    accounting: Option<AccountingPatch>,
    payments: Option<PaymentsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailPatch {
    risk_ceiling_low: Option<Decimal>,
    risk_ceiling_medium: Option<Decimal>,
    risk_ceiling_high: Option<Decimal>,
    secondary_escalation_threshold: Option<Decimal>,
    payment_terms_ceiling_days: Option<u32>,
    finance_review_sla_hours: Option<u32>,
    executive_approval_sla_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct InvoicingPatch {
    default_tax_rate: Option<Decimal>,
    tax_jurisdiction: Option<String>,
    numbering_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IdempotencyPatch {
    lease_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountingPatch {
    enabled: Option<bool>,
    system: Option<AccountingSystem>,
    base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PaymentsPatch {
    provider_base_url: Option<String>,
    callback_secret: Option<String>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use rust_decimal::Decimal;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_and_match_documented_limits() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(
            config.guardrails.risk_ceiling_low == Decimal::from(30)
                && config.guardrails.risk_ceiling_medium == Decimal::from(20)
                && config.guardrails.risk_ceiling_high == Decimal::from(10),
            "default risk ceilings should be 30/20/10",
        )?;
        ensure(
            config.guardrails.payment_terms_ceiling_days == 45,
            "default payment terms ceiling should be 45 days",
        )?;
        ensure(
            config.guardrails.secondary_escalation_threshold == Decimal::new(5, 1),
            "default escalation threshold should be 0.5",
        )?;
        ensure(
            config.idempotency.lease_ttl_secs == 3600,
            "default lease ttl should be one hour",
        )?;
        ensure(
            config.invoicing.default_tax_rate == Decimal::new(825, 2),
            "default tax rate should be 8.25",
        )?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_ACCOUNTING_API_KEY", "ak-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dealgate.toml");
            fs::write(
                &path,
                r#"
[accounting]
enabled = true
base_url = "https://ledger.example.com"
api_key = "${TEST_ACCOUNTING_API_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let api_key = config
                .accounting
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().to_string())
                .unwrap_or_default();
            ensure(api_key == "ak-from-env", "api key should be loaded from environment")
        })();

        clear_vars(&["TEST_ACCOUNTING_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALGATE_LOG_LEVEL", "warn");
        env::set_var("DEALGATE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["DEALGATE_LOG_LEVEL", "DEALGATE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALGATE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM", "18");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dealgate.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[guardrails]
risk_ceiling_medium = 15
payment_terms_ceiling_days = 60

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.guardrails.risk_ceiling_medium == Decimal::from(18),
                "env risk ceiling should win over file and defaults",
            )?;
            ensure(
                config.guardrails.payment_terms_ceiling_days == 60,
                "file payment terms ceiling should win over defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["DEALGATE_DATABASE_URL", "DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM", "150");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("guardrails.risk_ceiling_medium")
            );
            ensure(has_message, "validation failure should name the offending field")
        })();

        clear_vars(&["DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM"]);
        result
    }

    #[test]
    fn enabled_accounting_requires_credentials() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALGATE_ACCOUNTING_ENABLED", "true");
        env::set_var("DEALGATE_ACCOUNTING_BASE_URL", "https://ledger.example.com");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected missing api key failure".to_string()),
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("accounting.api_key")
            );
            ensure(has_message, "validation failure should mention accounting.api_key")
        })();

        clear_vars(&["DEALGATE_ACCOUNTING_ENABLED", "DEALGATE_ACCOUNTING_BASE_URL"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALGATE_ACCOUNTING_ENABLED", "true");
        env::set_var("DEALGATE_ACCOUNTING_BASE_URL", "https://ledger.example.com");
        env::set_var("DEALGATE_ACCOUNTING_API_KEY", "ak-secret-value");
        env::set_var("DEALGATE_PAYMENTS_PROVIDER_BASE_URL", "https://pay.example.com");
        env::set_var("DEALGATE_PAYMENTS_CALLBACK_SECRET", "whsec-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("ak-secret-value"),
                "debug output should not contain the accounting api key",
            )?;
            ensure(
                !debug.contains("whsec-secret-value"),
                "debug output should not contain the callback secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "DEALGATE_ACCOUNTING_ENABLED",
            "DEALGATE_ACCOUNTING_BASE_URL",
            "DEALGATE_ACCOUNTING_API_KEY",
            "DEALGATE_PAYMENTS_PROVIDER_BASE_URL",
            "DEALGATE_PAYMENTS_CALLBACK_SECRET",
        ]);
        result
    }
}
