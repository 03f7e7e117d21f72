use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dealgate_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", "DEALGATE_DATABASE_URL"),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", "DEALGATE_DATABASE_MAX_CONNECTIONS"),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", "DEALGATE_DATABASE_TIMEOUT_SECS"),
    ));

    lines.push(render_line(
        "guardrails.risk_ceiling_low",
        &config.guardrails.risk_ceiling_low.to_string(),
        source("guardrails.risk_ceiling_low", "DEALGATE_GUARDRAILS_RISK_CEILING_LOW"),
    ));
    lines.push(render_line(
        "guardrails.risk_ceiling_medium",
        &config.guardrails.risk_ceiling_medium.to_string(),
        source("guardrails.risk_ceiling_medium", "DEALGATE_GUARDRAILS_RISK_CEILING_MEDIUM"),
    ));
    lines.push(render_line(
        "guardrails.risk_ceiling_high",
        &config.guardrails.risk_ceiling_high.to_string(),
        source("guardrails.risk_ceiling_high", "DEALGATE_GUARDRAILS_RISK_CEILING_HIGH"),
    ));
    lines.push(render_line(
        "guardrails.secondary_escalation_threshold",
        &config.guardrails.secondary_escalation_threshold.to_string(),
        source(
            "guardrails.secondary_escalation_threshold",
            "DEALGATE_GUARDRAILS_SECONDARY_ESCALATION_THRESHOLD",
        ),
    ));
    lines.push(render_line(
        "guardrails.payment_terms_ceiling_days",
        &config.guardrails.payment_terms_ceiling_days.to_string(),
        source(
            "guardrails.payment_terms_ceiling_days",
            "DEALGATE_GUARDRAILS_PAYMENT_TERMS_CEILING_DAYS",
        ),
    ));
    lines.push(render_line(
        "guardrails.finance_review_sla_hours",
        &config.guardrails.finance_review_sla_hours.to_string(),
        source(
            "guardrails.finance_review_sla_hours",
            "DEALGATE_GUARDRAILS_FINANCE_REVIEW_SLA_HOURS",
        ),
    ));
    lines.push(render_line(
        "guardrails.executive_approval_sla_hours",
        &config.guardrails.executive_approval_sla_hours.to_string(),
        source(
            "guardrails.executive_approval_sla_hours",
            "DEALGATE_GUARDRAILS_EXECUTIVE_APPROVAL_SLA_HOURS",
        ),
    ));

    lines.push(render_line(
        "invoicing.default_tax_rate",
        &config.invoicing.default_tax_rate.to_string(),
        source("invoicing.default_tax_rate", "DEALGATE_INVOICING_DEFAULT_TAX_RATE"),
    ));
    lines.push(render_line(
        "invoicing.tax_jurisdiction",
        &config.invoicing.tax_jurisdiction,
        source("invoicing.tax_jurisdiction", "DEALGATE_INVOICING_TAX_JURISDICTION"),
    ));
    lines.push(render_line(
        "invoicing.numbering_prefix",
        &config.invoicing.numbering_prefix,
        source("invoicing.numbering_prefix", "DEALGATE_INVOICING_NUMBERING_PREFIX"),
    ));

    lines.push(render_line(
        "idempotency.lease_ttl_secs",
        &config.idempotency.lease_ttl_secs.to_string(),
        source("idempotency.lease_ttl_secs", "DEALGATE_IDEMPOTENCY_LEASE_TTL_SECS"),
    ));

    lines.push(render_line(
        "accounting.enabled",
        &config.accounting.enabled.to_string(),
        source("accounting.enabled", "DEALGATE_ACCOUNTING_ENABLED"),
    ));
    lines.push(render_line(
        "accounting.system",
        config.accounting.system.as_str(),
        source("accounting.system", "DEALGATE_ACCOUNTING_SYSTEM"),
    ));
    lines.push(render_line(
        "accounting.base_url",
        config.accounting.base_url.as_deref().unwrap_or("<unset>"),
        source("accounting.base_url", "DEALGATE_ACCOUNTING_BASE_URL"),
    ));
    let accounting_api_key = match config.accounting.api_key.as_ref() {
        Some(value) => redact_secret(value.expose_secret()),
        None => "<unset>".to_string(),
    };
    lines.push(render_line(
        "accounting.api_key",
        &accounting_api_key,
        source("accounting.api_key", "DEALGATE_ACCOUNTING_API_KEY"),
    ));

    lines.push(render_line(
        "payments.provider_base_url",
        config.payments.provider_base_url.as_deref().unwrap_or("<unset>"),
        source("payments.provider_base_url", "DEALGATE_PAYMENTS_PROVIDER_BASE_URL"),
    ));
    let callback_secret = match config.payments.callback_secret.as_ref() {
        Some(value) => redact_secret(value.expose_secret()),
        None => "<unset>".to_string(),
    };
    lines.push(render_line(
        "payments.callback_secret",
        &callback_secret,
        source("payments.callback_secret", "DEALGATE_PAYMENTS_CALLBACK_SECRET"),
    ));
    lines.push(render_line(
        "payments.max_retries",
        &config.payments.max_retries.to_string(),
        source("payments.max_retries", "DEALGATE_PAYMENTS_MAX_RETRIES"),
    ));

    lines.push(render_line(
        "server.bind_address",
        &config.server.bind_address,
        source("server.bind_address", "DEALGATE_SERVER_BIND_ADDRESS"),
    ));
    lines.push(render_line(
        "server.port",
        &config.server.port.to_string(),
        source("server.port", "DEALGATE_SERVER_PORT"),
    ));
    lines.push(render_line(
        "server.health_check_port",
        &config.server.health_check_port.to_string(),
        source("server.health_check_port", "DEALGATE_SERVER_HEALTH_CHECK_PORT"),
    ));
    lines.push(render_line(
        "server.graceful_shutdown_secs",
        &config.server.graceful_shutdown_secs.to_string(),
        source("server.graceful_shutdown_secs", "DEALGATE_SERVER_GRACEFUL_SHUTDOWN_SECS"),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", "DEALGATE_LOGGING_LEVEL"),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", "DEALGATE_LOGGING_FORMAT"),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("dealgate.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/dealgate.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
