use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::commands::CommandResult;
use dealgate_core::config::{AppConfig, LoadOptions};
use dealgate_core::domain::policy::Policy;
use dealgate_core::guardrails::PolicySnapshot;
use dealgate_core::simulation::{SimulationDeal, SimulationEngine};
use dealgate_db::repositories::{PolicyRepository, SqlPolicyRepository};
use dealgate_db::{connect_with_settings, migrations};

pub fn run(policy_path: &Path, deals_path: &Path, pretty: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "simulate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let proposed: Policy = match read_json_file(policy_path, "proposed policy") {
        Ok(policy) => policy,
        Err(message) => {
            return CommandResult::failure("simulate", "input_validation", message, 2);
        }
    };
    let configuration_problems = proposed.configuration.validate();
    if !configuration_problems.is_empty() {
        return CommandResult::failure(
            "simulate",
            "input_validation",
            format!(
                "proposed policy configuration is invalid: {}",
                configuration_problems.join("; ")
            ),
            2,
        );
    }

    let deals: Vec<SimulationDeal> = match read_json_file(deals_path, "simulation deals") {
        Ok(deals) => deals,
        Err(message) => {
            return CommandResult::failure("simulate", "input_validation", message, 2);
        }
    };
    if deals.is_empty() {
        return CommandResult::failure(
            "simulate",
            "input_validation",
            format!("deals file `{}` contains no deals to evaluate", deals_path.display()),
            2,
        );
    }
    for (index, deal) in deals.iter().enumerate() {
        if let Err(error) = deal.terms.validate() {
            let label = deal.id.clone().unwrap_or_else(|| format!("#{index}"));
            return CommandResult::failure(
                "simulate",
                "input_validation",
                format!("deal {label} has invalid terms: {error}"),
                2,
            );
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "simulate",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let active = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let repository = SqlPolicyRepository::new(pool.clone());
        let active = repository
            .active_policies()
            .await
            .map_err(|error| ("policy_load", error.to_string(), 4u8))?;

        pool.close().await;
        Ok::<Vec<Policy>, (&'static str, String, u8)>(active)
    });

    let active = match active {
        Ok(active) => active,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("simulate", error_class, message, exit_code);
        }
    };

    let now = Utc::now();
    let snapshot = PolicySnapshot::new(active, now);
    let engine = SimulationEngine::new(config.guardrails.clone());
    let report = engine.simulate(&proposed, &deals, &snapshot, now);

    let serialized = if pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    };
    match serialized {
        Ok(output) => CommandResult { exit_code: 0, output },
        Err(error) => CommandResult::failure("simulate", "serialization", error.to_string(), 1),
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("could not read {what} file `{}`: {error}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("could not parse {what} file `{}`: {error}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use dealgate_core::simulation::SimulationDeal;

    use super::read_json_file;

    #[test]
    fn read_json_file_reports_missing_file_with_context() {
        let path = Path::new("/nonexistent/simulation-deals.json");
        let result: Result<Vec<SimulationDeal>, String> =
            read_json_file(path, "simulation deals");

        let message = result.expect_err("missing file should fail");
        assert!(message.contains("could not read simulation deals file"));
        assert!(message.contains("/nonexistent/simulation-deals.json"));
    }

    #[test]
    fn read_json_file_parses_a_deal_list() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("deals.json");
        std::fs::write(
            &path,
            r#"[{"id":"deal-1","amount":"1000","currency":"USD","discount_percent":"5","payment_terms_days":30,"risk":"low","segment":null}]"#,
        )
        .expect("write deals file");

        let deals: Vec<SimulationDeal> =
            read_json_file(&path, "simulation deals").expect("deal list should parse");
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].id.as_deref(), Some("deal-1"));
        assert_eq!(deals[0].terms.payment_terms_days, 30);
    }

    #[test]
    fn read_json_file_reports_parse_failures_with_context() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("policy.json");
        std::fs::write(&path, "{not json").expect("write policy file");

        let result: Result<Vec<SimulationDeal>, String> =
            read_json_file(&path, "proposed policy");
        let message = result.expect_err("malformed JSON should fail");
        assert!(message.contains("could not parse proposed policy file"));
    }
}
