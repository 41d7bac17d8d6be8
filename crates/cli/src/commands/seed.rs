use chrono::Utc;
use leadroute_db::repositories::SqlRuleRepository;
use leadroute_db::{DemoRuleSet, VerificationResult};

use crate::commands::{execute, CommandResult, EXIT_OPERATION};

pub fn run() -> CommandResult {
    execute("seed", |_config, pool| async move {
        let rules = SqlRuleRepository::new(pool);

        let seed_result = DemoRuleSet::load(&rules, Utc::now())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), EXIT_OPERATION))?;

        let verification = DemoRuleSet::verify(&rules)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), EXIT_OPERATION))?;

        if !verification.all_passed {
            return Err(("seed_verification", verification_message(&verification), EXIT_OPERATION));
        }

        let lines: Vec<String> =
            seed_result.rules_seeded.iter().map(|rule_id| format!("  - {rule_id}")).collect();
        Ok(format!("demo rule set loaded ({} rules):\n{}", lines.len(), lines.join("\n")))
    })
}

fn verification_message(verification: &VerificationResult) -> String {
    let failed_checks = verification
        .checks
        .iter()
        .filter_map(|check| (!check.passed).then_some(check.rule_id.as_str()))
        .collect::<Vec<_>>();

    if failed_checks.is_empty() {
        "some demo rules failed to load".to_string()
    } else {
        format!("seed verification failed for rules: {}", failed_checks.join(", "))
    }
}
