//! Subcommand implementations.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use comfy_table::Cell;
use serde_json::Value;

use scenariosync_core::config::AppConfig;
use scenariosync_core::diff::ChangeKind;
use scenariosync_core::models::{
    ChangeHistoryEntry, Conflict, EntityType, GitCredential, Page, Scenario, ScenarioType,
    SyncOperation,
};
use scenariosync_core::{MergeOutcome, ResolutionStrategy, ScenarioExportData, SyncOutcome};

use crate::style;
use crate::{ConflictsAction, CredentialsAction, MergeAction, ScenariosAction, Services, SyncAction};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub fn init(output: &Path) -> Result<()> {
    if output.exists() {
        bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, AppConfig::default_toml()).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Set git.repository_url to the remote that stores scenario branches");
    println!("  2. Optionally set git.token_env and export that variable");
    println!(
        "  3. Validate with: scenariosync validate --config {}",
        output.display()
    );
    println!(
        "  4. Start the server: scenariosync-daemon --config {}",
        output.display()
    );
    Ok(())
}

pub fn validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        bail!("configuration validation failed");
    }
    println!("  [OK] All required fields are valid");

    println!();
    println!("Configuration summary:");
    println!("  Repository    : {}", config.git.repository_url);
    println!("  Default branch: {}", config.git.default_branch);
    println!(
        "  System token  : {}",
        if config.git.token.is_some() { "set" } else { "not set" }
    );
    println!("  Net timeout   : {}s", config.git.network_timeout_secs);
    println!("  Lock stale    : {}s", config.merge.lock_stale_after_secs);
    println!("  Max depth     : {}", config.merge.max_hierarchy_depth);
    println!("  Web listen    : {}", config.web.listen);
    println!("  Data directory: {}", config.server.data_dir.display());
    println!();
    println!("{}", style::success("Configuration is valid."));
    Ok(())
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

pub fn scenarios(services: &Services, action: ScenariosAction, user: &str) -> Result<()> {
    match action {
        ScenariosAction::List { all } => {
            let scenarios = services.graph.list(all)?;
            if scenarios.is_empty() {
                println!("No scenarios found. Create a baseline with `scenariosync scenarios create`.");
                return Ok(());
            }
            print_scenarios(&scenarios);
            println!("{} scenario(s)", scenarios.len());
        }
        ScenariosAction::Create {
            name,
            parent,
            scenario_type,
        } => {
            let request = match parent.as_deref() {
                None => scenariosync_core::NewScenario::root(&name, user),
                Some(parent) => {
                    let scenario_type: ScenarioType = scenario_type
                        .parse()
                        .map_err(|_| anyhow::anyhow!("unknown scenario type '{scenario_type}'"))?;
                    scenariosync_core::NewScenario::branch(parent, scenario_type, &name, user)
                }
            };
            let scenario = services.graph.create(request)?;
            let branch = services.graph.branch(&scenario.id)?;
            println!(
                "{}",
                style::success(&format!("Created scenario '{}' ({})", scenario.name, scenario.id))
            );
            println!("  Branch: {}", branch.branch_name);
        }
        ScenariosAction::Activate { id } => {
            let scenario = services.graph.activate(&id)?;
            println!("{}", style::success(&format!("Scenario '{}' is active", scenario.name)));
        }
        ScenariosAction::Archive { id } => {
            let scenario = services.graph.archive(&id)?;
            println!("{}", style::success(&format!("Scenario '{}' archived", scenario.name)));
        }
        ScenariosAction::Ancestors { id } => {
            let ancestors = services.graph.ancestors_of(&id)?;
            if ancestors.is_empty() {
                println!("Scenario {} is a root.", id);
                return Ok(());
            }
            print_scenarios(&ancestors);
        }
    }
    Ok(())
}

fn print_scenarios(scenarios: &[Scenario]) {
    let mut table = style::table(&["ID", "Name", "Type", "Status", "Parent", "Created"]);
    for s in scenarios {
        table.add_row(vec![
            Cell::new(&s.id),
            Cell::new(&s.name),
            Cell::new(s.scenario_type),
            Cell::new(s.status),
            Cell::new(s.parent_scenario_id.as_deref().map(style::short).unwrap_or("—")),
            Cell::new(s.created_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    println!("{table}");
}

pub fn compare(services: &Services, from: &str, to: &str, all: bool) -> Result<()> {
    let diff = services.diff.compare(from, to)?;
    let summary = diff.summary();

    println!();
    println!("{}", style::header(&format!("{} → {}", style::short(from), style::short(to))));
    println!();

    let mut table = style::table(&["Type", "Entity", "Change", "Field", "From", "To"]);
    let mut rows = 0;
    for entry in &diff.entries {
        if entry.change == ChangeKind::Unchanged && !all {
            continue;
        }
        let change = match entry.change {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Unchanged => "unchanged",
        };
        if entry.fields.is_empty() {
            table.add_row(vec![
                entry.entity_type.to_string(),
                entry.entity_id.clone(),
                change.to_string(),
                String::new(),
                String::new(),
                String::new(),
            ]);
        }
        for (field, values) in &entry.fields {
            table.add_row(vec![
                entry.entity_type.to_string(),
                entry.entity_id.clone(),
                change.to_string(),
                field.clone(),
                style::value(&values.from_value),
                style::value(&values.to_value),
            ]);
        }
        rows += 1;
    }

    if rows == 0 {
        println!("{}", style::success("No differences"));
        return Ok(());
    }
    println!("{table}");
    println!(
        "{} entities, {}",
        rows,
        style::dim(&format!("+{} / -{} field values", summary.added, summary.removed))
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Merge and conflicts
// ---------------------------------------------------------------------------

pub fn merge(services: &Services, action: MergeAction, user: &str) -> Result<()> {
    match action {
        MergeAction::Run { scenario } => print_merge(&services.merges.merge(&scenario, user)?),
        MergeAction::Retry { operation_id } => {
            print_merge(&services.merges.retry(&operation_id, user)?)
        }
        MergeAction::Abandon { operation_id } => {
            let op = services.merges.abandon(&operation_id, user)?;
            println!("{}", style::warn(&format!("Merge {} abandoned", op.id)));
        }
    }
    Ok(())
}

fn print_merge(outcome: &MergeOutcome) {
    if outcome.is_committed() {
        let changed = outcome
            .history
            .as_ref()
            .map(|h| h.entities_affected.len())
            .unwrap_or(0);
        println!(
            "{}",
            style::success(&format!(
                "Merge {} committed ({} entities changed)",
                outcome.operation.id, changed
            ))
        );
        return;
    }
    print_halted(&outcome.operation, &outcome.conflicts, "merge retry");
}

fn print_halted(op: &SyncOperation, conflicts: &[Conflict], retry_command: &str) {
    println!(
        "{}",
        style::warn(&format!(
            "Operation {} stopped with {} conflict(s)",
            op.id, op.conflict_count
        ))
    );
    print_conflicts(conflicts);
    println!("Resolve each conflict with `scenariosync conflicts resolve <id> --strategy ...`,");
    println!("then run `scenariosync {} {}`.", retry_command, op.id);
}

fn print_conflicts(conflicts: &[Conflict]) {
    let mut table = style::table(&["ID", "Entity", "Field", "Base", "Local", "Remote", "Status"]);
    for c in conflicts {
        let entity = match &c.entity_name {
            Some(name) => format!("{} {} ({})", c.entity_type, c.entity_id, name),
            None => format!("{} {}", c.entity_type, c.entity_id),
        };
        table.add_row(vec![
            c.id.clone(),
            entity,
            c.field.clone(),
            style::value(&c.base_value),
            style::value(&c.local_value),
            style::value(&c.remote_value),
            c.resolution_status.to_string(),
        ]);
    }
    println!("{table}");
}

pub fn conflicts(services: &Services, action: ConflictsAction, user: &str) -> Result<()> {
    match action {
        ConflictsAction::List { operation, scenario } => {
            let conflicts = match (operation, scenario) {
                (Some(op), _) => services.resolver.list_for_operation(&op)?,
                (None, Some(scenario)) => services.resolver.outstanding_for_scenario(&scenario)?,
                (None, None) => bail!("pass --operation or --scenario"),
            };
            if conflicts.is_empty() {
                println!("{}", style::success("No conflicts"));
                return Ok(());
            }
            print_conflicts(&conflicts);
        }
        ConflictsAction::Resolve {
            id,
            strategy,
            value,
        } => {
            let value = value
                .map(|raw| parse_value(&raw))
                .transpose()?;
            if strategy == "custom" && value.is_none() {
                bail!("--value is required with the custom strategy");
            }
            let strategy = ResolutionStrategy::from_parts(&strategy, value).ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid strategy '{strategy}': use accept_local, accept_remote or custom"
                )
            })?;
            let conflict = services.resolver.resolve(&id, strategy, user)?;
            println!(
                "{}",
                style::success(&format!(
                    "Conflict {} resolved to {}",
                    conflict.id,
                    conflict
                        .resolved_value
                        .as_ref()
                        .map(style::value)
                        .unwrap_or_default()
                ))
            );
        }
        ConflictsAction::Defer { id } => {
            services.resolver.defer(&id, user)?;
            println!("{}", style::warn(&format!("Conflict {} deferred", id)));
        }
    }
    Ok(())
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

// ---------------------------------------------------------------------------
// History, export and import
// ---------------------------------------------------------------------------

pub fn history(
    services: &Services,
    scenario: Option<&str>,
    entity: Option<(&str, &str)>,
    limit: u32,
    cursor: Option<&str>,
) -> Result<()> {
    let page: Page<ChangeHistoryEntry> = match (entity, scenario) {
        (Some((entity_type, entity_id)), _) => {
            let entity_type: EntityType = entity_type
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown entity type '{entity_type}'"))?;
            services.history.query(entity_type, entity_id, limit, cursor)?
        }
        (None, Some(scenario)) => services.history.for_scenario(scenario, limit, cursor)?,
        (None, None) => bail!("pass --scenario or --entity-type with --entity-id"),
    };

    if page.items.is_empty() {
        println!("No history found.");
        return Ok(());
    }

    let mut table = style::table(&["Commit", "When", "Author", "Message", "Entities", "+/-"]);
    for entry in &page.items {
        table.add_row(vec![
            style::short(&entry.commit_sha).to_string(),
            entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.author.clone(),
            entry.message.clone(),
            entry.entities_affected.len().to_string(),
            format!("+{}/-{}", entry.diff_summary.added, entry.diff_summary.removed),
        ]);
    }
    println!("{table}");
    if let Some(next) = &page.next_cursor {
        println!("{}", style::dim(&format!("more: --cursor {next}")));
    }
    Ok(())
}

pub fn export(services: &Services, scenario: &str, output: Option<&Path>, user: &str) -> Result<()> {
    let data = services.exporter.export(scenario, user)?;
    let text = data.encode()?;
    match output {
        Some(path) => {
            std::fs::write(path, text).context("failed to write export file")?;
            eprintln!(
                "{}",
                style::success(&format!(
                    "Exported {} projects, {} people, {} assignments to {}",
                    data.data.projects.len(),
                    data.data.people.len(),
                    data.data.assignments.len(),
                    path.display()
                ))
            );
        }
        None => println!("{text}"),
    }
    Ok(())
}

pub fn import(services: &Services, scenario: &str, input: &Path, user: &str) -> Result<()> {
    let text = std::fs::read_to_string(input).context("failed to read export file")?;
    let data = ScenarioExportData::decode(&text)?;
    match services.exporter.import(scenario, &data, user)? {
        Some(entry) => println!(
            "{}",
            style::success(&format!(
                "Imported {} changed entities ({})",
                entry.entities_affected.len(),
                style::short(&entry.commit_sha)
            ))
        ),
        None => println!("{}", style::success("Scenario already matches the export")),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Credentials and sync
// ---------------------------------------------------------------------------

pub fn credentials(services: &Services, action: CredentialsAction, user: &str) -> Result<()> {
    match action {
        CredentialsAction::Add {
            owner,
            token,
            expires_in_days,
        } => {
            if token.trim().is_empty() {
                bail!("token must not be empty");
            }
            let owner = owner.unwrap_or_else(|| user.to_string());
            let now = Utc::now();
            services.vault.store(&GitCredential {
                user_id: owner.clone(),
                provider: services.config.git.credential_provider.clone(),
                credential_type: "personal-access-token".into(),
                token,
                repository_url: services.config.git.repository_url.clone(),
                expires_at: expires_in_days.map(|days| now + Duration::days(days)),
                created_at: now,
                last_used_at: None,
            })?;
            println!(
                "{}",
                style::success(&format!(
                    "Stored credential for {} on {}",
                    owner, services.config.git.repository_url
                ))
            );
        }
        CredentialsAction::List { owner } => {
            let owner = owner.unwrap_or_else(|| user.to_string());
            let credentials = services.vault.list_for_user(&owner)?;
            if credentials.is_empty() {
                println!("No credentials for {}.", owner);
                return Ok(());
            }
            let now = Utc::now();
            let mut table = style::table(&["Repository", "Provider", "Created", "Expires", "Last used"]);
            for c in &credentials {
                let expires = match c.expires_at {
                    Some(at) if c.is_expired(now) => style::error(&at.format("%Y-%m-%d").to_string()),
                    Some(at) => at.format("%Y-%m-%d").to_string(),
                    None => "never".to_string(),
                };
                table.add_row(vec![
                    c.repository_url.clone(),
                    c.provider.clone(),
                    c.created_at.format("%Y-%m-%d").to_string(),
                    expires,
                    c.last_used_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "—".to_string()),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

pub async fn sync(services: &Services, action: SyncAction, user: &str) -> Result<()> {
    let orchestrator = services.sync();
    let outcome = match action {
        SyncAction::Clone => orchestrator.clone_remote(user).await?,
        SyncAction::Pull { scenario } => orchestrator.pull(&scenario, user).await?,
        SyncAction::Push { scenario } => orchestrator.push(&scenario, user).await?,
        SyncAction::Resume { operation_id } => orchestrator.resume(&operation_id, user).await?,
    };
    print_sync(&outcome);
    Ok(())
}

fn print_sync(outcome: &SyncOutcome) {
    let op = &outcome.operation;
    if !outcome.conflicts.is_empty() {
        print_halted(op, &outcome.conflicts, "sync resume");
        return;
    }
    let detail = match &outcome.history {
        Some(entry) => format!(
            "{} entities changed at {}",
            entry.entities_affected.len(),
            style::short(&entry.commit_sha)
        ),
        None => "no changes".to_string(),
    };
    println!(
        "{}",
        style::success(&format!("{} {} {}: {}", op.operation_type, op.id, op.status, detail))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_falls_back_to_string() {
        assert_eq!(parse_value("65").unwrap(), serde_json::json!(65));
        assert_eq!(parse_value("{\"a\":1}").unwrap(), serde_json::json!({"a": 1}));
        assert_eq!(parse_value("Q3 plan").unwrap(), serde_json::json!("Q3 plan"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenariosync.toml");
        init(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[git]"));
        assert!(init(&path).is_err());
    }
}
