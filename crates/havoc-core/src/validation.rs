//! Static checks for configuration and user-submitted objects.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::chaos::{parse_percentage, ChaosSpec, NetworkAction};
use crate::config::{ExecutorMode, HavocConfig};
use crate::duration::parse_duration;
use crate::experiment::{Experiment, ExperimentSpec};
use crate::schedule::Schedule;
use crate::selector::SUPPORTED_FIELD_SELECTORS;
use crate::workflow::{NodeType, Workflow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for HavocConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.controller.resync_interval_secs == 0 {
            issues.push(ValidationIssue::error(
                "controller.resync_interval.zero",
                "resync interval cannot be 0",
            ));
        }

        if self.controller.max_concurrent_actions == 0 {
            issues.push(ValidationIssue::error(
                "controller.max_concurrent_actions.zero",
                "max_concurrent_actions must be greater than zero",
            ));
        }

        if !self.controller.cluster_scoped && self.controller.target_namespace.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "controller.target_namespace.empty",
                "namespace-scoped controllers need a target_namespace",
            ));
        }

        for namespace in &self.controller.allowed_namespaces {
            if self.controller.ignored_namespaces.contains(namespace) {
                issues.push(ValidationIssue::warning(
                    "controller.namespace.allowed_and_ignored",
                    format!("namespace {namespace} is both allowed and ignored; it will be ignored"),
                ));
            }
        }

        if self.retry.steps == 0 {
            issues.push(ValidationIssue::error(
                "retry.steps.zero",
                "retry steps must be at least 1",
            ));
        }

        if self.retry.factor < 1.0 {
            issues.push(ValidationIssue::warning(
                "retry.factor.shrinking",
                format!(
                    "retry factor {} shrinks the backoff between attempts",
                    self.retry.factor
                ),
            ));
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            issues.push(ValidationIssue::warning(
                "retry.max_backoff.below_initial",
                "max_backoff_ms is lower than initial_backoff_ms; every wait is capped",
            ));
        }

        if self.executor.mode == ExecutorMode::Command && self.executor.command.is_empty() {
            issues.push(ValidationIssue::error(
                "executor.command.empty",
                "executor mode is command but no command is configured",
            ));
        }

        if self.executor.timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "executor.timeout.zero",
                "executor timeout must be greater than zero",
            ));
        }

        issues
    }
}

fn validate_experiment_spec(spec: &ExperimentSpec, issues: &mut Vec<ValidationIssue>) {
    if spec.selectors.is_empty() {
        issues.push(ValidationIssue::warning(
            "experiment.selectors.empty",
            "no selectors declared; the experiment will target nothing",
        ));
    }

    for (key, selector) in &spec.selectors {
        for field in selector.field_selectors.keys() {
            if !SUPPORTED_FIELD_SELECTORS.contains(&field.as_str()) {
                issues.push(ValidationIssue::error(
                    "experiment.selector.field_unsupported",
                    format!(
                        "selector {key} uses unsupported field {field}. supported: {}",
                        SUPPORTED_FIELD_SELECTORS.join(", ")
                    ),
                ));
            }
        }
    }

    if let Err(err) = spec.duration() {
        issues.push(ValidationIssue::error(
            "experiment.duration.invalid",
            err.to_string(),
        ));
    }

    match &spec.chaos {
        ChaosSpec::NetworkChaos(network) => {
            let missing = match network.action {
                NetworkAction::Delay => network.delay.is_none().then_some("delay"),
                NetworkAction::Loss => network.loss.is_none().then_some("loss"),
                NetworkAction::Duplicate => network.duplicate.is_none().then_some("duplicate"),
                NetworkAction::Corrupt => network.corrupt.is_none().then_some("corrupt"),
                NetworkAction::Bandwidth => network.bandwidth.is_none().then_some("bandwidth"),
                NetworkAction::Partition => network.target.is_none().then_some("target"),
                NetworkAction::Netem => (network.delay.is_none()
                    && network.loss.is_none()
                    && network.duplicate.is_none()
                    && network.corrupt.is_none())
                .then_some("delay/loss/duplicate/corrupt"),
            };
            if let Some(field) = missing {
                issues.push(ValidationIssue::error(
                    "experiment.network.section_missing",
                    format!(
                        "network action {} requires the {field} section",
                        network.action.as_str()
                    ),
                ));
            }
            if let Some(bandwidth) = &network.bandwidth {
                if let Err(err) = bandwidth.rate_bytes_per_sec() {
                    issues.push(ValidationIssue::error(
                        "experiment.network.rate_invalid",
                        err.to_string(),
                    ));
                }
            }
            if let Some(delay) = &network.delay {
                if let Err(err) = delay.latency() {
                    issues.push(ValidationIssue::error(
                        "experiment.network.latency_invalid",
                        err.to_string(),
                    ));
                }
            }
        }
        ChaosSpec::HttpChaos(http) => {
            match parse_percentage("percent", &http.percent) {
                Ok(value) if (0.0..=100.0).contains(&value) => {}
                Ok(value) => issues.push(ValidationIssue::error(
                    "experiment.http.percent_range",
                    format!("percent {value} must be between 0 and 100"),
                )),
                Err(err) => issues.push(ValidationIssue::error(
                    "experiment.http.percent_invalid",
                    err.to_string(),
                )),
            }
            if let Some(delay) = &http.delay {
                if let Err(err) = parse_duration(delay) {
                    issues.push(ValidationIssue::error(
                        "experiment.http.delay_invalid",
                        err.to_string(),
                    ));
                }
            }
        }
        ChaosSpec::StressChaos(stress) => {
            if stress.stressors.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "experiment.stress.stressors_empty",
                    "stressors must not be empty",
                ));
            }
        }
    }
}

impl Validate for Experiment {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        validate_experiment_spec(&self.spec, &mut issues);
        issues
    }
}

impl Validate for Schedule {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.spec.schedule.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "schedule.schedule.empty",
                "schedule expression must not be empty",
            ));
        }
        validate_experiment_spec(&self.spec.job, &mut issues);
        issues
    }
}

impl Validate for Workflow {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.spec.templates.is_empty() {
            issues.push(ValidationIssue::error(
                "workflow.templates.empty",
                "missing required templates in workflow spec",
            ));
            return issues;
        }

        let mut names = HashSet::new();
        for template in &self.spec.templates {
            if !names.insert(template.name.as_str()) {
                issues.push(ValidationIssue::error(
                    "workflow.template.duplicate_name",
                    format!("template name {} is declared more than once", template.name),
                ));
            }
        }

        if !names.contains(self.spec.entry.as_str()) {
            issues.push(ValidationIssue::error(
                "workflow.entry.missing",
                format!("entry template {} is not declared", self.spec.entry),
            ));
        }

        for template in &self.spec.templates {
            if let Some(deadline) = &template.deadline {
                if let Err(err) = parse_duration(deadline) {
                    issues.push(ValidationIssue::error(
                        "workflow.template.deadline_invalid",
                        format!("template {}: {err}", template.name),
                    ));
                }
            }

            match template.template_type {
                NodeType::Serial | NodeType::Parallel => {
                    if template.tasks.is_empty() {
                        issues.push(ValidationIssue::warning(
                            "workflow.template.no_tasks",
                            format!(
                                "{} template {} declares no tasks and finishes immediately",
                                template.template_type, template.name
                            ),
                        ));
                    }
                    let mut seen = HashSet::new();
                    for task in &template.tasks {
                        if !names.contains(task.as_str()) {
                            issues.push(ValidationIssue::error(
                                "workflow.template.unknown_task",
                                format!("template {} references unknown task {task}", template.name),
                            ));
                        }
                        if !seen.insert(task.as_str()) {
                            issues.push(ValidationIssue::error(
                                "workflow.template.duplicate_task",
                                format!(
                                    "template {} lists task {task} more than once",
                                    template.name
                                ),
                            ));
                        }
                    }
                }
                NodeType::Suspend => match &template.duration {
                    None => issues.push(ValidationIssue::error(
                        "workflow.template.duration_missing",
                        format!("suspend template {} needs a duration", template.name),
                    )),
                    Some(duration) => {
                        if let Err(err) = parse_duration(duration) {
                            issues.push(ValidationIssue::error(
                                "workflow.template.duration_invalid",
                                format!("template {}: {err}", template.name),
                            ));
                        }
                    }
                },
                NodeType::Chaos => match &template.chaos {
                    None => issues.push(ValidationIssue::error(
                        "workflow.template.chaos_missing",
                        format!("chaos template {} needs a chaos section", template.name),
                    )),
                    Some(spec) => validate_experiment_spec(spec, &mut issues),
                },
                NodeType::Task => {
                    if template.task.is_none() {
                        issues.push(ValidationIssue::error(
                            "workflow.template.task_missing",
                            format!("task template {} needs a task section", template.name),
                        ));
                    }
                }
            }
        }

        issues
    }
}
