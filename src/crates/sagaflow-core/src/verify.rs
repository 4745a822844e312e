//! Graph verifier
//!
//! Verification runs once, between the builder DSL and compilation. It walks
//! the definition tree depth-first carrying a path-scoped set of step
//! instance names, and reports findings as [`Diagnostic`] values rather than
//! panics so callers can surface all of them at once. Any fatal diagnostic
//! blocks the graph from becoming executable; warnings are returned alongside
//! the compiled graph and the workflow still runs.
//!
//! | Code | Meaning | Severity |
//! |------|---------|----------|
//! | AGWF001 | Workflow name is empty | fatal |
//! | AGWF002 | Workflow contains no steps | warning |
//! | AGWF003 | Duplicate step name within a linear path | fatal |
//! | AGWF004 | Workflow not declared in a named namespace | fatal |
//! | AGWF009 | First node is not a step | fatal |
//! | AGWF010 | Last reachable node is not a terminal step | warning |
//! | AGWF012 | Fork without a matching join | fatal |
//! | AGWF014 | Loop body contains no steps | fatal |
//! | AGWF015 | Approval with an empty option list | fatal |
//!
//! Duplicate names across mutually exclusive branch cases are permitted;
//! each case is its own linear path.

use std::collections::HashSet;
use std::fmt;

use crate::graph::{NodeDef, WorkflowDefinition};

/// Severity of a verifier finding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Fatal => "fatal",
        }
    }
}

/// One verifier finding: code, severity and tree location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub severity: Severity,
    pub location: String,
    pub message: String,
}

impl Diagnostic {
    fn fatal(code: &'static str, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Fatal,
            location: location.into(),
            message: message.into(),
        }
    }

    fn warning(code: &'static str, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {}: {}",
            self.code,
            self.severity.as_str(),
            self.location,
            self.message
        )
    }
}

/// Whether a diagnostic list blocks execution
pub fn has_fatal(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Fatal)
}

/// Verify a definition tree, returning every finding
pub fn verify(definition: &WorkflowDefinition) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let location = format!("{}/{}", definition.namespace, definition.name);

    if definition.name.trim().is_empty() {
        diagnostics.push(Diagnostic::fatal(
            "AGWF001",
            &location,
            "workflow name must be non-empty",
        ));
    }
    if definition.namespace.trim().is_empty() {
        diagnostics.push(Diagnostic::fatal(
            "AGWF004",
            &location,
            "workflow must be declared in a named namespace",
        ));
    }

    if count_steps(&definition.nodes) == 0 {
        diagnostics.push(Diagnostic::warning(
            "AGWF002",
            &location,
            "workflow contains no steps",
        ));
    } else {
        match definition.nodes.first() {
            Some(NodeDef::Step(_)) => {}
            _ => diagnostics.push(Diagnostic::fatal(
                "AGWF009",
                &location,
                "first node must be an entry step",
            )),
        }
        match definition.nodes.last() {
            Some(NodeDef::Step(step)) if step.terminal => {}
            Some(NodeDef::Branch(_)) => {
                // Branches may short-circuit; terminality is per-case.
            }
            _ => diagnostics.push(Diagnostic::warning(
                "AGWF010",
                &location,
                "last reachable node is not a terminal step",
            )),
        }
    }

    let mut seen = HashSet::new();
    walk_sequence(&definition.nodes, &location, &mut seen, &mut diagnostics);

    if let Some(handler) = &definition.handler {
        let mut handler_seen = HashSet::new();
        for step in &handler.steps {
            check_name(
                step.name(),
                &format!("{location}/on_failure"),
                &mut handler_seen,
                &mut diagnostics,
            );
        }
    }

    diagnostics
}

fn count_steps(nodes: &[NodeDef]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            NodeDef::Step(_) => 1,
            NodeDef::Branch(branch) => branch
                .cases
                .iter()
                .map(|case| count_steps(&case.nodes))
                .sum(),
            NodeDef::Fork(fork) => {
                1 + fork
                    .paths
                    .iter()
                    .map(|path| count_steps(&path.nodes))
                    .sum::<usize>()
            }
            NodeDef::Loop(loop_def) => count_steps(&loop_def.body),
            NodeDef::Approval(approval) => {
                count_steps(&approval.escalation) + count_steps(&approval.rejection)
            }
        })
        .sum()
}

fn check_name(
    name: &str,
    location: &str,
    seen: &mut HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if !seen.insert(name.to_string()) {
        diagnostics.push(Diagnostic::fatal(
            "AGWF003",
            location,
            format!("duplicate step name '{name}' within a linear path"),
        ));
    }
}

fn walk_sequence(
    nodes: &[NodeDef],
    location: &str,
    seen: &mut HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for node in nodes {
        match node {
            NodeDef::Step(step) => {
                check_name(step.name(), location, seen, diagnostics);
            }
            NodeDef::Branch(branch) => {
                // Cases are mutually exclusive: each gets its own copy of the
                // path-scoped name set.
                for case in &branch.cases {
                    let mut case_seen = seen.clone();
                    walk_sequence(
                        &case.nodes,
                        &format!("{location}/{}[{}]", branch.name, case.key),
                        &mut case_seen,
                        diagnostics,
                    );
                }
            }
            NodeDef::Fork(fork) => {
                if fork.paths.is_empty() || fork.join.step_type.trim().is_empty() {
                    diagnostics.push(Diagnostic::fatal(
                        "AGWF012",
                        format!("{location}/{}", fork.name),
                        "fork requires at least one path and a matching join step",
                    ));
                }
                for (index, path) in fork.paths.iter().enumerate() {
                    let mut path_seen = seen.clone();
                    walk_sequence(
                        &path.nodes,
                        &format!("{location}/{}[{index}]", fork.name),
                        &mut path_seen,
                        diagnostics,
                    );
                    if let Some(handler) = &path.handler {
                        let mut handler_seen = HashSet::new();
                        for step in &handler.steps {
                            check_name(
                                step.name(),
                                &format!("{location}/{}[{index}]/on_failure", fork.name),
                                &mut handler_seen,
                                diagnostics,
                            );
                        }
                    }
                }
                check_name(fork.join.name(), location, seen, diagnostics);
            }
            NodeDef::Loop(loop_def) => {
                if count_steps(&loop_def.body) == 0 {
                    diagnostics.push(Diagnostic::fatal(
                        "AGWF014",
                        format!("{location}/{}", loop_def.name),
                        "loop body must contain at least one step",
                    ));
                }
                // Body iterations run within the same linear path.
                walk_sequence(
                    &loop_def.body,
                    &format!("{location}/{}", loop_def.name),
                    seen,
                    diagnostics,
                );
            }
            NodeDef::Approval(approval) => {
                if approval.options.is_empty() {
                    diagnostics.push(Diagnostic::fatal(
                        "AGWF015",
                        format!("{location}/{}", approval.name),
                        "approval requires a non-empty option list",
                    ));
                }
                for (label, path) in [
                    ("escalation", &approval.escalation),
                    ("rejection", &approval.rejection),
                ] {
                    let mut path_seen = seen.clone();
                    walk_sequence(
                        path,
                        &format!("{location}/{}/{label}", approval.name),
                        &mut path_seen,
                        diagnostics,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Sequence, WorkflowBuilder};
    use crate::state::StateSchema;
    use std::sync::Arc;

    fn schema() -> Arc<StateSchema> {
        Arc::new(StateSchema::new("test"))
    }

    #[test]
    fn test_empty_name_is_fatal() {
        let definition = WorkflowBuilder::new("demo", "", schema())
            .step("plan")
            .definition();
        let diagnostics = verify(&definition);
        assert!(diagnostics.iter().any(|d| d.code == "AGWF001"));
        assert!(has_fatal(&diagnostics));
    }

    #[test]
    fn test_global_namespace_is_fatal() {
        let definition = WorkflowBuilder::new("", "demo", schema())
            .step("plan")
            .definition();
        let diagnostics = verify(&definition);
        assert!(diagnostics.iter().any(|d| d.code == "AGWF004"));
    }

    #[test]
    fn test_stepless_workflow_warns() {
        let definition = WorkflowBuilder::new("demo", "empty", schema()).definition();
        let diagnostics = verify(&definition);
        let finding = diagnostics.iter().find(|d| d.code == "AGWF002").unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert!(!has_fatal(&diagnostics));
    }

    #[test]
    fn test_duplicate_step_in_linear_path_is_fatal() {
        let definition = WorkflowBuilder::new("demo", "dupes", schema())
            .step("plan")
            .step("plan")
            .definition();
        let diagnostics = verify(&definition);
        assert!(diagnostics.iter().any(|d| d.code == "AGWF003"));
    }

    #[test]
    fn test_duplicate_across_branch_cases_is_permitted() {
        let definition = WorkflowBuilder::new("demo", "branches", schema())
            .step("classify")
            .branch(
                "route",
                |state| {
                    state
                        .get("kind")
                        .and_then(|v| v.as_str())
                        .unwrap_or("other")
                        .to_string()
                },
                vec![
                    ("a", Sequence::new().step("handle")),
                    ("b", Sequence::new().step("handle")),
                ],
                true,
            )
            .terminal_step("finish")
            .definition();
        let diagnostics = verify(&definition);
        assert!(!diagnostics.iter().any(|d| d.code == "AGWF003"));
    }

    #[test]
    fn test_empty_loop_body_is_fatal() {
        let definition = WorkflowBuilder::new("demo", "loops", schema())
            .step("start")
            .repeat_until("refine", Sequence::new(), |_| true, 3)
            .terminal_step("finish")
            .definition();
        let diagnostics = verify(&definition);
        assert!(diagnostics.iter().any(|d| d.code == "AGWF014"));
    }

    #[test]
    fn test_non_terminal_tail_warns() {
        let definition = WorkflowBuilder::new("demo", "tail", schema())
            .step("a")
            .step("b")
            .definition();
        let diagnostics = verify(&definition);
        let finding = diagnostics.iter().find(|d| d.code == "AGWF010").unwrap();
        assert_eq!(finding.severity, Severity::Warning);
    }

    #[test]
    fn test_first_node_must_be_step() {
        let definition = WorkflowBuilder::new("demo", "entry", schema())
            .repeat_until("spin", Sequence::new().step("body"), |_| true, 2)
            .terminal_step("finish")
            .definition();
        let diagnostics = verify(&definition);
        assert!(diagnostics.iter().any(|d| d.code == "AGWF009"));
    }

    #[test]
    fn test_empty_approval_options_fatal() {
        let definition = WorkflowBuilder::new("demo", "approvals", schema())
            .step("draft")
            .approval(crate::builder::ApprovalSpec::new("sign_off", "lead", Vec::<String>::new()))
            .terminal_step("publish")
            .definition();
        let diagnostics = verify(&definition);
        assert!(diagnostics.iter().any(|d| d.code == "AGWF015"));
    }

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic::fatal("AGWF003", "demo/wf", "duplicate step name 'plan'");
        assert_eq!(
            diagnostic.to_string(),
            "AGWF003[fatal] demo/wf: duplicate step name 'plan'"
        );
    }
}
