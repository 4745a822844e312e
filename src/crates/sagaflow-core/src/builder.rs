//! Fluent workflow builder DSL and graph compiler
//!
//! [`WorkflowBuilder`] is how workflows are declared: a fluent chain of
//! steps, branches, forks, bounded loops, approvals and failure handlers.
//! [`WorkflowBuilder::build`] verifies the resulting definition tree and,
//! when no fatal diagnostic is found, compiles it into the normalized
//! [`CompiledWorkflow`] the engine executes.
//!
//! ```rust
//! use sagaflow_core::builder::{Sequence, WorkflowBuilder};
//! use sagaflow_core::state::StateSchema;
//! use std::sync::Arc;
//!
//! let schema = Arc::new(StateSchema::new("review"));
//! let compiled = WorkflowBuilder::new("pipelines", "review", schema)
//!     .step("ingest")
//!     .repeat_until(
//!         "refine",
//!         Sequence::new().step("generate").step("critique"),
//!         |state| state.get("accepted").and_then(|v| v.as_bool()).unwrap_or(false),
//!         3,
//!     )
//!     .terminal_step("publish")
//!     .build()
//!     .expect("valid workflow");
//! assert!(compiled.entry.is_some());
//! ```

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use crate::graph::{
    ApprovalDef, BranchDef, CaseDef, CompiledNode, CompiledWorkflow, DiscriminatorFn, Enclosing,
    ForkDef, ForkPathMeta, HandlerDef, HandlerOwner, HandlerRef, LoopDef, NodeDef, NodeId,
    NodeKind, PathDef, StepDef, WorkflowDefinition,
};
use crate::state::{StateSchema, WorkflowState};
use crate::verify::{has_fatal, verify, Diagnostic};

/// A buildable sub-sequence of nodes (branch case, fork path, loop body)
#[derive(Clone, Default)]
pub struct Sequence {
    nodes: Vec<NodeDef>,
    handler: Option<HandlerDef>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step_type: impl Into<String>) -> Self {
        self.nodes.push(NodeDef::Step(StepDef {
            step_type: step_type.into(),
            instance_name: None,
            terminal: false,
        }));
        self
    }

    /// A step under a distinct instance name, for reusing one implementation
    /// several times along a path
    pub fn named_step(
        mut self,
        step_type: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        self.nodes.push(NodeDef::Step(StepDef {
            step_type: step_type.into(),
            instance_name: Some(instance_name.into()),
            terminal: false,
        }));
        self
    }

    /// A step whose completion completes the workflow
    pub fn terminal_step(mut self, step_type: impl Into<String>) -> Self {
        self.nodes.push(NodeDef::Step(StepDef {
            step_type: step_type.into(),
            instance_name: None,
            terminal: true,
        }));
        self
    }

    pub fn branch(
        mut self,
        name: impl Into<String>,
        discriminator: impl Fn(&WorkflowState) -> String + Send + Sync + 'static,
        cases: Vec<(&str, Sequence)>,
        rejoin: bool,
    ) -> Self {
        self.nodes.push(NodeDef::Branch(BranchDef {
            name: name.into(),
            discriminator: Arc::new(discriminator),
            cases: cases
                .into_iter()
                .map(|(key, sequence)| CaseDef {
                    key: key.to_string(),
                    nodes: sequence.nodes,
                })
                .collect(),
            rejoin,
        }));
        self
    }

    /// Fan out into parallel paths that converge at `join`
    ///
    /// A path's failure handler is whatever was attached to its sequence via
    /// [`Sequence::on_failure`].
    pub fn fork(
        mut self,
        name: impl Into<String>,
        paths: Vec<Sequence>,
        join: impl Into<String>,
    ) -> Self {
        self.nodes.push(NodeDef::Fork(ForkDef {
            name: name.into(),
            paths: paths
                .into_iter()
                .map(|sequence| PathDef {
                    nodes: sequence.nodes,
                    handler: sequence.handler,
                })
                .collect(),
            join: StepDef {
                step_type: join.into(),
                instance_name: None,
                terminal: false,
            },
        }));
        self
    }

    /// Repeat `body` until `exit` holds or `max_iterations` is reached
    pub fn repeat_until(
        mut self,
        name: impl Into<String>,
        body: Sequence,
        exit: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        max_iterations: u32,
    ) -> Self {
        self.nodes.push(NodeDef::Loop(LoopDef {
            name: name.into(),
            exit: Arc::new(exit),
            body: body.nodes,
            max_iterations,
            handler: body.handler,
        }));
        self
    }

    pub fn approval(mut self, spec: ApprovalSpec) -> Self {
        self.nodes.push(NodeDef::Approval(spec.into_def()));
        self
    }

    /// Attach a failure handler to this sequence's scope
    pub fn on_failure(mut self, steps: Vec<&str>, terminal: bool) -> Self {
        self.handler = Some(HandlerDef {
            steps: steps
                .into_iter()
                .map(|step_type| StepDef {
                    step_type: step_type.to_string(),
                    instance_name: None,
                    terminal: false,
                })
                .collect(),
            terminal,
        });
        self
    }
}

/// Declarative spec for an approval checkpoint
pub struct ApprovalSpec {
    name: String,
    approver: String,
    options: Vec<String>,
    escalation: Sequence,
    rejection: Sequence,
    timeout: Option<Duration>,
}

impl ApprovalSpec {
    pub fn new(
        name: impl Into<String>,
        approver: impl Into<String>,
        options: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            approver: approver.into(),
            options: options.into_iter().map(Into::into).collect(),
            escalation: Sequence::new(),
            rejection: Sequence::new(),
            timeout: None,
        }
    }

    /// Path taken on an escalate decision; may itself contain approvals
    pub fn with_escalation(mut self, sequence: Sequence) -> Self {
        self.escalation = sequence;
        self
    }

    /// Path taken on a reject decision before the workflow terminates
    pub fn with_rejection(mut self, sequence: Sequence) -> Self {
        self.rejection = sequence;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_def(self) -> ApprovalDef {
        ApprovalDef {
            name: self.name,
            approver: self.approver,
            options: self.options,
            escalation: self.escalation.nodes,
            rejection: self.rejection.nodes,
            timeout: self.timeout,
        }
    }
}

/// Fluent builder for a complete workflow definition
pub struct WorkflowBuilder {
    namespace: String,
    name: String,
    schema: Arc<StateSchema>,
    sequence: Sequence,
    handler: Option<HandlerDef>,
}

impl WorkflowBuilder {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        schema: Arc<StateSchema>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            schema,
            sequence: Sequence::new(),
            handler: None,
        }
    }

    pub fn step(mut self, step_type: impl Into<String>) -> Self {
        self.sequence = self.sequence.step(step_type);
        self
    }

    pub fn named_step(
        mut self,
        step_type: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        self.sequence = self.sequence.named_step(step_type, instance_name);
        self
    }

    pub fn terminal_step(mut self, step_type: impl Into<String>) -> Self {
        self.sequence = self.sequence.terminal_step(step_type);
        self
    }

    pub fn branch(
        mut self,
        name: impl Into<String>,
        discriminator: impl Fn(&WorkflowState) -> String + Send + Sync + 'static,
        cases: Vec<(&str, Sequence)>,
        rejoin: bool,
    ) -> Self {
        self.sequence = self.sequence.branch(name, discriminator, cases, rejoin);
        self
    }

    pub fn fork(
        mut self,
        name: impl Into<String>,
        paths: Vec<Sequence>,
        join: impl Into<String>,
    ) -> Self {
        self.sequence = self.sequence.fork(name, paths, join);
        self
    }

    pub fn repeat_until(
        mut self,
        name: impl Into<String>,
        body: Sequence,
        exit: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        max_iterations: u32,
    ) -> Self {
        self.sequence = self.sequence.repeat_until(name, body, exit, max_iterations);
        self
    }

    pub fn approval(mut self, spec: ApprovalSpec) -> Self {
        self.sequence = self.sequence.approval(spec);
        self
    }

    /// Workflow-global failure handler
    pub fn on_failure(mut self, steps: Vec<&str>, terminal: bool) -> Self {
        self.handler = Some(HandlerDef {
            steps: steps
                .into_iter()
                .map(|step_type| StepDef {
                    step_type: step_type.to_string(),
                    instance_name: None,
                    terminal: false,
                })
                .collect(),
            terminal,
        });
        self
    }

    /// The raw definition tree, before verification
    pub fn definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            schema: self.schema.clone(),
            nodes: self.sequence.nodes.clone(),
            handler: self.handler.clone(),
        }
    }

    /// Verify and compile; fatal diagnostics block compilation
    pub fn build(self) -> Result<CompiledWorkflow, Vec<Diagnostic>> {
        let definition = self.definition();
        let diagnostics = verify(&definition);
        if has_fatal(&diagnostics) {
            return Err(diagnostics);
        }
        Ok(compile(definition, diagnostics))
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

struct Compiler {
    nodes: HashMap<NodeId, CompiledNode>,
    counter: usize,
}

impl Compiler {
    fn next_id(&mut self, hint: &str) -> NodeId {
        self.counter += 1;
        // Deterministic DFS numbering keeps ids stable across restarts for
        // the same definition, which the step ledger relies on.
        format!("n{:03}:{hint}", self.counter)
    }

    fn insert(&mut self, id: NodeId, kind: NodeKind, enclosing: Enclosing) {
        self.nodes.insert(
            id.clone(),
            CompiledNode {
                id,
                kind,
                next: None,
                enclosing,
            },
        );
    }

    fn compile_sequence(&mut self, defs: &[NodeDef], enclosing: &Enclosing) -> Option<NodeId> {
        let ids: Vec<NodeId> = defs
            .iter()
            .map(|def| self.compile_node(def, enclosing))
            .collect();
        for pair in ids.windows(2) {
            if let Some(node) = self.nodes.get_mut(&pair[0]) {
                node.next = Some(pair[1].clone());
            }
        }
        ids.first().cloned()
    }

    fn compile_step(&mut self, step: &StepDef, enclosing: &Enclosing) -> NodeId {
        let id = self.next_id(step.name());
        self.insert(
            id.clone(),
            NodeKind::Step {
                step_type: step.step_type.clone(),
                name: step.name().to_string(),
                terminal: step.terminal,
            },
            enclosing.clone(),
        );
        id
    }

    fn compile_handler(&mut self, def: &HandlerDef, owner: HandlerOwner) -> Option<HandlerRef> {
        let enclosing = Enclosing::Handler {
            owner,
            terminal: def.terminal,
        };
        let ids: Vec<NodeId> = def
            .steps
            .iter()
            .map(|step| self.compile_step(step, &enclosing))
            .collect();
        for pair in ids.windows(2) {
            if let Some(node) = self.nodes.get_mut(&pair[0]) {
                node.next = Some(pair[1].clone());
            }
        }
        ids.first().cloned().map(|entry| HandlerRef {
            entry,
            terminal: def.terminal,
        })
    }

    fn compile_node(&mut self, def: &NodeDef, enclosing: &Enclosing) -> NodeId {
        match def {
            NodeDef::Step(step) => self.compile_step(step, enclosing),
            NodeDef::Branch(branch) => {
                let id = self.next_id(&branch.name);
                let cases = branch
                    .cases
                    .iter()
                    .map(|case| {
                        let entry = self.compile_sequence(
                            &case.nodes,
                            &Enclosing::BranchCase { branch: id.clone() },
                        );
                        (case.key.clone(), entry)
                    })
                    .collect();
                self.insert(
                    id.clone(),
                    NodeKind::Branch {
                        name: branch.name.clone(),
                        discriminator: branch.discriminator.clone(),
                        cases,
                        rejoin: branch.rejoin,
                    },
                    enclosing.clone(),
                );
                id
            }
            NodeDef::Fork(fork) => {
                let id = self.next_id(&fork.name);
                let paths = fork
                    .paths
                    .iter()
                    .enumerate()
                    .map(|(index, path)| {
                        let entry = self.compile_sequence(
                            &path.nodes,
                            &Enclosing::ForkPath {
                                fork: id.clone(),
                                index,
                            },
                        );
                        let handler = path.handler.as_ref().and_then(|handler| {
                            self.compile_handler(
                                handler,
                                HandlerOwner::ForkPath {
                                    fork: id.clone(),
                                    index,
                                },
                            )
                        });
                        ForkPathMeta { entry, handler }
                    })
                    .collect();
                // The join is compiled here and re-parented to the fork's own
                // position in a final pass, once the fork's `next` is linked.
                let join = self.compile_step(&fork.join, enclosing);
                self.insert(
                    id.clone(),
                    NodeKind::Fork {
                        name: fork.name.clone(),
                        paths,
                        join,
                    },
                    enclosing.clone(),
                );
                id
            }
            NodeDef::Loop(loop_def) => {
                let id = self.next_id(&loop_def.name);
                let body = self.compile_sequence(
                    &loop_def.body,
                    &Enclosing::LoopBody {
                        loop_node: id.clone(),
                    },
                );
                let handler = loop_def.handler.as_ref().and_then(|handler| {
                    self.compile_handler(
                        handler,
                        HandlerOwner::LoopBody {
                            loop_node: id.clone(),
                        },
                    )
                });
                self.insert(
                    id.clone(),
                    NodeKind::Loop {
                        name: loop_def.name.clone(),
                        exit: loop_def.exit.clone(),
                        body,
                        max_iterations: loop_def.max_iterations,
                        handler,
                    },
                    enclosing.clone(),
                );
                id
            }
            NodeDef::Approval(approval) => {
                let id = self.next_id(&approval.name);
                let escalation = self.compile_sequence(
                    &approval.escalation,
                    &Enclosing::ApprovalEscalation { approval: id.clone() },
                );
                let rejection = self.compile_sequence(
                    &approval.rejection,
                    &Enclosing::ApprovalRejection { approval: id.clone() },
                );
                self.insert(
                    id.clone(),
                    NodeKind::Approval {
                        name: approval.name.clone(),
                        approver: approval.approver.clone(),
                        options: approval.options.clone(),
                        escalation,
                        rejection,
                        timeout: approval.timeout,
                    },
                    enclosing.clone(),
                );
                id
            }
        }
    }

    /// Give each join the continuation of its fork
    fn relink_joins(&mut self) {
        let forks: Vec<(NodeId, NodeId)> = self
            .nodes
            .values()
            .filter_map(|node| match &node.kind {
                NodeKind::Fork { join, .. } => Some((node.id.clone(), join.clone())),
                _ => None,
            })
            .collect();
        for (fork_id, join_id) in forks {
            let (next, enclosing) = match self.nodes.get(&fork_id) {
                Some(fork) => (fork.next.clone(), fork.enclosing.clone()),
                None => continue,
            };
            if let Some(join) = self.nodes.get_mut(&join_id) {
                join.next = next;
                join.enclosing = enclosing;
            }
        }
    }
}

fn compile(definition: WorkflowDefinition, warnings: Vec<Diagnostic>) -> CompiledWorkflow {
    let mut compiler = Compiler {
        nodes: HashMap::new(),
        counter: 0,
    };
    let entry = compiler.compile_sequence(&definition.nodes, &Enclosing::Top);
    let handler = definition
        .handler
        .as_ref()
        .and_then(|handler| compiler.compile_handler(handler, HandlerOwner::Workflow));
    compiler.relink_joins();

    CompiledWorkflow {
        namespace: definition.namespace,
        name: definition.name,
        schema: definition.schema,
        nodes: compiler.nodes,
        entry,
        handler,
        warnings,
    }
}
