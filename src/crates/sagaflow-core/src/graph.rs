//! Workflow graph model
//!
//! A [`WorkflowDefinition`] is the tree the builder DSL produces: an ordered
//! sequence of node definitions where branches, forks and loops carry their
//! own sub-sequences. Compilation flattens that tree into a
//! [`CompiledWorkflow`]: a map of uniquely-identified [`CompiledNode`]s that
//! reference each other by id (never by pointer), each knowing its `next`
//! node in sequence and the [`Enclosing`] construct it sits in. The engine
//! walks the compiled form exclusively.
//!
//! Graphs are constructed once at program init, verified, and thereafter
//! shared immutably across all workflow instances.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use crate::state::{StateSchema, WorkflowState};

/// Identifier of a compiled node, unique within its workflow
pub type NodeId = String;

/// State-derived routing function for branches
pub type DiscriminatorFn = Arc<dyn Fn(&WorkflowState) -> String + Send + Sync>;

/// State-derived exit predicate for loops
pub type PredicateFn = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Definition tree (builder output)
// ---------------------------------------------------------------------------

/// One step invocation in a definition
#[derive(Clone)]
pub struct StepDef {
    /// Step implementation looked up in the registry at dispatch time
    pub step_type: String,
    /// Display name; defaults to the step type
    pub instance_name: Option<String>,
    /// Completing this step completes the workflow
    pub terminal: bool,
}

impl StepDef {
    pub fn name(&self) -> &str {
        self.instance_name.as_deref().unwrap_or(&self.step_type)
    }
}

/// One case of a branch: a literal key and its sub-sequence
#[derive(Clone)]
pub struct CaseDef {
    pub key: String,
    pub nodes: Vec<NodeDef>,
}

/// Conditional routing by a state-derived discriminator
#[derive(Clone)]
pub struct BranchDef {
    pub name: String,
    pub discriminator: DiscriminatorFn,
    pub cases: Vec<CaseDef>,
    /// Whether cases converge after the branch; `false` means every case
    /// terminates its enclosing scope
    pub rejoin: bool,
}

/// One parallel path of a fork
#[derive(Clone)]
pub struct PathDef {
    pub nodes: Vec<NodeDef>,
    pub handler: Option<HandlerDef>,
}

/// N parallel sub-sequences converging at a join step
#[derive(Clone)]
pub struct ForkDef {
    pub name: String,
    pub paths: Vec<PathDef>,
    pub join: StepDef,
}

/// Bounded repetition of a body until an exit predicate holds
#[derive(Clone)]
pub struct LoopDef {
    pub name: String,
    pub exit: PredicateFn,
    pub body: Vec<NodeDef>,
    pub max_iterations: u32,
    pub handler: Option<HandlerDef>,
}

/// Human decision checkpoint
#[derive(Clone)]
pub struct ApprovalDef {
    pub name: String,
    pub approver: String,
    pub options: Vec<String>,
    pub escalation: Vec<NodeDef>,
    pub rejection: Vec<NodeDef>,
    pub timeout: Option<Duration>,
}

/// Steps that run when a failure reaches their scope
#[derive(Clone)]
pub struct HandlerDef {
    pub steps: Vec<StepDef>,
    /// Whether handler completion terminates the scope (workflow or path)
    /// with a failed status instead of rejoining the normal flow
    pub terminal: bool,
}

/// A node of the definition tree
#[derive(Clone)]
pub enum NodeDef {
    Step(StepDef),
    Branch(BranchDef),
    Fork(ForkDef),
    Loop(LoopDef),
    Approval(ApprovalDef),
}

/// Immutable output of the builder DSL, input to the verifier/compiler
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub namespace: String,
    pub name: String,
    pub schema: Arc<StateSchema>,
    pub nodes: Vec<NodeDef>,
    pub handler: Option<HandlerDef>,
}

// ---------------------------------------------------------------------------
// Compiled graph (engine input)
// ---------------------------------------------------------------------------

/// The construct a compiled node sits inside, driving end-of-sequence
/// continuation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enclosing {
    Top,
    BranchCase { branch: NodeId },
    ForkPath { fork: NodeId, index: usize },
    LoopBody { loop_node: NodeId },
    Handler { owner: HandlerOwner, terminal: bool },
    ApprovalEscalation { approval: NodeId },
    ApprovalRejection { approval: NodeId },
}

/// Scope a failure handler is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOwner {
    Workflow,
    ForkPath { fork: NodeId, index: usize },
    LoopBody { loop_node: NodeId },
}

/// Compiled failure handler: entry node of its step chain
#[derive(Debug, Clone)]
pub struct HandlerRef {
    pub entry: NodeId,
    pub terminal: bool,
}

/// Metadata of one compiled fork path
#[derive(Clone)]
pub struct ForkPathMeta {
    /// First node of the path; `None` for an empty path, which completes
    /// immediately
    pub entry: Option<NodeId>,
    pub handler: Option<HandlerRef>,
}

/// Behavior of a compiled node
#[derive(Clone)]
pub enum NodeKind {
    Step {
        step_type: String,
        name: String,
        terminal: bool,
    },
    Branch {
        name: String,
        discriminator: DiscriminatorFn,
        /// Case key to entry node; `None` entry means the case is empty
        cases: Vec<(String, Option<NodeId>)>,
        rejoin: bool,
    },
    Fork {
        name: String,
        paths: Vec<ForkPathMeta>,
        join: NodeId,
    },
    Loop {
        name: String,
        exit: PredicateFn,
        /// First node of the body; `None` (empty body) exits immediately
        body: Option<NodeId>,
        max_iterations: u32,
        handler: Option<HandlerRef>,
    },
    Approval {
        name: String,
        approver: String,
        options: Vec<String>,
        escalation: Option<NodeId>,
        rejection: Option<NodeId>,
        timeout: Option<Duration>,
    },
}

/// One node of the compiled graph
#[derive(Clone)]
pub struct CompiledNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Next node in the same sequence; `None` at the end of the sequence
    pub next: Option<NodeId>,
    pub enclosing: Enclosing,
}

impl CompiledNode {
    /// Display name used in events and logs
    pub fn display_name(&self) -> &str {
        match &self.kind {
            NodeKind::Step { name, .. }
            | NodeKind::Branch { name, .. }
            | NodeKind::Fork { name, .. }
            | NodeKind::Loop { name, .. }
            | NodeKind::Approval { name, .. } => name,
        }
    }
}

/// Where control flows when a sequence runs off its end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Proceed to this node
    Node(NodeId),
    /// A fork path finished
    PathEnd { fork: NodeId, index: usize },
    /// A loop body finished; re-evaluate at the loop head
    LoopHead(NodeId),
    /// A failure-handler chain finished
    HandlerEnd { owner: HandlerOwner, terminal: bool },
    /// An approval rejection path finished; the workflow is rejected
    Rejected,
    /// The workflow ran off the end of its top-level sequence
    Complete,
}

/// Normalized, verified execution graph shared across instances
#[derive(Clone)]
pub struct CompiledWorkflow {
    pub namespace: String,
    pub name: String,
    pub schema: Arc<StateSchema>,
    pub nodes: HashMap<NodeId, CompiledNode>,
    pub entry: Option<NodeId>,
    pub handler: Option<HandlerRef>,
    /// Non-fatal verifier findings, surfaced but not blocking
    pub warnings: Vec<crate::verify::Diagnostic>,
}

impl CompiledWorkflow {
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    /// Resolve where control flows after `id` completes its own sequence
    /// position, walking outward through enclosing constructs as needed.
    pub fn continuation(&self, id: &str) -> Continuation {
        let Some(node) = self.nodes.get(id) else {
            return Continuation::Complete;
        };
        if let Some(next) = &node.next {
            return Continuation::Node(next.clone());
        }
        self.continuation_of_scope(&node.enclosing)
    }

    /// Continuation as if `id`'s whole sequence had ended (used for empty
    /// branch cases and non-rejoining branches)
    pub fn continuation_after_scope(&self, id: &str) -> Continuation {
        match self.nodes.get(id) {
            Some(node) => self.continuation_of_scope(&node.enclosing),
            None => Continuation::Complete,
        }
    }

    /// The fork owning the join step `id`, if any
    pub fn fork_of_join(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.values().find(|node| {
            matches!(&node.kind, NodeKind::Fork { join, .. } if join == id)
        })
    }

    fn continuation_of_scope(&self, enclosing: &Enclosing) -> Continuation {
        match enclosing {
            Enclosing::Top => Continuation::Complete,
            Enclosing::BranchCase { branch } => {
                let rejoin = match self.nodes.get(branch).map(|n| &n.kind) {
                    Some(NodeKind::Branch { rejoin, .. }) => *rejoin,
                    _ => false,
                };
                if rejoin {
                    self.continuation(branch)
                } else {
                    // All cases terminate: resolve as if the branch itself
                    // ended its scope.
                    match self.nodes.get(branch) {
                        Some(node) => self.continuation_of_scope(&node.enclosing),
                        None => Continuation::Complete,
                    }
                }
            }
            Enclosing::ForkPath { fork, index } => Continuation::PathEnd {
                fork: fork.clone(),
                index: *index,
            },
            Enclosing::LoopBody { loop_node } => Continuation::LoopHead(loop_node.clone()),
            Enclosing::Handler { owner, terminal } => Continuation::HandlerEnd {
                owner: owner.clone(),
                terminal: *terminal,
            },
            Enclosing::ApprovalEscalation { approval } => self.continuation(approval),
            Enclosing::ApprovalRejection { .. } => Continuation::Rejected,
        }
    }

    /// Nearest failure handler covering `id`, searched fork-path →
    /// loop-body → workflow-global
    pub fn handler_for(&self, id: &str) -> Option<(HandlerRef, HandlerOwner)> {
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            match &node.enclosing {
                Enclosing::ForkPath { fork, index } => {
                    if let Some(NodeKind::Fork { paths, .. }) =
                        self.nodes.get(fork).map(|n| &n.kind)
                    {
                        if let Some(handler) = paths.get(*index).and_then(|p| p.handler.clone()) {
                            return Some((
                                handler,
                                HandlerOwner::ForkPath {
                                    fork: fork.clone(),
                                    index: *index,
                                },
                            ));
                        }
                    }
                    cursor = self.nodes.get(fork);
                }
                Enclosing::LoopBody { loop_node } => {
                    if let Some(NodeKind::Loop { handler, .. }) =
                        self.nodes.get(loop_node).map(|n| &n.kind)
                    {
                        if let Some(handler) = handler.clone() {
                            return Some((
                                handler,
                                HandlerOwner::LoopBody {
                                    loop_node: loop_node.clone(),
                                },
                            ));
                        }
                    }
                    cursor = self.nodes.get(loop_node);
                }
                Enclosing::BranchCase { branch } => {
                    cursor = self.nodes.get(branch);
                }
                Enclosing::ApprovalEscalation { approval }
                | Enclosing::ApprovalRejection { approval } => {
                    cursor = self.nodes.get(approval);
                }
                // A failure inside a handler does not re-enter handlers.
                Enclosing::Handler { .. } => return None,
                Enclosing::Top => break,
            }
        }
        self.handler
            .clone()
            .map(|handler| (handler, HandlerOwner::Workflow))
    }

    /// Ids of all step nodes, in compilation order
    pub fn step_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Step { .. }))
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
