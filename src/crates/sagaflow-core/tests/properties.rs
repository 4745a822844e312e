//! Property tests for the reducer and budget laws

use proptest::prelude::*;
use serde_json::json;

use sagaflow_core::budget::{self, BudgetDimensions};
use sagaflow_core::state::{FieldShape, MergeRule, StateSchema, StateUpdate, WorkflowState};

fn schema() -> StateSchema {
    let mut schema = StateSchema::new("props");
    schema
        .add_field("logs", FieldShape::Sequence, MergeRule::Append)
        .unwrap();
    schema
        .add_field("meta", FieldShape::Mapping, MergeRule::Merge)
        .unwrap();
    schema
        .add_field("status", FieldShape::Scalar, MergeRule::Replace)
        .unwrap();
    schema
}

fn arb_update() -> impl Strategy<Value = StateUpdate> {
    (
        proptest::option::of(proptest::collection::vec("[a-z]{1,4}", 0..4)),
        proptest::option::of(proptest::collection::btree_map("[a-z]{1,3}", 0..50i64, 0..4)),
        proptest::option::of("[a-z]{1,6}"),
    )
        .prop_map(|(logs, meta, status)| {
            let mut update = StateUpdate::new();
            if let Some(logs) = logs {
                update.insert("logs", json!(logs));
            }
            if let Some(meta) = meta {
                update.insert("meta", json!(meta));
            }
            if let Some(status) = status {
                update.insert("status", json!(status));
            }
            update
        })
}

fn arb_state() -> impl Strategy<Value = WorkflowState> {
    arb_update().prop_map(|update| {
        let schema = schema();
        let empty = WorkflowState::empty("wf");
        schema.reduce(&empty, &update).unwrap()
    })
}

proptest! {
    #[test]
    fn reduce_with_empty_update_is_identity(state in arb_state()) {
        let schema = schema();
        let next = schema.reduce(&state, &StateUpdate::new()).unwrap();
        prop_assert_eq!(next, state);
    }

    #[test]
    fn reduce_never_touches_input_state(state in arb_state(), update in arb_update()) {
        let schema = schema();
        let before = state.clone();
        let _ = schema.reduce(&state, &update).unwrap();
        prop_assert_eq!(state, before);
    }

    #[test]
    fn combine_replays_as_single_reduction(
        state in arb_state(),
        u1 in arb_update(),
        u2 in arb_update(),
    ) {
        let schema = schema();
        let sequential = schema
            .reduce(&schema.reduce(&state, &u1).unwrap(), &u2)
            .unwrap();
        let combined = schema
            .reduce(&state, &schema.combine(&u1, &u2).unwrap())
            .unwrap();
        prop_assert_eq!(sequential, combined);
    }

    #[test]
    fn combine_is_associative_over_updates(
        state in arb_state(),
        u1 in arb_update(),
        u2 in arb_update(),
        u3 in arb_update(),
    ) {
        let schema = schema();
        let left = schema
            .combine(&schema.combine(&u1, &u2).unwrap(), &u3)
            .unwrap();
        let right = schema
            .combine(&u1, &schema.combine(&u2, &u3).unwrap())
            .unwrap();
        prop_assert_eq!(
            schema.reduce(&state, &left).unwrap(),
            schema.reduce(&state, &right).unwrap()
        );
    }
}

fn arb_dims() -> impl Strategy<Value = BudgetDimensions> {
    (0..64u64, 0..4096u64, 0..64u64, 0..64u64, 0..512u64).prop_map(
        |(steps, tokens, executions, tool_calls, wall_seconds)| BudgetDimensions {
            steps,
            tokens,
            executions,
            tool_calls,
            wall_seconds,
        },
    )
}

proptest! {
    #[test]
    fn reservation_is_all_or_nothing(allocation in arb_dims(), request in arb_dims()) {
        let mut remaining = allocation;
        match budget::reserve(&mut remaining, &request) {
            Ok(reserved) => {
                prop_assert_eq!(reserved, request);
                prop_assert_eq!(remaining.steps, allocation.steps - request.steps);
                prop_assert_eq!(remaining.tokens, allocation.tokens - request.tokens);
                prop_assert_eq!(remaining.executions, allocation.executions - request.executions);
                prop_assert_eq!(remaining.tool_calls, allocation.tool_calls - request.tool_calls);
                prop_assert_eq!(
                    remaining.wall_seconds,
                    allocation.wall_seconds - request.wall_seconds
                );
            }
            Err(_) => {
                // A failed reservation consumes nothing in any dimension.
                prop_assert_eq!(remaining, allocation);
            }
        }
    }

    #[test]
    fn reserve_then_full_refund_restores_allocation(
        allocation in arb_dims(),
        request in arb_dims(),
    ) {
        let mut remaining = allocation;
        if let Ok(reserved) = budget::reserve(&mut remaining, &request) {
            budget::refund(&mut remaining, &reserved);
            prop_assert_eq!(remaining, allocation);
        }
    }

    #[test]
    fn commit_settles_to_allocation_minus_actual(
        allocation in arb_dims(),
        request in arb_dims(),
        actual in arb_dims(),
    ) {
        let mut remaining = allocation;
        if let Ok(reserved) = budget::reserve(&mut remaining, &request) {
            budget::commit(&mut remaining, &reserved, &actual);
            // Refunding the unused part and draining overage settles every
            // dimension to allocation minus actual usage, floored at zero.
            prop_assert_eq!(remaining, allocation.saturating_sub(&actual));
        }
    }
}
