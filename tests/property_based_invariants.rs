//! Property-based tests for the kernel's core invariants:
//!
//! - P1 (I2, single claimer): no two agents ever hold the same work item.
//! - P2 (I3, capacity bound): an agent never holds more active claims than
//!   its `max_concurrent_work`.
//! - P4 (I4, dependency gating): a blocked item never becomes claimable
//!   before every dependency has completed.
//!
//! and a crash-consistency scenario for S5/P9: a simulated crash between
//! a table's temp-file write and its atomic rename must leave the prior
//! snapshot fully intact, with no partial mutation observable.

use proptest::prelude::*;
use std::collections::BTreeSet;
use swarmsh::config::KernelConfig;
use swarmsh::kernel::{ClaimSelector, CoordinationKernel};
use swarmsh::model::{Priority, WorkStatus};

fn open_kernel() -> (tempfile::TempDir, CoordinationKernel) {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = CoordinationKernel::open(KernelConfig::for_dir(dir.path())).expect("open kernel");
    (dir, kernel)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// P1: for any number of competing agents racing over a fixed pool of
    /// work items, no work item is ever claimed by more than one agent.
    #[test]
    fn prop_no_work_item_is_ever_double_claimed(
        n_agents in 2usize..8,
        n_items in 1usize..12,
    ) {
        let (_dir, kernel) = open_kernel();
        let agents: Vec<String> = (0..n_agents)
            .map(|_| kernel.register("core".into(), "generalist".into(), Some(100), BTreeSet::new()).unwrap())
            .collect();
        for i in 0..n_items {
            kernel
                .claim(format!("job-{i}"), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None)
                .unwrap();
        }

        let mut claimed_ids = std::collections::HashMap::new();
        loop {
            let mut any_claimed = false;
            for agent in &agents {
                if let Ok(work_id) = kernel.claim_as(agent, ClaimSelector::default()) {
                    any_claimed = true;
                    let prior = claimed_ids.insert(work_id.clone(), agent.clone());
                    prop_assert!(prior.is_none(), "work item {} claimed twice", work_id);
                }
            }
            if !any_claimed {
                break;
            }
        }
    }

    /// P2: no agent ever holds more active ({claimed,in_progress}) items
    /// than its `max_concurrent_work`, regardless of how many pending
    /// items are available to pull.
    #[test]
    fn prop_agent_never_exceeds_its_capacity(
        max_concurrent in 1u32..5,
        n_items in 1usize..20,
    ) {
        let (_dir, kernel) = open_kernel();
        let agent = kernel.register("core".into(), "generalist".into(), Some(1_000), BTreeSet::new()).unwrap();
        kernel.mutator().with_table::<swarmsh::model::Agent, ()>(swarmsh::store::Table::Agents, |mut rows| {
            rows[0].max_concurrent_work = max_concurrent;
            Ok((rows, ()))
        }).unwrap();

        for i in 0..n_items {
            kernel
                .claim(format!("job-{i}"), "d".into(), Priority::Low, None, BTreeSet::new(), BTreeSet::new(), None)
                .unwrap();
        }

        let mut claimed = 0u32;
        loop {
            match kernel.claim_as(&agent, ClaimSelector::default()) {
                Ok(_) => claimed += 1,
                Err(_) => break,
            }
        }
        prop_assert!(claimed <= max_concurrent, "agent pulled {claimed} items past its cap of {max_concurrent}");

        let active = kernel
            .store()
            .read_work_claims()
            .unwrap()
            .iter()
            .filter(|w| w.claimed_by.as_deref() == Some(agent.as_str()) && w.status.is_active_claim())
            .count() as u32;
        prop_assert!(active <= max_concurrent);
    }

    /// P4: an item with dependencies is never claimable until every
    /// dependency has reached `completed`, for an arbitrary chain length.
    #[test]
    fn prop_dependent_item_unclaimable_until_all_dependencies_complete(chain_len in 1usize..6) {
        let (_dir, kernel) = open_kernel();
        let agent = kernel.register("core".into(), "generalist".into(), None, BTreeSet::new()).unwrap();

        let mut chain = Vec::new();
        let mut prev: Option<String> = None;
        for i in 0..chain_len {
            let deps = prev.iter().cloned().collect::<BTreeSet<_>>();
            let work_id = kernel
                .claim(format!("step-{i}"), "d".into(), Priority::Medium, None, BTreeSet::new(), deps, None)
                .unwrap();
            chain.push(work_id.clone());
            prev = Some(work_id);
        }

        for (i, work_id) in chain.iter().enumerate() {
            if i > 0 {
                let items = kernel.store().read_work_claims().unwrap();
                let item = items.iter().find(|w| &w.work_id == work_id).unwrap();
                prop_assert_eq!(item.status, WorkStatus::Blocked, "item {} should still be blocked", work_id);
            }
            let picked = kernel.claim_as(&agent, ClaimSelector::default()).unwrap();
            prop_assert_eq!(&picked, work_id, "agent should only be able to pick the next unblocked link");
            kernel.complete(&picked, &agent, "ok".into(), None).unwrap();
        }
    }
}

/// S5/P9: a crash between a table write's temp-file flush and its atomic
/// rename leaves the previous snapshot fully intact — no torn write, no
/// partially-applied mutation, and the failed operation surfaces an error
/// rather than silently succeeding.
#[test]
fn crash_before_rename_leaves_prior_snapshot_intact() {
    let (_dir, kernel) = open_kernel();
    let agent = kernel.register("core".into(), "generalist".into(), None, BTreeSet::new()).unwrap();
    let work_id = kernel
        .claim("job".into(), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None)
        .unwrap();
    kernel.claim_as(&agent, ClaimSelector::default()).unwrap();

    let before = kernel.store().read_work_claims().unwrap();
    let before_item = before.iter().find(|w| w.work_id == work_id).unwrap().clone();
    assert_eq!(before_item.status, WorkStatus::Claimed);

    kernel.store().arm_crash_before_next_rename();
    let err = kernel.complete(&work_id, &agent, "done".into(), None).unwrap_err();
    assert!(matches!(err, swarmsh::SwarmError::Io(_)));

    let after = kernel.store().read_work_claims().unwrap();
    let after_item = after.iter().find(|w| w.work_id == work_id).unwrap();
    assert_eq!(after_item.status, WorkStatus::Claimed, "crash mid-commit must not leave a torn write visible");
    assert_eq!(after_item.completed_at_ns, None);

    let spans = kernel.store().read_telemetry_spans().unwrap();
    assert!(
        spans.iter().all(|s| s.operation_name != "coordination.complete"),
        "no completion span should be recorded for a commit that never landed"
    );

    // The fault is one-shot: a retry of the same operation now succeeds.
    kernel.complete(&work_id, &agent, "done".into(), None).unwrap();
    let items = kernel.store().read_work_claims().unwrap();
    assert_eq!(items.iter().find(|w| w.work_id == work_id).unwrap().status, WorkStatus::Completed);
}
