//! 정합성 엔진 통합 테스트
//!
//! mock 커널 정책 테이블과 수동 clock으로 `PolicyTable`의 재동기화,
//! 재시도, graceful shutdown 동작을 검증합니다.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use xfrmguard_core::error::FatalReconciliationError;
use xfrmguard_policy_table::{
    Direction, GracefulShutdownPhase, PolicyAction, PolicyRule, PolicySelector, PolicyTable,
    XfrmMode, XfrmPolicy, XfrmProto, XfrmTemplate, host_net,
};

use mock::{ManualClock, MockKernel};

const REQ_ID: u32 = 50;

// Mock kernel policy table for integration tests
mod mock {
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::{Duration, Instant};

    use xfrmguard_core::clock::Clock;
    use xfrmguard_policy_table::{
        AddressFamily, PolicyTableError, XfrmConnector, XfrmHandle, XfrmPolicy,
    };

    #[derive(Debug, Default)]
    pub struct KernelState {
        pub policies: Vec<XfrmPolicy>,
        pub errors: HashMap<&'static str, usize>,
        pub handle_open: bool,
        pub connect_calls: usize,
        pub list_calls: usize,
        pub update_calls: usize,
        pub delete_calls: usize,
    }

    impl KernelState {
        fn next_error(&mut self, op: &'static str) -> Result<(), PolicyTableError> {
            match self.errors.get_mut(op) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(PolicyTableError::Kernel {
                        operation: op.to_owned(),
                        reason: format!("injected {op} failure"),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockKernel {
        state: Arc<Mutex<KernelState>>,
    }

    impl MockKernel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_policy(&self, policy: XfrmPolicy) {
            self.state().policies.push(policy);
        }

        pub fn queue_errors(&self, op: &'static str, count: usize) {
            *self.state().errors.entry(op).or_default() += count;
        }

        pub fn state(&self) -> MutexGuard<'_, KernelState> {
            self.state.lock().unwrap()
        }

        pub fn policies(&self) -> Vec<XfrmPolicy> {
            self.state().policies.clone()
        }

        /// 다른 에이전트의 커널 변경을 흉내냅니다.
        pub fn external_update(&self, policy: XfrmPolicy) {
            let mut handle = KernelHandle {
                state: Arc::clone(&self.state),
            };
            handle.update_policy(&policy).unwrap();
        }

        pub fn external_delete(&self, policy: &XfrmPolicy) {
            let mut handle = KernelHandle {
                state: Arc::clone(&self.state),
            };
            handle.delete_policy(policy).unwrap();
        }
    }

    impl XfrmConnector for MockKernel {
        type Handle = KernelHandle;

        fn connect(&self) -> Result<KernelHandle, PolicyTableError> {
            let mut state = self.state();
            state.connect_calls += 1;
            if let Err(e) = state.next_error("connect") {
                return Err(PolicyTableError::Connect(e.to_string()));
            }
            assert!(!state.handle_open, "new handle opened without closing previous one");
            state.handle_open = true;
            Ok(KernelHandle {
                state: Arc::clone(&self.state),
            })
        }
    }

    pub struct KernelHandle {
        state: Arc<Mutex<KernelState>>,
    }

    impl XfrmHandle for KernelHandle {
        fn list_policies(
            &mut self,
            family: AddressFamily,
        ) -> Result<Vec<XfrmPolicy>, PolicyTableError> {
            assert_eq!(family, AddressFamily::V4);
            let mut state = self.state.lock().unwrap();
            state.list_calls += 1;
            state.next_error("list")?;
            Ok(state.policies.clone())
        }

        fn update_policy(&mut self, policy: &XfrmPolicy) -> Result<(), PolicyTableError> {
            let mut state = self.state.lock().unwrap();
            state.update_calls += 1;
            state.next_error("update")?;
            assert_eq!(policy.templates.len(), 1, "policy must carry one template");
            match state.policies.iter_mut().find(|p| p.same_selector(policy)) {
                Some(existing) => *existing = policy.clone(),
                None => state.policies.push(policy.clone()),
            }
            Ok(())
        }

        fn delete_policy(&mut self, policy: &XfrmPolicy) -> Result<(), PolicyTableError> {
            let mut state = self.state.lock().unwrap();
            state.delete_calls += 1;
            state.next_error("delete")?;
            let before = state.policies.len();
            state.policies.retain(|p| !p.same_selector(policy));
            if state.policies.len() == before {
                return Err(PolicyTableError::Kernel {
                    operation: "delete".to_owned(),
                    reason: "policy not found".to_owned(),
                });
            }
            Ok(())
        }

        fn close(&mut self) {
            let mut state = self.state.lock().unwrap();
            assert!(state.handle_open, "handle closed while not open");
            state.handle_open = false;
        }
    }

    pub struct ManualClock {
        now: Cell<Instant>,
        pub slept: Cell<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Cell::new(Instant::now()),
                slept: Cell::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, d: Duration) {
            self.now.set(self.now.get() + d);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.now.get()
        }

        fn sleep(&self, duration: Duration) {
            self.slept.set(self.slept.get() + duration);
            self.advance(duration);
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn host1() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 1, 1)
}

fn host2() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 2, 1)
}

fn workload1() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 1, 2)
}

/// to-remote-host policy
fn sel1() -> PolicySelector {
    PolicySelector::new(Direction::Out)
        .with_dst(host_net(host1()))
        .with_mark(0x10, 0xf0)
}

fn rule1() -> PolicyRule {
    PolicyRule::allow(host1(), host2())
}

fn rule1_block() -> PolicyRule {
    PolicyRule::block()
}

/// from-remote-workload policy
fn sel2() -> PolicySelector {
    PolicySelector::new(Direction::Fwd).with_src(host_net(workload1()))
}

fn rule2() -> PolicyRule {
    PolicyRule::allow(host1(), host2())
}

fn kernel_policy(sel: PolicySelector, rule: PolicyRule) -> XfrmPolicy {
    XfrmPolicy::from_rule(&sel, Some(&rule), REQ_ID)
}

/// sel2/rule2 with an explicit zero CIDR instead of "any"
fn kernel_policy2_zero_cidr() -> XfrmPolicy {
    let mut policy = kernel_policy(sel2(), rule2());
    policy.dst = Some("0.0.0.0/0".parse::<Ipv4Net>().unwrap());
    policy
}

/// Looks like one of ours but carries another request id.
fn foreign_policy1() -> XfrmPolicy {
    XfrmPolicy {
        src: Some(host_net(host1())),
        dst: Some(host_net(host2())),
        dir: Direction::Out,
        mark: None,
        action: PolicyAction::Allow,
        templates: vec![XfrmTemplate {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            proto: XfrmProto::Esp,
            mode: XfrmMode::Transport,
            reqid: 101,
            optional: false,
        }],
    }
}

/// No templates at all.
fn foreign_policy2() -> XfrmPolicy {
    XfrmPolicy {
        src: Some(host_net(host1())),
        dst: Some(host_net(host2())),
        dir: Direction::Fwd,
        mark: None,
        action: PolicyAction::Allow,
        templates: Vec::new(),
    }
}

fn enabled_table<'a>(
    kernel: &MockKernel,
    clock: &'a ManualClock,
) -> PolicyTable<MockKernel, &'a ManualClock> {
    PolicyTable::with_shims(REQ_ID, true, false, kernel.clone(), clock)
}

fn disabled_table<'a>(
    kernel: &MockKernel,
    clock: &'a ManualClock,
) -> PolicyTable<MockKernel, &'a ManualClock> {
    PolicyTable::with_shims(REQ_ID, false, false, kernel.clone(), clock)
}

/// 순서와 무관하게 같은 정책 집합인지 확인합니다.
fn assert_policies(kernel: &MockKernel, expected: &[XfrmPolicy]) {
    let actual = kernel.policies();
    assert_eq!(actual.len(), expected.len(), "policies: {actual:#?}");
    for policy in expected {
        assert!(actual.contains(policy), "missing {policy} in {actual:#?}");
    }
}

// =============================================================================
// Empty kernel, IPsec enabled
// =============================================================================

#[test]
fn empty_kernel_resyncs_once_and_makes_no_updates() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.apply().unwrap();
    table.apply().unwrap();

    assert!(kernel.policies().is_empty());
    assert_eq!(kernel.state().list_calls, 1);
    assert_eq!(clock.slept.get(), Duration::ZERO);
}

#[test]
fn applies_a_pair_of_updates() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel1(), rule1());
    table.set_rule(sel2(), rule2());
    assert_eq!(kernel.state().update_calls, 0);
    table.apply().unwrap();

    assert_eq!(kernel.state().update_calls, 2);
    assert_policies(
        &kernel,
        &[kernel_policy(sel1(), rule1()), kernel_policy(sel2(), rule2())],
    );
    assert_eq!(table.active_policy_count(), 2);
}

#[test]
fn same_rule_twice_is_applied_once() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel1(), rule1());
    table.apply().unwrap();
    table.set_rule(sel1(), rule1());
    table.apply().unwrap();

    assert_eq!(kernel.state().update_calls, 1);
    assert_policies(&kernel, &[kernel_policy(sel1(), rule1())]);
}

#[test]
fn delete_before_apply_is_squashed() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel1(), rule1());
    table.delete_rule(sel1());
    table.apply().unwrap();

    assert_eq!(kernel.state().update_calls, 0);
    assert_eq!(kernel.state().delete_calls, 0);
    assert!(kernel.policies().is_empty());
}

#[test]
fn deletes_at_the_right_time_and_only_once() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel1(), rule1());
    table.apply().unwrap();
    table.delete_rule(sel1());
    assert_eq!(kernel.state().delete_calls, 0);

    table.apply().unwrap();
    table.apply().unwrap();

    assert_eq!(kernel.state().update_calls, 1);
    assert_eq!(kernel.state().delete_calls, 1);
    assert!(kernel.policies().is_empty());
    assert_eq!(table.active_policy_count(), 0);
}

// =============================================================================
// Transient and persistent failures per gateway operation
// =============================================================================

const OPERATIONS: [&str; 4] = ["connect", "list", "update", "delete"];

#[test]
fn transient_failures_are_retried() {
    for op in OPERATIONS {
        let kernel = MockKernel::new();
        let clock = ManualClock::new();
        let mut table = enabled_table(&kernel, &clock);
        kernel.queue_errors(op, 2);

        table.set_rule(sel1(), rule1());
        table.apply().unwrap_or_else(|e| panic!("{op}: {e}"));
        assert_policies(&kernel, &[kernel_policy(sel1(), rule1())]);

        table.delete_rule(sel1());
        table.apply().unwrap_or_else(|e| panic!("{op}: {e}"));
        assert!(kernel.policies().is_empty(), "{op}");

        assert!(
            clock.slept.get() >= Duration::from_millis(1),
            "{op}: expected at least one backoff"
        );
    }
}

#[test]
fn persistent_failures_are_fatal() {
    for op in OPERATIONS {
        let kernel = MockKernel::new();
        let clock = ManualClock::new();
        let mut table = enabled_table(&kernel, &clock);

        // 삭제할 정책을 준비
        table.set_rule(sel1(), rule1());
        table.apply().unwrap();

        kernel.queue_errors(op, 20);
        match op {
            // 핸들 재연결을 유발하기 위해 update 실패 하나를 추가
            "connect" => kernel.queue_errors("update", 1),
            // apply()가 list를 호출하도록 보장
            "list" => table.queue_resync(),
            _ => {}
        }

        table.delete_rule(sel1());
        table.set_rule(sel2(), rule2());
        let err = table.apply().expect_err(op);

        match op {
            "connect" => assert!(
                matches!(err, FatalReconciliationError::KernelConnect { attempts: 3, .. }),
                "{op}: {err}"
            ),
            _ => assert!(
                matches!(err, FatalReconciliationError::RetriesExhausted { attempts: 10, .. }),
                "{op}: {err}"
            ),
        }
        assert!(clock.slept.get() >= Duration::from_millis(1), "{op}");
    }
}

#[test]
fn persistent_update_failure_stops_after_exactly_ten_attempts() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    kernel.queue_errors("update", 20);

    table.set_rule(sel1(), rule1());
    let err = table.apply().unwrap_err();

    assert!(matches!(
        err,
        FatalReconciliationError::RetriesExhausted { attempts: 10, .. }
    ));
    assert!(err.to_string().contains("injected update failure"));
    assert_eq!(kernel.state().update_calls, 10);
    let slept = clock.slept.get();
    assert!(slept >= Duration::from_millis(1));
    assert!(slept < Duration::from_millis(1024));
}

#[test]
fn connect_exhaustion_gives_up_after_three_connects() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    kernel.queue_errors("connect", 100);

    table.set_rule(sel1(), rule1());
    let err = table.apply().unwrap_err();

    assert!(matches!(
        err,
        FatalReconciliationError::KernelConnect { attempts: 3, .. }
    ));
    assert_eq!(kernel.state().connect_calls, 3);
    assert_eq!(kernel.state().list_calls, 0);
    assert_eq!(clock.slept.get(), Duration::from_millis(200));
}

// =============================================================================
// Zero CIDR in the kernel
// =============================================================================

#[test]
fn zero_cidr_policy_without_pending_update_is_removed() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    kernel.add_policy(kernel_policy2_zero_cidr());
    let mut table = enabled_table(&kernel, &clock);

    table.apply().unwrap();
    assert!(kernel.policies().is_empty());
}

#[test]
fn zero_cidr_policy_squashes_matching_pending_update() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    kernel.add_policy(kernel_policy2_zero_cidr());
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel2(), rule2());
    table.apply().unwrap();

    assert_policies(&kernel, &[kernel_policy2_zero_cidr()]);
    assert_eq!(kernel.state().delete_calls, 0);
    assert_eq!(kernel.state().update_calls, 0);
}

#[test]
fn zero_cidr_selector_is_idempotent_across_resync() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    let zero = "0.0.0.0/0".parse::<Ipv4Net>().unwrap();
    let sel = sel2().with_dst(zero);
    assert_eq!(sel, sel2());

    table.set_rule(sel, rule2());
    table.apply().unwrap();
    table.queue_resync();
    table.apply().unwrap();
    table.set_rule(sel, rule2());
    table.apply().unwrap();

    assert_eq!(kernel.state().update_calls, 1);
    assert_eq!(table.pending_update_count(), 0);
    assert_eq!(table.active_rule(&sel), Some(&rule2()));
}

#[test]
fn zero_cidr_policy_can_be_deleted() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    kernel.add_policy(kernel_policy2_zero_cidr());
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel2(), rule2());
    table.apply().unwrap();
    table.delete_rule(sel2());
    table.apply().unwrap();

    assert!(kernel.policies().is_empty());
}

// =============================================================================
// Foreign policies and an unexpected policy of ours
// =============================================================================

fn kernel_with_foreign_and_stale() -> MockKernel {
    let kernel = MockKernel::new();
    kernel.add_policy(foreign_policy1());
    kernel.add_policy(foreign_policy2());
    kernel.add_policy(kernel_policy(sel1(), rule1()));
    kernel
}

#[test]
fn cleans_up_only_our_policy() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.apply().unwrap();
    table.apply().unwrap();

    assert_policies(&kernel, &[foreign_policy1(), foreign_policy2()]);
    assert_eq!(kernel.state().list_calls, 1);
}

#[test]
fn pending_policy_matching_kernel_is_left_untouched() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel1(), rule1());
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1())],
    );
    assert_eq!(kernel.state().list_calls, 1);
    assert_eq!(kernel.state().update_calls, 0);
}

#[test]
fn resync_with_matching_cache_changes_nothing() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    table.set_rule(sel1(), rule1());
    table.apply().unwrap();

    table.queue_resync();
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1())],
    );
    assert_eq!(kernel.state().list_calls, 2);
    assert_eq!(kernel.state().update_calls, 0);
}

#[test]
fn pending_policy_differing_from_kernel_is_updated() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel1(), rule1_block());
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1_block())],
    );
    assert_eq!(kernel.state().list_calls, 1);
    assert_eq!(kernel.state().update_calls, 1);
}

#[test]
fn pending_policy_after_first_apply_is_recreated() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.apply().unwrap();
    table.set_rule(sel1(), rule1_block());
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1_block())],
    );
    assert_eq!(kernel.state().list_calls, 1);
    assert_eq!(kernel.state().update_calls, 1);
}

#[test]
fn resync_repairs_externally_modified_policy() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    table.set_rule(sel1(), rule1());
    table.apply().unwrap();

    kernel.external_update(kernel_policy(sel1(), rule1_block()));
    table.queue_resync();
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1())],
    );
    assert_eq!(kernel.state().list_calls, 2);
    // 외부 변경 1회 + 복구 1회
    assert_eq!(kernel.state().update_calls, 2);
}

#[test]
fn resync_restores_externally_deleted_policy() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    table.set_rule(sel1(), rule1());
    table.apply().unwrap();

    kernel.external_delete(&kernel_policy(sel1(), rule1()));
    table.queue_resync();
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1())],
    );
    assert_eq!(kernel.state().list_calls, 2);
    assert_eq!(kernel.state().update_calls, 1);
}

#[test]
fn resync_squashes_pending_deletion_of_missing_policy() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    table.set_rule(sel1(), rule1());
    table.apply().unwrap();
    kernel.external_delete(&kernel_policy(sel1(), rule1()));

    table.delete_rule(sel1());
    table.queue_resync();
    table.apply().unwrap();

    assert_policies(&kernel, &[foreign_policy1(), foreign_policy2()]);
    assert_eq!(kernel.state().list_calls, 2);
    assert_eq!(kernel.state().update_calls, 0);
    // 외부 삭제 1회뿐
    assert_eq!(kernel.state().delete_calls, 1);
    assert!(!table.has_pending_deletion(&sel1()));
}

#[test]
fn resync_keeps_pending_update_for_missing_policy() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);
    table.set_rule(sel1(), rule1());
    table.apply().unwrap();
    kernel.external_delete(&kernel_policy(sel1(), rule1()));

    table.set_rule(sel1(), rule1_block());
    table.queue_resync();
    table.apply().unwrap();

    assert_policies(
        &kernel,
        &[foreign_policy1(), foreign_policy2(), kernel_policy(sel1(), rule1_block())],
    );
    assert_eq!(kernel.state().list_calls, 2);
    assert_eq!(kernel.state().update_calls, 1);
    assert_eq!(kernel.state().delete_calls, 1);
}

#[test]
fn foreign_policies_survive_every_operation() {
    let kernel = kernel_with_foreign_and_stale();
    let clock = ManualClock::new();
    let mut table = enabled_table(&kernel, &clock);

    table.set_rule(sel2(), rule2());
    table.apply().unwrap();
    table.delete_rule(sel2());
    table.queue_resync();
    table.apply().unwrap();

    let policies = kernel.policies();
    assert!(policies.contains(&foreign_policy1()));
    assert!(policies.contains(&foreign_policy2()));
}

// =============================================================================
// IPsec disabled: graceful shutdown phases
// =============================================================================

#[test]
fn disabled_with_empty_kernel_makes_no_updates() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = disabled_table(&kernel, &clock);

    table.apply().unwrap();
    assert!(kernel.policies().is_empty());
    assert_eq!(kernel.state().list_calls, 1);
    assert_eq!(clock.slept.get(), Duration::ZERO);
}

#[test]
fn disabled_walks_through_every_grace_phase() {
    let kernel = kernel_with_foreign_and_stale();
    kernel.add_policy(kernel_policy(sel2(), rule2()));
    let clock = ManualClock::new();
    let mut table = disabled_table(&kernel, &clock);

    // all-optional
    table.apply().unwrap();
    assert_policies(
        &kernel,
        &[
            foreign_policy1(),
            foreign_policy2(),
            kernel_policy(sel1(), rule1().with_optional(true)),
            kernel_policy(sel2(), rule2().with_optional(true)),
        ],
    );
    assert_eq!(kernel.state().list_calls, 1);
    table.apply().unwrap();
    assert_eq!(kernel.state().list_calls, 1);

    // remove-outbound
    clock.advance(Duration::from_secs(61));
    table.apply().unwrap();
    assert_policies(
        &kernel,
        &[
            foreign_policy1(),
            foreign_policy2(),
            kernel_policy(sel2(), rule2().with_optional(true)),
        ],
    );
    assert_eq!(kernel.state().list_calls, 2);
    table.apply().unwrap();
    assert_eq!(kernel.state().list_calls, 2);

    // remove-all
    clock.advance(Duration::from_secs(61));
    table.apply().unwrap();
    assert_policies(&kernel, &[foreign_policy1(), foreign_policy2()]);
    assert_eq!(kernel.state().list_calls, 3);
    table.apply().unwrap();
    assert_eq!(kernel.state().list_calls, 3);
    assert_eq!(table.active_policy_count(), 0);
}

#[test]
fn disabled_phase_is_monotonic() {
    let kernel = MockKernel::new();
    let clock = ManualClock::new();
    let mut table = disabled_table(&kernel, &clock);
    table.apply().unwrap();

    let mut seen = vec![table.calculate_graceful_shutdown_phase()];
    for _ in 0..30 {
        clock.advance(Duration::from_secs(5));
        let phase = table.calculate_graceful_shutdown_phase();
        assert!(phase >= *seen.last().unwrap());
        if Some(&phase) != seen.last() {
            seen.push(phase);
        }
    }
    assert_eq!(
        seen,
        vec![
            GracefulShutdownPhase::AllOptional,
            GracefulShutdownPhase::RemoveOutbound,
            GracefulShutdownPhase::RemoveAll,
        ]
    );
}

// =============================================================================
// Pending-state invariant
// =============================================================================

mod pending_invariant {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Set(usize, bool),
        Delete(usize),
        Apply,
        Resync,
    }

    fn selectors() -> Vec<PolicySelector> {
        vec![
            sel1(),
            sel2(),
            PolicySelector::new(Direction::In)
                .with_src(host_net(workload1()))
                .with_dst(host_net(host1())),
            PolicySelector::new(Direction::Out).with_dst(host_net(workload1())),
        ]
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, any::<bool>()).prop_map(|(i, block)| Op::Set(i, block)),
            (0..4usize).prop_map(Op::Delete),
            Just(Op::Apply),
            Just(Op::Resync),
        ]
    }

    proptest! {
        #[test]
        fn selector_is_never_pending_both_ways(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let kernel = MockKernel::new();
            let clock = ManualClock::new();
            let mut table = enabled_table(&kernel, &clock);
            let sels = selectors();

            for op in ops {
                match op {
                    Op::Set(i, block) => {
                        let rule = if block { rule1_block() } else { rule1() };
                        table.set_rule(sels[i], rule);
                    }
                    Op::Delete(i) => table.delete_rule(sels[i]),
                    Op::Apply => table.apply().unwrap(),
                    Op::Resync => table.queue_resync(),
                }
                for sel in &sels {
                    prop_assert!(!(table.has_pending_update(sel) && table.has_pending_deletion(sel)));
                }
            }

            table.apply().unwrap();
            prop_assert_eq!(table.pending_update_count(), 0);
            prop_assert_eq!(table.pending_deletion_count(), 0);
            prop_assert_eq!(table.active_policy_count(), kernel.policies().len());
        }
    }
}
