//! 정책 정합성 엔진 (`PolicyTable`)
//!
//! 원하는 상태(selector → rule)와 대기 중인 변경을 추적하고, [`PolicyTable::apply`]가
//! 커널 정책 테이블과 재동기화한 뒤 변경을 적용합니다.
//!
//! # 상태
//! - `selector_to_rule`: 커널에 이미 올바르게 존재한다고 믿는 정책
//! - `pending_rule_updates`: 커널에 밀어넣어야 하는 정책
//! - `pending_deletions`: 커널에서 제거해야 하는 selector
//!
//! 한 selector는 `pending_rule_updates`와 `pending_deletions`에 동시에 존재하지 않습니다.
//!
//! # 재시도
//! `apply()`는 최대 10번 시도하며, 실패한 시도 사이에 1ms부터 두 배씩 늘어나는
//! backoff로 대기합니다. 모두 실패하면 상태를 로그로 덤프하고
//! [`FatalReconciliationError`]를 반환합니다.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};
use xfrmguard_core::clock::{Clock, SystemClock};
use xfrmguard_core::error::FatalReconciliationError;
use xfrmguard_core::metrics as m;

use crate::error::PolicyTableError;
use crate::grace::{GraceTimes, GracefulShutdownPhase};
use crate::kernel::{AddressFamily, XfrmConnector, XfrmHandle, XfrmPolicy};
use crate::model::{PolicyRule, PolicySelector};
use crate::netlink::NetlinkXfrmConnector;
use crate::store::PolicyStore;

/// `apply()` 최대 시도 횟수
pub const MAX_APPLY_ATTEMPTS: u32 = 10;

/// 첫 재시도 전 대기 시간 (시도마다 두 배)
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1);

/// 커널 핸들 연결 최대 시도 횟수
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// 커널 핸들 연결 재시도 간격
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 한 번의 시도 안에서 발생한 실패
enum AttemptError {
    /// 재시도로 복구 가능
    Transient(PolicyTableError),
    /// 즉시 중단
    Fatal(FatalReconciliationError),
}

impl From<FatalReconciliationError> for AttemptError {
    fn from(err: FatalReconciliationError) -> Self {
        Self::Fatal(err)
    }
}

/// 커널 XFRM 정책 정합성 엔진
///
/// 단일 스레드에서 호출하는 것을 전제로 합니다. 커널 핸들은 이 구조체가
/// 독점하며 처음 사용할 때 열고, 호출이 실패하면 닫은 뒤 다시 엽니다.
pub struct PolicyTable<C: XfrmConnector = NetlinkXfrmConnector, K: Clock = SystemClock> {
    req_id: u32,
    ipsec_enabled: bool,
    grace_times: GraceTimes,
    first_apply: Option<Instant>,
    grace_phase: GracefulShutdownPhase,
    resync_required: bool,

    pending_rule_updates: HashMap<PolicySelector, PolicyRule>,
    pending_deletions: HashSet<PolicySelector>,
    selector_to_rule: HashMap<PolicySelector, PolicyRule>,

    connector: C,
    handle: Option<C::Handle>,
    clock: K,
}

impl PolicyTable {
    /// NETLINK_XFRM 게이트웨이와 시스템 시간을 사용하는 테이블을 생성합니다.
    pub fn new(req_id: u32, ipsec_enabled: bool, use_short_grace_time: bool) -> Self {
        Self::with_shims(
            req_id,
            ipsec_enabled,
            use_short_grace_time,
            NetlinkXfrmConnector,
            SystemClock,
        )
    }
}

impl<C: XfrmConnector, K: Clock> PolicyTable<C, K> {
    /// 게이트웨이 connector와 clock을 주입하여 생성합니다.
    pub fn with_shims(
        req_id: u32,
        ipsec_enabled: bool,
        use_short_grace_time: bool,
        connector: C,
        clock: K,
    ) -> Self {
        Self {
            req_id,
            ipsec_enabled,
            grace_times: GraceTimes::new(use_short_grace_time),
            first_apply: None,
            grace_phase: GracefulShutdownPhase::None,
            resync_required: true,
            pending_rule_updates: HashMap::new(),
            pending_deletions: HashSet::new(),
            selector_to_rule: HashMap::new(),
            connector,
            handle: None,
            clock,
        }
    }

    /// 다음 `apply()`가 커널 목록으로 재동기화하도록 강제합니다.
    pub fn queue_resync(&mut self) {
        self.resync_required = true;
    }

    /// `sel`에 `rule`을 원합니다.
    ///
    /// 이미 커널에 같은 rule이 있다고 믿으면 아무 일도 하지 않습니다.
    /// IPsec이 비활성화된 상태에서의 호출은 에러 로그 후 무시합니다.
    pub fn set_rule(&mut self, sel: PolicySelector, rule: PolicyRule) {
        if !self.ipsec_enabled {
            error!(selector = %sel, "unexpected call to set_rule() when IPsec is disabled");
            return;
        }
        self.pending_deletions.remove(&sel);
        self.pending_rule_updates.remove(&sel);

        if self.selector_to_rule.get(&sel) == Some(&rule) {
            debug!(selector = %sel, rule = %rule, "ignoring no-op update to IPsec rule");
            return;
        }

        debug!(selector = %sel, rule = %rule, "queueing update of IPsec rule");
        self.pending_rule_updates.insert(sel, rule);
    }

    /// `sel`에 정책이 없기를 원합니다.
    ///
    /// 커널에 존재한다고 믿지 않는 selector면 아무 일도 하지 않습니다.
    pub fn delete_rule(&mut self, sel: PolicySelector) {
        if !self.ipsec_enabled {
            error!(selector = %sel, "unexpected call to delete_rule() when IPsec is disabled");
            return;
        }
        self.pending_deletions.remove(&sel);
        self.pending_rule_updates.remove(&sel);

        if !self.selector_to_rule.contains_key(&sel) {
            debug!(selector = %sel, "ignoring no-op delete of IPsec rule");
            return;
        }

        debug!(selector = %sel, "queueing delete of IPsec rule");
        self.pending_deletions.insert(sel);
    }

    /// 현재 시각 기준 graceful shutdown 단계
    ///
    /// 첫 `apply()` 전에는 경과 시간을 무한대로 보므로, IPsec이 비활성화된
    /// 테이블은 [`GracefulShutdownPhase::RemoveAll`]을 반환합니다.
    pub fn calculate_graceful_shutdown_phase(&self) -> GracefulShutdownPhase {
        let elapsed = self.first_apply.map_or(Duration::MAX, |first| {
            self.clock.now().saturating_duration_since(first)
        });
        GracefulShutdownPhase::for_elapsed(self.ipsec_enabled, elapsed, self.grace_times)
    }

    /// 커널을 원하는 상태로 수렴시킵니다.
    ///
    /// 필요하면 재동기화한 뒤 대기 중인 삭제, 그 다음 갱신을 적용합니다.
    /// 실패한 시도 사이에는 backoff로 대기하며, [`MAX_APPLY_ATTEMPTS`]번 모두
    /// 실패하거나 커널 핸들을 열 수 없으면 상태를 덤프하고 치명적 에러를 반환합니다.
    pub fn apply(&mut self) -> Result<(), FatalReconciliationError> {
        let result = self.apply_with_retries();
        if let Err(e) = &result {
            error!(error = %e, "failed to update IPsec policies, dumping state");
            // 연결 재시도를 이미 모두 소진했으면 커널 목록은 건너뜀
            let list_kernel = !matches!(e, FatalReconciliationError::KernelConnect { .. });
            self.dump_state(list_kernel);
        }
        gauge!(m::IPSEC_POLICIES_ACTIVE).set(self.selector_to_rule.len() as f64);
        result
    }

    fn apply_with_retries(&mut self) -> Result<(), FatalReconciliationError> {
        if self.first_apply.is_none() {
            self.first_apply = Some(self.clock.now());
        }

        let phase = self.calculate_graceful_shutdown_phase();
        if phase != self.grace_phase {
            info!(
                old_phase = %self.grace_phase,
                new_phase = %phase,
                "IPsec disabled, entering new cleanup phase"
            );
            self.resync_required = true;
            self.grace_phase = phase;
            gauge!(m::IPSEC_GRACE_PHASE).set(f64::from(phase.index()));
        }

        let mut retry_delay = INITIAL_RETRY_DELAY;
        let mut last_error = None;
        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            if attempt > 1 {
                warn!(
                    attempt,
                    backoff_ms = u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying after an IPsec policy update failure"
                );
                self.clock.sleep(retry_delay);
                retry_delay *= 2;
            }

            match self.try_apply_once() {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    counter!(m::IPSEC_ERRORS_TOTAL, m::LABEL_OPERATION => e.operation().to_owned())
                        .increment(1);
                    last_error = Some(e);
                }
            }
        }

        Err(FatalReconciliationError::RetriesExhausted {
            attempts: MAX_APPLY_ATTEMPTS,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn try_apply_once(&mut self) -> Result<(), AttemptError> {
        if self.resync_required {
            debug!("resyncing IPsec policies with the kernel");
            let num_problems = self.try_resync()?;
            if num_problems > 0 {
                info!(num_problems, "found inconsistencies in kernel IPsec policies");
            }
            self.resync_required = false;
        }

        if let Err(e) = self.try_updates() {
            if let AttemptError::Transient(e) = &e {
                warn!(error = %e, "failed to update IPsec policies, marking for resync");
            }
            self.resync_required = true;
            return Err(e);
        }
        Ok(())
    }

    /// 커널 목록을 기준으로 대기 중인 변경을 다시 계산합니다.
    ///
    /// 반환값은 발견된 불일치 수입니다.
    fn try_resync(&mut self) -> Result<usize, AttemptError> {
        let listing = match self.handle()?.list_policies(AddressFamily::V4) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "failed to list kernel IPsec policies");
                self.close_handle();
                return Err(AttemptError::Transient(e));
            }
        };

        let phase = self.grace_phase;
        let mut expected = match phase {
            GracefulShutdownPhase::None => self.selector_to_rule.clone(),
            _ => HashMap::new(),
        };
        let mut actual = HashMap::with_capacity(listing.len());
        let mut num_problems = 0usize;
        let mut logged_delete = false;
        let mut logged_repair = false;

        for policy in &listing {
            let Some((sel, rule)) = policy.decode_owned(self.req_id) else {
                continue;
            };
            actual.insert(sel, rule);

            let expected_rule = match phase {
                GracefulShutdownPhase::None => expected.remove(&sel),
                _ => phase.expected_rule(&sel, &rule),
            };

            if let Some(pending) = self.pending_rule_updates.get(&sel) {
                if *pending == rule {
                    debug!(selector = %sel, "resync: pending policy already in place, skipping update");
                    self.pending_rule_updates.remove(&sel);
                }
                continue;
            }
            if self.pending_deletions.contains(&sel) {
                continue;
            }

            match expected_rule {
                None => {
                    if logged_delete {
                        debug!(selector = %sel, "resync: queueing deletion of unexpected policy");
                    } else {
                        warn!(
                            selector = %sel,
                            "resync: queueing deletion of unexpected policy (further occurrences at debug)"
                        );
                        logged_delete = true;
                    }
                    num_problems += 1;
                    self.pending_deletions.insert(sel);
                }
                Some(expected_rule) if expected_rule == rule => {}
                Some(expected_rule) => {
                    if phase == GracefulShutdownPhase::None && !logged_repair {
                        warn!(
                            selector = %sel,
                            found = %rule,
                            expected = %expected_rule,
                            "resync: found incorrect policy in kernel, queueing a repair (further occurrences at debug)"
                        );
                        logged_repair = true;
                    } else {
                        debug!(selector = %sel, rule = %expected_rule, "resync: queueing repair");
                    }
                    num_problems += 1;
                    self.pending_rule_updates.insert(sel, expected_rule);
                }
            }
        }

        let mut logged_replace = false;
        for (sel, rule) in expected {
            if self.pending_rule_updates.contains_key(&sel) {
                continue;
            }
            if self.pending_deletions.remove(&sel) {
                debug!(selector = %sel, "resync: pending deletion had already been done");
                continue;
            }
            if logged_replace {
                debug!(selector = %sel, rule = %rule, "resync: queueing replacement of missing policy");
            } else {
                warn!(
                    selector = %sel,
                    rule = %rule,
                    "resync: found policy missing from kernel, queueing a replacement (further occurrences at debug)"
                );
                logged_replace = true;
            }
            num_problems += 1;
            self.pending_rule_updates.insert(sel, rule);
        }

        // 커널에 없는 selector는 삭제할 것이 없음
        self.pending_deletions.retain(|sel| actual.contains_key(sel));
        self.selector_to_rule = actual;

        counter!(m::IPSEC_RESYNCS_TOTAL).increment(1);
        if num_problems > 0 {
            counter!(m::IPSEC_RESYNC_PROBLEMS_TOTAL).increment(num_problems as u64);
        }
        Ok(num_problems)
    }

    /// 대기 중인 삭제, 그 다음 갱신을 커널에 적용합니다.
    ///
    /// 실패해도 나머지 변경을 계속 시도하고 마지막 에러를 반환합니다.
    fn try_updates(&mut self) -> Result<(), AttemptError> {
        let mut last_error = None;

        if !self.pending_deletions.is_empty() {
            info!(num_deletions = self.pending_deletions.len(), "applying IPsec policy deletions");
        }
        let deletions: Vec<PolicySelector> = self.pending_deletions.iter().copied().collect();
        for sel in deletions {
            let policy = XfrmPolicy::from_rule(&sel, self.selector_to_rule.get(&sel), self.req_id);
            debug!(selector = %sel, policy = %policy, "deleting IPsec policy");
            match self.handle()?.delete_policy(&policy) {
                Ok(()) => {
                    self.selector_to_rule.remove(&sel);
                    self.pending_deletions.remove(&sel);
                }
                Err(e) => {
                    error!(policy = %policy, error = %e, "failed to remove IPsec policy");
                    self.close_handle();
                    last_error = Some(e);
                }
            }
        }

        if !self.pending_rule_updates.is_empty() {
            info!(num_updates = self.pending_rule_updates.len(), "applying IPsec policy updates");
        }
        let updates: Vec<(PolicySelector, PolicyRule)> = self
            .pending_rule_updates
            .iter()
            .map(|(sel, rule)| (*sel, *rule))
            .collect();
        for (sel, rule) in updates {
            let policy = XfrmPolicy::from_rule(&sel, Some(&rule), self.req_id);
            debug!(selector = %sel, rule = %rule, policy = %policy, "updating IPsec policy");
            match self.handle()?.update_policy(&policy) {
                Ok(()) => {
                    self.selector_to_rule.insert(sel, rule);
                    self.pending_rule_updates.remove(&sel);
                }
                Err(e) => {
                    error!(policy = %policy, error = %e, "failed to update IPsec policy");
                    self.close_handle();
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(AttemptError::Transient(e)),
            None => Ok(()),
        }
    }

    /// 원하는 상태, 대기 중인 변경, 커널 정책 목록을 info 레벨로 기록합니다.
    ///
    /// 진단용이며 실패해도 에러를 반환하지 않습니다.
    pub fn dump_state_to_log(&mut self) {
        self.dump_state(true);
    }

    fn dump_state(&mut self, list_kernel: bool) {
        info!(
            grace_phase = %self.grace_phase,
            resync_required = self.resync_required,
            "dumping internal IPsec state"
        );
        for (sel, rule) in &self.selector_to_rule {
            info!(selector = %sel, rule = %rule, "expected policy");
        }
        for (sel, rule) in &self.pending_rule_updates {
            info!(selector = %sel, rule = %rule, "pending policy update");
        }
        for sel in &self.pending_deletions {
            info!(selector = %sel, "pending deletion");
        }

        if !list_kernel {
            return;
        }
        let listing = match self.handle() {
            Ok(handle) => handle.list_policies(AddressFamily::V4),
            Err(e) => {
                error!(error = %e, "failed to connect to the kernel policy table");
                return;
            }
        };
        match listing {
            Ok(policies) => {
                for policy in policies {
                    info!(policy = %policy, "kernel policy");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to read XFRM policies from kernel");
                self.close_handle();
            }
        }
    }

    fn handle(&mut self) -> Result<&mut C::Handle, FatalReconciliationError> {
        if self.handle.is_none() {
            let handle = self.connect_with_retry()?;
            self.handle = Some(handle);
        }
        self.handle.as_mut().ok_or_else(|| {
            FatalReconciliationError::InvariantViolation("kernel handle missing after connect".to_owned())
        })
    }

    fn connect_with_retry(&self) -> Result<C::Handle, FatalReconciliationError> {
        let mut last_error = None;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if attempt > 1 {
                self.clock.sleep(CONNECT_RETRY_DELAY);
            }
            match self.connector.connect() {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(attempt, error = %e, "failed to connect to the kernel policy table");
                    counter!(m::IPSEC_ERRORS_TOTAL, m::LABEL_OPERATION => e.operation().to_owned())
                        .increment(1);
                    last_error = Some(e);
                }
            }
        }
        Err(FatalReconciliationError::KernelConnect {
            attempts: MAX_CONNECT_ATTEMPTS,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn close_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }

    /// 커널에 존재한다고 믿는 정책 수
    pub fn active_policy_count(&self) -> usize {
        self.selector_to_rule.len()
    }

    /// 커널에 존재한다고 믿는 `sel`의 rule
    pub fn active_rule(&self, sel: &PolicySelector) -> Option<&PolicyRule> {
        self.selector_to_rule.get(sel)
    }

    pub fn pending_update_count(&self) -> usize {
        self.pending_rule_updates.len()
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.pending_deletions.len()
    }

    pub fn has_pending_update(&self, sel: &PolicySelector) -> bool {
        self.pending_rule_updates.contains_key(sel)
    }

    pub fn has_pending_deletion(&self, sel: &PolicySelector) -> bool {
        self.pending_deletions.contains(sel)
    }

    /// 마지막 `apply()`에서 관측한 graceful shutdown 단계
    pub fn graceful_shutdown_phase(&self) -> GracefulShutdownPhase {
        self.grace_phase
    }

    pub fn ipsec_enabled(&self) -> bool {
        self.ipsec_enabled
    }

    pub fn req_id(&self) -> u32 {
        self.req_id
    }
}

impl<C: XfrmConnector, K: Clock> PolicyStore for PolicyTable<C, K> {
    fn set_rule(&mut self, sel: PolicySelector, rule: PolicyRule) {
        PolicyTable::set_rule(self, sel, rule);
    }

    fn delete_rule(&mut self, sel: PolicySelector) {
        PolicyTable::delete_rule(self, sel);
    }
}

impl<C: XfrmConnector, K: Clock> Drop for PolicyTable<C, K> {
    fn drop(&mut self) {
        self.close_handle();
    }
}
