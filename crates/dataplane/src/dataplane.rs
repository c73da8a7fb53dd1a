//! 터널/바인딩 레이어 (`Dataplane`)
//!
//! 원격 터널과 그 뒤의 워크로드 바인딩을 참조 카운트 맵으로 관리하고,
//! 각 변경을 selector/rule 쌍으로 변환해 [`PolicyStore`]에 전달합니다.
//! 터널 추가/제거는 IKE 데몬의 키와 연결도 함께 관리합니다.
//!
//! # 설치되는 정책 (원격 R, 로컬 L, 워크로드 W)
//!
//! | 작업 | selector | 터널 |
//! |---|---|---|
//! | 터널 | `src R/32, fwd` | R → L |
//! | 터널 | `dst R/32, out, mark fwd/fwd` | L → R |
//! | 바인딩 | `src W/32, fwd` | R → L |
//! | 바인딩 | `src W/32 dst L/32, in` | R → L |
//! | 바인딩 | `dst W/32, out` | L → R |
//! | 블랙리스트 | `src W` in/fwd, `dst W` out/fwd | block |
//!
//! 로컬 주소와 같은 터널은 IKE 설정과 정책 설치를 모두 건너뜁니다.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use metrics::gauge;
use tracing::{debug, info, warn};
use xfrmguard_core::clock::{Clock, SystemClock};
use xfrmguard_core::error::FatalReconciliationError;
use xfrmguard_core::metrics as m;
use xfrmguard_policy_table::{Direction, PolicyRule, PolicySelector, PolicyStore, host_net};

use crate::config::DataplaneConfig;
use crate::ike::{IkeDaemon, PresharedKey};

/// 로컬 키 로딩 최대 시도 횟수
pub const MAX_KEY_LOAD_ATTEMPTS: u32 = 10;

/// 로컬 키 로딩 재시도 간격
pub const KEY_LOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 터널/바인딩 레이어
///
/// 단일 제어 루프 스레드에서 호출하는 것을 전제로 합니다. 정책은 store에
/// 대기열로만 쌓이며, 커널 반영은 store 소유자(보통 [`PolicyTable::apply`])의 몫입니다.
///
/// [`PolicyTable::apply`]: xfrmguard_policy_table::PolicyTable::apply
pub struct Dataplane<P: PolicyStore, I: IkeDaemon, K: Clock = SystemClock> {
    config: DataplaneConfig,
    preshared_key: PresharedKey,
    tunnel_to_workloads: HashMap<Ipv4Addr, HashSet<Ipv4Addr>>,
    policies: P,
    ike: I,
    clock: K,
}

impl<P: PolicyStore, I: IkeDaemon> Dataplane<P, I> {
    /// 시스템 시간을 사용하는 데이터플레인을 생성합니다.
    ///
    /// 로컬 호스트의 키를 IKE 데몬에 즉시 로딩합니다.
    pub fn new(
        config: DataplaneConfig,
        preshared_key: PresharedKey,
        policies: P,
        ike: I,
    ) -> Result<Self, FatalReconciliationError> {
        Self::with_clock(config, preshared_key, policies, ike, SystemClock)
    }
}

impl<P: PolicyStore, I: IkeDaemon, K: Clock> Dataplane<P, I, K> {
    /// clock을 주입하여 생성합니다.
    ///
    /// forward mark가 0이면 [`FatalReconciliationError::Misconfiguration`],
    /// 로컬 키 로딩이 [`MAX_KEY_LOAD_ATTEMPTS`]번 모두 실패하면
    /// [`FatalReconciliationError::IkeDaemon`]을 반환합니다.
    pub fn with_clock(
        config: DataplaneConfig,
        preshared_key: PresharedKey,
        policies: P,
        ike: I,
        clock: K,
    ) -> Result<Self, FatalReconciliationError> {
        if config.forward_mark == 0 {
            return Err(FatalReconciliationError::Misconfiguration {
                field: "forward_mark".to_owned(),
                reason: "IPsec forward mark must be non-zero".to_owned(),
            });
        }

        let mut dataplane = Self {
            config,
            preshared_key,
            tunnel_to_workloads: HashMap::new(),
            policies,
            ike,
            clock,
        };
        dataplane.load_local_key()?;
        dataplane.update_gauges();
        Ok(dataplane)
    }

    fn load_local_key(&mut self) -> Result<(), FatalReconciliationError> {
        let local = self.config.local_tunnel_addr;
        let mut last_error = None;
        for attempt in 1..=MAX_KEY_LOAD_ATTEMPTS {
            if attempt > 1 {
                self.clock.sleep(KEY_LOAD_RETRY_DELAY);
            }
            match self.ike.load_shared_key(local, &self.preshared_key) {
                Ok(()) => {
                    info!(local_addr = %local, attempt, "loaded local IPsec pre-shared key");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        local_addr = %local,
                        attempt,
                        error = %e,
                        "failed to load local IPsec pre-shared key, will retry"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(ike_fatal(
            "load-shared-key",
            local,
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// `remote`로 가는 터널을 추가합니다.
    ///
    /// 이미 존재하는 터널이면 치명적 에러입니다. IKE 호출 실패도 즉시 치명적입니다.
    pub fn add_tunnel(&mut self, remote: Ipv4Addr) -> Result<(), FatalReconciliationError> {
        if self.tunnel_to_workloads.contains_key(&remote) {
            return Err(FatalReconciliationError::InvariantViolation(format!(
                "IPsec tunnel to {remote} already exists"
            )));
        }
        let local = self.config.local_tunnel_addr;
        info!(remote_addr = %remote, "adding IPsec tunnel");

        if remote != local {
            self.ike
                .load_shared_key(remote, &self.preshared_key)
                .map_err(|e| ike_fatal("load-shared-key", remote, e.to_string()))?;
            self.ike
                .load_connection(local, remote)
                .map_err(|e| ike_fatal("load-connection", remote, e.to_string()))?;
        }

        self.tunnel_to_workloads.insert(remote, HashSet::new());

        if remote != local {
            self.policies
                .set_rule(tunnel_fwd_selector(remote), self.reversed_rule(remote));
            self.policies.set_rule(
                tunnel_out_selector(remote, self.config.forward_mark),
                self.forward_rule(remote),
            );
        }
        self.update_gauges();
        Ok(())
    }

    /// `remote`로 가는 터널을 제거합니다.
    ///
    /// 바인딩이 남아 있거나 알 수 없는 터널이면 치명적 에러입니다.
    pub fn remove_tunnel(&mut self, remote: Ipv4Addr) -> Result<(), FatalReconciliationError> {
        match self.tunnel_to_workloads.get(&remote) {
            None => {
                return Err(FatalReconciliationError::InvariantViolation(format!(
                    "removing unknown IPsec tunnel {remote}"
                )));
            }
            Some(workloads) if !workloads.is_empty() => {
                return Err(FatalReconciliationError::InvariantViolation(format!(
                    "removing IPsec tunnel {remote} that still has {} binding(s)",
                    workloads.len()
                )));
            }
            Some(_) => {}
        }
        let local = self.config.local_tunnel_addr;
        info!(remote_addr = %remote, "removing IPsec tunnel");

        if remote != local {
            self.policies.delete_rule(tunnel_fwd_selector(remote));
            self.policies
                .delete_rule(tunnel_out_selector(remote, self.config.forward_mark));

            self.ike
                .unload_connection(local, remote)
                .map_err(|e| ike_fatal("unload-connection", remote, e.to_string()))?;
            self.ike
                .unload_shared_key(remote)
                .map_err(|e| ike_fatal("unload-shared-key", remote, e.to_string()))?;
        }

        self.tunnel_to_workloads.remove(&remote);
        self.update_gauges();
        Ok(())
    }

    /// `remote` 터널 뒤의 `workload`를 바인딩합니다.
    ///
    /// 이미 있는 바인딩을 다시 추가하면 같은 rule을 다시 요청할 뿐입니다.
    pub fn add_binding(
        &mut self,
        remote: Ipv4Addr,
        workload: Ipv4Addr,
    ) -> Result<(), FatalReconciliationError> {
        let local = self.config.local_tunnel_addr;
        let workloads = self.tunnel_to_workloads.get_mut(&remote).ok_or_else(|| {
            FatalReconciliationError::InvariantViolation(format!(
                "adding binding {workload} to unknown IPsec tunnel {remote}"
            ))
        })?;
        if !workloads.insert(workload) {
            debug!(
                remote_addr = %remote,
                workload_addr = %workload,
                "re-asserting existing IPsec binding"
            );
        }

        if remote != local {
            debug!(
                remote_addr = %remote,
                workload_addr = %workload,
                "adding IPsec binding policies"
            );
            let reversed = self.reversed_rule(remote);
            let forward = self.forward_rule(remote);
            let [fwd, inbound, out] = binding_selectors(local, workload);
            self.policies.set_rule(fwd, reversed);
            self.policies.set_rule(inbound, reversed);
            self.policies.set_rule(out, forward);
        }
        self.update_gauges();
        Ok(())
    }

    /// `remote` 터널 뒤의 `workload` 바인딩을 제거합니다.
    pub fn remove_binding(
        &mut self,
        remote: Ipv4Addr,
        workload: Ipv4Addr,
    ) -> Result<(), FatalReconciliationError> {
        let local = self.config.local_tunnel_addr;
        if !self.tunnel_to_workloads.contains_key(&remote) {
            return Err(FatalReconciliationError::InvariantViolation(format!(
                "removing binding {workload} from unknown IPsec tunnel {remote}"
            )));
        }

        if remote != local {
            debug!(
                remote_addr = %remote,
                workload_addr = %workload,
                "removing IPsec binding policies"
            );
            for sel in binding_selectors(local, workload) {
                self.policies.delete_rule(sel);
            }
        }

        let removed = self
            .tunnel_to_workloads
            .get_mut(&remote)
            .is_some_and(|workloads| workloads.remove(&workload));
        if !removed {
            debug!(
                remote_addr = %remote,
                workload_addr = %workload,
                "IPsec binding was not present"
            );
        }
        self.update_gauges();
        Ok(())
    }

    /// `workload`로 들어오고 나가는 트래픽을 차단합니다.
    ///
    /// 암호화되지 않은 트래픽을 허용하는 모드에서는 아무 일도 하지 않습니다.
    pub fn add_blacklist(&mut self, workload: Ipv4Addr) {
        if self.config.allow_unsecured_traffic {
            debug!(workload_addr = %workload, "unsecured traffic allowed, ignoring blacklist");
            return;
        }
        debug!(workload_addr = %workload, "adding IPsec blacklist");
        for sel in blacklist_selectors(workload) {
            self.policies.set_rule(sel, PolicyRule::block());
        }
    }

    /// [`add_blacklist`](Self::add_blacklist)로 설치한 차단을 해제합니다.
    pub fn remove_blacklist(&mut self, workload: Ipv4Addr) {
        if self.config.allow_unsecured_traffic {
            debug!(
                workload_addr = %workload,
                "unsecured traffic allowed, ignoring blacklist removal"
            );
            return;
        }
        debug!(workload_addr = %workload, "removing IPsec blacklist");
        for sel in blacklist_selectors(workload) {
            self.policies.delete_rule(sel);
        }
    }

    /// 원격에서 로컬로 향하는 트래픽용 rule (터널 R → L)
    fn reversed_rule(&self, remote: Ipv4Addr) -> PolicyRule {
        PolicyRule::allow(remote, self.config.local_tunnel_addr)
            .with_optional(self.config.allow_unsecured_traffic)
    }

    /// 로컬에서 원격으로 향하는 트래픽용 rule (터널 L → R)
    fn forward_rule(&self, remote: Ipv4Addr) -> PolicyRule {
        PolicyRule::allow(self.config.local_tunnel_addr, remote)
            .with_optional(self.config.allow_unsecured_traffic)
    }

    fn update_gauges(&self) {
        gauge!(m::IPSEC_TUNNELS).set(self.tunnel_count() as f64);
        gauge!(m::IPSEC_BINDINGS).set(self.binding_count() as f64);
    }

    pub fn has_tunnel(&self, remote: Ipv4Addr) -> bool {
        self.tunnel_to_workloads.contains_key(&remote)
    }

    /// `remote` 터널에 바인딩된 워크로드
    pub fn bindings(&self, remote: Ipv4Addr) -> Option<&HashSet<Ipv4Addr>> {
        self.tunnel_to_workloads.get(&remote)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnel_to_workloads.len()
    }

    /// 모든 터널의 바인딩 수 합계
    pub fn binding_count(&self) -> usize {
        self.tunnel_to_workloads.values().map(HashSet::len).sum()
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn policies(&self) -> &P {
        &self.policies
    }

    pub fn policies_mut(&mut self) -> &mut P {
        &mut self.policies
    }

    pub fn ike(&self) -> &I {
        &self.ike
    }
}

fn ike_fatal(operation: &str, peer: Ipv4Addr, reason: String) -> FatalReconciliationError {
    FatalReconciliationError::IkeDaemon {
        operation: operation.to_owned(),
        peer: peer.to_string(),
        reason,
    }
}

fn tunnel_fwd_selector(remote: Ipv4Addr) -> PolicySelector {
    PolicySelector::new(Direction::Fwd).with_src(host_net(remote))
}

fn tunnel_out_selector(remote: Ipv4Addr, forward_mark: u32) -> PolicySelector {
    PolicySelector::new(Direction::Out)
        .with_dst(host_net(remote))
        .with_mark(forward_mark, forward_mark)
}

/// 원격 워크로드 → 로컬 워크로드, 원격 워크로드 → 로컬 호스트, 로컬 → 원격 워크로드
fn binding_selectors(local: Ipv4Addr, workload: Ipv4Addr) -> [PolicySelector; 3] {
    let w = host_net(workload);
    [
        PolicySelector::new(Direction::Fwd).with_src(w),
        PolicySelector::new(Direction::In)
            .with_src(w)
            .with_dst(host_net(local)),
        PolicySelector::new(Direction::Out).with_dst(w),
    ]
}

fn blacklist_selectors(workload: Ipv4Addr) -> [PolicySelector; 4] {
    let w = host_net(workload);
    [
        PolicySelector::new(Direction::In).with_src(w),
        PolicySelector::new(Direction::Fwd).with_src(w),
        PolicySelector::new(Direction::Out).with_dst(w),
        PolicySelector::new(Direction::Fwd).with_dst(w),
    ]
}
