//! 메트릭 상수 및 설명 등록
//!
//! 모든 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 크레이트는 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`
//! 매크로를 호출합니다. recorder 설치는 바이너리의 책임입니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `xfrmguard_ipsec_`
//! - 접미어: `_total` (counter), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(xfrmguard_core::metrics::IPSEC_ERRORS_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 커널 작업 레이블 키 (connect, list, update, delete)
pub const LABEL_OPERATION: &str = "operation";

// ─── Policy Table 메트릭 ────────────────────────────────────────────

/// 커널에 적용된(것으로 간주되는) IPsec 정책 수 (gauge)
pub const IPSEC_POLICIES_ACTIVE: &str = "xfrmguard_ipsec_policies_active";

/// 실패한 정책 적용 시도 수 (counter, label: operation)
pub const IPSEC_ERRORS_TOTAL: &str = "xfrmguard_ipsec_errors_total";

/// 커널 재동기화 실행 수 (counter)
pub const IPSEC_RESYNCS_TOTAL: &str = "xfrmguard_ipsec_resyncs_total";

/// 재동기화 중 발견된 불일치 수 (counter)
pub const IPSEC_RESYNC_PROBLEMS_TOTAL: &str = "xfrmguard_ipsec_resync_problems_total";

/// 현재 graceful shutdown 단계 (gauge, 0=none .. 3=remove-all)
pub const IPSEC_GRACE_PHASE: &str = "xfrmguard_ipsec_grace_phase";

// ─── Dataplane 메트릭 ────────────────────────────────────────────

/// 등록된 원격 터널 수 (gauge)
pub const IPSEC_TUNNELS: &str = "xfrmguard_ipsec_tunnels";

/// 등록된 워크로드 바인딩 수 (gauge)
pub const IPSEC_BINDINGS: &str = "xfrmguard_ipsec_bindings";

/// 모든 메트릭의 설명을 등록합니다.
///
/// recorder 설치 직후 한 번 호출합니다. recorder가 없으면 아무 일도 하지 않습니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    // Policy Table
    describe_gauge!(
        IPSEC_POLICIES_ACTIVE,
        "Number of IPsec policies believed to be programmed in the kernel"
    );
    describe_counter!(
        IPSEC_ERRORS_TOTAL,
        "Total number of failed kernel policy operations (per attempt)"
    );
    describe_counter!(
        IPSEC_RESYNCS_TOTAL,
        "Total number of full resyncs against the kernel policy table"
    );
    describe_counter!(
        IPSEC_RESYNC_PROBLEMS_TOTAL,
        "Total number of kernel policies found missing, stale or unexpected during resync"
    );
    describe_gauge!(
        IPSEC_GRACE_PHASE,
        "Current graceful shutdown phase (0=none, 1=all-optional, 2=remove-outbound, 3=remove-all)"
    );

    // Dataplane
    describe_gauge!(IPSEC_TUNNELS, "Number of remote IPsec tunnels configured");
    describe_gauge!(
        IPSEC_BINDINGS,
        "Number of workload addresses bound to remote tunnels"
    );
}
