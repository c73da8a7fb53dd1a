//! 에러 타입: 도메인별 에러 정의
//!
//! [`FatalReconciliationError`]는 커널 정책 상태를 더 이상 신뢰할 수 없을 때
//! 반환되는 치명적 에러입니다. 호출자(supervisor)는 이 에러를 받으면
//! 진단 덤프 이후 프로세스를 종료해야 합니다.

/// xfrmguard 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum XfrmGuardError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 복구 불가능한 정합성 에러
    #[error("fatal: {0}")]
    Fatal(#[from] FatalReconciliationError),

    /// 커널 정책 게이트웨이 에러
    #[error("kernel error: {0}")]
    Kernel(String),

    /// IKE 데몬 또는 키 로딩 에러
    #[error("ike error: {0}")]
    Ike(String),

    /// 로깅 초기화 에러
    #[error("logging error: {0}")]
    Logging(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 치명적 정합성 에러
///
/// 재시도로 복구할 수 없는 상황을 나타냅니다. 커널 정책과 내부 상태의
/// 불일치가 해소되지 않았거나, 프로그래밍/설정 오류로 불변식이 깨진 경우입니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalReconciliationError {
    /// 정책 적용 재시도 횟수 초과
    #[error("failed to update IPsec policy after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// 커널 정책 핸들 연결 재시도 횟수 초과
    #[error("failed to connect to kernel policy table after {attempts} attempts: {reason}")]
    KernelConnect { attempts: u32, reason: String },

    /// 불변식 위반 (잘못된 호출 순서 등)
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// 잘못된 설정
    #[error("misconfiguration of '{field}': {reason}")]
    Misconfiguration { field: String, reason: String },

    /// IKE 데몬 호출 실패
    #[error("ike daemon {operation} for {peer} failed: {reason}")]
    IkeDaemon {
        operation: String,
        peer: String,
        reason: String,
    },
}
