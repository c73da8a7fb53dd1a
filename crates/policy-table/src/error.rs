//! 정책 테이블 에러 타입
//!
//! [`PolicyTableError`]는 커널 정책 게이트웨이 호출의 일시적 실패를 표현합니다.
//! 이 에러는 `PolicyTable`의 공개 API를 넘지 않고 재시도 루프에서 소비되며,
//! 재시도가 모두 소진되면 `FatalReconciliationError`의 사유로 남습니다.

use xfrmguard_core::error::XfrmGuardError;

/// 커널 정책 게이트웨이 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyTableError {
    /// 커널 정책 핸들 생성 실패
    #[error("kernel policy connection error: {0}")]
    Connect(String),

    /// 커널 정책 작업 실패
    #[error("kernel policy {operation} failed: {reason}")]
    Kernel {
        /// 실패한 작업 (list, update, delete)
        operation: String,
        /// 실패 사유
        reason: String,
    },

    /// 커널 응답 디코딩 실패
    #[error("failed to decode XFRM message: {0}")]
    Decode(String),
}

impl PolicyTableError {
    /// 메트릭 레이블로 쓰이는 작업 이름
    pub fn operation(&self) -> &str {
        match self {
            Self::Connect(_) => "connect",
            Self::Kernel { operation, .. } => operation,
            Self::Decode(_) => "decode",
        }
    }
}

impl From<PolicyTableError> for XfrmGuardError {
    fn from(err: PolicyTableError) -> Self {
        XfrmGuardError::Kernel(err.to_string())
    }
}
