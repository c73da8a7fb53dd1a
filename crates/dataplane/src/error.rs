//! 데이터플레인 에러 타입
//!
//! [`IkeError`]는 IKE 데몬 호출 실패를, [`DataplaneError`]는 설정과 키 파일
//! 로딩 실패를 표현합니다. 둘 다 `XfrmGuardError`로 변환됩니다.

use xfrmguard_core::error::{ConfigError, XfrmGuardError};

/// IKE 데몬 호출 실패
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IkeError {
    /// 데몬에 연결할 수 없음
    #[error("ike daemon unavailable: {0}")]
    Unavailable(String),

    /// 데몬이 요청을 거부함
    #[error("ike request {operation} rejected: {reason}")]
    Rejected {
        /// 요청 종류 (예: `load-shared-key`)
        operation: String,
        /// 거부 사유
        reason: String,
    },
}

/// 데이터플레인 설정/초기화 에러
#[derive(Debug, thiserror::Error)]
pub enum DataplaneError {
    /// 설정값이 잘못됨
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 사전 공유 키 파일 로딩 실패
    #[error("failed to load pre-shared key from {path}: {reason}")]
    KeyFile {
        /// 키 파일 경로
        path: String,
        /// 실패 사유
        reason: String,
    },
}

impl From<IkeError> for XfrmGuardError {
    fn from(err: IkeError) -> Self {
        XfrmGuardError::Ike(err.to_string())
    }
}

impl From<DataplaneError> for XfrmGuardError {
    fn from(err: DataplaneError) -> Self {
        match err {
            DataplaneError::Config { field, reason } => {
                XfrmGuardError::Config(ConfigError::InvalidValue { field, reason })
            }
            DataplaneError::KeyFile { path, reason } => {
                XfrmGuardError::Config(ConfigError::InvalidValue {
                    field: "ipsec.psk_file".to_owned(),
                    reason: format!("{path}: {reason}"),
                })
            }
        }
    }
}
