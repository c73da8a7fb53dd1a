//! xfrmguard core: 공통 에러, 설정, 로깅, 메트릭 이름, 시간 추상화.
//!
//! 정책 테이블(`xfrmguard-policy-table`)과 데이터플레인(`xfrmguard-dataplane`)
//! 크레이트가 공유하는 타입을 제공합니다.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, FatalReconciliationError, XfrmGuardError};

// 설정
pub use config::{GeneralConfig, IpsecConfig, XfrmGuardConfig};

// 시간
pub use clock::{Clock, SystemClock};
