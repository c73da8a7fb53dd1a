//! 데이터플레인 설정
//!
//! [`DataplaneConfig`]는 core의 [`IpsecConfig`]에서 바인딩 레이어가 쓰는 값만
//! 타입이 있는 형태로 뽑아냅니다.
//!
//! # 사용 예시
//! ```ignore
//! use xfrmguard_core::config::XfrmGuardConfig;
//! use xfrmguard_dataplane::config::DataplaneConfig;
//!
//! let core_config = XfrmGuardConfig::load("/etc/xfrmguard/xfrmguard.toml")?;
//! let config = DataplaneConfig::from_core(&core_config.ipsec)?;
//! ```

use std::net::Ipv4Addr;

use serde::Serialize;
use xfrmguard_core::config::IpsecConfig;

use crate::error::DataplaneError;

/// 바인딩 레이어 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataplaneConfig {
    /// 로컬 터널 주소
    pub local_tunnel_addr: Ipv4Addr,
    /// 자기 자신에게 암호화할 트래픽의 firewall mark (0 불가)
    pub forward_mark: u32,
    /// 암호화되지 않은 트래픽 허용 여부
    pub allow_unsecured_traffic: bool,
}

impl DataplaneConfig {
    /// core의 `IpsecConfig`에서 데이터플레인 설정을 생성합니다.
    pub fn from_core(core: &IpsecConfig) -> Result<Self, DataplaneError> {
        let local_tunnel_addr = core.local_tunnel_ip().map_err(|e| DataplaneError::Config {
            field: "local_tunnel_addr".to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            local_tunnel_addr,
            forward_mark: core.forward_mark,
            allow_unsecured_traffic: core.allow_unsecured_traffic,
        })
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), DataplaneError> {
        if self.forward_mark == 0 {
            return Err(DataplaneError::Config {
                field: "forward_mark".to_owned(),
                reason: "forward mark must be non-zero".to_owned(),
            });
        }
        if self.local_tunnel_addr.is_unspecified() {
            return Err(DataplaneError::Config {
                field: "local_tunnel_addr".to_owned(),
                reason: "local tunnel address must not be 0.0.0.0".to_owned(),
            });
        }
        Ok(())
    }
}
