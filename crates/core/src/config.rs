//! 설정 관리: xfrmguard.toml 파싱 및 런타임 설정
//!
//! [`XfrmGuardConfig`]는 모든 구성 요소의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. 환경변수 (`XFRMGUARD_IPSEC_FORWARD_MARK=0x8` 형식)
//! 2. 설정 파일 (`xfrmguard.toml`)
//! 3. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # fn example() -> Result<(), xfrmguard_core::error::XfrmGuardError> {
//! use xfrmguard_core::config::XfrmGuardConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = XfrmGuardConfig::load("xfrmguard.toml")?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = XfrmGuardConfig::parse("[ipsec]\nforward_mark = 0x8")?;
//! # Ok(())
//! # }
//! ```

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, XfrmGuardError};

/// xfrmguard 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XfrmGuardConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// IPsec 정책 설정
    #[serde(default)]
    pub ipsec: IpsecConfig,
}

impl XfrmGuardConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, XfrmGuardError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, XfrmGuardError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                XfrmGuardError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                XfrmGuardError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, XfrmGuardError> {
        toml::from_str(toml_str).map_err(|e| {
            XfrmGuardError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `XFRMGUARD_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "XFRMGUARD_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "XFRMGUARD_GENERAL_LOG_FORMAT");

        // IPsec
        override_bool(&mut self.ipsec.enabled, "XFRMGUARD_IPSEC_ENABLED");
        override_u32(&mut self.ipsec.request_id, "XFRMGUARD_IPSEC_REQUEST_ID");
        override_string(
            &mut self.ipsec.local_tunnel_addr,
            "XFRMGUARD_IPSEC_LOCAL_TUNNEL_ADDR",
        );
        override_string(&mut self.ipsec.psk_file, "XFRMGUARD_IPSEC_PSK_FILE");
        override_u32(&mut self.ipsec.forward_mark, "XFRMGUARD_IPSEC_FORWARD_MARK");
        override_bool(
            &mut self.ipsec.allow_unsecured_traffic,
            "XFRMGUARD_IPSEC_ALLOW_UNSECURED_TRAFFIC",
        );
        override_bool(
            &mut self.ipsec.short_grace_time,
            "XFRMGUARD_IPSEC_SHORT_GRACE_TIME",
        );
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), XfrmGuardError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if self.ipsec.request_id == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ipsec.request_id".to_owned(),
                reason: "must not be zero".to_owned(),
            }
            .into());
        }

        // IPsec이 비활성화 상태면 터널 관련 검증을 건너뜀
        if self.ipsec.enabled {
            if self.ipsec.forward_mark == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "ipsec.forward_mark".to_owned(),
                    reason: "must not be zero when ipsec is enabled".to_owned(),
                }
                .into());
            }

            self.ipsec.local_tunnel_ip()?;

            if self.ipsec.psk_file.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "ipsec.psk_file".to_owned(),
                    reason: "must not be empty when ipsec is enabled".to_owned(),
                }
                .into());
            }
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// IPsec 정책 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpsecConfig {
    /// IPsec 활성화 여부 (false면 graceful shutdown 단계로 정책을 해제)
    pub enabled: bool,
    /// 이 시스템이 소유한 정책을 식별하는 request ID
    pub request_id: u32,
    /// 로컬 터널 주소 (IPv4)
    pub local_tunnel_addr: String,
    /// pre-shared key 파일 경로
    pub psk_file: String,
    /// 자기 자신으로 암호화할 트래픽을 구분하는 firewall mark
    pub forward_mark: u32,
    /// 암호화되지 않은 트래픽 허용 여부
    pub allow_unsecured_traffic: bool,
    /// 짧은 grace 기간 사용 (테스트용, 5s/10s)
    pub short_grace_time: bool,
}

impl Default for IpsecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_id: 50,
            local_tunnel_addr: String::new(),
            psk_file: "/etc/xfrmguard/psk".to_owned(),
            forward_mark: 0,
            allow_unsecured_traffic: false,
            short_grace_time: false,
        }
    }
}

impl IpsecConfig {
    /// 로컬 터널 주소를 IPv4 주소로 파싱합니다.
    pub fn local_tunnel_ip(&self) -> Result<Ipv4Addr, ConfigError> {
        self.local_tunnel_addr
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                field: "ipsec.local_tunnel_addr".to_owned(),
                reason: format!("'{}' is not an IPv4 address: {e}", self.local_tunnel_addr),
            })
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

/// 10진수 또는 `0x` 접두어 16진수를 허용합니다 (mark 값용).
fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match parse_u32(&val) {
            Some(parsed) => *target = parsed,
            None => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn parse_u32(val: &str) -> Option<u32> {
    let val = val.trim();
    match val
        .strip_prefix("0x")
        .or_else(|| val.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => val.parse().ok(),
    }
}
