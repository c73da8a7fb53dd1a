//! 커널 XFRM 정책 게이트웨이 추상화
//!
//! [`XfrmHandle`] trait으로 커널 정책 테이블 접근을 추상화하여
//! 테스트에서 mock 구현으로 대체할 수 있게 합니다.
//! [`XfrmConnector`]는 핸들을 (재)생성하는 팩토리입니다.
//!
//! 프로덕션 구현은 [`crate::netlink`]의 NETLINK_XFRM 소켓 어댑터입니다.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::error::PolicyTableError;
use crate::model::{Direction, PolicyAction, PolicyRule, PolicySelector, normalize_cidr};

/// 주소 패밀리 (IPv4만 지원)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4
    V4,
}

/// 템플릿 보안 프로토콜
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XfrmProto {
    /// Encapsulating Security Payload
    Esp,
    /// Authentication Header
    Ah,
    /// IP payload compression
    Comp,
}

impl XfrmProto {
    /// `ip xfrm` 표기
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Esp => "esp",
            Self::Ah => "ah",
            Self::Comp => "comp",
        }
    }
}

/// 템플릿 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XfrmMode {
    /// transport 모드
    Transport,
    /// tunnel 모드
    Tunnel,
    /// bound end-to-end tunnel 모드
    Beet,
}

impl XfrmMode {
    /// `ip xfrm` 표기
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Tunnel => "tunnel",
            Self::Beet => "beet",
        }
    }
}

/// firewall mark 매칭
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct XfrmMark {
    pub value: u32,
    pub mask: u32,
}

/// 정책 템플릿 (보호에 사용할 터널)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct XfrmTemplate {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub reqid: u32,
    pub optional: bool,
}

/// 커널 XFRM 정책 (wire 수준 표현)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct XfrmPolicy {
    /// 출발지 CIDR (`None` = any)
    pub src: Option<Ipv4Net>,
    /// 목적지 CIDR (`None` = any)
    pub dst: Option<Ipv4Net>,
    pub dir: Direction,
    pub mark: Option<XfrmMark>,
    pub action: PolicyAction,
    pub templates: Vec<XfrmTemplate>,
}

impl XfrmPolicy {
    /// selector와 rule로 커널 정책을 구성합니다.
    ///
    /// rule이 있으면 request ID를 담은 ESP tunnel 템플릿 하나를 추가합니다.
    /// `Block` rule에도 템플릿을 붙여 소유권을 식별할 수 있게 합니다.
    pub fn from_rule(sel: &PolicySelector, rule: Option<&PolicyRule>, req_id: u32) -> Self {
        let mut policy = Self {
            src: sel.traffic_src(),
            dst: sel.traffic_dst(),
            dir: sel.dir(),
            mark: sel.matches_mark().then_some(XfrmMark {
                value: sel.mark(),
                mask: sel.mark_mask(),
            }),
            action: PolicyAction::Allow,
            templates: Vec::new(),
        };
        if let Some(rule) = rule {
            policy.action = rule.action;
            policy.templates.push(XfrmTemplate {
                src: rule.tunnel_src,
                dst: rule.tunnel_dst,
                proto: XfrmProto::Esp,
                mode: XfrmMode::Tunnel,
                reqid: req_id,
                optional: rule.optional,
            });
        }
        policy
    }

    /// 첫 번째 템플릿의 reqid가 `req_id`와 같으면 selector/rule로 해석합니다.
    ///
    /// 다른 소유자의 정책이면 `None`을 반환합니다.
    pub fn decode_owned(&self, req_id: u32) -> Option<(PolicySelector, PolicyRule)> {
        let tmpl = self.templates.first()?;
        if tmpl.reqid != req_id {
            return None;
        }

        let mut sel = PolicySelector::new(self.dir);
        if let Some(src) = self.src {
            sel = sel.with_src(src);
        }
        if let Some(dst) = self.dst {
            sel = sel.with_dst(dst);
        }
        if let Some(mark) = self.mark {
            sel = sel.with_mark(mark.value, mark.mask);
        }

        let rule = PolicyRule {
            action: self.action,
            tunnel_src: tmpl.src,
            tunnel_dst: tmpl.dst,
            optional: tmpl.optional,
        };
        Some((sel, rule))
    }

    /// 커널이 정책을 식별하는 키(주소, 방향, mark)가 같은지 비교합니다.
    pub fn same_selector(&self, other: &XfrmPolicy) -> bool {
        normalize_cidr(self.src) == normalize_cidr(other.src)
            && normalize_cidr(self.dst) == normalize_cidr(other.dst)
            && self.dir == other.dir
            && self.mark == other.mark
    }
}

impl fmt::Display for XfrmPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src {} dst {} dir {} action {}",
            cidr_or_any(self.src),
            cidr_or_any(self.dst),
            self.dir,
            self.action
        )?;
        if let Some(mark) = self.mark {
            write!(f, " mark {:#x}/{:#x}", mark.value, mark.mask)?;
        }
        for tmpl in &self.templates {
            write!(
                f,
                " tmpl src {} dst {} proto {} reqid {} mode {}{}",
                tmpl.src,
                tmpl.dst,
                tmpl.proto.as_str(),
                tmpl.reqid,
                tmpl.mode.as_str(),
                if tmpl.optional { " level use" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// CIDR을 표기합니다 (`None`은 `0.0.0.0/0`).
fn cidr_or_any(net: Option<Ipv4Net>) -> String {
    match net {
        Some(net) => net.to_string(),
        None => "0.0.0.0/0".to_owned(),
    }
}

/// 열린 커널 정책 핸들
pub trait XfrmHandle {
    /// 주어진 패밀리의 모든 정책을 나열합니다.
    fn list_policies(&mut self, family: AddressFamily)
    -> Result<Vec<XfrmPolicy>, PolicyTableError>;

    /// 정책을 생성하거나 같은 selector의 정책을 교체합니다.
    fn update_policy(&mut self, policy: &XfrmPolicy) -> Result<(), PolicyTableError>;

    /// 같은 selector의 정책을 삭제합니다.
    fn delete_policy(&mut self, policy: &XfrmPolicy) -> Result<(), PolicyTableError>;

    /// 핸들을 닫습니다. 이후 호출은 정의되지 않습니다.
    fn close(&mut self);
}

/// 커널 정책 핸들 팩토리
pub trait XfrmConnector {
    type Handle: XfrmHandle;

    /// 새 핸들을 엽니다.
    fn connect(&self) -> Result<Self::Handle, PolicyTableError>;
}

#[cfg(test)]
pub(crate) use mock::MockXfrmKernel;
