//! 정책 selector/rule 값 타입
//!
//! [`PolicySelector`]는 "어떤 트래픽인가"를, [`PolicyRule`]은 "그 트래픽을
//! 어떻게 처리하는가"를 표현합니다. 두 타입 모두 구조적 동등성을 가지며
//! `PolicySelector`는 맵 키로 사용됩니다.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// 정책 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 로컬로 들어오는 트래픽
    In,
    /// 로컬에서 나가는 트래픽
    Out,
    /// 포워딩되는 트래픽
    Fwd,
}

impl Direction {
    /// `ip xfrm` 표기 (`in`, `out`, `fwd`)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Fwd => "fwd",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 정책 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// 템플릿의 터널을 통해 허용
    Allow,
    /// 차단
    Block,
}

impl PolicyAction {
    /// `ip xfrm` 표기 (`allow`, `block`)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 트래픽 selector
///
/// 필드는 항상 정규형으로 유지됩니다. `/0` CIDR은 `None`("모든 주소")으로,
/// 마스크가 0인 mark는 `0/0`("mark 매칭 안 함")으로 저장되므로 같은 트래픽을
/// 가리키는 selector는 같은 맵 키가 됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PolicySelector {
    traffic_src: Option<Ipv4Net>,
    traffic_dst: Option<Ipv4Net>,
    mark: u32,
    mark_mask: u32,
    dir: Direction,
}

impl PolicySelector {
    /// 주소 제한이 없는 selector를 생성합니다.
    pub fn new(dir: Direction) -> Self {
        Self {
            traffic_src: None,
            traffic_dst: None,
            mark: 0,
            mark_mask: 0,
            dir,
        }
    }

    /// 출발지 CIDR을 지정합니다. `/0`은 "모든 주소"로 정규화됩니다.
    pub fn with_src(mut self, src: Ipv4Net) -> Self {
        self.traffic_src = normalize_cidr(Some(src));
        self
    }

    /// 목적지 CIDR을 지정합니다. `/0`은 "모든 주소"로 정규화됩니다.
    pub fn with_dst(mut self, dst: Ipv4Net) -> Self {
        self.traffic_dst = normalize_cidr(Some(dst));
        self
    }

    /// mark 매칭을 지정합니다. `mask == 0`이면 매칭하지 않습니다.
    pub fn with_mark(mut self, mark: u32, mask: u32) -> Self {
        self.mark = if mask == 0 { 0 } else { mark };
        self.mark_mask = mask;
        self
    }

    /// 출발지 CIDR (`None` = any)
    pub fn traffic_src(&self) -> Option<Ipv4Net> {
        self.traffic_src
    }

    /// 목적지 CIDR (`None` = any)
    pub fn traffic_dst(&self) -> Option<Ipv4Net> {
        self.traffic_dst
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn mark_mask(&self) -> u32 {
        self.mark_mask
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    /// mark 매칭 여부
    pub fn matches_mark(&self) -> bool {
        self.mark_mask != 0
    }
}

impl fmt::Display for PolicySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            CidrDisplay(self.traffic_src),
            CidrDisplay(self.traffic_dst),
            self.dir
        )?;
        if self.matches_mark() {
            write!(f, " mark {:#x}/{:#x}", self.mark, self.mark_mask)?;
        }
        Ok(())
    }
}

struct CidrDisplay(Option<Ipv4Net>);

impl fmt::Display for CidrDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(net) => write!(f, "{net}"),
            None => f.write_str("any"),
        }
    }
}

/// selector에 대응하는 정책 동작
///
/// 터널 주소는 `action == Allow`일 때만 의미가 있으며,
/// `Ipv4Addr::UNSPECIFIED`는 "설정되지 않음"을 뜻합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    /// 동작
    pub action: PolicyAction,
    /// 터널 출발지
    pub tunnel_src: Ipv4Addr,
    /// 터널 목적지
    pub tunnel_dst: Ipv4Addr,
    /// true면 커널이 이 정책을 만족하지 않아도 트래픽을 통과시킴
    pub optional: bool,
}

impl PolicyRule {
    /// `src -> dst` 터널로 허용하는 rule
    pub fn allow(tunnel_src: Ipv4Addr, tunnel_dst: Ipv4Addr) -> Self {
        Self {
            action: PolicyAction::Allow,
            tunnel_src,
            tunnel_dst,
            optional: false,
        }
    }

    /// 차단 rule
    pub fn block() -> Self {
        Self {
            action: PolicyAction::Block,
            tunnel_src: Ipv4Addr::UNSPECIFIED,
            tunnel_dst: Ipv4Addr::UNSPECIFIED,
            optional: false,
        }
    }

    /// optional 플래그를 지정합니다.
    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action.as_str())?;
        if self.action != PolicyAction::Block {
            write!(f, " tunnel {} -> {}", self.tunnel_src, self.tunnel_dst)?;
        }
        if self.optional {
            f.write_str(" (optional)")?;
        }
        Ok(())
    }
}

/// 단일 호스트 CIDR (`/32`)
pub fn host_net(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}

/// `/0` CIDR을 "모든 주소"(`None`)로 정규화합니다.
pub fn normalize_cidr(net: Option<Ipv4Net>) -> Option<Ipv4Net> {
    net.filter(|n| n.prefix_len() > 0)
}
