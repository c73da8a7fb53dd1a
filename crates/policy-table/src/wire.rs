//! XFRM netlink 메시지 코덱
//!
//! `linux/xfrm.h`의 고정 길이 구조체(`xfrm_userpolicy_info`, `xfrm_userpolicy_id`,
//! `xfrm_user_tmpl`)와 속성(`XFRMA_TMPL`, `XFRMA_MARK`)을 [`XfrmPolicy`]와
//! 상호 변환합니다.
//!
//! nlmsghdr 프레이밍은 `netlink-packet-core`가 담당하며, 이 모듈은
//! [`XfrmMessage`]로 그 payload만 다룹니다. 정수 필드는 호스트 바이트 순서입니다.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use netlink_packet_core::{NetlinkDeserializable, NetlinkHeader, NetlinkSerializable};

use crate::kernel::{AddressFamily, XfrmMark, XfrmMode, XfrmPolicy, XfrmProto, XfrmTemplate};
use crate::model::{Direction, PolicyAction, normalize_cidr};

// --- 메시지 유형 ---

pub const XFRM_MSG_NEWPOLICY: u16 = 0x13;
pub const XFRM_MSG_DELPOLICY: u16 = 0x14;
pub const XFRM_MSG_GETPOLICY: u16 = 0x15;
pub const XFRM_MSG_UPDPOLICY: u16 = 0x19;

// --- 속성 ---

const XFRMA_TMPL: u16 = 5;
const XFRMA_MARK: u16 = 21;
const NLA_TYPE_MASK: u16 = 0x3fff;
const NLA_HEADER_LEN: usize = 4;

// --- 필드 값 ---

const AF_INET: u16 = 2;

const XFRM_POLICY_IN: u8 = 0;
const XFRM_POLICY_OUT: u8 = 1;
const XFRM_POLICY_FWD: u8 = 2;

const XFRM_POLICY_ALLOW: u8 = 0;
const XFRM_POLICY_BLOCK: u8 = 1;

const XFRM_MODE_TRANSPORT: u8 = 0;
const XFRM_MODE_TUNNEL: u8 = 1;
const XFRM_MODE_BEET: u8 = 4;

const IPPROTO_ESP: u8 = 50;
const IPPROTO_AH: u8 = 51;
const IPPROTO_COMP: u8 = 108;

/// 무제한 lifetime
const XFRM_INF: u64 = u64::MAX;

// --- 구조체 크기 ---

/// `struct xfrm_userpolicy_info`
pub const USERPOLICY_INFO_LEN: usize = 168;
/// `struct xfrm_userpolicy_id`
pub const USERPOLICY_ID_LEN: usize = 64;
/// `struct xfrm_user_tmpl`
const USER_TMPL_LEN: usize = 64;
/// `struct xfrm_mark`
const MARK_LEN: usize = 8;

// xfrm_selector 오프셋
const SEL_DADDR: usize = 0;
const SEL_SADDR: usize = 16;
const SEL_FAMILY: usize = 40;
const SEL_PREFIXLEN_D: usize = 42;
const SEL_PREFIXLEN_S: usize = 43;

// xfrm_userpolicy_info 오프셋
const INFO_LFT: usize = 56;
const INFO_DIR: usize = 160;
const INFO_ACTION: usize = 161;

// xfrm_userpolicy_id 오프셋
const ID_DIR: usize = 60;

// xfrm_user_tmpl 오프셋
const TMPL_DADDR: usize = 0;
const TMPL_PROTO: usize = 20;
const TMPL_FAMILY: usize = 24;
const TMPL_SADDR: usize = 28;
const TMPL_REQID: usize = 44;
const TMPL_MODE: usize = 48;
const TMPL_OPTIONAL: usize = 50;
const TMPL_AALGOS: usize = 52;

/// XFRM payload 디코딩 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// 고정 길이 구조체보다 짧은 payload
    #[error("{what} truncated: {len} bytes, need {need}")]
    Truncated {
        what: &'static str,
        len: usize,
        need: usize,
    },

    /// 길이가 잘못된 속성
    #[error("malformed attribute {kind}: length {len}")]
    InvalidAttribute { kind: u16, len: usize },

    /// 알 수 없는 필드 값
    #[error("unknown {field} value {value}")]
    UnknownValue { field: &'static str, value: u8 },

    /// IPv4가 아닌 템플릿
    #[error("unsupported template address family {0}")]
    UnsupportedFamily(u16),

    /// 32보다 큰 prefix 길이
    #[error("invalid IPv4 prefix length {0}")]
    InvalidPrefix(u8),
}

/// XFRM 정책 메시지 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XfrmMessage {
    /// 정책 생성 또는 같은 selector 정책 교체 (`XFRM_MSG_UPDPOLICY`)
    UpdatePolicy(XfrmPolicy),
    /// selector로 정책 삭제 (`XFRM_MSG_DELPOLICY`)
    DeletePolicy(XfrmPolicy),
    /// 정책 dump 요청 (`XFRM_MSG_GETPOLICY`, `NLM_F_DUMP`와 함께 전송)
    GetPolicies(AddressFamily),
    /// dump 응답 (`XFRM_MSG_NEWPOLICY`). IPv4가 아니거나 socket 정책이면 `None`
    Policy(Option<XfrmPolicy>),
    /// 해석할 수 없는 정책 레코드
    Malformed(WireError),
    /// 다루지 않는 메시지 유형
    Other(u16),
}

impl XfrmMessage {
    fn payload(&self) -> Vec<u8> {
        match self {
            Self::UpdatePolicy(policy) | Self::Policy(Some(policy)) => encode_policy_info(policy),
            Self::DeletePolicy(policy) => encode_policy_id(policy),
            Self::GetPolicies(family) => {
                let mut id = [0u8; USERPOLICY_ID_LEN];
                put_u16(&mut id, SEL_FAMILY, family_number(*family));
                id.to_vec()
            }
            Self::Policy(None) | Self::Malformed(_) | Self::Other(_) => Vec::new(),
        }
    }
}

impl NetlinkSerializable for XfrmMessage {
    fn message_type(&self) -> u16 {
        match self {
            Self::UpdatePolicy(_) => XFRM_MSG_UPDPOLICY,
            Self::DeletePolicy(_) => XFRM_MSG_DELPOLICY,
            Self::GetPolicies(_) => XFRM_MSG_GETPOLICY,
            Self::Policy(_) | Self::Malformed(_) => XFRM_MSG_NEWPOLICY,
            Self::Other(message_type) => *message_type,
        }
    }

    fn buffer_len(&self) -> usize {
        self.payload().len()
    }

    fn serialize(&self, buffer: &mut [u8]) {
        let payload = self.payload();
        buffer[..payload.len()].copy_from_slice(&payload);
    }
}

impl NetlinkDeserializable for XfrmMessage {
    type Error = WireError;

    /// 고정 구조체가 잘린 메시지만 에러입니다. 값을 해석할 수 없는 정책은
    /// [`XfrmMessage::Malformed`]로 돌려주어 나머지 dump를 계속 읽을 수 있게 합니다.
    fn deserialize(header: &NetlinkHeader, payload: &[u8]) -> Result<Self, Self::Error> {
        match header.message_type {
            XFRM_MSG_NEWPOLICY => match decode_policy(payload) {
                Ok(policy) => Ok(Self::Policy(policy)),
                Err(e @ WireError::Truncated { .. }) => Err(e),
                Err(e) => Ok(Self::Malformed(e)),
            },
            other => Ok(Self::Other(other)),
        }
    }
}

/// `xfrm_userpolicy_info` 뒤에 템플릿과 mark 속성을 붙입니다.
pub fn encode_policy_info(policy: &XfrmPolicy) -> Vec<u8> {
    let mut info = [0u8; USERPOLICY_INFO_LEN];
    encode_selector(&mut info, policy);
    // soft/hard byte, packet 제한
    for i in 0..4 {
        put_u64(&mut info, INFO_LFT + i * 8, XFRM_INF);
    }
    info[INFO_DIR] = direction_number(policy.dir);
    info[INFO_ACTION] = match policy.action {
        PolicyAction::Allow => XFRM_POLICY_ALLOW,
        PolicyAction::Block => XFRM_POLICY_BLOCK,
    };

    let mut out = info.to_vec();
    if !policy.templates.is_empty() {
        let mut tmpls = Vec::with_capacity(policy.templates.len() * USER_TMPL_LEN);
        for tmpl in &policy.templates {
            tmpls.extend_from_slice(&encode_template(tmpl));
        }
        put_attr(&mut out, XFRMA_TMPL, &tmpls);
    }
    put_mark(&mut out, policy.mark);
    out
}

/// 삭제 요청용 `xfrm_userpolicy_id`와 mark 속성
fn encode_policy_id(policy: &XfrmPolicy) -> Vec<u8> {
    let mut id = [0u8; USERPOLICY_ID_LEN];
    encode_selector(&mut id, policy);
    id[ID_DIR] = direction_number(policy.dir);

    let mut out = id.to_vec();
    put_mark(&mut out, policy.mark);
    out
}

fn encode_selector(buf: &mut [u8], policy: &XfrmPolicy) {
    let (daddr, prefixlen_d) = net_parts(policy.dst);
    let (saddr, prefixlen_s) = net_parts(policy.src);
    put_addr(buf, SEL_DADDR, daddr);
    put_addr(buf, SEL_SADDR, saddr);
    put_u16(buf, SEL_FAMILY, AF_INET);
    buf[SEL_PREFIXLEN_D] = prefixlen_d;
    buf[SEL_PREFIXLEN_S] = prefixlen_s;
}

fn encode_template(tmpl: &XfrmTemplate) -> [u8; USER_TMPL_LEN] {
    let mut buf = [0u8; USER_TMPL_LEN];
    put_addr(&mut buf, TMPL_DADDR, tmpl.dst);
    buf[TMPL_PROTO] = match tmpl.proto {
        XfrmProto::Esp => IPPROTO_ESP,
        XfrmProto::Ah => IPPROTO_AH,
        XfrmProto::Comp => IPPROTO_COMP,
    };
    put_u16(&mut buf, TMPL_FAMILY, AF_INET);
    put_addr(&mut buf, TMPL_SADDR, tmpl.src);
    put_u32(&mut buf, TMPL_REQID, tmpl.reqid);
    buf[TMPL_MODE] = match tmpl.mode {
        XfrmMode::Transport => XFRM_MODE_TRANSPORT,
        XfrmMode::Tunnel => XFRM_MODE_TUNNEL,
        XfrmMode::Beet => XFRM_MODE_BEET,
    };
    buf[TMPL_OPTIONAL] = u8::from(tmpl.optional);
    // aalgos, ealgos, calgos: 모든 알고리즘 허용
    for i in 0..3 {
        put_u32(&mut buf, TMPL_AALGOS + i * 4, u32::MAX);
    }
    buf
}

fn put_mark(out: &mut Vec<u8>, mark: Option<XfrmMark>) {
    if let Some(mark) = mark {
        let mut buf = [0u8; MARK_LEN];
        put_u32(&mut buf, 0, mark.value);
        put_u32(&mut buf, 4, mark.mask);
        put_attr(out, XFRMA_MARK, &buf);
    }
}

fn put_attr(out: &mut Vec<u8>, kind: u16, data: &[u8]) {
    let len = NLA_HEADER_LEN + data.len();
    out.extend_from_slice(&u16::try_from(len).unwrap_or(u16::MAX).to_ne_bytes());
    out.extend_from_slice(&kind.to_ne_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + (align4(len) - len), 0);
}

/// `XFRM_MSG_NEWPOLICY` payload를 정책으로 해석합니다.
///
/// IPv4 selector가 아니거나 socket 정책(방향 3 이상)이면 `Ok(None)`입니다.
pub fn decode_policy(payload: &[u8]) -> Result<Option<XfrmPolicy>, WireError> {
    let info = payload
        .get(..USERPOLICY_INFO_LEN)
        .ok_or(WireError::Truncated {
            what: "xfrm_userpolicy_info",
            len: payload.len(),
            need: USERPOLICY_INFO_LEN,
        })?;

    if get_u16(info, SEL_FAMILY) != AF_INET {
        return Ok(None);
    }
    let dir = match info[INFO_DIR] {
        XFRM_POLICY_IN => Direction::In,
        XFRM_POLICY_OUT => Direction::Out,
        XFRM_POLICY_FWD => Direction::Fwd,
        _ => return Ok(None),
    };
    let action = match info[INFO_ACTION] {
        XFRM_POLICY_ALLOW => PolicyAction::Allow,
        XFRM_POLICY_BLOCK => PolicyAction::Block,
        value => {
            return Err(WireError::UnknownValue {
                field: "action",
                value,
            });
        }
    };

    let mut policy = XfrmPolicy {
        src: decode_net(info, SEL_SADDR, info[SEL_PREFIXLEN_S])?,
        dst: decode_net(info, SEL_DADDR, info[SEL_PREFIXLEN_D])?,
        dir,
        mark: None,
        action,
        templates: Vec::new(),
    };

    for (kind, data) in attributes(&payload[USERPOLICY_INFO_LEN..])? {
        match kind {
            XFRMA_TMPL => {
                if data.len() % USER_TMPL_LEN != 0 {
                    return Err(WireError::InvalidAttribute {
                        kind,
                        len: data.len(),
                    });
                }
                for chunk in data.chunks_exact(USER_TMPL_LEN) {
                    policy.templates.push(decode_template(chunk)?);
                }
            }
            XFRMA_MARK => {
                if data.len() < MARK_LEN {
                    return Err(WireError::InvalidAttribute {
                        kind,
                        len: data.len(),
                    });
                }
                let mask = get_u32(data, 4);
                policy.mark = (mask != 0).then_some(XfrmMark {
                    value: get_u32(data, 0),
                    mask,
                });
            }
            _ => {}
        }
    }
    Ok(Some(policy))
}

fn decode_template(buf: &[u8]) -> Result<XfrmTemplate, WireError> {
    let family = get_u16(buf, TMPL_FAMILY);
    if family != AF_INET && family != 0 {
        return Err(WireError::UnsupportedFamily(family));
    }
    let proto = match buf[TMPL_PROTO] {
        IPPROTO_ESP => XfrmProto::Esp,
        IPPROTO_AH => XfrmProto::Ah,
        IPPROTO_COMP => XfrmProto::Comp,
        value => {
            return Err(WireError::UnknownValue {
                field: "template proto",
                value,
            });
        }
    };
    let mode = match buf[TMPL_MODE] {
        XFRM_MODE_TRANSPORT => XfrmMode::Transport,
        XFRM_MODE_TUNNEL => XfrmMode::Tunnel,
        XFRM_MODE_BEET => XfrmMode::Beet,
        value => {
            return Err(WireError::UnknownValue {
                field: "template mode",
                value,
            });
        }
    };
    Ok(XfrmTemplate {
        src: get_addr(buf, TMPL_SADDR),
        dst: get_addr(buf, TMPL_DADDR),
        proto,
        mode,
        reqid: get_u32(buf, TMPL_REQID),
        optional: buf[TMPL_OPTIONAL] != 0,
    })
}

fn decode_net(buf: &[u8], offset: usize, prefix_len: u8) -> Result<Option<Ipv4Net>, WireError> {
    let net = Ipv4Net::new(get_addr(buf, offset), prefix_len)
        .map_err(|_| WireError::InvalidPrefix(prefix_len))?;
    Ok(normalize_cidr(Some(net)))
}

/// netlink 속성 목록 (`struct nlattr` + 데이터, 4바이트 정렬)
fn attributes(buf: &[u8]) -> Result<Vec<(u16, &[u8])>, WireError> {
    let mut attrs = Vec::new();
    let mut rest = buf;
    while rest.len() >= NLA_HEADER_LEN {
        let len = usize::from(get_u16(rest, 0));
        let kind = get_u16(rest, 2) & NLA_TYPE_MASK;
        if len < NLA_HEADER_LEN || len > rest.len() {
            return Err(WireError::InvalidAttribute { kind, len });
        }
        attrs.push((kind, &rest[NLA_HEADER_LEN..len]));
        rest = &rest[align4(len).min(rest.len())..];
    }
    Ok(attrs)
}

fn family_number(family: AddressFamily) -> u16 {
    match family {
        AddressFamily::V4 => AF_INET,
    }
}

fn direction_number(dir: Direction) -> u8 {
    match dir {
        Direction::In => XFRM_POLICY_IN,
        Direction::Out => XFRM_POLICY_OUT,
        Direction::Fwd => XFRM_POLICY_FWD,
    }
}

fn net_parts(net: Option<Ipv4Net>) -> (Ipv4Addr, u8) {
    net.map_or((Ipv4Addr::UNSPECIFIED, 0), |n| (n.addr(), n.prefix_len()))
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

// 호출자가 길이를 먼저 확인합니다.

fn put_addr(buf: &mut [u8], offset: usize, addr: Ipv4Addr) {
    buf[offset..offset + 4].copy_from_slice(&addr.octets());
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

fn get_addr(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
