#![no_main]

use std::net::Ipv4Addr;

use arbitrary::Arbitrary;
use ipnet::Ipv4Net;
use libfuzzer_sys::fuzz_target;
use xfrmguard_policy_table::{Direction, PolicyRule, PolicySelector, XfrmPolicy};

/// 퍼저용 구조적 selector/rule 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    dir: u8,
    src: Option<([u8; 4], u8)>,
    dst: Option<([u8; 4], u8)>,
    mark: u32,
    mark_mask: u32,
    tunnel_src: [u8; 4],
    tunnel_dst: [u8; 4],
    block: bool,
    optional: bool,
    req_id: u32,
}

fn net(raw: Option<([u8; 4], u8)>) -> Option<Ipv4Net> {
    let (addr, prefix) = raw?;
    Ipv4Net::new(Ipv4Addr::from(addr), prefix % 33).ok()
}

fuzz_target!(|input: FuzzInput| {
    let dir = match input.dir % 3 {
        0 => Direction::In,
        1 => Direction::Out,
        _ => Direction::Fwd,
    };
    let mut sel = PolicySelector::new(dir).with_mark(input.mark, input.mark_mask);
    if let Some(src) = net(input.src) {
        sel = sel.with_src(src);
    }
    if let Some(dst) = net(input.dst) {
        sel = sel.with_dst(dst);
    }

    let rule = if input.block {
        PolicyRule::block()
    } else {
        PolicyRule::allow(
            Ipv4Addr::from(input.tunnel_src),
            Ipv4Addr::from(input.tunnel_dst),
        )
        .with_optional(input.optional)
    };

    let policy = XfrmPolicy::from_rule(&sel, Some(&rule), input.req_id);
    let Some((decoded_sel, _)) = policy.decode_owned(input.req_id) else {
        panic!("owned policy failed to decode");
    };

    // 다시 인코딩하면 커널 키가 같아야 함
    let again = XfrmPolicy::from_rule(&decoded_sel, Some(&rule), input.req_id);
    assert!(policy.same_selector(&again));
    assert!(policy.decode_owned(input.req_id.wrapping_add(1)).is_none());
});
