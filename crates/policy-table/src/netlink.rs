//! NETLINK_XFRM 소켓 기반 커널 정책 게이트웨이
//!
//! 요청마다 `netlink-packet-core`로 nlmsghdr를 붙여 전송하고, ACK(에러 코드 0),
//! 커널 에러, dump 종료(`NLMSG_DONE`) 중 하나가 올 때까지 응답을 읽습니다.
//! payload는 [`crate::wire`]가 인코딩합니다.

use std::io;

use netlink_packet_core::{
    NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload,
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_XFRM};
use tracing::debug;

use crate::error::PolicyTableError;
use crate::kernel::{AddressFamily, XfrmConnector, XfrmHandle, XfrmPolicy};
use crate::wire::XfrmMessage;

/// 커널 XFRM 소켓을 여는 connector
#[derive(Debug, Clone, Copy, Default)]
pub struct NetlinkXfrmConnector;

impl XfrmConnector for NetlinkXfrmConnector {
    type Handle = NetlinkXfrmHandle;

    fn connect(&self) -> Result<NetlinkXfrmHandle, PolicyTableError> {
        let connect_error =
            |step: &str, e: io::Error| PolicyTableError::Connect(format!("{step}: {e}"));

        let mut socket = Socket::new(NETLINK_XFRM)
            .map_err(|e| connect_error("failed to open NETLINK_XFRM socket", e))?;
        socket
            .bind_auto()
            .map_err(|e| connect_error("failed to bind netlink socket", e))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| connect_error("failed to connect netlink socket", e))?;

        Ok(NetlinkXfrmHandle {
            socket: Some(socket),
            sequence: 0,
        })
    }
}

/// 열린 NETLINK_XFRM 소켓
pub struct NetlinkXfrmHandle {
    socket: Option<Socket>,
    sequence: u32,
}

impl NetlinkXfrmHandle {
    /// `message`를 보내고 완료될 때까지 응답 payload를 모읍니다.
    fn request(
        &mut self,
        operation: &str,
        message: XfrmMessage,
        flags: u16,
    ) -> Result<Vec<XfrmMessage>, PolicyTableError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| kernel_error(operation, "handle is closed"))?;
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | flags;
        header.sequence_number = sequence;
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf[..]);

        socket
            .send(&buf, 0)
            .map_err(|e| kernel_error(operation, e))?;

        let mut replies = Vec::new();
        loop {
            let (bytes, _) = socket
                .recv_from_full()
                .map_err(|e| kernel_error(operation, e))?;

            let mut offset = 0;
            while offset < bytes.len() {
                let reply = NetlinkMessage::<XfrmMessage>::deserialize(&bytes[offset..])
                    .map_err(|e| PolicyTableError::Decode(e.to_string()))?;
                let len = usize::try_from(reply.header.length).unwrap_or(usize::MAX);

                if reply.header.sequence_number == sequence {
                    match reply.payload {
                        NetlinkPayload::Done(_) => return Ok(replies),
                        NetlinkPayload::Error(err) => {
                            return match err.code {
                                None => Ok(replies),
                                Some(code) => Err(kernel_error(
                                    operation,
                                    io::Error::from_raw_os_error(-code.get()),
                                )),
                            };
                        }
                        NetlinkPayload::InnerMessage(msg) => replies.push(msg),
                        _ => {}
                    }
                } else {
                    debug!(
                        expected = sequence,
                        got = reply.header.sequence_number,
                        "ignoring stale netlink reply"
                    );
                }

                if len == 0 {
                    break;
                }
                offset = offset.saturating_add((len + 3) & !3);
            }
        }
    }
}

impl XfrmHandle for NetlinkXfrmHandle {
    fn list_policies(
        &mut self,
        family: AddressFamily,
    ) -> Result<Vec<XfrmPolicy>, PolicyTableError> {
        let replies = self.request("list", XfrmMessage::GetPolicies(family), NLM_F_DUMP)?;

        let mut policies = Vec::with_capacity(replies.len());
        for reply in replies {
            match reply {
                XfrmMessage::Policy(Some(policy)) => policies.push(policy),
                XfrmMessage::Malformed(e) => {
                    debug!(error = %e, "skipping undecodable xfrm policy");
                }
                _ => {}
            }
        }
        Ok(policies)
    }

    fn update_policy(&mut self, policy: &XfrmPolicy) -> Result<(), PolicyTableError> {
        self.request("update", XfrmMessage::UpdatePolicy(policy.clone()), NLM_F_ACK)
            .map(|_| ())
    }

    fn delete_policy(&mut self, policy: &XfrmPolicy) -> Result<(), PolicyTableError> {
        self.request("delete", XfrmMessage::DeletePolicy(policy.clone()), NLM_F_ACK)
            .map(|_| ())
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

fn kernel_error(operation: &str, reason: impl ToString) -> PolicyTableError {
    PolicyTableError::Kernel {
        operation: operation.to_owned(),
        reason: reason.to_string(),
    }
}
