//! Inspection and recovery of XDP state from outside the owning process.
//!
//! If a process dies with a misbehaving filter attached, the interface keeps
//! redirecting into sockets nobody reads. These helpers find what is attached
//! and remove it, either through the XDP link (`BPF_LINK_DETACH`) or, for
//! programs attached the legacy way, by clearing `IFLA_XDP` over rtnetlink.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST,
};
use netlink_packet_route::link::nlas::{Nla, Xdp};
use netlink_packet_route::{LinkMessage, RtnlMessage, AF_UNSPEC};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use tracing::{debug, info, warn};

use crate::bpf_sys::{
    fd_by_id, link_detach, next_id, obj_info, BPF_LINK_GET_FD_BY_ID, BPF_LINK_GET_NEXT_ID,
    BPF_LINK_TYPE_XDP, BPF_PROG_GET_FD_BY_ID, BPF_PROG_GET_NEXT_ID, XDP_FLAGS_DRV_MODE,
    XDP_FLAGS_SKB_MODE,
};
use crate::error::{Result, XdpError};

/// Leading fields of `struct bpf_prog_info`.
#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy, Default)]
struct BpfProgInfo {
    prog_type: u32,
    id: u32,
    tag: [u8; 8],
    jited_prog_len: u32,
    xlated_prog_len: u32,
    jited_prog_insns: u64,
    xlated_prog_insns: u64,
    load_time: u64,
    created_by_uid: u32,
    nr_map_ids: u32,
    map_ids: u64,
    name: [u8; 16],
    ifindex: u32,
    flags: u32,
}

/// `struct bpf_link_info` with the XDP member of its union.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct BpfLinkInfo {
    link_type: u32,
    id: u32,
    prog_id: u32,
    _pad: u32,
    xdp_ifindex: u32,
    _pad2: u32,
}

const _: () = {
    use std::mem::offset_of;
    assert!(offset_of!(BpfProgInfo, name) == 64);
    assert!(offset_of!(BpfProgInfo, ifindex) == 80);
    assert!(mem::size_of::<BpfProgInfo>() == 88);
    assert!(offset_of!(BpfLinkInfo, xdp_ifindex) == 16);
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub id: u32,
    pub prog_type: u32,
    pub name: String,
    /// Hex of the kernel's program tag (hash of the instructions).
    pub tag: String,
}

impl ProgramInfo {
    fn from_raw(info: &BpfProgInfo) -> Self {
        let end = info.name.iter().position(|&b| b == 0).unwrap_or(info.name.len());
        Self {
            id: info.id,
            prog_type: info.prog_type,
            name: String::from_utf8_lossy(&info.name[..end]).into_owned(),
            tag: info.tag.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdpLinkInfo {
    pub id: u32,
    pub prog_id: u32,
    pub ifindex: u32,
}

/// Take ownership of an fd handed out by `bpf(2)`.
fn owned(fd: RawFd) -> OwnedFd {
    // SAFETY: `fd` was just returned by the kernel and is owned by no one.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Every BPF program loaded on the host.
pub fn list_programs() -> Result<Vec<ProgramInfo>> {
    let mut programs = Vec::new();
    let mut id = 0;
    while let Some(next) = next_id(BPF_PROG_GET_NEXT_ID, id)? {
        id = next;
        let Some(fd) = fd_by_id(BPF_PROG_GET_FD_BY_ID, id)? else {
            continue;
        };
        let fd = owned(fd);
        let mut info = BpfProgInfo::default();
        obj_info(fd.as_raw_fd(), &mut info)?;
        programs.push(ProgramInfo::from_raw(&info));
    }
    Ok(programs)
}

/// Every XDP link on the host.
pub fn list_xdp_links() -> Result<Vec<XdpLinkInfo>> {
    let mut links = Vec::new();
    let mut id = 0;
    while let Some(next) = next_id(BPF_LINK_GET_NEXT_ID, id)? {
        id = next;
        let Some(fd) = fd_by_id(BPF_LINK_GET_FD_BY_ID, id)? else {
            continue;
        };
        let fd = owned(fd);
        let mut info = BpfLinkInfo::default();
        obj_info(fd.as_raw_fd(), &mut info)?;
        if info.link_type == BPF_LINK_TYPE_XDP {
            links.push(XdpLinkInfo {
                id: info.id,
                prog_id: info.prog_id,
                ifindex: info.xdp_ifindex,
            });
        }
    }
    Ok(links)
}

/// Remove every XDP program from `ifindex`, however it was attached.
/// Returns the number of links detached.
pub fn force_detach(ifindex: u32) -> Result<usize> {
    let mut detached = 0;
    for link in list_xdp_links()?.into_iter().filter(|l| l.ifindex == ifindex) {
        let Some(fd) = fd_by_id(BPF_LINK_GET_FD_BY_ID, link.id)? else {
            continue;
        };
        let fd = owned(fd);
        link_detach(fd.as_raw_fd())?;
        warn!(
            ifindex,
            link_id = link.id,
            prog_id = link.prog_id,
            "force-detached XDP link"
        );
        detached += 1;
    }

    for (flags, mode) in [(XDP_FLAGS_SKB_MODE, "skb"), (XDP_FLAGS_DRV_MODE, "native")] {
        match clear_netlink_xdp(ifindex, flags) {
            Ok(()) => debug!(ifindex, mode, "cleared netlink XDP attachment"),
            Err(e) if tolerated_clear_error(&e) => {
                debug!(ifindex, mode, error = %e, "nothing to clear")
            }
            Err(e) => return Err(e),
        }
    }

    info!(ifindex, links = detached, "XDP removed from interface");
    Ok(detached)
}

fn tolerated_clear_error(e: &XdpError) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::EOPNOTSUPP) | Some(libc::EINVAL)
    )
}

// ---------------------------------------------------------------------------
// rtnetlink
// ---------------------------------------------------------------------------

/// `RTM_SETLINK` setting `IFLA_XDP_FD = -1` for the given attach mode.
fn clear_xdp_request(ifindex: u32, xdp_flags: u32, seq: u32) -> NetlinkMessage<RtnlMessage> {
    let mut link = LinkMessage::default();
    link.header.interface_family = AF_UNSPEC as u8;
    link.header.index = ifindex;
    link.nlas.push(Nla::Xdp(vec![Xdp::Fd(-1), Xdp::Flags(xdp_flags)]));

    let mut header = NetlinkHeader::default();
    header.flags = NLM_F_REQUEST | NLM_F_ACK;
    header.sequence_number = seq;
    let mut msg = NetlinkMessage::new(
        header,
        NetlinkPayload::InnerMessage(RtnlMessage::SetLink(link)),
    );
    // Sets `length` and `message_type` from the payload.
    msg.finalize();
    msg
}

/// Interpret the kernel's reply to an `NLM_F_ACK` request.
fn parse_ack(reply: &[u8]) -> io::Result<()> {
    let msg = NetlinkMessage::<RtnlMessage>::deserialize(reply)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let message_type = msg.header.message_type;
    match msg.payload {
        NetlinkPayload::Error(err) => match err.code {
            None => Ok(()),
            Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
        },
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected netlink message type {}", message_type),
        )),
    }
}

fn clear_netlink_xdp(ifindex: u32, xdp_flags: u32) -> Result<()> {
    let mut socket =
        Socket::new(NETLINK_ROUTE).map_err(|e| XdpError::syscall("socket(AF_NETLINK)", e))?;
    socket
        .bind_auto()
        .map_err(|e| XdpError::syscall("netlink bind", e))?;

    let msg = clear_xdp_request(ifindex, xdp_flags, 1);
    let mut buf = vec![0u8; msg.buffer_len()];
    msg.serialize(&mut buf[..]);
    socket
        .send_to(&buf, &SocketAddr::new(0, 0), 0)
        .map_err(|e| XdpError::syscall("netlink sendto", e))?;

    let (reply, _) = socket
        .recv_from_full()
        .map_err(|e| XdpError::syscall("netlink recv", e))?;
    parse_ack(&reply).map_err(|e| XdpError::syscall("RTM_SETLINK IFLA_XDP", e))
}
