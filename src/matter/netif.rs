//! Network interface selection and filtering.
//!
//! The default UnixNetifs implementation reports every interface on the
//! host, including addresses that may be visible via mDNS reflection but
//! don't belong to this node. Everything here pins the stack to a single
//! interface: transport bind address, mDNS multicast membership and the
//! general-diagnostics netif list all agree.

use std::ffi::CString;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::{InterfaceFlags, if_nametoindex};
use nix::sys::socket::{AddressFamily, SockaddrLike};

use rs_matter::dm::clusters::gen_diag::{InterfaceTypeEnum, NetifDiag, NetifInfo};
use rs_matter::dm::networks::NetChangeNotif;
use rs_matter::error::{Error, ErrorCode};

static INTERFACE_NAME: OnceLock<String> = OnceLock::new();

/// The interface the stack binds to: `MATTER_INTERFACE` if set, otherwise
/// the first running non-loopback interface carrying an IPv4 address.
pub fn interface_name() -> &'static str {
    INTERFACE_NAME.get_or_init(|| {
        if let Ok(name) = std::env::var("MATTER_INTERFACE") {
            return name;
        }

        let Ok(addrs) = getifaddrs() else {
            return "eth0".to_string();
        };

        for ifaddr in addrs {
            if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                || !ifaddr.flags.contains(InterfaceFlags::IFF_RUNNING)
            {
                continue;
            }
            if let Some(addr) = ifaddr.address
                && addr.family() == Some(AddressFamily::Inet)
            {
                return ifaddr.interface_name;
            }
        }

        "eth0".to_string()
    })
}

/// Kernel index of the selected interface.
pub fn interface_index(name: &str) -> Result<u32, Error> {
    let cname = CString::new(name).map_err(|_| {
        log::error!("Invalid interface name: {name}");
        Error::from(ErrorCode::MdnsError)
    })?;
    if_nametoindex(cname.as_c_str()).map_err(|e| {
        log::error!("Failed to get interface index for '{name}': {e:?}");
        Error::from(ErrorCode::MdnsError)
    })
}

/// IPv4 and IPv6 addresses of the selected interface, link-local IPv6
/// (fe80::/10) excluded.
pub fn interface_addresses(name: &str) -> Result<(Vec<Ipv4Addr>, Vec<Ipv6Addr>), Error> {
    let addrs = getifaddrs().map_err(|e| {
        log::error!("Failed to enumerate interface addresses: {e:?}");
        ErrorCode::MdnsError
    })?;

    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();

    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }

        if let Some(addr) = ifaddr.address
            && let Some(family) = addr.family()
        {
            match family {
                AddressFamily::Inet => {
                    if let Some(sockaddr) = addr.as_sockaddr_in() {
                        ipv4.push(sockaddr.ip());
                    }
                }
                AddressFamily::Inet6 => {
                    if let Some(sockaddr) = addr.as_sockaddr_in6() {
                        let ip = sockaddr.ip();
                        let octets = ip.octets();
                        if !(octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80) {
                            ipv6.push(ip);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Ok((ipv4, ipv6))
}

/// Netif diagnostics provider reporting only the selected interface.
#[derive(Clone, Copy)]
pub struct FilteredNetifs {
    interface_name: &'static str,
}

impl FilteredNetifs {
    pub fn new(interface_name: &'static str) -> Self {
        Self { interface_name }
    }
}

impl NetifDiag for FilteredNetifs {
    fn netifs(&self, f: &mut dyn FnMut(&NetifInfo) -> Result<(), Error>) -> Result<(), Error> {
        let Ok(addrs) = getifaddrs() else {
            return Ok(());
        };

        let mut ipv4_addrs: Vec<Ipv4Addr> = Vec::new();
        let mut ipv6_addrs: Vec<Ipv6Addr> = Vec::new();
        let mut hw_addr = [0u8; 8];
        let mut operational = false;
        let mut found = false;
        let mut netif_index = 0u32;

        for ifaddr in addrs {
            let name = &ifaddr.interface_name;
            if name != self.interface_name {
                continue;
            }

            found = true;

            if netif_index == 0
                && let Ok(cname) = CString::new(name.as_str())
                && let Ok(idx) = if_nametoindex(cname.as_c_str())
            {
                netif_index = idx;
            }

            if ifaddr.flags.contains(InterfaceFlags::IFF_RUNNING) {
                operational = true;
            }

            if let Some(addr) = ifaddr.address
                && let Some(family) = addr.family()
            {
                match family {
                    AddressFamily::Inet => {
                        if let Some(sockaddr) = addr.as_sockaddr_in() {
                            ipv4_addrs.push(sockaddr.ip());
                        }
                    }
                    AddressFamily::Inet6 => {
                        if let Some(sockaddr) = addr.as_sockaddr_in6() {
                            let ip = sockaddr.ip();
                            // Skip link-local (fe80::/10)
                            let octets = ip.octets();
                            if octets[0] != 0xfe || (octets[1] & 0xc0) != 0x80 {
                                ipv6_addrs.push(ip);
                            }
                        }
                    }
                    AddressFamily::Packet => {
                        if let Some(link_addr) = addr.as_link_addr()
                            && let Some(mac) = link_addr.addr()
                        {
                            let len = mac.len().min(8);
                            hw_addr[..len].copy_from_slice(&mac[..len]);
                        }
                    }
                    _ => {}
                }
            }
        }

        if !found {
            log::warn!(
                "FilteredNetifs: interface '{}' not found",
                self.interface_name
            );
            return Ok(());
        }

        let info = NetifInfo {
            name: self.interface_name,
            operational,
            offprem_svc_reachable_ipv4: None,
            offprem_svc_reachable_ipv6: None,
            hw_addr: &hw_addr,
            ipv4_addrs: &ipv4_addrs,
            ipv6_addrs: &ipv6_addrs,
            netif_type: InterfaceTypeEnum::Ethernet,
            netif_index,
        };

        f(&info)
    }
}

impl NetChangeNotif for FilteredNetifs {
    async fn wait_changed(&self) {
        // Interface changes are not tracked; the list is re-read per query.
        core::future::pending().await
    }
}
