//! Network interface address lookup
//!
//! The tunnel process brings up an interface (e.g. `tun0`) whose address the
//! download client must bind to. Addresses are reported in CIDR form
//! (`10.8.0.4/24`) and resolved to the bare address.

use std::net::IpAddr;

use crate::error::InterfaceError;

/// Looks up the addresses assigned to a named interface
pub trait AddressResolver: Send + Sync {
    /// All addresses of the interface in `address/prefix` form
    ///
    /// Returns `InterfaceError::NotFound` when no such interface exists.
    fn interface_addresses(&self, interface: &str) -> Result<Vec<String>, InterfaceError>;

    /// Resolve the address to bind to, preferring IPv4
    fn resolve(&self, interface: &str) -> Result<IpAddr, InterfaceError> {
        let addresses = self.interface_addresses(interface)?;
        tracing::debug!("Addresses for {:?}: {:?}", interface, addresses);

        let parsed = addresses
            .iter()
            .map(|a| strip_prefix_len(a))
            .collect::<Result<Vec<_>, _>>()?;

        parsed
            .iter()
            .find(|ip| ip.is_ipv4())
            .or(parsed.first())
            .copied()
            .ok_or_else(|| InterfaceError::NoAddress(interface.to_string()))
    }
}

/// Parse `10.8.0.4/24` (or a bare address) into the address part
pub fn strip_prefix_len(cidr: &str) -> Result<IpAddr, InterfaceError> {
    let address = cidr.split_once('/').map(|(a, _)| a).unwrap_or(cidr);
    address
        .trim()
        .parse()
        .map_err(|_| InterfaceError::InvalidAddress(cidr.to_string()))
}

/// Resolver backed by the operating system's interface table
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[cfg(unix)]
impl AddressResolver for SystemResolver {
    fn interface_addresses(&self, interface: &str) -> Result<Vec<String>, InterfaceError> {
        use std::ffi::CStr;
        use std::net::{Ipv4Addr, Ipv6Addr};

        tracing::debug!("Looking up addresses for interface {:?}", interface);

        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        // SAFETY: getifaddrs fills ifap with a linked list we free below
        if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
            return Err(InterfaceError::Io(std::io::Error::last_os_error()));
        }

        let mut found = false;
        let mut addresses = Vec::new();
        let mut cursor = ifap;

        while !cursor.is_null() {
            // SAFETY: cursor is a valid node of the list returned by getifaddrs
            let ifa = unsafe { &*cursor };
            cursor = ifa.ifa_next;

            if ifa.ifa_name.is_null() {
                continue;
            }
            let name = unsafe { CStr::from_ptr(ifa.ifa_name) }.to_string_lossy();
            if name != interface {
                continue;
            }
            found = true;

            if ifa.ifa_addr.is_null() {
                continue;
            }

            let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            match family {
                libc::AF_INET => {
                    let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    let prefix = if ifa.ifa_netmask.is_null() {
                        32
                    } else {
                        let mask = unsafe { &*(ifa.ifa_netmask as *const libc::sockaddr_in) };
                        u32::from_be(mask.sin_addr.s_addr).count_ones()
                    };
                    addresses.push(format!("{}/{}", ip, prefix));
                }
                libc::AF_INET6 => {
                    let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    let prefix = if ifa.ifa_netmask.is_null() {
                        128
                    } else {
                        let mask = unsafe { &*(ifa.ifa_netmask as *const libc::sockaddr_in6) };
                        mask.sin6_addr.s6_addr.iter().map(|b| b.count_ones()).sum()
                    };
                    addresses.push(format!("{}/{}", ip, prefix));
                }
                _ => {}
            }
        }

        // SAFETY: ifap came from a successful getifaddrs call
        unsafe { libc::freeifaddrs(ifap) };

        if !found {
            return Err(InterfaceError::NotFound(interface.to_string()));
        }
        if addresses.is_empty() {
            return Err(InterfaceError::NoAddress(interface.to_string()));
        }
        Ok(addresses)
    }
}

#[cfg(not(unix))]
impl AddressResolver for SystemResolver {
    fn interface_addresses(&self, interface: &str) -> Result<Vec<String>, InterfaceError> {
        Err(InterfaceError::NotFound(interface.to_string()))
    }
}
