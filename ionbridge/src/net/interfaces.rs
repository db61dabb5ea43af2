//! Network interface enumeration.
//!
//! Synchronous and reactor-free: the kernel snapshot from `getifaddrs` is
//! walked once and projected into the `{ipv4: {...}, ipv6: {...}}` report.
//! An interface with several addresses of one family reports its last.

use std::ffi::CStr;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde_json::{json, Map, Value};

use crate::error::CoreError;

/// Enumerates interfaces into `{ipv4: {name: addr, …, "local": "0.0.0.0"},
/// ipv6: {…, "local": "::1"}}`.
#[cfg(unix)]
pub fn network_interfaces() -> Result<Value, CoreError> {
    let mut ipv4 = Map::new();
    let mut ipv6 = Map::new();

    unsafe {
        let mut list: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut list) != 0 {
            return Err(CoreError::platform(&io::Error::last_os_error()));
        }

        let mut cursor = list;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;

            if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
                continue;
            }

            let name = CStr::from_ptr(entry.ifa_name).to_string_lossy().into_owned();
            match i32::from((*entry.ifa_addr).sa_family) {
                libc::AF_INET => {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    ipv4.insert(name, Value::from(ip.to_string()));
                }
                libc::AF_INET6 => {
                    let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    ipv6.insert(name, Value::from(ip.to_string()));
                }
                _ => {}
            }
        }

        libc::freeifaddrs(list);
    }

    ipv4.insert("local".to_string(), Value::from("0.0.0.0"));
    ipv6.insert("local".to_string(), Value::from("::1"));

    Ok(json!({ "ipv4": ipv4, "ipv6": ipv6 }))
}

#[cfg(not(unix))]
pub fn network_interfaces() -> Result<Value, CoreError> {
    Err(CoreError::NotSupported("network interface enumeration"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_always_carries_local_entries() {
        let report = network_interfaces().unwrap();
        assert_eq!(report["ipv4"]["local"], "0.0.0.0");
        assert_eq!(report["ipv6"]["local"], "::1");
    }

    #[test]
    fn loopback_appears_as_ipv4() {
        let report = network_interfaces().unwrap();
        let ipv4 = report["ipv4"].as_object().unwrap();
        assert!(
            ipv4.values().any(|v| v == "127.0.0.1"),
            "expected a loopback address in {ipv4:?}"
        );
    }
}
