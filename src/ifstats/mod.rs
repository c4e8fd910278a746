//! Per-interface byte counters.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;

use thiserror::Error;
use tracing::debug;

use crate::config::{InterfacesConfig, NameSelection};

/// Raw in/out byte counters of one interface at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSample {
    pub name: String,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Source of interface counters. Injected so tests can supply fixed samples.
pub trait InterfaceReader: Send + Sync {
    fn read(&self) -> impl Future<Output = io::Result<Vec<InterfaceSample>>> + Send;
}

/// Reads the kernel's counters: `/proc/net/dev` on Linux, `getifaddrs(3)`
/// link entries on the BSDs and macOS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceReader for SystemInterfaces {
    async fn read(&self) -> io::Result<Vec<InterfaceSample>> {
        read_system().await
    }
}

#[cfg(target_os = "linux")]
async fn read_system() -> io::Result<Vec<InterfaceSample>> {
    let text = tokio::fs::read_to_string("/proc/net/dev").await?;
    Ok(parse_proc_net_dev(&text))
}

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "macos"))]
async fn read_system() -> io::Result<Vec<InterfaceSample>> {
    read_link_counters()
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "macos"
)))]
async fn read_system() -> io::Result<Vec<InterfaceSample>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface counters are not supported on this platform",
    ))
}

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "macos"))]
fn read_link_counters() -> io::Result<Vec<InterfaceSample>> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs only writes the list head through a valid pointer.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut samples = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        // SAFETY: `cur` is a node of the list returned by getifaddrs and
        // stays valid until freeifaddrs below.
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;

        if ifa.ifa_addr.is_null() || ifa.ifa_data.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        // SAFETY: checked non-null above.
        let family = i32::from(unsafe { (*ifa.ifa_addr).sa_family });
        if family != libc::AF_LINK {
            continue;
        }

        // SAFETY: for AF_LINK entries ifa_data points to the interface's
        // `struct if_data`.
        let data = unsafe { &*(ifa.ifa_data as *const libc::if_data) };
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();

        samples.push(InterfaceSample {
            name,
            in_bytes: data.ifi_ibytes as u64,
            out_bytes: data.ifi_obytes as u64,
        });
    }

    // SAFETY: `head` came from a successful getifaddrs and is freed once.
    unsafe { libc::freeifaddrs(head) };

    Ok(samples)
}

/// Parses `/proc/net/dev`. Header and malformed lines are skipped.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub fn parse_proc_net_dev(text: &str) -> Vec<InterfaceSample> {
    text.lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            // 8 receive columns, then transmit bytes.
            let in_bytes = fields.first()?.parse().ok()?;
            let out_bytes = fields.get(8)?.parse().ok()?;
            Some(InterfaceSample {
                name: name.trim().to_string(),
                in_bytes,
                out_bytes,
            })
        })
        .collect()
}

/// Interface counter read failure.
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("reading interface counters: {0}")]
    Read(#[source] io::Error),
}

/// Reads interface counters and applies the configured selection.
pub struct InterfaceCollector<R> {
    reader: R,
    select: NameSelection,
}

impl<R: InterfaceReader> InterfaceCollector<R> {
    pub fn new(reader: R, cfg: &InterfacesConfig) -> Self {
        Self {
            reader,
            select: cfg.select.clone(),
        }
    }

    /// Selected interfaces in name order, one sample per name.
    pub async fn collect(&self) -> Result<Vec<InterfaceSample>, InterfaceError> {
        let samples = self.reader.read().await.map_err(InterfaceError::Read)?;

        let mut by_name = BTreeMap::new();
        for sample in samples {
            if !self.select.includes(&sample.name) {
                continue;
            }
            if by_name.contains_key(&sample.name) {
                debug!(interface = %sample.name, "duplicate interface entry ignored");
                continue;
            }
            by_name.insert(sample.name.clone(), sample);
        }

        Ok(by_name.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543210 5000    1    2    0     0          0        12 1234567     4000    0    0    0     0       0          0
 wlan0: garbage
";

    struct Fixed(Vec<InterfaceSample>);

    impl InterfaceReader for Fixed {
        async fn read(&self) -> io::Result<Vec<InterfaceSample>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl InterfaceReader for Broken {
        async fn read(&self) -> io::Result<Vec<InterfaceSample>> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    fn sample(name: &str, in_bytes: u64, out_bytes: u64) -> InterfaceSample {
        InterfaceSample {
            name: name.to_string(),
            in_bytes,
            out_bytes,
        }
    }

    #[test]
    fn test_parse_proc_net_dev() {
        let samples = parse_proc_net_dev(PROC_NET_DEV);
        assert_eq!(
            samples,
            vec![sample("lo", 123_456, 123_456), sample("eth0", 9_876_543_210, 1_234_567)]
        );
    }

    #[tokio::test]
    async fn test_collect_applies_selection_and_sorts() {
        let reader = Fixed(vec![
            sample("em1", 5, 6),
            sample("lo0", 1, 1),
            sample("em0", 3, 4),
        ]);
        let cfg = InterfacesConfig {
            enabled: true,
            select: NameSelection::Names(vec!["em0".to_string(), "em1".to_string()]),
        };
        let collected = InterfaceCollector::new(reader, &cfg)
            .collect()
            .await
            .expect("collect");
        assert_eq!(collected, vec![sample("em0", 3, 4), sample("em1", 5, 6)]);
    }

    #[tokio::test]
    async fn test_collect_keeps_first_duplicate() {
        let reader = Fixed(vec![sample("em0", 3, 4), sample("em0", 9, 9)]);
        let collected = InterfaceCollector::new(reader, &InterfacesConfig::default())
            .collect()
            .await
            .expect("collect");
        assert_eq!(collected, vec![sample("em0", 3, 4)]);
    }

    #[tokio::test]
    async fn test_collect_read_failure() {
        let err = InterfaceCollector::new(Broken, &InterfacesConfig::default())
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, InterfaceError::Read(_)));
    }
}
