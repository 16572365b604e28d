//! CIDR expansion and range-file loading for the sweep.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use thiserror::Error;

/// Why one range line was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid CIDR syntax")]
    Syntax,
    #[error("only IPv4 ranges are supported")]
    NotIpv4,
    #[error("host bits set below the /{0} prefix")]
    HostBits(u8),
}

/// Expand one IPv4 CIDR into its probe-able host addresses.
///
/// Network and broadcast addresses are excluded for prefixes of /30
/// and shorter; a /31 yields both addresses and a /32 its single one.
/// A bare address without a prefix behaves as /32. Host bits set
/// below the prefix are rejected rather than silently truncated, so
/// `192.168.1.5/24` is an error and not an alias for `192.168.1.0/24`.
pub fn expand_cidr(range: &str) -> Result<Vec<Ipv4Addr>, RangeError> {
    let range = range.trim();
    if !range.contains('/') {
        if let Ok(addr) = range.parse::<Ipv4Addr>() {
            return Ok(vec![addr]);
        }
        if range.parse::<Ipv6Addr>().is_ok() {
            return Err(RangeError::NotIpv4);
        }
        return Err(RangeError::Syntax);
    }
    let net: Ipv4Net = match range.parse() {
        Ok(net) => net,
        Err(_) => {
            return Err(if range.parse::<IpNet>().is_ok() {
                RangeError::NotIpv4
            } else {
                RangeError::Syntax
            });
        }
    };
    if net.addr() != net.network() {
        return Err(RangeError::HostBits(net.prefix_len()));
    }
    Ok(net.hosts().collect())
}

/// One accepted range and how many addresses it expanded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRange {
    pub cidr: String,
    pub count: usize,
}

/// One skipped line and the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRange {
    pub line: String,
    pub reason: String,
}

/// Outcome of expanding a whole range list.
///
/// Rejections are data rather than errors: one malformed line never
/// fails the batch, it just does not contribute addresses.
#[derive(Debug, Default)]
pub struct LoadedRanges {
    /// Concatenation of every accepted range's expansion, in file order.
    pub addresses: Vec<Ipv4Addr>,
    pub accepted: Vec<LoadedRange>,
    pub rejected: Vec<RejectedRange>,
}

/// Expand every line, skipping blanks and `#` comments.
pub fn collect_ranges<'a, I>(lines: I) -> LoadedRanges
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = LoadedRanges::default();
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match expand_cidr(line) {
            Ok(addrs) => {
                out.accepted.push(LoadedRange { cidr: line.to_string(), count: addrs.len() });
                out.addresses.extend(addrs);
            }
            Err(e) => {
                out.rejected.push(RejectedRange { line: line.to_string(), reason: e.to_string() });
            }
        }
    }
    out
}

/// Read a range file: one CIDR or bare address per line.
pub fn load_ranges(path: &Path) -> Result<LoadedRanges> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read range file {}", path.display()))?;
    Ok(collect_ranges(text.lines()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_28_yields_fourteen_hosts() {
        let ips = expand_cidr("192.0.2.0/28").unwrap();
        assert_eq!(ips.len(), 14);
        assert_eq!(ips.first(), Some(&Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(ips.last(), Some(&Ipv4Addr::new(192, 0, 2, 14)));
        assert!(!ips.contains(&Ipv4Addr::new(192, 0, 2, 0)));
        assert!(!ips.contains(&Ipv4Addr::new(192, 0, 2, 15)));
    }

    #[test]
    fn slash_24_yields_the_usual_254() {
        let ips = expand_cidr("10.20.30.0/24").unwrap();
        assert_eq!(ips.len(), 254);
        assert_eq!(ips.first(), Some(&Ipv4Addr::new(10, 20, 30, 1)));
        assert_eq!(ips.last(), Some(&Ipv4Addr::new(10, 20, 30, 254)));
    }

    #[test]
    fn expansion_has_no_duplicates() {
        let ips = expand_cidr("198.51.100.0/26").unwrap();
        let mut dedup = ips.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), ips.len());
    }

    #[test]
    fn tiny_prefixes_keep_every_address() {
        assert_eq!(
            expand_cidr("192.0.2.6/31").unwrap(),
            vec![Ipv4Addr::new(192, 0, 2, 6), Ipv4Addr::new(192, 0, 2, 7)]
        );
        assert_eq!(expand_cidr("192.0.2.9/32").unwrap(), vec![Ipv4Addr::new(192, 0, 2, 9)]);
    }

    #[test]
    fn bare_address_acts_as_slash_32() {
        assert_eq!(expand_cidr("203.0.113.5").unwrap(), vec![Ipv4Addr::new(203, 0, 113, 5)]);
    }

    #[test]
    fn host_bits_below_the_prefix_are_rejected() {
        assert_eq!(expand_cidr("192.168.1.5/24"), Err(RangeError::HostBits(24)));
        // The aligned network address is fine.
        assert!(expand_cidr("192.168.1.0/24").is_ok());
    }

    #[test]
    fn non_ipv4_input_is_rejected() {
        assert_eq!(expand_cidr("2001:db8::/64"), Err(RangeError::NotIpv4));
        assert_eq!(expand_cidr("2001:db8::1"), Err(RangeError::NotIpv4));
        assert_eq!(expand_cidr("not-a-range"), Err(RangeError::Syntax));
        assert_eq!(expand_cidr("10.0.0.0/33"), Err(RangeError::Syntax));
    }

    #[test]
    fn collect_skips_comments_and_keeps_going_past_bad_lines() {
        let text = "# edge ranges\n\n192.0.2.0/30\nbogus/99\n  203.0.113.7  \n";
        let loaded = collect_ranges(text.lines());
        assert_eq!(loaded.accepted.len(), 2);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(loaded.rejected[0].line, "bogus/99");
        assert_eq!(
            loaded.addresses,
            vec![
                Ipv4Addr::new(192, 0, 2, 1),
                Ipv4Addr::new(192, 0, 2, 2),
                Ipv4Addr::new(203, 0, 113, 7),
            ]
        );
        assert_eq!(loaded.accepted[0], LoadedRange { cidr: "192.0.2.0/30".into(), count: 2 });
    }

    #[test]
    fn empty_input_loads_nothing() {
        let loaded = collect_ranges("".lines());
        assert!(loaded.addresses.is_empty());
        assert!(loaded.accepted.is_empty());
        assert!(loaded.rejected.is_empty());
    }
}
