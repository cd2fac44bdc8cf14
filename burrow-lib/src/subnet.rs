//! Classification and set math for redirect targets.
//!
//! A target is either an IPv4 literal (optionally carrying a prefix length)
//! or a DNS name. Literals go to the firewall verbatim; resolved addresses
//! are emitted as host routes in `<ip>/32` form.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

use cidr::Ipv4Cidr;
use regex::Regex;
use thiserror::Error;

static IPV4_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A\d+\.\d+\.\d+\.\d+(/\d+)?\z").expect("hardcoded regex"));

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid subnet {0}: {1}")]
    Invalid(String, String),
}

/// Whether a target is an IPv4 literal rather than a DNS name.
pub fn is_ipv4_target(target: &str) -> bool {
    IPV4_TARGET.is_match(target)
}

/// Parse a subnet string; a bare address becomes a host route and host bits
/// below the prefix are ignored.
pub fn parse(input: &str) -> Result<Ipv4Cidr, Error> {
    cidr::parsers::parse_cidr_ignore_hostbits::<Ipv4Cidr, _>(input, Ipv4Addr::from_str)
        .map_err(|e| Error::Invalid(input.to_string(), e.to_string()))
}

/// Whether `subnet` is contained in or equal to any entry of `excludes`.
pub fn is_excluded(subnet: &str, excludes: &[Ipv4Cidr]) -> bool {
    let Ok(cidr) = parse(subnet) else {
        return false;
    };
    excludes.iter().any(|exclude| {
        exclude.first_address() <= cidr.first_address()
            && cidr.last_address() <= exclude.last_address()
    })
}
