//! Exit policies: the full rule lists of server descriptors and the
//! condensed port summaries of router status entries and microdescriptors.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{DocumentParseError, ErrorContext};

use ipnet::IpNet;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PolicyAction {
    Accept,
    Reject,
}

impl FromStr for PolicyAction {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" | "accept6" => Ok(PolicyAction::Accept),
            "reject" | "reject6" => Ok(PolicyAction::Reject),
            _ => Err(DocumentParseError::PolicyParseError(s.to_string())),
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PolicyAction::Accept => write!(f, "accept"),
            PolicyAction::Reject => write!(f, "reject"),
        }
    }
}

/// An inclusive port range; a single port has `min == max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub const ALL: PortRange = PortRange { min: 1, max: 65535 };

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

impl FromStr for PortRange {
    type Err = DocumentParseError;

    /// Parse from "80" or "1-1024".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let range = match s.split_once('-') {
            Some((min, max)) => PortRange {
                min: min.parse::<u16>().context("port range (from)")?,
                max: max.parse::<u16>().context("port range (to)")?,
            },
            None => {
                let port = s.parse::<u16>().context("port")?;
                PortRange { min: port, max: port }
            }
        };
        if range.min > range.max {
            return Err(DocumentParseError::RangeParseError(s.to_string()));
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// A condensed policy: which ports most addresses may be reached on.
///
/// Appears in `p` and `p6` lines of router status entries and
/// microdescriptors, and in `ipv6-policy` lines of server descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    pub action: PolicyAction,
    pub ranges: Vec<PortRange>,
}

impl PortSummary {
    /// What a missing `ipv6-policy` line means
    pub fn reject_all() -> PortSummary {
        PortSummary {
            action: PolicyAction::Reject,
            ranges: vec![PortRange::ALL],
        }
    }

    pub fn allows_port(&self, port: u16) -> bool {
        let listed = self.ranges.iter().any(|r| r.contains(port));
        match self.action {
            PolicyAction::Accept => listed,
            PolicyAction::Reject => !listed,
        }
    }

    /// Whether any port at all can be used
    pub fn is_exiting_allowed(&self) -> bool {
        match self.action {
            PolicyAction::Accept => !self.ranges.is_empty(),
            PolicyAction::Reject => self.ranges != [PortRange::ALL],
        }
    }
}

impl Default for PortSummary {
    fn default() -> Self {
        PortSummary::reject_all()
    }
}

impl FromStr for PortSummary {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, ports) = s
            .trim()
            .split_once(' ')
            .ok_or(DocumentParseError::MalformedExitPolicy)?;
        let action = action.parse::<PolicyAction>()?;
        let ranges = ports
            .trim()
            .split(',')
            .map(|p| {
                p.parse::<PortRange>()
                    .map_err(|_| DocumentParseError::InvalidExitPolicyEntry { raw: p.to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PortSummary { action, ranges })
    }
}

impl fmt::Display for PortSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ranges: Vec<String> = self.ranges.iter().map(ToString::to_string).collect();
        write!(f, "{} {}", self.action, ranges.join(","))
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum AddressPattern {
    Wildcard,
    Network(IpNet),
}

impl AddressPattern {
    pub fn matches(&self, address: IpAddr) -> bool {
        match self {
            AddressPattern::Wildcard => true,
            AddressPattern::Network(net) => net.contains(&address),
        }
    }
}

impl FromStr for AddressPattern {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" || s == "*4" || s == "*6" {
            return Ok(AddressPattern::Wildcard);
        }
        let invalid = || DocumentParseError::IpParseError(s.to_string());
        let unbracketed = |a: &str| a.trim_start_matches('[').replace(']', "");
        let network = match s.split_once('/') {
            Some((address, mask)) => {
                let address: IpAddr = unbracketed(address).parse().map_err(|_| invalid())?;
                let prefix = match mask.parse::<u8>() {
                    Ok(prefix) => prefix,
                    // old style dotted netmask, e.g. 255.255.0.0
                    Err(_) => netmask_prefix(mask).ok_or_else(invalid)?,
                };
                IpNet::new(address, prefix).map_err(|_| invalid())?
            }
            None => {
                let address: IpAddr = unbracketed(s).parse().map_err(|_| invalid())?;
                let host_prefix = if address.is_ipv4() { 32 } else { 128 };
                IpNet::new(address, host_prefix).map_err(|_| invalid())?
            }
        };
        Ok(AddressPattern::Network(network))
    }
}

/// Prefix length of a contiguous dotted IPv4 netmask
fn netmask_prefix(mask: &str) -> Option<u8> {
    let bits = u32::from(mask.parse::<std::net::Ipv4Addr>().ok()?);
    let ones = bits.leading_ones();
    (bits.count_ones() == ones).then(|| ones as u8)
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddressPattern::Wildcard => write!(f, "*"),
            AddressPattern::Network(IpNet::V6(net)) => write!(f, "[{}]/{}", net.addr(), net.prefix_len()),
            AddressPattern::Network(net) => write!(f, "{}", net),
        }
    }
}

/// One `accept` or `reject` line of a server descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRule {
    pub action: PolicyAction,
    pub address: AddressPattern,
    /// `None` for the `*` wildcard
    pub ports: Option<PortRange>,
}

impl ExitRule {
    /// Parse the `address:port` argument of an `accept` or `reject` line.
    pub fn parse(action: PolicyAction, argument: &str) -> Result<ExitRule, DocumentParseError> {
        let (address, port) = argument
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| DocumentParseError::InvalidExitPolicyEntry {
                raw: argument.to_string(),
            })?;
        let ports = match port {
            "*" => None,
            _ => Some(port.parse::<PortRange>()?),
        };
        Ok(ExitRule {
            action,
            address: address.parse()?,
            ports,
        })
    }

    pub fn matches(&self, address: IpAddr, port: u16) -> bool {
        self.address.matches(address) && self.ports.map_or(true, |r| r.contains(port))
    }
}

impl fmt::Display for ExitRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.ports {
            Some(range) => write!(f, "{} {}:{}", self.action, self.address, range),
            None => write!(f, "{} {}:*", self.action, self.address),
        }
    }
}

/// The ordered rules of a server descriptor; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitPolicy {
    pub rules: Vec<ExitRule>,
}

impl ExitPolicy {
    pub fn push(&mut self, rule: ExitRule) {
        self.rules.push(rule);
    }

    /// Whether traffic to `address:port` may exit. Unmatched traffic is
    /// accepted, as Tor does.
    pub fn allows(&self, address: IpAddr, port: u16) -> bool {
        self.rules
            .iter()
            .find(|r| r.matches(address, port))
            .map_or(true, |r| r.action == PolicyAction::Accept)
    }

    pub fn to_descriptor_lines(&self) -> Vec<String> {
        self.rules.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_summary() {
        let accept: PortSummary = "accept 80,443,6660-6669".parse().unwrap();
        assert!(accept.allows_port(443));
        assert!(accept.allows_port(6665));
        assert!(!accept.allows_port(22));
        assert_eq!("accept 80,443,6660-6669", accept.to_string());

        let reject: PortSummary = "reject 1-65535".parse().unwrap();
        assert!(!reject.allows_port(80));
        assert!(!reject.is_exiting_allowed());
        assert_eq!(PortSummary::reject_all(), reject);

        assert!("allow 80".parse::<PortSummary>().is_err());
        assert!("accept 80,x".parse::<PortSummary>().is_err());
        assert!("accept".parse::<PortSummary>().is_err());
    }

    #[test]
    fn test_rules() {
        let mut policy = ExitPolicy::default();
        policy.push(ExitRule::parse(PolicyAction::Reject, "10.0.0.0/8:*").unwrap());
        policy.push(ExitRule::parse(PolicyAction::Accept, "*:80-81").unwrap());
        policy.push(ExitRule::parse(PolicyAction::Reject, "*:*").unwrap());

        assert!(!policy.allows("10.1.2.3".parse().unwrap(), 80));
        assert!(policy.allows("192.0.2.1".parse().unwrap(), 81));
        assert!(!policy.allows("192.0.2.1".parse().unwrap(), 443));
        assert_eq!(
            vec!["reject 10.0.0.0/8:*", "accept *:80-81", "reject *:*"],
            policy.to_descriptor_lines()
        );
    }

    #[test]
    fn test_addresses() {
        let rule = ExitRule::parse(PolicyAction::Accept, "[2001:db8::]/32:443").unwrap();
        assert!(rule.matches("2001:db8::1".parse().unwrap(), 443));
        assert!(!rule.matches("2001:db9::1".parse().unwrap(), 443));

        let masked = ExitRule::parse(PolicyAction::Reject, "192.168.0.0/255.255.0.0:*").unwrap();
        assert!(masked.matches("192.168.7.7".parse().unwrap(), 1));

        let host = ExitRule::parse(PolicyAction::Reject, "192.0.2.7:25").unwrap();
        assert!(host.matches("192.0.2.7".parse().unwrap(), 25));
        assert!(!host.matches("192.0.2.8".parse().unwrap(), 25));

        assert!(ExitRule::parse(PolicyAction::Accept, "nonsense").is_err());
        assert!(ExitRule::parse(PolicyAction::Accept, "1.2.3.999:80").is_err());
    }
}
