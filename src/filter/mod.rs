//! Upstream answer validation.
//!
//! Decides whether an upstream answer looks genuine or looks like the
//! product of censorship or a broken resolver: no answer at all, or
//! addresses in ranges no public name should resolve to.

mod blocklist;

pub use blocklist::{BlockEntry, Blocklist, Network};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::dns::DnsRecord;

/// A classification rule, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRule {
    Loopback,
    Private,
    LinkLocal,
    Reserved,
    Custom,
}

/// Built-in rules in evaluation order. `Custom` is consulted last.
const BUILTIN_RULES: [BlockRule; 4] = [
    BlockRule::Loopback,
    BlockRule::Private,
    BlockRule::LinkLocal,
    BlockRule::Reserved,
];

impl BlockRule {
    pub fn name(self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Private => "private",
            Self::LinkLocal => "link-local",
            Self::Reserved => "reserved",
            Self::Custom => "custom",
        }
    }

    fn matches_builtin(self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.matches_v4(ip),
            IpAddr::V6(ip) => self.matches_v6(ip),
        }
    }

    fn matches_v4(self, ip: Ipv4Addr) -> bool {
        let [a, b, c, _] = ip.octets();
        match self {
            Self::Loopback => ip.is_loopback(),
            Self::Private => ip.is_private(),
            Self::LinkLocal => ip.is_link_local(),
            Self::Reserved => {
                a == 0 // "this network", includes 0.0.0.0
                    || (a == 100 && (b & 0xC0) == 64) // shared address space 100.64/10
                    || (a == 192 && b == 0 && c == 0) // IETF protocol assignments
                    || (a == 198 && (b & 0xFE) == 18) // benchmarking 198.18/15
                    || ip.is_documentation()
                    || ip.is_multicast()
                    || a >= 240 // 240/4 and broadcast
            }
            Self::Custom => false,
        }
    }

    fn matches_v6(self, ip: Ipv6Addr) -> bool {
        let segments = ip.segments();
        match self {
            Self::Loopback => ip.is_loopback(),
            Self::Private => ip.is_unique_local(),
            Self::LinkLocal => ip.is_unicast_link_local(),
            Self::Reserved => {
                ip.is_unspecified()
                    || ip.is_multicast()
                    || (segments[0] == 0x2001 && segments[1] == 0x0db8) // documentation
                    || (segments[0] == 0x0100 && segments[1..4] == [0, 0, 0]) // discard 100::/64
            }
            Self::Custom => false,
        }
    }
}

impl fmt::Display for BlockRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an answer set was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The answer section was empty.
    NoAnswer,
    /// An address matched a rule.
    Rule { rule: BlockRule, addr: IpAddr },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAnswer => f.write_str("no-answer"),
            Self::Rule { rule, addr } => write!(f, "{rule} ({addr})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Classifies upstream answer sets. Holds only immutable state.
#[derive(Debug, Clone, Default)]
pub struct IpValidator {
    blocklist: Blocklist,
}

impl IpValidator {
    pub fn new(blocklist: Blocklist) -> Self {
        Self { blocklist }
    }

    /// Classify an answer set.
    ///
    /// Addresses are checked in answer order; for each address the rules
    /// are tried in order and the first match decides. Records without
    /// an address (CNAME, MX, ...) are never blocked themselves.
    pub fn classify(&self, answers: &[DnsRecord]) -> Verdict {
        if answers.is_empty() {
            return Verdict::Blocked(BlockReason::NoAnswer);
        }

        for addr in answers.iter().filter_map(DnsRecord::address).map(unmap) {
            if let Some(rule) = self.classify_addr(addr) {
                return Verdict::Blocked(BlockReason::Rule { rule, addr });
            }
        }

        Verdict::Allowed
    }

    /// First rule matching a single address.
    ///
    /// IPv4-mapped IPv6 addresses are judged as their IPv4 form by every
    /// rule, the custom blocklist included.
    pub fn classify_addr(&self, addr: IpAddr) -> Option<BlockRule> {
        let addr = unmap(addr);
        BUILTIN_RULES
            .into_iter()
            .find(|rule| rule.matches_builtin(addr))
            .or_else(|| self.blocklist.matches(addr).map(|_| BlockRule::Custom))
    }

    /// Returns the number of custom blocklist entries.
    pub fn blocklist_len(&self) -> usize {
        self.blocklist.len()
    }
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::TYPE_A;

    fn a(ip: [u8; 4]) -> DnsRecord {
        DnsRecord::a("example.com", Ipv4Addr::from(ip), 300)
    }

    fn aaaa(ip: &str) -> DnsRecord {
        DnsRecord::aaaa("example.com", ip.parse().unwrap(), 300)
    }

    fn rule_of(verdict: Verdict) -> Option<BlockRule> {
        match verdict {
            Verdict::Blocked(BlockReason::Rule { rule, .. }) => Some(rule),
            _ => None,
        }
    }

    #[test]
    fn empty_answer_is_blocked() {
        let validator = IpValidator::default();

        assert_eq!(validator.classify(&[]), Verdict::Blocked(BlockReason::NoAnswer));
    }

    #[test]
    fn loopback_is_blocked() {
        let validator = IpValidator::default();

        assert_eq!(
            validator.classify(&[a([127, 0, 0, 1])]),
            Verdict::Blocked(BlockReason::Rule {
                rule: BlockRule::Loopback,
                addr: "127.0.0.1".parse().unwrap(),
            })
        );
    }

    #[test]
    fn public_address_is_allowed() {
        let validator = IpValidator::default();

        assert_eq!(validator.classify(&[a([93, 184, 216, 34])]), Verdict::Allowed);
        assert!(validator.classify(&[aaaa("2606:2800:220:1:248:1893:25c8:1946")]).is_allowed());
    }

    #[test]
    fn each_builtin_range_is_detected() {
        let validator = IpValidator::default();
        let cases = [
            ([10, 0, 0, 5], BlockRule::Private),
            ([172, 16, 3, 4], BlockRule::Private),
            ([192, 168, 1, 1], BlockRule::Private),
            ([169, 254, 1, 1], BlockRule::LinkLocal),
            ([0, 0, 0, 0], BlockRule::Reserved),
            ([100, 64, 0, 1], BlockRule::Reserved),
            ([198, 18, 0, 1], BlockRule::Reserved),
            ([192, 0, 2, 10], BlockRule::Reserved),
            ([224, 0, 0, 1], BlockRule::Reserved),
            ([240, 0, 0, 1], BlockRule::Reserved),
            ([255, 255, 255, 255], BlockRule::Reserved),
        ];

        for (ip, expected) in cases {
            assert_eq!(rule_of(validator.classify(&[a(ip)])), Some(expected), "{ip:?}");
        }
    }

    #[test]
    fn range_boundaries_are_not_overmatched() {
        let validator = IpValidator::default();

        for ip in [[172, 32, 0, 1], [100, 128, 0, 1], [198, 20, 0, 1], [11, 0, 0, 1]] {
            assert!(validator.classify(&[a(ip)]).is_allowed(), "{ip:?}");
        }
    }

    #[test]
    fn ipv6_ranges_are_detected() {
        let validator = IpValidator::default();

        assert_eq!(rule_of(validator.classify(&[aaaa("::1")])), Some(BlockRule::Loopback));
        assert_eq!(rule_of(validator.classify(&[aaaa("fd00::1")])), Some(BlockRule::Private));
        assert_eq!(rule_of(validator.classify(&[aaaa("fe80::1")])), Some(BlockRule::LinkLocal));
        assert_eq!(rule_of(validator.classify(&[aaaa("::")])), Some(BlockRule::Reserved));
        assert_eq!(rule_of(validator.classify(&[aaaa("2001:db8::1")])), Some(BlockRule::Reserved));
        assert_eq!(
            rule_of(validator.classify(&[aaaa("::ffff:127.0.0.1")])),
            Some(BlockRule::Loopback)
        );
    }

    #[test]
    fn custom_blocklist_is_checked_last() {
        let validator = IpValidator::new(Blocklist::new());

        assert_eq!(
            rule_of(validator.classify(&[a([203, 98, 7, 65])])),
            Some(BlockRule::Custom)
        );
    }

    #[test]
    fn mapped_address_hits_custom_blocklist() {
        let validator = IpValidator::new(Blocklist::new());

        assert_eq!(
            validator.classify(&[aaaa("::ffff:203.98.7.65")]),
            Verdict::Blocked(BlockReason::Rule {
                rule: BlockRule::Custom,
                addr: "203.98.7.65".parse().unwrap(),
            })
        );
    }

    #[test]
    fn any_blocked_address_blocks_the_set() {
        let validator = IpValidator::default();

        let verdict = validator.classify(&[a([93, 184, 216, 34]), a([10, 1, 2, 3])]);

        assert_eq!(rule_of(verdict), Some(BlockRule::Private));
    }

    #[test]
    fn non_address_records_are_allowed() {
        let validator = IpValidator::default();
        let cname = DnsRecord::cname("www.example.com", "example.com", 60);

        assert!(validator.classify(&[cname.clone()]).is_allowed());
        assert!(validator.classify(&[cname, a([93, 184, 216, 34])]).is_allowed());
    }

    #[test]
    fn malformed_address_rdata_is_ignored() {
        let validator = IpValidator::default();
        let mut record = a([127, 0, 0, 1]);
        record.rdata.truncate(3);
        assert_eq!(record.rtype, TYPE_A);

        assert!(validator.classify(&[record]).is_allowed());
    }

    #[test]
    fn block_reason_display() {
        let reason = BlockReason::Rule {
            rule: BlockRule::LinkLocal,
            addr: "169.254.0.1".parse().unwrap(),
        };

        assert_eq!(reason.to_string(), "link-local (169.254.0.1)");
        assert_eq!(BlockReason::NoAnswer.to_string(), "no-answer");
    }
}
