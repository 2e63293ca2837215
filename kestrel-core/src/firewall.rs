//! Firewall rule compiler
//!
//! Compiles a VPC's declared rule set into an iptables script for the
//! per-VPC chains. The output is byte-stable for a given rule set: rules are
//! sorted by (priority, id) and every line is rendered from normalized
//! fields, so drivers can compare fingerprints and skip pushing unchanged
//! chains.

use crate::types::{Direction, FirewallRule, Protocol, Vpc};

/// A compiled, pushable ruleset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleset {
    /// Base chain name (`<chain>-in` / `<chain>-out` are derived)
    pub chain: String,
    pub script: String,
    /// Stable fingerprint of `script`
    pub fingerprint: String,
}

/// Compile the rule set for a VPC. `rules` may arrive in any order.
pub fn compile(vpc: &Vpc, rules: &[FirewallRule]) -> CompiledRuleset {
    let chain_in = format!("{}-in", vpc.chain);
    let chain_out = format!("{}-out", vpc.chain);

    let mut sorted: Vec<&FirewallRule> = rules.iter().filter(|r| r.vpc == vpc.name).collect();
    sorted.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });

    let mut script = String::new();
    script.push_str(&format!(":{} - [0:0]\n", chain_in));
    script.push_str(&format!(":{} - [0:0]\n", chain_out));
    script.push_str(&format!("-F {}\n", chain_in));
    script.push_str(&format!("-F {}\n", chain_out));

    // Implicit allows: established connections and intra-VPC traffic.
    script.push_str(&format!(
        "-A {} -m state --state ESTABLISHED,RELATED -j ACCEPT\n",
        chain_in
    ));
    script.push_str(&format!("-A {} -s {} -j ACCEPT\n", chain_in, vpc.cidr));
    script.push_str(&format!(
        "-A {} -m state --state ESTABLISHED,RELATED -j ACCEPT\n",
        chain_out
    ));
    script.push_str(&format!("-A {} -d {} -j ACCEPT\n", chain_out, vpc.cidr));

    for rule in &sorted {
        script.push_str(&render_rule(&chain_in, &chain_out, rule));
    }

    // Default policy DROP, expressed as trailing rules so the script stays
    // self-contained per chain.
    script.push_str(&format!("-A {} -j DROP\n", chain_in));
    script.push_str(&format!("-A {} -j DROP\n", chain_out));

    let fingerprint = fingerprint(&script);
    CompiledRuleset {
        chain: vpc.chain.clone(),
        script,
        fingerprint,
    }
}

fn render_rule(chain_in: &str, chain_out: &str, rule: &FirewallRule) -> String {
    let mut line = String::new();
    match rule.direction {
        Direction::Inbound => line.push_str(&format!("-A {}", chain_in)),
        Direction::Outbound => line.push_str(&format!("-A {}", chain_out)),
    }
    line.push_str(&format!(" -p {}", rule.protocol));
    if rule.protocol != Protocol::Icmp {
        if let Some(range) = &rule.port_range {
            if range.start == range.end {
                line.push_str(&format!(" --dport {}", range.start));
            } else {
                line.push_str(&format!(" --dport {}:{}", range.start, range.end));
            }
        }
    }
    match rule.direction {
        Direction::Inbound => line.push_str(&format!(" -s {}", rule.cidr)),
        Direction::Outbound => line.push_str(&format!(" -d {}", rule.cidr)),
    }
    line.push_str(" -j ACCEPT");
    line.push_str(&format!(" -m comment --comment id:{}\n", rule.id));
    line
}

/// FNV-1a over the script bytes, rendered as fixed-width hex. Stable across
/// platforms and releases, which is all the driver's skip-if-unchanged
/// comparison needs.
pub fn fingerprint(script: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in script.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PortRange, RuleId};
    use chrono::Utc;
    use ipnet::Ipv4Net;

    fn vpc() -> Vpc {
        Vpc::new("v1".to_string(), "10.0.0.0/24".parse::<Ipv4Net>().unwrap(), 1500)
    }

    fn rule(
        vpc: &str,
        direction: Direction,
        protocol: Protocol,
        range: Option<PortRange>,
        cidr: &str,
        priority: u16,
    ) -> FirewallRule {
        FirewallRule {
            id: RuleId::new(),
            vpc: vpc.to_string(),
            direction,
            protocol,
            port_range: range,
            cidr: cidr.parse().unwrap(),
            description: String::new(),
            priority,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn compile_is_byte_stable_regardless_of_input_order() {
        let vpc = vpc();
        let a = rule(
            "v1",
            Direction::Inbound,
            Protocol::Tcp,
            Some(PortRange::single(80)),
            "0.0.0.0/0",
            100,
        );
        let b = rule(
            "v1",
            Direction::Inbound,
            Protocol::Tcp,
            Some(PortRange::single(443)),
            "0.0.0.0/0",
            50,
        );
        let c = rule(
            "v1",
            Direction::Outbound,
            Protocol::Udp,
            Some(PortRange { start: 5000, end: 5100 }),
            "192.0.2.0/24",
            100,
        );

        let forward = compile(&vpc, &[a.clone(), b.clone(), c.clone()]);
        let backward = compile(&vpc, &[c, b, a]);
        assert_eq!(forward.script, backward.script);
        assert_eq!(forward.fingerprint, backward.fingerprint);
    }

    #[test]
    fn rules_sort_by_priority_then_id() {
        let vpc = vpc();
        let low = rule(
            "v1",
            Direction::Inbound,
            Protocol::Tcp,
            Some(PortRange::single(22)),
            "203.0.113.0/24",
            10,
        );
        let high = rule(
            "v1",
            Direction::Inbound,
            Protocol::Tcp,
            Some(PortRange::single(80)),
            "0.0.0.0/0",
            200,
        );
        let compiled = compile(&vpc, &[high, low]);
        let pos_22 = compiled.script.find("--dport 22").unwrap();
        let pos_80 = compiled.script.find("--dport 80").unwrap();
        assert!(pos_22 < pos_80);
    }

    #[test]
    fn inbound_rule_renders_per_contract() {
        let vpc = vpc();
        let r = rule(
            "v1",
            Direction::Inbound,
            Protocol::Tcp,
            Some(PortRange::single(80)),
            "0.0.0.0/0",
            100,
        );
        let compiled = compile(&vpc, std::slice::from_ref(&r));
        let expected = format!(
            "-A {}-in -p tcp --dport 80 -s 0.0.0.0/0 -j ACCEPT -m comment --comment id:{}",
            vpc.chain, r.id
        );
        assert!(
            compiled.script.contains(&expected),
            "script missing rule line:\n{}",
            compiled.script
        );
    }

    #[test]
    fn icmp_rules_carry_no_ports() {
        let vpc = vpc();
        let r = rule("v1", Direction::Inbound, Protocol::Icmp, None, "0.0.0.0/0", 10);
        let compiled = compile(&vpc, &[r]);
        assert!(compiled.script.contains("-p icmp -s 0.0.0.0/0 -j ACCEPT"));
        assert!(!compiled.script.contains("--dport"));
    }

    #[test]
    fn preamble_allows_established_and_intra_vpc_then_drops() {
        let vpc = vpc();
        let compiled = compile(&vpc, &[]);
        let lines: Vec<&str> = compiled.script.lines().collect();
        assert!(lines
            .iter()
            .any(|l| l.contains("--state ESTABLISHED,RELATED")));
        assert!(lines.iter().any(|l| l.contains("-s 10.0.0.0/24 -j ACCEPT")));
        assert_eq!(
            lines.iter().filter(|l| l.ends_with("-j DROP")).count(),
            2,
            "both chains end in DROP"
        );
    }

    #[test]
    fn rules_for_other_vpcs_are_ignored() {
        let vpc = vpc();
        let foreign = rule(
            "v2",
            Direction::Inbound,
            Protocol::Tcp,
            Some(PortRange::single(80)),
            "0.0.0.0/0",
            100,
        );
        let compiled = compile(&vpc, &[foreign]);
        assert!(!compiled.script.contains("--dport 80"));
    }
}
