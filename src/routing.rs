//! Packet routing rules for outbound proxy egress
//!
//! Rules live in dedicated iptables chains hung off the built-in ones, so
//! the whole set can be removed by detaching, flushing and deleting those
//! chains. Setup always runs cleanup first, which makes re-running it after
//! a partial apply safe.

use crate::config::ToolSettings;
use crate::error::{RelayError, RelayResult};
use crate::fsutil;
use crate::gateway::ToolGateway;
use crate::obfs::ObfuscationMode;
use crate::validation::{sanitize_error_message, validate_interface_name, validate_port};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Redirect chain for locally generated traffic (nat, from OUTPUT)
pub const PROXY_CHAIN: &str = "RELAY_PROXY";
/// Forwarding chain for relay interface traffic (filter, from FORWARD)
pub const FORWARD_CHAIN: &str = "RELAY_FWD";
/// Source NAT chain (nat, from POSTROUTING)
pub const MASQ_CHAIN: &str = "RELAY_MASQ";

const COMMENT_PREFIX: &str = "relayctl:";

/// Destinations never sent through the proxy
pub const BYPASS_RANGES: [&str; 8] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
];

/// (protocol, destination port) pairs redirected to the proxy
const REDIRECTED: [(&str, u16); 4] = [("tcp", 80), ("tcp", 443), ("udp", 53), ("tcp", 53)];

/// (table, parent chain, dedicated chain)
const CHAINS: [(&str, &str, &str); 3] = [
    ("nat", "OUTPUT", PROXY_CHAIN),
    ("filter", "FORWARD", FORWARD_CHAIN),
    ("nat", "POSTROUTING", MASQ_CHAIN),
];

/// Named groups of rules; the name is carried in each rule's comment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSet {
    BypassLocal,
    RedirectToProxy,
    Forward,
    Masquerade,
}

impl RuleSet {
    pub fn name(&self) -> &'static str {
        match self {
            RuleSet::BypassLocal => "bypass-local",
            RuleSet::RedirectToProxy => "redirect-to-proxy",
            RuleSet::Forward => "forward",
            RuleSet::Masquerade => "masquerade",
        }
    }

    fn comment(&self) -> String {
        format!("{}{}", COMMENT_PREFIX, self.name())
    }
}

/// One planned command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingStep {
    pub description: String,
    pub program: String,
    pub args: Vec<String>,
}

/// A dedicated chain found on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub table: String,
    pub name: String,
    pub rules: usize,
}

pub struct TrafficRouter {
    iptables: String,
    sysctl: String,
    gateway: Arc<dyn ToolGateway>,
}

impl TrafficRouter {
    pub fn new(tools: &ToolSettings, gateway: Arc<dyn ToolGateway>) -> Self {
        Self {
            iptables: tools.iptables_binary.clone(),
            sysctl: tools.sysctl_binary.clone(),
            gateway,
        }
    }

    /// Commands [`setup_routing`](Self::setup_routing) runs after cleanup
    pub fn plan_setup(&self, proxy_port: u16, relay_interface: &str) -> Vec<RoutingStep> {
        let mut steps = vec![RoutingStep {
            description: "enable packet forwarding".to_string(),
            program: self.sysctl.clone(),
            args: strings(&["-w", "net.ipv4.ip_forward=1"]),
        }];

        steps.push(self.ipt("create redirect chain", &["-t", "nat", "-N", PROXY_CHAIN]));

        // Bypass rules must precede the redirects
        for range in BYPASS_RANGES {
            steps.push(self.tagged(
                &format!("bypass {}", range),
                &["-t", "nat", "-A", PROXY_CHAIN, "-d", range, "-j", "RETURN"],
                RuleSet::BypassLocal,
            ));
        }

        let port = proxy_port.to_string();
        for (proto, dport) in REDIRECTED {
            let dport = dport.to_string();
            steps.push(self.tagged(
                &format!("redirect {}/{}", proto, dport),
                &[
                    "-t", "nat", "-A", PROXY_CHAIN, "-p", proto, "--dport", dport.as_str(), "-j",
                    "REDIRECT", "--to-ports", port.as_str(),
                ],
                RuleSet::RedirectToProxy,
            ));
        }

        steps.push(self.tagged(
            "attach redirect chain",
            &["-t", "nat", "-I", "OUTPUT", "1", "-j", PROXY_CHAIN],
            RuleSet::RedirectToProxy,
        ));

        steps.push(self.ipt("create forward chain", &["-t", "filter", "-N", FORWARD_CHAIN]));
        steps.push(self.tagged(
            &format!("forward in on {}", relay_interface),
            &["-t", "filter", "-A", FORWARD_CHAIN, "-i", relay_interface, "-j", "ACCEPT"],
            RuleSet::Forward,
        ));
        steps.push(self.tagged(
            &format!("forward out on {}", relay_interface),
            &["-t", "filter", "-A", FORWARD_CHAIN, "-o", relay_interface, "-j", "ACCEPT"],
            RuleSet::Forward,
        ));
        steps.push(self.tagged(
            "attach forward chain",
            &["-t", "filter", "-I", "FORWARD", "1", "-j", FORWARD_CHAIN],
            RuleSet::Forward,
        ));

        steps
    }

    /// Commands [`enable_masquerade`](Self::enable_masquerade) runs
    pub fn plan_masquerade(&self, egress_interface: &str) -> Vec<RoutingStep> {
        vec![
            self.ipt("create masquerade chain", &["-t", "nat", "-N", MASQ_CHAIN]),
            self.tagged(
                &format!("masquerade out {}", egress_interface),
                &["-t", "nat", "-A", MASQ_CHAIN, "-o", egress_interface, "-j", "MASQUERADE"],
                RuleSet::Masquerade,
            ),
            self.tagged(
                "attach masquerade chain",
                &["-t", "nat", "-I", "POSTROUTING", "1", "-j", MASQ_CHAIN],
                RuleSet::Masquerade,
            ),
        ]
    }

    /// Redirect web and DNS traffic to the proxy on `proxy_port`, bypassing
    /// local and private destinations, and accept forwarding on
    /// `relay_interface`.
    pub async fn setup_routing(&self, proxy_port: u32, relay_interface: &str) -> RelayResult<()> {
        let port = validate_port(proxy_port)?;
        validate_interface_name(relay_interface)?;

        self.remove_chains(&CHAINS[..2]).await;
        let steps = self.plan_setup(port, relay_interface);
        self.apply(&steps).await?;

        info!(
            "Routing set up: web/DNS redirected to port {}, forwarding on {}",
            port, relay_interface
        );
        Ok(())
    }

    /// Source-NAT traffic leaving through `egress_interface`
    pub async fn enable_masquerade(&self, egress_interface: &str) -> RelayResult<()> {
        validate_interface_name(egress_interface)?;

        self.remove_chains(&CHAINS[2..]).await;
        self.apply(&self.plan_masquerade(egress_interface)).await?;

        info!("Masquerading enabled on {}", egress_interface);
        Ok(())
    }

    /// Detach, flush and delete every dedicated chain.
    ///
    /// Missing chains are not an error. Fails only if a chain is still
    /// present afterwards.
    pub async fn cleanup_routing(&self) -> RelayResult<()> {
        self.remove_chains(&CHAINS).await;

        let remaining = self.list_chains().await?;
        if !remaining.is_empty() {
            let names: Vec<String> = remaining
                .iter()
                .map(|c| format!("{}/{}", c.table, c.name))
                .collect();
            return Err(RelayError::PartialApply {
                step: "cleanup".to_string(),
                completed: CHAINS.len() - remaining.len(),
                reason: format!("chains still present: {}", names.join(", ")),
            });
        }

        info!("Routing rules removed");
        Ok(())
    }

    /// Dedicated chains currently present, from `iptables -S`
    pub async fn list_chains(&self) -> RelayResult<Vec<ChainInfo>> {
        let mut found = Vec::new();

        for table in ["nat", "filter"] {
            let output = self.gateway.run(&self.iptables, &["-t", table, "-S"]).await?;
            if !output.success() {
                return Err(RelayError::ExternalTool {
                    tool: format!("{} -t {} -S", self.iptables, table),
                    code: output.code,
                    output: sanitize_error_message(&output.combined()),
                });
            }

            for (t, _, chain) in CHAINS.iter().filter(|(t, _, _)| *t == table) {
                let declared = output
                    .stdout
                    .lines()
                    .any(|line| line.trim() == format!("-N {}", chain));
                if declared {
                    let prefix = format!("-A {} ", chain);
                    found.push(ChainInfo {
                        table: t.to_string(),
                        name: chain.to_string(),
                        rules: output
                            .stdout
                            .lines()
                            .filter(|line| line.starts_with(&prefix))
                            .count(),
                    });
                }
            }
        }

        Ok(found)
    }

    /// Write the relay's ACL for `mode` to `path`
    pub async fn generate_acl(&self, mode: ObfuscationMode, path: &Path) -> RelayResult<String> {
        let content = render_acl(mode);
        fsutil::write_atomic(path, content.as_bytes(), 0o644).await?;
        info!("Wrote ACL for mode {} to {:?}", mode, path);
        Ok(content)
    }

    async fn apply(&self, steps: &[RoutingStep]) -> RelayResult<()> {
        for (completed, step) in steps.iter().enumerate() {
            let args: Vec<&str> = step.args.iter().map(String::as_str).collect();
            let result = self.gateway.run(&step.program, &args).await;

            let reason = match result {
                Ok(out) if out.success() => continue,
                Ok(out) => sanitize_error_message(&out.combined()),
                Err(e) => e.to_string(),
            };
            warn!(
                "Routing step '{}' failed after {} step(s): {}",
                step.description, completed, reason
            );
            return Err(RelayError::PartialApply {
                step: step.description.clone(),
                completed,
                reason,
            });
        }
        Ok(())
    }

    async fn remove_chains(&self, chains: &[(&str, &str, &str)]) {
        for &(table, parent, chain) in chains {
            let set = match chain {
                PROXY_CHAIN => RuleSet::RedirectToProxy,
                FORWARD_CHAIN => RuleSet::Forward,
                _ => RuleSet::Masquerade,
            };
            let comment = set.comment();

            // A jump may have been inserted more than once by earlier runs
            for _ in 0..4 {
                let args = [
                    "-t", table, "-D", parent, "-j", chain, "-m", "comment", "--comment",
                    comment.as_str(),
                ];
                if !self.try_run(&args).await {
                    break;
                }
            }
            let _ = self.try_run(&["-t", table, "-F", chain]).await;
            let _ = self.try_run(&["-t", table, "-X", chain]).await;
        }
    }

    async fn try_run(&self, args: &[&str]) -> bool {
        match self.gateway.run(&self.iptables, args).await {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("{} {} failed: {}", self.iptables, args.join(" "), e);
                false
            }
        }
    }

    fn ipt(&self, description: &str, args: &[&str]) -> RoutingStep {
        RoutingStep {
            description: description.to_string(),
            program: self.iptables.clone(),
            args: strings(args),
        }
    }

    fn tagged(&self, description: &str, args: &[&str], set: RuleSet) -> RoutingStep {
        let mut step = self.ipt(description, args);
        step.args.extend(strings(&["-m", "comment", "--comment"]));
        step.args.push(set.comment());
        step
    }
}

/// ACL text: private ranges go direct first, then everything else goes
/// through the outbound proxy when that mode is active, or direct otherwise.
pub fn render_acl(mode: ObfuscationMode) -> String {
    let mut lines = vec![format!("# relayctl ACL (mode: {})", mode)];
    for range in BYPASS_RANGES {
        lines.push(format!("direct({})", range));
    }
    if mode == ObfuscationMode::OutboundProxy {
        lines.push("proxy(all)".to_string());
    } else {
        lines.push("direct(all)".to_string());
    }
    let mut content = lines.join("\n");
    content.push('\n');
    content
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gateway::{ScriptedGateway, ToolOutput};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Just enough of iptables' chain semantics to check setup and cleanup;
    /// other programs succeed silently
    pub(crate) fn iptables_handler() -> impl Fn(&str, &[String]) -> ToolOutput + Send + Sync + 'static {
        let tables: Mutex<BTreeMap<(String, String), Vec<String>>> = Mutex::new(
            [
                ("nat", "OUTPUT"),
                ("nat", "POSTROUTING"),
                ("nat", "PREROUTING"),
                ("filter", "FORWARD"),
                ("filter", "INPUT"),
                ("filter", "OUTPUT"),
            ]
            .iter()
            .map(|(t, c)| ((t.to_string(), c.to_string()), Vec::new()))
            .collect(),
        );

        move |program: &str, args: &[String]| {
            if program != "iptables" {
                return ToolOutput::ok("");
            }
            let mut tables = tables.lock().unwrap();
            let table = args[1].clone();
            let op = args[2].as_str();

            if op == "-S" {
                let mut out = String::new();
                for ((t, chain), rules) in tables.iter() {
                    if *t != table {
                        continue;
                    }
                    if !chain.starts_with("RELAY") {
                        out.push_str(&format!("-P {} ACCEPT\n", chain));
                    } else {
                        out.push_str(&format!("-N {}\n", chain));
                    }
                    for rule in rules {
                        out.push_str(&format!("-A {} {}\n", chain, rule));
                    }
                }
                return ToolOutput::ok(out);
            }

            let key = (table, args[3].clone());
            let mut rest: Vec<String> = args[4..].to_vec();
            match op {
                "-N" if tables.contains_key(&key) => {
                    ToolOutput::failed(1, "iptables: Chain already exists.")
                }
                "-N" => {
                    tables.insert(key, Vec::new());
                    ToolOutput::ok("")
                }
                "-F" => match tables.get_mut(&key) {
                    Some(rules) => {
                        rules.clear();
                        ToolOutput::ok("")
                    }
                    None => ToolOutput::failed(1, "iptables: No chain/target/match by that name."),
                },
                "-X" => {
                    let referenced = tables
                        .values()
                        .flatten()
                        .any(|r| r.starts_with(&format!("-j {}", key.1)));
                    match tables.get(&key) {
                        None => ToolOutput::failed(1, "iptables: No chain/target/match by that name."),
                        Some(_) if referenced => ToolOutput::failed(1, "iptables: Too many links."),
                        Some(rules) if !rules.is_empty() => {
                            ToolOutput::failed(1, "iptables: Directory not empty.")
                        }
                        Some(_) => {
                            tables.remove(&key);
                            ToolOutput::ok("")
                        }
                    }
                }
                "-A" | "-I" | "-D" => {
                    let position = if op == "-I" && rest.first().map(|s| s.parse::<usize>().is_ok()) == Some(true) {
                        rest.remove(0).parse::<usize>().unwrap() - 1
                    } else {
                        usize::MAX
                    };
                    let rule = rest.join(" ");
                    let Some(rules) = tables.get_mut(&key) else {
                        return ToolOutput::failed(1, "iptables: No chain/target/match by that name.");
                    };
                    match op {
                        "-D" => match rules.iter().position(|r| *r == rule) {
                            Some(i) => {
                                rules.remove(i);
                                ToolOutput::ok("")
                            }
                            None => ToolOutput::failed(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
                        },
                        _ => {
                            let at = position.min(rules.len());
                            rules.insert(at, rule);
                            ToolOutput::ok("")
                        }
                    }
                }
                _ => ToolOutput::failed(2, "unsupported"),
            }
        }
    }

    pub(crate) fn simulated_iptables() -> ScriptedGateway {
        ScriptedGateway::new(iptables_handler())
    }

    fn router(gateway: Arc<ScriptedGateway>) -> TrafficRouter {
        TrafficRouter::new(&ToolSettings::default(), gateway)
    }

    #[tokio::test]
    async fn test_bypass_precedes_redirect() {
        let gateway = Arc::new(simulated_iptables());
        let router = router(gateway.clone());

        router.setup_routing(1080, "eth1").await.unwrap();

        let lines = gateway.lines();
        let last_bypass = lines.iter().rposition(|l| l.contains("-j RETURN")).unwrap();
        let first_redirect = lines.iter().position(|l| l.contains("-j REDIRECT")).unwrap();
        assert!(last_bypass < first_redirect);
        assert!(lines.contains(&"sysctl -w net.ipv4.ip_forward=1".to_string()));
        assert!(lines
            .iter()
            .any(|l| l.contains("-p udp --dport 53 -j REDIRECT --to-ports 1080")));
        assert!(lines.iter().all(|l| !l.contains(" -A ") || l.contains("--comment relayctl:")));

        let chains = router.list_chains().await.unwrap();
        assert_eq!(
            chains,
            vec![
                ChainInfo {
                    table: "nat".to_string(),
                    name: PROXY_CHAIN.to_string(),
                    rules: BYPASS_RANGES.len() + REDIRECTED.len(),
                },
                ChainInfo {
                    table: "filter".to_string(),
                    name: FORWARD_CHAIN.to_string(),
                    rules: 2,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_twice_leaves_no_chains() {
        let gateway = Arc::new(simulated_iptables());
        let router = router(gateway.clone());

        router.setup_routing(1080, "eth1").await.unwrap();
        router.enable_masquerade("eth0").await.unwrap();
        assert_eq!(router.list_chains().await.unwrap().len(), 3);

        router.cleanup_routing().await.unwrap();
        assert!(router.list_chains().await.unwrap().is_empty());

        router.cleanup_routing().await.unwrap();
        assert!(router.list_chains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_without_setup_is_noop() {
        let router = router(Arc::new(simulated_iptables()));
        router.cleanup_routing().await.unwrap();
        assert!(router.list_chains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setup_is_repeatable() {
        let gateway = Arc::new(simulated_iptables());
        let router = router(gateway.clone());

        router.setup_routing(1080, "eth1").await.unwrap();
        router.setup_routing(2080, "eth1").await.unwrap();

        let chains = router.list_chains().await.unwrap();
        assert_eq!(chains[0].rules, BYPASS_RANGES.len() + REDIRECTED.len());

        // Only one jump into the redirect chain
        let nat = gateway.run("iptables", &["-t", "nat", "-S"]).await.unwrap();
        let jumps = nat
            .stdout
            .lines()
            .filter(|l| l.starts_with("-A OUTPUT -j RELAY_PROXY"))
            .count();
        assert_eq!(jumps, 1);
        router.cleanup_routing().await.unwrap();
        assert!(router.list_chains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_partial_apply() {
        let gateway = Arc::new(ScriptedGateway::new(|program, args| {
            if program == "iptables" && args.iter().any(|a| a == "REDIRECT") {
                ToolOutput::failed(1, "iptables: No chain/target/match by that name.")
            } else {
                ToolOutput::ok("")
            }
        }));
        let router = router(gateway);

        match router.setup_routing(1080, "eth1").await.unwrap_err() {
            RelayError::PartialApply { step, completed, reason } => {
                assert_eq!(step, "redirect tcp/80");
                // sysctl + create chain + bypass rules
                assert_eq!(completed, 2 + BYPASS_RANGES.len());
                assert!(reason.contains("No chain"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_input_touches_nothing() {
        let gateway = Arc::new(simulated_iptables());
        let router = router(gateway.clone());

        assert!(router.setup_routing(0, "eth1").await.unwrap_err().is_validation());
        assert!(router.setup_routing(1080, "eth1; rm -rf /").await.is_err());
        assert!(gateway.calls().is_empty());
    }

    #[test]
    fn test_acl_bypasses_private_ranges_first() {
        let acl = render_acl(ObfuscationMode::OutboundProxy);
        let lines: Vec<&str> = acl.lines().collect();
        assert_eq!(lines.last(), Some(&"proxy(all)"));
        assert!(lines[1..=BYPASS_RANGES.len()].iter().all(|l| l.starts_with("direct(")));

        let plain = render_acl(ObfuscationMode::None);
        assert!(plain.ends_with("direct(all)\n"));
        assert!(!plain.contains("proxy("));
    }

    #[tokio::test]
    async fn test_generate_acl_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.txt");
        let router = router(Arc::new(ScriptedGateway::succeeding()));

        let content = router
            .generate_acl(ObfuscationMode::OutboundProxy, &path)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }
}
