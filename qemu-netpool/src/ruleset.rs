//! Pure builders for the iptables rule sequences the pool installs and
//! uninstalls. Kept free of any process I/O so the install/uninstall
//! symmetry can be checked without a kernel.

macro_rules! rule {
    ($($part:expr),+ $(,)?) => {
        vec![$($part.to_string()),+]
    };
}

/// `filter`/`nat` rules for one TAP + prefix: accept forwarded traffic
/// both directions, masquerade egress to the rest of the world.
pub(crate) fn entry_install_rules(tap: &str, prefix: &str) -> Vec<Vec<String>> {
    vec![
        rule!(
            "iptables", "-t", "filter", "-A", "FORWARD", "-i", tap, "-s",
            format!("{prefix}.0/24"), "-j", "ACCEPT"
        ),
        rule!(
            "iptables", "-t", "filter", "-A", "FORWARD", "-o", tap, "-d",
            format!("{prefix}.0/24"), "-j", "ACCEPT"
        ),
        rule!(
            "iptables", "-t", "nat", "-A", "POSTROUTING", "-s",
            format!("{prefix}.0/24"), "!", "-d", format!("{prefix}.0/24"), "-j", "MASQUERADE"
        ),
    ]
}

pub(crate) fn entry_uninstall_rules(tap: &str, prefix: &str) -> Vec<Vec<String>> {
    reversed_inverse(entry_install_rules(tap, prefix))
}

/// Pairwise `DROP` rules isolating every pool subnet from every other.
/// Installed once, after every per-entry accept/masquerade rule is in
/// place — guests can reach the outside world but never each other.
pub(crate) fn isolation_install_rules(prefixes: &[String]) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    for (i, from) in prefixes.iter().enumerate() {
        for (j, to) in prefixes.iter().enumerate() {
            if i == j {
                continue;
            }
            rules.push(rule!(
                "iptables", "-t", "filter", "-I", "FORWARD", "-s",
                format!("{from}.0/24"), "-d", format!("{to}.0/24"), "-j", "DROP"
            ));
        }
    }
    rules
}

pub(crate) fn isolation_uninstall_rules(prefixes: &[String]) -> Vec<Vec<String>> {
    reversed_inverse(isolation_install_rules(prefixes))
}

fn reversed_inverse(mut rules: Vec<Vec<String>>) -> Vec<Vec<String>> {
    rules.reverse();
    rules.iter().map(|rule| invert(rule)).collect()
}

fn invert(rule: &[String]) -> Vec<String> {
    rule.iter()
        .map(|part| match part.as_str() {
            "-A" | "-I" => "-D".to_string(),
            other => other.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_install_rules_cover_forward_and_nat() {
        let rules = entry_install_rules("tctap0", "192.168.150");
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().any(|r| r.contains(&"FORWARD".to_string())));
        assert!(rules.iter().any(|r| r.contains(&"MASQUERADE".to_string())));
    }

    #[test]
    fn entry_uninstall_is_reversed_and_inverted() {
        let install = entry_install_rules("tctap0", "192.168.150");
        let uninstall = entry_uninstall_rules("tctap0", "192.168.150");
        assert_eq!(install.len(), uninstall.len());
        for (installed, removed) in install.iter().rev().zip(uninstall.iter()) {
            assert_eq!(installed.len(), removed.len());
            for (a, b) in installed.iter().zip(removed.iter()) {
                if a == "-A" || a == "-I" {
                    assert_eq!(b, "-D");
                } else {
                    assert_eq!(a, b);
                }
            }
        }
    }

    #[test]
    fn isolation_rules_cover_every_ordered_pair() {
        let prefixes: Vec<String> = vec!["192.168.150", "192.168.151", "192.168.152"]
            .into_iter()
            .map(String::from)
            .collect();
        // 3 entries -> 3 * 2 ordered pairs.
        assert_eq!(isolation_install_rules(&prefixes).len(), 6);
    }

    #[test]
    fn isolation_rules_empty_below_two_entries() {
        assert!(isolation_install_rules(&[]).is_empty());
        assert!(isolation_install_rules(&["192.168.150".to_string()]).is_empty());
    }

    #[test]
    fn isolation_uninstall_reverses_and_inverts_install() {
        let prefixes: Vec<String> = vec!["192.168.150", "192.168.151"]
            .into_iter()
            .map(String::from)
            .collect();
        let install = isolation_install_rules(&prefixes);
        let uninstall = isolation_uninstall_rules(&prefixes);
        assert_eq!(install.len(), uninstall.len());

        let first_install = install.first().cloned().unwrap_or_default();
        let last_uninstall = uninstall.last().cloned().unwrap_or_default();
        let reinverted: Vec<String> = last_uninstall
            .iter()
            .map(|p| if p == "-D" { "-I".to_string() } else { p.clone() })
            .collect();
        assert_eq!(first_install, reinverted);
    }
}
