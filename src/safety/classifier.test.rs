//! Unit tests for pattern-based risk classification

use super::*;

fn classifier() -> RiskClassifier {
    RiskClassifier::with_builtin_rules().expect("builtin rules should compile")
}

#[cfg(test)]
mod classify_tests {
    use super::*;

    #[test]
    fn test_critical_patterns() {
        let c = classifier();
        for command in [
            "rm -rf /",
            "sudo rm -rf /*",
            "rm -fr / --verbose",
            "rm -r --no-preserve-root /",
            "chmod -R 777 /",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "cat image.iso > /dev/sdb",
            ":(){ :|:& };:",
            "mkfs.ext4 /dev/sdb1",
            "fdisk /dev/sda --delete 1",
            "shred -u /home/me/secret",
            "wipefs -a /dev/sdc",
        ] {
            let result = c.classify(command);
            assert_eq!(result.level, RiskLevel::Critical, "{} should be critical", command);
            assert!(result.reason.is_some());
            assert!(result.suggestion.is_some());
        }
    }

    #[test]
    fn test_high_risk_command_on_critical_path() {
        let c = classifier();
        for command in [
            "rm -r /etc/nginx",
            "sudo chown -R nobody /usr/local",
            "/bin/rm /var/log/syslog",
            "chmod 600 /etc/shadow",
            "cd /tmp && rm -r /boot",
        ] {
            assert_eq!(c.classify(command).level, RiskLevel::High, "{} should be high", command);
        }
    }

    #[test]
    fn test_writes_into_critical_paths() {
        let c = classifier();
        assert_eq!(c.classify("echo nameserver 1.1.1.1 > /etc/resolv.conf").level, RiskLevel::High);
        assert_eq!(c.classify("cp hosts /etc/hosts").level, RiskLevel::High);
        assert_eq!(c.classify("sed -i s/a/b/ /etc/fstab").level, RiskLevel::High);
        // Reading is fine
        assert_eq!(c.classify("cat /etc/hosts").level, RiskLevel::Low);
        assert_eq!(c.classify("ls -la /usr/bin").level, RiskLevel::Low);
    }

    #[test]
    fn test_medium_risk() {
        let c = classifier();
        for command in [
            "rm notes.txt",
            "rmdir build",
            "chmod +x run.sh",
            "find . -name '*.tmp' -exec rm {} ;",
            "git push origin --delete old-branch",
        ] {
            assert_eq!(c.classify(command).level, RiskLevel::Medium, "{} should be medium", command);
        }
    }

    #[test]
    fn test_low_risk() {
        let c = classifier();
        for command in [
            "ls -la",
            "df -h",
            "ps aux | grep python",
            "find . -type f -mtime -1 2>/dev/null",
            "git init",
            "grep -r firmware docs/",
        ] {
            let result = c.classify(command);
            assert_eq!(result.level, RiskLevel::Low, "{} should be low", command);
            assert!(result.reason.is_none());
        }
    }

    #[test]
    fn test_classification_is_pure() {
        let c = classifier();
        let first = c.classify("rm -r /etc/nginx");
        let second = c.classify("rm -r /etc/nginx");
        assert_eq!(first, second);
    }

    #[test]
    fn test_script_takes_most_severe_line() {
        let c = classifier();
        let script = "#!/bin/bash\n# rm -rf / in a comment is ignored\nwhile true; do\n  rm -f old.log\n  rm -rf /\n  sleep 5\ndone\n";
        assert_eq!(c.classify_script(script).level, RiskLevel::Critical);

        let quiet = "#!/bin/bash\nINTERVAL=5\nwhile true; do\n  ps aux | grep python\n  sleep $INTERVAL\ndone\n";
        assert_eq!(c.classify_script(quiet), RiskAssessment::low());
    }
}
