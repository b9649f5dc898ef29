use crate::error::ScanError;
use crate::nmap_xml::parse_nmap_xml;
use crate::types::ScanResult;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Backend that performs a single scan of one host.
///
/// A call may take arbitrarily long and may fail for reasons outside the caller's control
/// (unreachable host, missing privileges, bad arguments). Implementations must be usable
/// from a spawned tokio task.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(
        &self,
        host: &str,
        ports: Option<&str>,
        arguments: &str,
    ) -> Result<ScanResult, ScanError>;
}

/// Output flags that would take nmap's XML report away from stdout.
const OUTPUT_FLAGS: &[&str] = &["-oX", "-oN", "-oG", "-oA", "-oS"];

/// Runs the `nmap` binary and parses its XML report.
#[derive(Debug, Clone)]
pub struct NmapScanner {
    binary: PathBuf,
}

impl Default for NmapScanner {
    fn default() -> Self {
        Self::new("nmap")
    }
}

impl NmapScanner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argument vector passed to nmap, excluding the binary itself.
    ///
    /// `arguments` is tokenized with POSIX shell quoting rules, so
    /// `--script "default and safe"` stays one value.
    pub fn build_args(
        host: &str,
        ports: Option<&str>,
        arguments: &str,
    ) -> Result<Vec<String>, ScanError> {
        let tokens = shlex::split(arguments).ok_or_else(|| {
            ScanError::InvalidArguments(format!("unbalanced quotes in: {arguments}"))
        })?;
        let mut args = vec!["-oX".to_string(), "-".to_string()];
        for token in tokens {
            if OUTPUT_FLAGS.iter().any(|f| token.starts_with(f)) {
                return Err(ScanError::InvalidArguments(format!(
                    "output option {token} is managed by the scanner"
                )));
            }
            args.push(token);
        }
        if let Some(p) = ports {
            args.push("-p".to_string());
            args.push(p.to_string());
        }
        args.push(host.to_string());
        Ok(args)
    }

    /// Version string reported by `nmap -V`, e.g. `7.94`.
    pub async fn version(&self) -> Result<String, ScanError> {
        let output = Command::new(&self.binary)
            .arg("-V")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout)
            .ok_or_else(|| ScanError::Parse(format!("unrecognized version banner: {stdout}")))
    }

    fn spawn_error(&self, err: std::io::Error) -> ScanError {
        if err.kind() == ErrorKind::NotFound {
            ScanError::ToolNotFound {
                binary: self.binary.display().to_string(),
            }
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl Scanner for NmapScanner {
    async fn scan(
        &self,
        host: &str,
        ports: Option<&str>,
        arguments: &str,
    ) -> Result<ScanResult, ScanError> {
        let args = Self::build_args(host, ports, arguments)?;
        debug!(binary = %self.binary.display(), args = ?args, "running nmap");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ScanError::ToolFailed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!(host, "nmap: {}", line.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_nmap_xml(&stdout)
    }
}

fn parse_version(banner: &str) -> Option<String> {
    banner.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Nmap version ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_put_xml_to_stdout_and_host_last() {
        let args = NmapScanner::build_args("127.0.0.1", Some("22-443"), "-sV -T4  -A").unwrap();
        assert_eq!(
            args,
            vec!["-oX", "-", "-sV", "-T4", "-A", "-p", "22-443", "127.0.0.1"]
        );
    }

    #[test]
    fn args_without_ports() {
        let args = NmapScanner::build_args("scanme.nmap.org", None, "-sV").unwrap();
        assert_eq!(args, vec!["-oX", "-", "-sV", "scanme.nmap.org"]);
    }

    #[test]
    fn quoted_values_stay_together() {
        let args =
            NmapScanner::build_args("10.0.0.1", None, r#"-sV --script "default and safe""#)
                .unwrap();
        assert_eq!(
            args,
            vec!["-oX", "-", "-sV", "--script", "default and safe", "10.0.0.1"]
        );
        let args = NmapScanner::build_args("10.0.0.1", None, "--script-args 'user=a b'").unwrap();
        assert_eq!(args[3], "user=a b");
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let err = NmapScanner::build_args("10.0.0.1", None, r#"--script "default"#).unwrap_err();
        assert!(matches!(err, ScanError::InvalidArguments(_)));
    }

    #[test]
    fn output_flags_are_rejected() {
        let err = NmapScanner::build_args("10.0.0.1", None, "-sV -oN out.txt").unwrap_err();
        assert!(matches!(err, ScanError::InvalidArguments(_)));
        assert!(NmapScanner::build_args("10.0.0.1", None, "-oAprefix").is_err());
    }

    #[test]
    fn version_banner() {
        let banner = "\nNmap version 7.94SVN ( https://nmap.org )\nPlatform: x86_64-pc-linux-gnu\n";
        assert_eq!(parse_version(banner).as_deref(), Some("7.94SVN"));
        assert_eq!(parse_version("something else"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let scanner = NmapScanner::new("/nonexistent/definitely-not-nmap");
        let err = scanner.scan("127.0.0.1", None, "-sV").await.unwrap_err();
        assert!(matches!(err, ScanError::ToolNotFound { .. }));
    }
}
