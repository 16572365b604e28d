use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Unset fields fall back to flag defaults; explicit flags and the
/// environment both beat the file.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScanSection {
    pub host: Option<String>,
    pub location: Option<String>,
    pub ranges: Option<PathBuf>,
    pub scheme: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub concurrency: Option<usize>,
    pub report_interval: Option<u64>,
    pub out: Option<PathBuf>,
    pub verified_out: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct VerifySection {
    pub sample: Option<usize>,
    pub workers: Option<usize>,
    pub scheme: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub scan: Option<ScanSection>,
    pub verify: Option<VerifySection>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("edgesweep.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}

// Environment fallbacks for container-style deployments where flags
// are awkward. Values that fail to parse are treated as unset.

pub fn env_ranges() -> Option<PathBuf> {
    std::env::var_os("RANGE_FILE").map(PathBuf::from)
}

pub fn env_concurrency() -> Option<usize> {
    std::env::var("CONCURRENCY").ok()?.trim().parse().ok()
}

pub fn env_timeout() -> Option<f64> {
    std::env::var("TIMEOUT").ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_leaves_the_rest_unset() {
        let cfg: Config = serde_yaml::from_str(
            "scan:\n  host: cdn.example.net\n  concurrency: 120\nverify:\n  sample: 5\n",
        )
        .unwrap();
        let scan = cfg.scan.unwrap();
        assert_eq!(scan.host.as_deref(), Some("cdn.example.net"));
        assert_eq!(scan.concurrency, Some(120));
        assert!(scan.location.is_none());
        assert!(scan.out.is_none());
        let verify = cfg.verify.unwrap();
        assert_eq!(verify.sample, Some(5));
        assert!(verify.workers.is_none());
    }

    #[test]
    fn empty_sections_are_fine() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.scan.is_none());
        assert!(cfg.verify.is_none());
    }
}
