use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use edgesweep_core::progress::ProgressTick;
use edgesweep_core::state::{confirmed_sorted, ScanReport};
use redirect_probe::{
    sweep, ProbeSignature, RedirectProber, Scheme, SweepEvent, SweepOptions, DEFAULT_CONCURRENCY,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_REPORT_INTERVAL, DEFAULT_TIMEOUT,
};
use verify_pass::{VerifyOptions, DEFAULT_SAMPLE, DEFAULT_WORKERS};

mod config;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

fn clock_stamp() -> String {
    let t = OffsetDateTime::now_utc().time();
    format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "edgesweep", version, about = "Sweep IPv4 ranges for hosts answering a redirect signature")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./edgesweep.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Sweep the configured ranges for the redirect signature
    Scan {
        /// Domain sent as the Host header on every probe
        #[arg(long)]
        host: Option<String>,
        /// Exact Location value that marks a hit
        #[arg(long)]
        location: Option<String>,
        /// Range file, one CIDR or bare address per line (env RANGE_FILE)
        #[arg(long, value_name = "FILE")]
        ranges: Option<PathBuf>,
        /// Probe scheme
        #[arg(long, value_parser = ["http", "https"])]
        scheme: Option<String>,
        /// Probe port (defaults to the scheme's well-known port)
        #[arg(long)]
        port: Option<u16>,
        /// Overall per-probe timeout in seconds (env TIMEOUT)
        #[arg(long)]
        timeout: Option<f64>,
        /// Connect timeout in seconds, clamped to the overall timeout
        #[arg(long)]
        connect_timeout: Option<f64>,
        /// Max in-flight probes (env CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Seconds between progress reports
        #[arg(long)]
        report_interval: Option<u64>,
        /// Output file for the sorted available addresses
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Output file for verification-confirmed addresses
        #[arg(long, value_name = "FILE")]
        verified_out: Option<PathBuf>,
        /// Skip the verification pass
        #[arg(long, default_value_t = false)]
        no_verify: bool,
        /// How many of the first sorted positives to re-check
        #[arg(long)]
        verify_sample: Option<usize>,
        /// Worker threads for the verification pass
        #[arg(long)]
        verify_workers: Option<usize>,
        /// Scheme override for verification probes
        #[arg(long, value_parser = ["http", "https"])]
        verify_scheme: Option<String>,
        /// Port override for verification probes
        #[arg(long)]
        verify_port: Option<u16>,
        /// Summary format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Re-check a saved address list against the signature
    Verify {
        /// Newline-delimited IPv4 address file, such as a previous scan's output
        input: PathBuf,
        /// Domain sent as the Host header on every probe
        #[arg(long)]
        host: Option<String>,
        /// Exact Location value that marks a hit
        #[arg(long)]
        location: Option<String>,
        /// Probe scheme
        #[arg(long, value_parser = ["http", "https"])]
        scheme: Option<String>,
        /// Probe port (defaults to the scheme's well-known port)
        #[arg(long)]
        port: Option<u16>,
        /// Overall per-probe timeout in seconds (env TIMEOUT)
        #[arg(long)]
        timeout: Option<f64>,
        /// Connect timeout in seconds, clamped to the overall timeout
        #[arg(long)]
        connect_timeout: Option<f64>,
        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
        /// Output file for confirmed addresses
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Summary format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

struct ScanSettings {
    ranges: PathBuf,
    sig: ProbeSignature,
    concurrency: usize,
    report_interval: Duration,
    out: PathBuf,
    verified_out: PathBuf,
    verify: Option<VerifySettings>,
    format: OutputFormat,
}

struct VerifySettings {
    sample: usize,
    workers: usize,
    sig: ProbeSignature,
}

struct VerifyRunSettings {
    input: PathBuf,
    sig: ProbeSignature,
    workers: usize,
    out: Option<PathBuf>,
    format: OutputFormat,
}

struct VerifySummary {
    sampled: usize,
    confirmed: Vec<Ipv4Addr>,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let loaded_cfg = config::load_config(cli.config.as_deref());
    match cli.command {
        Commands::Version => {
            println!("edgesweep {} (core {})", env!("CARGO_PKG_VERSION"), edgesweep_core::version());
        }
        Commands::Scan {
            mut host,
            mut location,
            mut ranges,
            mut scheme,
            mut port,
            mut timeout,
            mut connect_timeout,
            mut concurrency,
            mut report_interval,
            mut out,
            mut verified_out,
            no_verify,
            mut verify_sample,
            mut verify_workers,
            mut verify_scheme,
            mut verify_port,
            format,
        } => {
            // Environment sits between explicit flags and the config file.
            if ranges.is_none() { ranges = config::env_ranges(); }
            if concurrency.is_none() { concurrency = config::env_concurrency(); }
            if timeout.is_none() { timeout = config::env_timeout(); }
            if let Some(cfg) = &loaded_cfg {
                if let Some(s) = &cfg.scan {
                    if host.is_none() { host = s.host.clone(); }
                    if location.is_none() { location = s.location.clone(); }
                    if ranges.is_none() { ranges = s.ranges.clone(); }
                    if scheme.is_none() { scheme = s.scheme.clone(); }
                    if port.is_none() { port = s.port; }
                    if timeout.is_none() { timeout = s.timeout; }
                    if connect_timeout.is_none() { connect_timeout = s.connect_timeout; }
                    if concurrency.is_none() { concurrency = s.concurrency; }
                    if report_interval.is_none() { report_interval = s.report_interval; }
                    if out.is_none() { out = s.out.clone(); }
                    if verified_out.is_none() { verified_out = s.verified_out.clone(); }
                }
                if let Some(v) = &cfg.verify {
                    if verify_sample.is_none() { verify_sample = v.sample; }
                    if verify_workers.is_none() { verify_workers = v.workers; }
                    if verify_scheme.is_none() { verify_scheme = v.scheme.clone(); }
                    if verify_port.is_none() { verify_port = v.port; }
                }
            }

            let host = host.ok_or_else(|| anyhow!("--host is required (flag or scan.host in the config)"))?;
            let location =
                location.ok_or_else(|| anyhow!("--location is required (flag or scan.location in the config)"))?;
            let scheme = parse_scheme(scheme.as_deref())?;
            let mut sig = ProbeSignature::new(host, location);
            sig.scheme = scheme;
            sig.port = port.unwrap_or_else(|| scheme.default_port());
            sig.timeout = match timeout {
                Some(t) => seconds(t, "--timeout")?,
                None => DEFAULT_TIMEOUT,
            };
            sig.connect_timeout = match connect_timeout {
                Some(t) => seconds(t, "--connect-timeout")?,
                None => DEFAULT_CONNECT_TIMEOUT,
            }
            .min(sig.timeout);

            let verify = if no_verify {
                None
            } else {
                let vscheme = match verify_scheme.as_deref() {
                    Some(s) => Some(s.parse::<Scheme>().map_err(|e| anyhow!(e))?),
                    None => None,
                };
                Some(VerifySettings {
                    sample: verify_sample.unwrap_or(DEFAULT_SAMPLE),
                    workers: verify_workers.unwrap_or(DEFAULT_WORKERS),
                    sig: sig.with_overrides(vscheme, verify_port),
                })
            };

            run_scan(ScanSettings {
                ranges: ranges.unwrap_or_else(|| PathBuf::from("range.txt")),
                sig,
                concurrency: concurrency.unwrap_or(DEFAULT_CONCURRENCY),
                report_interval: report_interval
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_REPORT_INTERVAL),
                out: out.unwrap_or_else(|| PathBuf::from("available_ips.txt")),
                verified_out: verified_out.unwrap_or_else(|| PathBuf::from("verified_ips.txt")),
                verify,
                format,
            })?;
        }
        Commands::Verify {
            input,
            mut host,
            mut location,
            mut scheme,
            mut port,
            mut timeout,
            mut connect_timeout,
            mut workers,
            out,
            format,
        } => {
            if timeout.is_none() { timeout = config::env_timeout(); }
            if let Some(cfg) = &loaded_cfg {
                if let Some(v) = &cfg.verify {
                    if scheme.is_none() { scheme = v.scheme.clone(); }
                    if port.is_none() { port = v.port; }
                    if workers.is_none() { workers = v.workers; }
                }
                if let Some(s) = &cfg.scan {
                    if host.is_none() { host = s.host.clone(); }
                    if location.is_none() { location = s.location.clone(); }
                    if scheme.is_none() { scheme = s.scheme.clone(); }
                    if port.is_none() { port = s.port; }
                    if timeout.is_none() { timeout = s.timeout; }
                    if connect_timeout.is_none() { connect_timeout = s.connect_timeout; }
                }
            }

            let host = host.ok_or_else(|| anyhow!("--host is required (flag or scan.host in the config)"))?;
            let location =
                location.ok_or_else(|| anyhow!("--location is required (flag or scan.location in the config)"))?;
            let scheme = parse_scheme(scheme.as_deref())?;
            let mut sig = ProbeSignature::new(host, location);
            sig.scheme = scheme;
            sig.port = port.unwrap_or_else(|| scheme.default_port());
            sig.timeout = match timeout {
                Some(t) => seconds(t, "--timeout")?,
                None => DEFAULT_TIMEOUT,
            };
            sig.connect_timeout = match connect_timeout {
                Some(t) => seconds(t, "--connect-timeout")?,
                None => DEFAULT_CONNECT_TIMEOUT,
            }
            .min(sig.timeout);

            run_verify(VerifyRunSettings {
                input,
                sig,
                workers: workers.unwrap_or(DEFAULT_WORKERS),
                out,
                format,
            })?;
        }
    }
    Ok(())
}

fn parse_scheme(value: Option<&str>) -> Result<Scheme> {
    match value {
        Some(s) => s.parse::<Scheme>().map_err(|e| anyhow!(e)),
        None => Ok(Scheme::Http),
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{what} must be a positive number of seconds");
    }
    Ok(Duration::from_secs_f64(value))
}

/// The match is byte-exact either way; a relative value usually means
/// a copy-paste slip, so it is worth a warning up front.
fn check_location(location: &str) {
    if url::Url::parse(location).is_err() {
        warn!(%location, "expected location is not an absolute URL");
    }
}

fn run_scan(s: ScanSettings) -> Result<()> {
    check_location(&s.sig.location);
    let started_at = now_rfc3339();
    let started = Instant::now();

    let loaded = range_source::load_ranges(&s.ranges)?;
    for r in &loaded.rejected {
        warn!(line = %r.line, reason = %r.reason, "skipping range");
    }
    for r in &loaded.accepted {
        info!(cidr = %r.cidr, addresses = r.count, "loaded range");
    }
    if loaded.accepted.is_empty() {
        bail!("no usable ranges in {}", s.ranges.display());
    }
    let total = loaded.addresses.len();
    if total == 0 {
        bail!("ranges in {} expand to zero probe-able addresses", s.ranges.display());
    }

    let text = s.format == OutputFormat::Text;
    if text {
        print_banner(&s, loaded.accepted.len(), total, &started_at);
    }

    let prober = Arc::new(RedirectProber::new(s.sig.clone())?);
    let opts = SweepOptions { concurrency: s.concurrency, report_interval: s.report_interval };
    let addrs = loaded.addresses;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async move {
        sweep(prober, addrs, opts, |event| match event {
            SweepEvent::Found(addr) => {
                if text { println!("available {addr}"); }
            }
            SweepEvent::Progress(tick) => {
                if text { print_progress(&tick); }
            }
        })
        .await
    });

    let sorted = report.sorted_available();
    write_addresses(&s.out, &sorted)?;
    info!(path = %s.out.display(), count = sorted.len(), "wrote available addresses");

    let mut verification: Option<VerifySummary> = None;
    if let Some(v) = &s.verify {
        if sorted.is_empty() {
            info!("no positives to verify");
        } else {
            let sample = &sorted[..v.sample.min(sorted.len())];
            if text {
                println!();
                println!("verifying {} of {} available addresses", sample.len(), sorted.len());
            }
            let records = verify_pass::verify(sample, &v.sig, &VerifyOptions { workers: v.workers })?;
            if text {
                let mut shown: Vec<_> = records.iter().collect();
                shown.sort_by_key(|r| r.addr);
                for r in shown {
                    println!("{} {}", if r.confirmed { "verified" } else { "failed" }, r.addr);
                }
            }
            let confirmed = confirmed_sorted(&records);
            write_addresses(&s.verified_out, &confirmed)?;
            info!(path = %s.verified_out.display(), count = confirmed.len(), "wrote verified addresses");
            verification = Some(VerifySummary { sampled: records.len(), confirmed });
        }
    }

    let elapsed = started.elapsed();
    match s.format {
        OutputFormat::Text => print_scan_summary(&s, &report, &sorted, verification.as_ref(), elapsed),
        OutputFormat::Json => {
            let causes = &report.causes;
            let obj = serde_json::json!({
                "host": s.sig.host,
                "location": s.sig.location,
                "scheme": s.sig.scheme.as_str(),
                "port": s.sig.port,
                "total": report.total,
                "completed": report.completed,
                "available": sorted,
                "unreachable": report.unreachable(),
                "causes": {
                    "timeout": causes.timeout,
                    "connection_refused": causes.connection_refused,
                    "status_mismatch": causes.status_mismatch,
                    "location_mismatch": causes.location_mismatch,
                    "other": causes.other,
                },
                "out": s.out.display().to_string(),
                "verified": verification.as_ref().map(|v| serde_json::json!({
                    "sampled": v.sampled,
                    "confirmed": v.confirmed,
                    "out": s.verified_out.display().to_string(),
                })),
                "duration_ms": elapsed.as_millis() as u64,
                "started_at": started_at,
                "ended_at": now_rfc3339(),
            });
            println!("{}", serde_json::to_string(&obj)?);
        }
    }
    Ok(())
}

fn run_verify(s: VerifyRunSettings) -> Result<()> {
    check_location(&s.sig.location);
    let started_at = now_rfc3339();
    let started = Instant::now();

    let addrs = read_address_list(&s.input)?;
    if addrs.is_empty() {
        bail!("no addresses in {}", s.input.display());
    }
    if s.format == OutputFormat::Text {
        println!("re-checking {} addresses against {}", addrs.len(), s.sig.host);
    }

    let records = verify_pass::verify(&addrs, &s.sig, &VerifyOptions { workers: s.workers })?;
    let confirmed = confirmed_sorted(&records);
    if let Some(path) = &s.out {
        write_addresses(path, &confirmed)?;
        info!(path = %path.display(), count = confirmed.len(), "wrote confirmed addresses");
    }

    let elapsed = started.elapsed();
    match s.format {
        OutputFormat::Text => {
            let mut shown: Vec<_> = records.iter().collect();
            shown.sort_by_key(|r| r.addr);
            for r in shown {
                println!("{} {}", if r.confirmed { "verified" } else { "failed" }, r.addr);
            }
            println!("{} of {} confirmed in {}", confirmed.len(), records.len(), fmt_duration(elapsed));
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "input": s.input.display().to_string(),
                "host": s.sig.host,
                "location": s.sig.location,
                "checked": records.len(),
                "confirmed": confirmed,
                "out": s.out.as_ref().map(|p| p.display().to_string()),
                "duration_ms": elapsed.as_millis() as u64,
                "started_at": started_at,
                "ended_at": now_rfc3339(),
            });
            println!("{}", serde_json::to_string(&obj)?);
        }
    }
    Ok(())
}

fn print_banner(s: &ScanSettings, ranges: usize, total: usize, started_at: &str) {
    println!("edgesweep {}", env!("CARGO_PKG_VERSION"));
    println!("target host: {}", s.sig.host);
    println!("expected redirect: {}", s.sig.location);
    println!("probing {} addresses from {} ranges via {} port {}", total, ranges, s.sig.scheme, s.sig.port);
    println!(
        "concurrency {} | timeout {:.1}s (connect {:.1}s)",
        s.concurrency,
        s.sig.timeout.as_secs_f64(),
        s.sig.connect_timeout.as_secs_f64()
    );
    println!("started: {started_at}");
    println!();
}

fn print_progress(tick: &ProgressTick) {
    println!();
    println!("progress [{}]", clock_stamp());
    println!("  scanned: {}/{} ({:.1}%)", tick.completed, tick.total, tick.percent());
    println!("  available: {}", tick.available);
    println!("  unreachable: {}", tick.unreachable());
    println!("  recent speed: {:.1} addrs/min", tick.recent_per_min);
    println!("  average speed: {:.1} addrs/min", tick.average_per_min);
    if let Some(eta) = tick.eta_minutes {
        if eta > 0.0 {
            println!("  eta: {eta:.1} minutes");
        }
    }
    println!();
}

fn print_scan_summary(
    s: &ScanSettings,
    report: &ScanReport,
    sorted: &[Ipv4Addr],
    verification: Option<&VerifySummary>,
    elapsed: Duration,
) {
    println!();
    println!("scan complete in {}", fmt_duration(elapsed));
    println!("scanned: {} | available: {} | unreachable: {}", report.completed, sorted.len(), report.unreachable());
    println!("success rate: {:.4}%", report.success_rate());
    let minutes = elapsed.as_secs_f64() / 60.0;
    if minutes > 0.0 {
        println!("average speed: {:.1} addrs/min", report.completed as f64 / minutes);
    }
    let c = &report.causes;
    if c.total() > 0 {
        println!(
            "unreachable causes: timeout {} | refused {} | status {} | location {} | other {}",
            c.timeout, c.connection_refused, c.status_mismatch, c.location_mismatch, c.other
        );
    }
    println!("available list: {} ({} addresses)", s.out.display(), sorted.len());
    if let Some(v) = verification {
        println!(
            "verified list: {} ({} of {} confirmed)",
            s.verified_out.display(),
            v.confirmed.len(),
            v.sampled
        );
    }
    if !sorted.is_empty() {
        println!("first {} available:", sorted.len().min(10));
        for addr in sorted.iter().take(10) {
            println!("  {addr}");
        }
    }
}

fn fmt_duration(d: Duration) -> String {
    let total = d.as_secs_f64();
    let hours = (total / 3600.0) as u64;
    let minutes = ((total % 3600.0) / 60.0) as u64;
    let seconds = total % 60.0;
    format!("{hours}h {minutes}m {seconds:.1}s")
}

fn write_addresses(path: &Path, addrs: &[Ipv4Addr]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for addr in addrs {
        writeln!(w, "{addr}")?;
    }
    w.flush()?;
    Ok(())
}

fn parse_address_lines(text: &str) -> Result<Vec<Ipv4Addr>> {
    let mut addrs = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let addr: Ipv4Addr = line
            .parse()
            .with_context(|| format!("line {}: not an IPv4 address: {:?}", idx + 1, line))?;
        addrs.push(addr);
    }
    Ok(addrs)
}

fn read_address_list(path: &Path) -> Result<Vec<Ipv4Addr>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read address list {}", path.display()))?;
    parse_address_lines(&text).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formats_like_a_stopwatch() {
        assert_eq!(fmt_duration(Duration::from_secs_f64(3723.5)), "1h 2m 3.5s");
        assert_eq!(fmt_duration(Duration::from_secs(59)), "0h 0m 59.0s");
    }

    #[test]
    fn seconds_rejects_nonsense() {
        assert!(seconds(5.0, "--timeout").is_ok());
        assert!(seconds(0.0, "--timeout").is_err());
        assert!(seconds(-1.0, "--timeout").is_err());
        assert!(seconds(f64::NAN, "--timeout").is_err());
    }

    #[test]
    fn address_lists_skip_comments_and_fail_on_junk() {
        let ok = parse_address_lines("# previous scan\n203.0.113.5\n\n203.0.113.9\n").unwrap();
        assert_eq!(ok, vec![Ipv4Addr::new(203, 0, 113, 5), Ipv4Addr::new(203, 0, 113, 9)]);
        assert!(parse_address_lines("203.0.113.5\nnot-an-ip\n").is_err());
    }

    #[test]
    fn default_scheme_is_http() {
        assert_eq!(parse_scheme(None).unwrap(), Scheme::Http);
        assert_eq!(parse_scheme(Some("https")).unwrap(), Scheme::Https);
        assert!(parse_scheme(Some("gopher")).is_err());
    }
}
